//! Feature registry: which feature type lives at which mask bit, per board type.

use super::builtin;
use super::{Feature, FeatureType};
use crate::protocol::DeviceDescriptor;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

/// Registration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid feature mask {0:#010x}: exactly one bit must be set")]
    InvalidMask(u32),
}

/// Iterate the single-bit masks set in `mask`, highest bit first
pub fn mask_bits(mask: u32) -> impl Iterator<Item = u32> {
    (0..32u32)
        .rev()
        .map(|bit| 1u32 << bit)
        .filter(move |bit| mask & bit != 0)
}

/// Mask bit → feature type tables keyed by device type id.
///
/// An explicit value, not a process-wide table: build one at start-up, share it behind an
/// `Arc`, and create more when tests need independent tables.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    boards: HashMap<u8, BTreeMap<u32, FeatureType>>,
}

impl FeatureRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in board tables
    pub fn with_default_boards() -> Self {
        let mut registry = Self::new();
        for (device_id, table) in builtin::default_boards() {
            registry.boards.insert(device_id, table.iter().copied().collect());
        }
        registry
    }

    /// Register `feature_type` at `mask_bit` for a device type; overwrites a previous entry
    pub fn register(
        &mut self,
        device_type_id: u8,
        mask_bit: u32,
        feature_type: FeatureType,
    ) -> Result<(), RegistryError> {
        if mask_bit.count_ones() != 1 {
            return Err(RegistryError::InvalidMask(mask_bit));
        }
        debug!(
            "Registered {} at {:#010x} for device type {:#04x}",
            feature_type.name, mask_bit, device_type_id
        );
        self.boards
            .entry(device_type_id)
            .or_default()
            .insert(mask_bit, feature_type);
        Ok(())
    }

    /// Register several entries at once; nothing is inserted if any mask is invalid
    pub fn register_all(
        &mut self,
        device_type_id: u8,
        entries: &[(u32, FeatureType)],
    ) -> Result<(), RegistryError> {
        if let Some((mask, _)) = entries.iter().find(|(mask, _)| mask.count_ones() != 1) {
            return Err(RegistryError::InvalidMask(*mask));
        }
        let table = self.boards.entry(device_type_id).or_default();
        for (mask, feature_type) in entries {
            table.insert(*mask, *feature_type);
        }
        Ok(())
    }

    /// Feature type registered at `mask_bit` for a device type
    pub fn lookup(&self, device_type_id: u8, mask_bit: u32) -> Option<&FeatureType> {
        self.boards.get(&device_type_id)?.get(&mask_bit)
    }

    pub fn knows_device(&self, device_type_id: u8) -> bool {
        self.boards.contains_key(&device_type_id)
    }

    /// Instantiate the features a board advertises, highest mask bit first
    pub fn build_for_device(&self, descriptor: &DeviceDescriptor) -> Vec<Feature> {
        let Some(table) = self.boards.get(&descriptor.device_type_id) else {
            debug!(
                "No feature table for device type {:#04x}",
                descriptor.device_type_id
            );
            return Vec::new();
        };
        mask_bits(descriptor.feature_mask)
            .filter_map(|bit| table.get(&bit).map(|ty| Feature::new(*ty, bit)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::builtin::{ACCELERATION, GYROSCOPE, TEMPERATURE};
    use crate::protocol::BoardType;

    fn descriptor(device_type_id: u8, feature_mask: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            name: None,
            address: None,
            tx_power: 0,
            protocol_version: 1,
            device_type_id,
            board_type: BoardType::from_device_id(device_type_id),
            feature_mask,
            is_sleeping: false,
            has_general_purpose: false,
        }
    }

    #[test]
    fn test_mask_bits_descending() {
        let bits: Vec<u32> = mask_bits(0x8000_0101).collect();
        assert_eq!(bits, vec![0x8000_0000, 0x0000_0100, 0x0000_0001]);
        assert_eq!(mask_bits(0).count(), 0);
    }

    #[test]
    fn test_multi_bit_registration_rejected() {
        let mut registry = FeatureRegistry::new();
        assert_eq!(
            registry.register(0x10, 0x0000_0003, ACCELERATION),
            Err(RegistryError::InvalidMask(3))
        );
        assert_eq!(
            registry.register(0x10, 0, ACCELERATION),
            Err(RegistryError::InvalidMask(0))
        );
        assert!(registry.lookup(0x10, 0x0000_0003).is_none());
    }

    #[test]
    fn test_single_bit_registration_retrievable() {
        let mut registry = FeatureRegistry::new();
        registry
            .register(0x10, 0x0000_0004, ACCELERATION)
            .expect("single bit");
        registry
            .register(0x10, 0x0000_0004, GYROSCOPE)
            .expect("overwrite");
        let found = registry.lookup(0x10, 0x0000_0004).expect("registered");
        assert_eq!(found.name, GYROSCOPE.name);
    }

    #[test]
    fn test_register_all_is_atomic() {
        let mut registry = FeatureRegistry::new();
        let result = registry.register_all(0x20, &[(0x01, ACCELERATION), (0x06, GYROSCOPE)]);
        assert_eq!(result, Err(RegistryError::InvalidMask(0x06)));
        assert!(!registry.knows_device(0x20));
    }

    #[test]
    fn test_build_for_device_orders_by_descending_bit() {
        let mut registry = FeatureRegistry::new();
        registry
            .register_all(
                0x10,
                &[(0x01, TEMPERATURE), (0x0080_0000, ACCELERATION), (0x10, GYROSCOPE)],
            )
            .expect("valid");
        let features = registry.build_for_device(&descriptor(0x10, 0x0080_0011 | 0x0200));
        let masks: Vec<u32> = features.iter().map(Feature::mask).collect();
        assert_eq!(masks, vec![0x0080_0000, 0x10, 0x01]);
        assert!(features.iter().all(|f| !f.is_enabled()));
    }

    #[test]
    fn test_default_boards() {
        let registry = FeatureRegistry::with_default_boards();
        assert!(registry.knows_device(0x00));
        assert!(registry
            .build_for_device(&descriptor(0x00, 0xFFFF_FFFF))
            .is_empty());
        let wesu = registry.build_for_device(&descriptor(0x01, 0x00E0_0000));
        let names: Vec<&str> = wesu.iter().map(Feature::name).collect();
        assert_eq!(names, vec!["Accelerometer", "Gyroscope", "Magnetometer"]);
        assert!(registry.build_for_device(&descriptor(0x81, 0x0080_0000)).is_empty());
    }
}
