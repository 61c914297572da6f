//! Per-session routing of characteristic payloads to feature instances.
//!
//! Payload layout: `[timestamp:u16 LE][feature bytes]...` with the features of a
//! characteristic decoded in descending mask-bit order at a running offset.

use super::builtin::GENERAL_PURPOSE;
use super::registry::mask_bits;
use super::{DecodeError, Feature, Sample};
use crate::protocol::ProtocolError;
use std::collections::HashMap;
use tracing::{trace, warn};
use uuid::Uuid;

/// Raw values this close to the 16-bit wrap may roll over
pub const ROLLOVER_WINDOW: u32 = 100;

/// Bytes taken by the timestamp at the head of every feature payload
pub const TIMESTAMP_SIZE: usize = 2;

/// Reconstructs a monotonic timestamp from the 16-bit counter boards send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingTimestamp {
    last_raw: u16,
    rollover_count: u32,
}

impl RollingTimestamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconstruct(&mut self, raw: u16) -> u64 {
        let last = self.last_raw as u32;
        if last > (1 << 16) - ROLLOVER_WINDOW && raw < self.last_raw {
            self.rollover_count += 1;
        }
        self.last_raw = raw;
        self.rollover_count as u64 * 65536 + raw as u64
    }

    pub fn rollover_count(&self) -> u32 {
        self.rollover_count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of routing one payload
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub timestamp: u64,
    /// Bytes consumed including the timestamp
    pub consumed: usize,
    /// Samples decoded before any failure, in decode order
    pub samples: Vec<(Feature, Sample)>,
    pub error: Option<ProtocolError>,
}

/// Feature instances of one session and the characteristics that carry them
#[derive(Debug, Default)]
pub struct FeatureDispatchTable {
    features: Vec<Feature>,
    by_mask: HashMap<u32, Feature>,
    characteristics: HashMap<Uuid, Vec<Feature>>,
    timestamp: RollingTimestamp,
}

impl FeatureDispatchTable {
    /// Table over the features built from the advertisement
    pub fn new(features: Vec<Feature>) -> Self {
        let by_mask = features
            .iter()
            .filter(|f| !f.is_general_purpose())
            .map(|f| (f.mask(), f.clone()))
            .collect();
        Self {
            features,
            by_mask,
            characteristics: HashMap::new(),
            timestamp: RollingTimestamp::new(),
        }
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn feature_for_mask(&self, mask: u32) -> Option<&Feature> {
        self.by_mask.get(&mask)
    }

    pub fn feature_named(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name() == name)
    }

    /// Bind the features exported through a characteristic; returns how many matched.
    ///
    /// A characteristic matching no known feature is not tracked.
    pub fn bind_characteristic(&mut self, characteristic: Uuid, mask: u32) -> usize {
        let bound: Vec<Feature> = mask_bits(mask)
            .filter_map(|bit| self.by_mask.get(&bit).cloned())
            .collect();
        if bound.is_empty() {
            trace!("Characteristic {} carries no known feature", characteristic);
            return 0;
        }
        for feature in &bound {
            feature.set_enabled(true);
        }
        let count = bound.len();
        self.characteristics.insert(characteristic, bound);
        count
    }

    /// Bind a general-purpose characteristic to a fresh raw feature
    pub fn bind_general_purpose(&mut self, characteristic: Uuid) -> Feature {
        let feature = Feature::new(GENERAL_PURPOSE, 0);
        feature.set_enabled(true);
        self.features.push(feature.clone());
        self.characteristics
            .insert(characteristic, vec![feature.clone()]);
        feature
    }

    /// Characteristic carrying `feature`; the one with the most features wins a tie
    pub fn characteristic_for(&self, feature: &Feature) -> Option<Uuid> {
        self.characteristics
            .iter()
            .filter(|(_, features)| features.iter().any(|f| f.same_as(feature)))
            .max_by_key(|(_, features)| features.len())
            .map(|(uuid, _)| *uuid)
    }

    pub fn features_on(&self, characteristic: &Uuid) -> &[Feature] {
        self.characteristics
            .get(characteristic)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_tracked(&self, characteristic: &Uuid) -> bool {
        self.characteristics.contains_key(characteristic)
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &Uuid> {
        self.characteristics.keys()
    }

    /// Forget every characteristic binding (before a new discovery)
    pub fn clear_bindings(&mut self) {
        for feature in &self.features {
            feature.set_enabled(false);
            feature.set_notifying(false);
        }
        self.features.retain(|f| !f.is_general_purpose());
        self.characteristics.clear();
        self.timestamp.reset();
    }

    /// Decode a payload received on `characteristic`.
    ///
    /// Returns `None` for untracked characteristics. A framing error stops the walk;
    /// samples decoded before it are still reported.
    pub fn dispatch(&mut self, characteristic: &Uuid, data: &[u8]) -> Option<DispatchReport> {
        let features = self.characteristics.get(characteristic)?;
        if data.len() < TIMESTAMP_SIZE {
            return Some(DispatchReport {
                timestamp: 0,
                consumed: 0,
                samples: Vec::new(),
                error: Some(ProtocolError::Framing {
                    feature: "timestamp".to_string(),
                    needed: TIMESTAMP_SIZE,
                    available: data.len(),
                }),
            });
        }

        let timestamp = self
            .timestamp
            .reconstruct(u16::from_le_bytes([data[0], data[1]]));
        let mut offset = TIMESTAMP_SIZE;
        let mut samples = Vec::with_capacity(features.len());
        let mut error = None;

        for feature in features {
            match feature.extract(timestamp, data, offset) {
                Ok(result) => {
                    offset += result.bytes_read;
                    samples.push((feature.clone(), result.sample));
                }
                Err(DecodeError::InsufficientData { needed, available }) => {
                    warn!(
                        "Framing error on {}: need {} bytes, {} available",
                        feature.name(),
                        needed,
                        available
                    );
                    error = Some(ProtocolError::Framing {
                        feature: feature.name().to_string(),
                        needed,
                        available,
                    });
                    break;
                }
            }
        }

        Some(DispatchReport {
            timestamp,
            consumed: offset,
            samples,
            error,
        })
    }
}
