//! Advertisement parsing
//!
//! A BlueST board advertises a vendor-specific record that carries the protocol version,
//! the board type, two capability flags and the bit-mask of the features it exports.
//! [`parse`] turns the raw advertisement into a [`DeviceDescriptor`] or a typed
//! [`AdvertiseError`]; it never produces a partially filled descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Record type carrying the complete local name
pub const DEVICE_NAME_TYPE: u8 = 0x09;
/// Record type carrying the transmit power level
pub const TX_POWER_TYPE: u8 = 0x0A;
/// Record type carrying manufacturer specific data
pub const VENDOR_DATA_TYPE: u8 = 0xFF;

/// Protocol versions this parser understands
pub const SUPPORTED_PROTOCOL_VERSIONS: RangeInclusive<u8> = 0x01..=0x01;

/// Vendor field length (type byte included) without the device address
pub const VENDOR_FIELD_SHORT: usize = 7;
/// Vendor field length (type byte included) with the device address
pub const VENDOR_FIELD_EXTENDED: usize = 13;

const DEVICE_ID_EXTENDED_FLAG: u8 = 0x80;
const DEVICE_ID_MASK: u8 = 0x1F;
const SLEEPING_FLAG: u8 = 0x40;
const GENERAL_PURPOSE_FLAG: u8 = 0x20;

/// Errors produced while parsing an advertisement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseError {
    #[error("Advertisement has no vendor specific record")]
    MissingVendorData,
    #[error("Invalid vendor field length: {0} (expected 7 or 13)")]
    InvalidVendorLength(usize),
    #[error("Unsupported protocol version: {0:#04x}")]
    UnsupportedProtocolVersion(u8),
    #[error("Truncated record at offset {offset}: declared {declared} bytes, {available} available")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },
}

impl AdvertiseError {
    /// True for every failure caused by unparseable bytes (as opposed to a version mismatch)
    pub fn is_malformed(&self) -> bool {
        !matches!(self, AdvertiseError::UnsupportedProtocolVersion(_))
    }
}

/// Board family announced in the advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardType {
    /// Unknown or user defined board
    Generic,
    StevalWesu1,
    SensorTile,
    BlueCoin,
    StevalIdb008vx,
    StevalBcn002v1,
    SensorTileBox,
    DiscoveryIot01a,
    /// Externally addressable board (device id 0x80..=0xFF)
    Nucleo,
}

impl BoardType {
    /// Map a device type id to its board family
    pub fn from_device_id(id: u8) -> Self {
        match id {
            0x01 => BoardType::StevalWesu1,
            0x02 => BoardType::SensorTile,
            0x03 => BoardType::BlueCoin,
            0x04 => BoardType::StevalIdb008vx,
            0x05 => BoardType::StevalBcn002v1,
            0x06 => BoardType::SensorTileBox,
            0x07 => BoardType::DiscoveryIot01a,
            0x80..=0xFF => BoardType::Nucleo,
            _ => BoardType::Generic,
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BoardType::Generic => "GENERIC",
            BoardType::StevalWesu1 => "STEVAL_WESU1",
            BoardType::SensorTile => "SENSOR_TILE",
            BoardType::BlueCoin => "BLUE_COIN",
            BoardType::StevalIdb008vx => "STEVAL_IDB008VX",
            BoardType::StevalBcn002v1 => "STEVAL_BCN002V1",
            BoardType::SensorTileBox => "SENSOR_TILE_BOX",
            BoardType::DiscoveryIot01a => "DISCOVERY_IOT01A",
            BoardType::Nucleo => "NUCLEO",
        };
        write!(f, "{}", name)
    }
}

/// Everything a BlueST advertisement tells about a board
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: Option<String>,
    /// Device address, only present in extended vendor fields
    pub address: Option<String>,
    pub tx_power: i8,
    pub protocol_version: u8,
    pub device_type_id: u8,
    pub board_type: BoardType,
    pub feature_mask: u32,
    pub is_sleeping: bool,
    pub has_general_purpose: bool,
}

impl DeviceDescriptor {
    /// True if the board exports the feature at `mask_bit`
    pub fn exports(&self, mask_bit: u32) -> bool {
        self.feature_mask & mask_bit != 0
    }
}

/// One `(length, type, payload)` record of an advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseRecord<'a> {
    pub record_type: u8,
    pub payload: &'a [u8],
}

/// Split an advertisement into its records.
///
/// Stops when fewer than two bytes remain or at the first zero-length record.
pub fn split(data: &[u8]) -> Result<Vec<AdvertiseRecord<'_>>, AdvertiseError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while data.len().saturating_sub(offset) >= 2 {
        let length = data[offset] as usize;
        if length == 0 {
            break;
        }
        let available = data.len() - offset - 1;
        if length > available {
            return Err(AdvertiseError::Truncated {
                offset,
                declared: length,
                available,
            });
        }
        records.push(AdvertiseRecord {
            record_type: data[offset + 1],
            payload: &data[offset + 2..offset + 1 + length],
        });
        offset += 1 + length;
    }
    Ok(records)
}

/// Parse a raw advertisement into a [`DeviceDescriptor`]
pub fn parse(data: &[u8]) -> Result<DeviceDescriptor, AdvertiseError> {
    let mut name = None;
    let mut tx_power = 0i8;
    let mut vendor: Option<&[u8]> = None;

    for record in split(data)? {
        match record.record_type {
            DEVICE_NAME_TYPE => {
                name = Some(String::from_utf8_lossy(record.payload).into_owned());
            }
            TX_POWER_TYPE => {
                if let Some(&b) = record.payload.first() {
                    tx_power = b as i8;
                }
            }
            VENDOR_DATA_TYPE => vendor = Some(record.payload),
            _ => {}
        }
    }

    let vendor = vendor.ok_or(AdvertiseError::MissingVendorData)?;
    let field_len = vendor.len() + 1;
    if field_len != VENDOR_FIELD_SHORT && field_len != VENDOR_FIELD_EXTENDED {
        return Err(AdvertiseError::InvalidVendorLength(field_len));
    }

    let protocol_version = vendor[0];
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version) {
        return Err(AdvertiseError::UnsupportedProtocolVersion(protocol_version));
    }

    let type_byte = vendor[1];
    let extended_id = type_byte & DEVICE_ID_EXTENDED_FLAG != 0;
    let device_type_id = if extended_id {
        type_byte
    } else {
        type_byte & DEVICE_ID_MASK
    };

    let feature_mask = u32::from_be_bytes([vendor[2], vendor[3], vendor[4], vendor[5]]);

    let address = if field_len == VENDOR_FIELD_EXTENDED {
        Some(format_address(&vendor[6..12]))
    } else {
        None
    };

    Ok(DeviceDescriptor {
        name,
        address,
        tx_power,
        protocol_version,
        device_type_id,
        board_type: BoardType::from_device_id(device_type_id),
        feature_mask,
        is_sleeping: !extended_id && type_byte & SLEEPING_FLAG != 0,
        has_general_purpose: !extended_id && type_byte & GENERAL_PURPOSE_FLAG != 0,
    })
}

fn format_address(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vendor(payload: &[u8]) -> Vec<u8> {
        let mut adv = vec![(payload.len() + 1) as u8, VENDOR_DATA_TYPE];
        adv.extend_from_slice(payload);
        adv
    }

    #[test]
    fn test_tx_power_is_signed() {
        for (raw, expected) in [(0x40u8, 64i8), (0x7F, 127), (0x80, -128)] {
            let mut adv = vec![0x02, TX_POWER_TYPE, raw];
            adv.extend(vendor(&[0x01, 0x00, 0, 0, 0, 0]));
            let desc = parse(&adv).expect("valid advertisement");
            assert_eq!(desc.tx_power, expected);
        }
    }

    #[test]
    fn test_device_name() {
        for name in ["c", "hello"] {
            let mut adv = vec![(name.len() + 1) as u8, DEVICE_NAME_TYPE];
            adv.extend_from_slice(name.as_bytes());
            adv.extend(vendor(&[0x01, 0x00, 0, 0, 0, 0]));
            let desc = parse(&adv).expect("valid advertisement");
            assert_eq!(desc.name.as_deref(), Some(name));
        }
    }

    #[test]
    fn test_nucleo_with_empty_mask() {
        let desc = parse(&[0x07, 0xFF, 0x01, 0x80, 0x00, 0x00, 0x00, 0x00]).expect("valid");
        assert_eq!(desc.feature_mask, 0);
        assert_eq!(desc.board_type, BoardType::Nucleo);
        assert_eq!(desc.device_type_id, 0x80);
        assert!(!desc.is_sleeping);
        assert!(desc.address.is_none());
    }

    #[test]
    fn test_generic_board_mask() {
        let desc = parse(&[0x07, 0xFF, 0x01, 0x00, 0x00, 0xFF, 0x00, 0x00]).expect("valid");
        assert_eq!(desc.feature_mask, 0x00FF_0000);
        assert_eq!(desc.board_type, BoardType::Generic);
        assert_eq!(desc.device_type_id, 0);
    }

    #[test]
    fn test_wesu_board_mask() {
        let desc = parse(&[0x07, 0xFF, 0x01, 0x01, 0xFF, 0xFF, 0x00, 0x00]).expect("valid");
        assert_eq!(desc.feature_mask, 0xFFFF_0000);
        assert_eq!(desc.board_type, BoardType::StevalWesu1);
    }

    #[test]
    fn test_extended_field_carries_address() {
        let adv = vendor(&[0x01, 0x02, 0, 0, 0, 0, 0xEF, 0xBE, 0x00, 0xAD, 0xDE, 0x02]);
        let desc = parse(&adv).expect("valid");
        assert_eq!(desc.address.as_deref(), Some("EF:BE:00:AD:DE:02"));
        assert_eq!(desc.board_type, BoardType::SensorTile);
    }

    #[test]
    fn test_flags_only_without_extended_id() {
        let desc = parse(&vendor(&[0x01, 0x63, 0, 0, 0, 0])).expect("valid");
        assert_eq!(desc.device_type_id, 0x03);
        assert!(desc.is_sleeping);
        assert!(desc.has_general_purpose);

        let desc = parse(&vendor(&[0x01, 0xE0, 0, 0, 0, 0])).expect("valid");
        assert_eq!(desc.device_type_id, 0xE0);
        assert!(!desc.is_sleeping);
        assert!(!desc.has_general_purpose);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let result = parse(&vendor(&[0xFF, 0x00, 0, 0, 0, 0]));
        assert_eq!(result, Err(AdvertiseError::UnsupportedProtocolVersion(0xFF)));
        assert!(!result.unwrap_err().is_malformed());
    }

    #[test]
    fn test_empty_advertisement_rejected() {
        assert_eq!(parse(&[]), Err(AdvertiseError::MissingVendorData));
    }

    #[test]
    fn test_small_and_big_vendor_rejected() {
        assert_eq!(
            parse(&vendor(&[0x01, 0x00, 0, 0, 0])),
            Err(AdvertiseError::InvalidVendorLength(6))
        );
        assert_eq!(
            parse(&vendor(&[0x01, 0x00, 0, 0, 0, 0, 0])),
            Err(AdvertiseError::InvalidVendorLength(8))
        );
    }

    #[test]
    fn test_no_vendor_record_rejected() {
        let result = parse(&[0x07, 0xFE, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(result, Err(AdvertiseError::MissingVendorData));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let result = parse(&[0x07, 0xFF, 0x01, 0x00]);
        assert!(matches!(result, Err(AdvertiseError::Truncated { .. })));
        assert!(result.unwrap_err().is_malformed());
    }

    #[test]
    fn test_zero_length_record_stops_walk() {
        let mut adv = vendor(&[0x01, 0x01, 0, 0, 0, 0]);
        adv.extend_from_slice(&[0x00, 0x09, 0x41]);
        assert!(parse(&adv).is_ok());
    }

    proptest! {
        #[test]
        fn prop_valid_fields_round_trip(
            type_byte in any::<u8>(),
            mask in any::<u32>(),
            address in proptest::option::of(any::<[u8; 6]>()),
        ) {
            let mut payload = vec![0x01, type_byte];
            payload.extend_from_slice(&mask.to_be_bytes());
            if let Some(addr) = address {
                payload.extend_from_slice(&addr);
            }
            let desc = parse(&vendor(&payload)).expect("valid vendor field");
            prop_assert_eq!(desc.feature_mask, mask);
            let expected_id = if type_byte & 0x80 != 0 { type_byte } else { type_byte & 0x1F };
            prop_assert_eq!(desc.device_type_id, expected_id);
            prop_assert_eq!(desc.address, address.map(|a| format_address(&a)));
        }

        #[test]
        fn prop_other_lengths_fail(len in 0usize..40) {
            prop_assume!(len + 1 != VENDOR_FIELD_SHORT && len + 1 != VENDOR_FIELD_EXTENDED);
            let mut payload = vec![0u8; len];
            if let Some(first) = payload.first_mut() {
                *first = 0x01;
            }
            prop_assert_eq!(
                parse(&vendor(&payload)),
                Err(AdvertiseError::InvalidVendorLength(len + 1))
            );
        }

        #[test]
        fn prop_unsupported_versions_fail(version in any::<u8>()) {
            prop_assume!(!SUPPORTED_PROTOCOL_VERSIONS.contains(&version));
            prop_assert_eq!(
                parse(&vendor(&[version, 0, 0, 0, 0, 0])),
                Err(AdvertiseError::UnsupportedProtocolVersion(version))
            );
        }
    }
}
