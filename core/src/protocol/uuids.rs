//! GATT identifiers used by BlueST boards.
//!
//! Every BlueST service shares the `xxxxxxxx-xxxx-11e1-9ab4-0002a5d5c51b` base and every
//! characteristic the `xxxxxxxx-xxxx-11e1-ac36-0002a5d5c51b` base. Feature characteristics
//! carry their feature bit-mask in the top 32 bits of the identifier.

use uuid::Uuid;

const SERVICE_BASE: u128 = 0x0000_0000_0000_11e1_9ab4_0002_a5d5_c51b;
const CHARACTERISTIC_BASE: u128 = 0x0000_0000_0000_11e1_ac36_0002_a5d5_c51b;

/// Bits of a UUID shared by every BlueST service.
const SERVICE_FIXED_MASK: u128 = 0x0000_0000_0000_FFFF_FFFF_FFFF_FFFF_FFFF;
/// Bits of a UUID that identify a characteristic family (everything but the top 32 bits).
const CHARACTERISTIC_FAMILY_MASK: u128 = 0x0000_0000_FFFF_FFFF_FFFF_FFFF_FFFF_FFFF;

const FEATURE_FAMILY: u128 = CHARACTERISTIC_BASE | (0x0001u128 << 80);
const GENERAL_PURPOSE_FAMILY: u128 = CHARACTERISTIC_BASE | (0x0003u128 << 80);

/// Debug console service.
pub const DEBUG_SERVICE: Uuid = Uuid::from_u128(SERVICE_BASE | (0x000Eu128 << 80));
/// Debug console stdout (notify) and stdin (write).
pub const DEBUG_TERM_CHARACTERISTIC: Uuid =
    Uuid::from_u128(CHARACTERISTIC_BASE | (0x0001u128 << 96) | (0x000Eu128 << 80));
/// Debug console stderr.
pub const DEBUG_STDERR_CHARACTERISTIC: Uuid =
    Uuid::from_u128(CHARACTERISTIC_BASE | (0x0002u128 << 96) | (0x000Eu128 << 80));

/// Configuration service.
pub const CONFIG_SERVICE: Uuid = Uuid::from_u128(SERVICE_BASE | (0x000Fu128 << 80));
/// Register access characteristic in the configuration service.
pub const CONFIG_REGISTERS_CHARACTERISTIC: Uuid =
    Uuid::from_u128(CHARACTERISTIC_BASE | (0x0001u128 << 96) | (0x000Fu128 << 80));
/// Feature command channel characteristic.
pub const FEATURE_COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(CHARACTERISTIC_BASE | (0x0002u128 << 96) | (0x000Fu128 << 80));

/// Standard client characteristic configuration descriptor.
pub const CLIENT_CONFIGURATION_DESCRIPTOR: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Descriptor value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// Descriptor value disabling notifications.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Classification of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicKind {
    /// Feature data characteristic carrying this mask.
    Feature(u32),
    /// General purpose raw data characteristic.
    GeneralPurpose,
    /// Command channel.
    Command,
    /// Debug stdout/stdin.
    DebugTerm,
    /// Debug stderr.
    DebugStderr,
    /// Not a BlueST characteristic.
    Other,
}

/// True for identifiers in the BlueST service family.
pub fn is_known_service(uuid: &Uuid) -> bool {
    uuid.as_u128() & SERVICE_FIXED_MASK == SERVICE_BASE
}

/// True if the characteristic carries feature data.
pub fn is_feature_characteristic(uuid: &Uuid) -> bool {
    uuid.as_u128() & CHARACTERISTIC_FAMILY_MASK == FEATURE_FAMILY
}

/// True if the characteristic carries general-purpose raw data.
pub fn is_general_purpose_characteristic(uuid: &Uuid) -> bool {
    uuid.as_u128() & CHARACTERISTIC_FAMILY_MASK == GENERAL_PURPOSE_FAMILY
}

/// The feature mask stored in the top 32 bits of a characteristic identifier.
pub fn extract_feature_mask(uuid: &Uuid) -> u32 {
    (uuid.as_u128() >> 96) as u32
}

/// Builds the characteristic identifier that exports the features in `mask`.
pub fn feature_characteristic(mask: u32) -> Uuid {
    Uuid::from_u128(FEATURE_FAMILY | ((mask as u128) << 96))
}

/// Builds a general-purpose characteristic identifier for slot `id`.
pub fn general_purpose_characteristic(id: u32) -> Uuid {
    Uuid::from_u128(GENERAL_PURPOSE_FAMILY | ((id as u128) << 96))
}

/// Sorts a characteristic into the role it plays in a session.
pub fn classify(uuid: &Uuid) -> CharacteristicKind {
    if *uuid == FEATURE_COMMAND_CHARACTERISTIC {
        CharacteristicKind::Command
    } else if *uuid == DEBUG_TERM_CHARACTERISTIC {
        CharacteristicKind::DebugTerm
    } else if *uuid == DEBUG_STDERR_CHARACTERISTIC {
        CharacteristicKind::DebugStderr
    } else if is_feature_characteristic(uuid) {
        CharacteristicKind::Feature(extract_feature_mask(uuid))
    } else if is_general_purpose_characteristic(uuid) {
        CharacteristicKind::GeneralPurpose
    } else {
        CharacteristicKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_uuids_render() {
        assert_eq!(
            DEBUG_SERVICE.to_string(),
            "00000000-000e-11e1-9ab4-0002a5d5c51b"
        );
        assert_eq!(
            DEBUG_TERM_CHARACTERISTIC.to_string(),
            "00000001-000e-11e1-ac36-0002a5d5c51b"
        );
        assert_eq!(
            DEBUG_STDERR_CHARACTERISTIC.to_string(),
            "00000002-000e-11e1-ac36-0002a5d5c51b"
        );
        assert_eq!(
            FEATURE_COMMAND_CHARACTERISTIC.to_string(),
            "00000002-000f-11e1-ac36-0002a5d5c51b"
        );
        assert_eq!(
            CLIENT_CONFIGURATION_DESCRIPTOR.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_feature_mask_extraction() {
        let uuid = Uuid::parse_str("00e00000-0001-11e1-ac36-0002a5d5c51b").expect("valid uuid");
        assert!(is_feature_characteristic(&uuid));
        assert_eq!(extract_feature_mask(&uuid), 0x00E0_0000);
        assert_eq!(feature_characteristic(0x00E0_0000), uuid);
        assert_eq!(classify(&uuid), CharacteristicKind::Feature(0x00E0_0000));
    }

    #[test]
    fn test_general_purpose_detection() {
        let uuid = Uuid::parse_str("00000004-0003-11e1-ac36-0002a5d5c51b").expect("valid uuid");
        assert!(is_general_purpose_characteristic(&uuid));
        assert!(!is_feature_characteristic(&uuid));
        assert_eq!(classify(&uuid), CharacteristicKind::GeneralPurpose);
    }

    #[test]
    fn test_service_family() {
        let feature_service =
            Uuid::parse_str("00000000-0001-11e1-9ab4-0002a5d5c51b").expect("valid uuid");
        assert!(is_known_service(&feature_service));
        assert!(is_known_service(&CONFIG_SERVICE));
        assert!(!is_known_service(&CLIENT_CONFIGURATION_DESCRIPTOR));
        assert_eq!(classify(&CLIENT_CONFIGURATION_DESCRIPTOR), CharacteristicKind::Other);
    }
}
