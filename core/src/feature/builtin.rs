//! Built-in feature catalogue and the feature tables of the known boards.

use super::{Field, FieldType, FeatureDecoder, FeatureType, LayoutDecoder, RawDecoder};

macro_rules! layout_feature {
    ($(#[$doc:meta])* $ident:ident, $name:literal, [$($field:expr),+ $(,)?]) => {
        $(#[$doc])*
        pub const $ident: FeatureType = {
            const FIELDS: &[Field] = &[$($field),+];
            fn decoder() -> Box<dyn FeatureDecoder> {
                Box::new(LayoutDecoder::new(FIELDS))
            }
            FeatureType::new($name, FIELDS, decoder)
        };
    };
}

layout_feature!(ACCELERATION, "Accelerometer", [
    Field::new("X", "mg", FieldType::Int16, -2000.0, 2000.0),
    Field::new("Y", "mg", FieldType::Int16, -2000.0, 2000.0),
    Field::new("Z", "mg", FieldType::Int16, -2000.0, 2000.0),
]);

layout_feature!(GYROSCOPE, "Gyroscope", [
    Field::new("X", "dps", FieldType::Int16, -2000.0, 2000.0).scaled(10.0),
    Field::new("Y", "dps", FieldType::Int16, -2000.0, 2000.0).scaled(10.0),
    Field::new("Z", "dps", FieldType::Int16, -2000.0, 2000.0).scaled(10.0),
]);

layout_feature!(MAGNETOMETER, "Magnetometer", [
    Field::new("X", "mGa", FieldType::Int16, -2000.0, 2000.0),
    Field::new("Y", "mGa", FieldType::Int16, -2000.0, 2000.0),
    Field::new("Z", "mGa", FieldType::Int16, -2000.0, 2000.0),
]);

layout_feature!(PRESSURE, "Pressure", [
    Field::new("Pressure", "mBar", FieldType::Int32, 260.0, 1260.0).scaled(100.0),
]);

layout_feature!(HUMIDITY, "Humidity", [
    Field::new("Humidity", "%", FieldType::UInt16, 0.0, 100.0).scaled(10.0),
]);

layout_feature!(TEMPERATURE, "Temperature", [
    Field::new("Temperature", "°C", FieldType::Int16, -40.0, 120.0).scaled(10.0),
]);

layout_feature!(BATTERY, "Battery", [
    Field::new("Level", "%", FieldType::Int16, 0.0, 100.0).scaled(10.0),
    Field::new("Voltage", "V", FieldType::Int16, -10.0, 10.0).scaled(1000.0),
    Field::new("Current", "mA", FieldType::Int16, -10.0, 10.0),
    Field::new("Status", "", FieldType::UInt8, 0.0, 4.0),
]);

layout_feature!(LUMINOSITY, "Luminosity", [
    Field::new("Luminosity", "Lux", FieldType::UInt16, 0.0, 1000.0),
]);

layout_feature!(PROXIMITY, "Proximity", [
    Field::new("Proximity", "mm", FieldType::UInt16, 0.0, 255.0),
]);

layout_feature!(SWITCH, "Switch", [
    Field::new("Status", "", FieldType::UInt8, 0.0, 1.0),
]);

layout_feature!(DIRECTION_OF_ARRIVAL, "Direction of arrival", [
    Field::new("Angle", "°", FieldType::Int16, -180.0, 180.0),
]);

layout_feature!(ACTIVITY, "Activity Recognition", [
    Field::new("Activity", "", FieldType::UInt8, 0.0, 7.0),
]);

layout_feature!(CARRY_POSITION, "Carry Position", [
    Field::new("Position", "", FieldType::UInt8, 0.0, 6.0),
]);

layout_feature!(MEMS_GESTURE, "Gesture", [
    Field::new("Gesture", "", FieldType::UInt8, 0.0, 4.0),
]);

layout_feature!(PROXIMITY_GESTURE, "Proximity Gesture", [
    Field::new("Gesture", "", FieldType::UInt8, 0.0, 4.0),
]);

layout_feature!(PEDOMETER, "Pedometer", [
    Field::new("Steps", "", FieldType::UInt32, 0.0, 4_294_967_295.0),
    Field::new("Frequency", "steps/min", FieldType::UInt16, 0.0, 65_535.0),
]);

layout_feature!(FREE_FALL, "Free Fall", [
    Field::new("FreeFall", "", FieldType::UInt8, 0.0, 1.0),
]);

layout_feature!(ACCELERATION_EVENT, "Acceleration Event", [
    Field::new("Event", "", FieldType::UInt8, 0.0, 255.0),
]);

layout_feature!(SENSOR_FUSION, "MEMS Sensor Fusion", [
    Field::new("qi", "", FieldType::Float, -1.0, 1.0),
    Field::new("qj", "", FieldType::Float, -1.0, 1.0),
    Field::new("qk", "", FieldType::Float, -1.0, 1.0),
]);

layout_feature!(
    /// Three quaternions per notification, each component scaled by 10000
    SENSOR_FUSION_COMPACT, "MEMS Sensor Fusion (Compact)", [
    Field::new("qi0", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qj0", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qk0", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qi1", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qj1", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qk1", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qi2", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qj2", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
    Field::new("qk2", "", FieldType::Int16, -1.0, 1.0).scaled(10000.0),
]);

layout_feature!(AUDIO_ADPCM_SYNC, "ADPCM Sync", [
    Field::new("ADPCM_index", "", FieldType::Int16, -32768.0, 32767.0),
    Field::new("ADPCM_predsample", "", FieldType::Int32, -2_147_483_648.0, 2_147_483_647.0),
]);

const MIC_LEVEL_FIELDS: &[Field] = &[Field::new("Mic1", "dB", FieldType::UInt8, 0.0, 128.0)];

fn mic_level_decoder() -> Box<dyn FeatureDecoder> {
    Box::new(RawDecoder::remaining())
}

/// One level per microphone; consumes the rest of the payload
pub const MIC_LEVEL: FeatureType = FeatureType::new("Mic Level", MIC_LEVEL_FIELDS, mic_level_decoder);

const AUDIO_ADPCM_FIELDS: &[Field] = &[Field::new("ADPCM", "", FieldType::UInt8, 0.0, 255.0)];

fn audio_adpcm_decoder() -> Box<dyn FeatureDecoder> {
    Box::new(RawDecoder::fixed(20))
}

/// Compressed audio frame, delivered as raw bytes
pub const AUDIO_ADPCM: FeatureType =
    FeatureType::new("Audio ADPCM", AUDIO_ADPCM_FIELDS, audio_adpcm_decoder);

const GENERAL_PURPOSE_FIELDS: &[Field] = &[Field::new("Data", "", FieldType::UInt8, 0.0, 255.0)];

fn general_purpose_decoder() -> Box<dyn FeatureDecoder> {
    Box::new(RawDecoder::remaining())
}

/// Untyped stream bound to a general-purpose characteristic
pub const GENERAL_PURPOSE: FeatureType = FeatureType {
    name: "General Purpose",
    fields: GENERAL_PURPOSE_FIELDS,
    factory: general_purpose_decoder,
    general_purpose: true,
};

pub const GENERIC_DEVICE_ID: u8 = 0x00;
pub const STEVAL_WESU1_DEVICE_ID: u8 = 0x01;
pub const SENSOR_TILE_DEVICE_ID: u8 = 0x02;
pub const BLUE_COIN_DEVICE_ID: u8 = 0x03;
pub const NUCLEO_DEVICE_ID: u8 = 0x80;

pub const STEVAL_WESU1_FEATURES: &[(u32, FeatureType)] = &[
    (0x0080_0000, ACCELERATION),
    (0x0040_0000, GYROSCOPE),
    (0x0020_0000, MAGNETOMETER),
    (0x0010_0000, PRESSURE),
    (0x0004_0000, TEMPERATURE),
    (0x0002_0000, BATTERY),
    (0x0000_0400, ACCELERATION_EVENT),
    (0x0000_0200, FREE_FALL),
    (0x0000_0100, SENSOR_FUSION_COMPACT),
    (0x0000_0080, SENSOR_FUSION),
    (0x0000_0010, ACTIVITY),
    (0x0000_0008, CARRY_POSITION),
    (0x0000_0002, MEMS_GESTURE),
    (0x0000_0001, PEDOMETER),
];

pub const SENSOR_TILE_FEATURES: &[(u32, FeatureType)] = &[
    (0x4000_0000, AUDIO_ADPCM_SYNC),
    (0x2000_0000, SWITCH),
    (0x1000_0000, DIRECTION_OF_ARRIVAL),
    (0x0800_0000, AUDIO_ADPCM),
    (0x0400_0000, MIC_LEVEL),
    (0x0080_0000, ACCELERATION),
    (0x0040_0000, GYROSCOPE),
    (0x0020_0000, MAGNETOMETER),
    (0x0010_0000, PRESSURE),
    (0x0008_0000, HUMIDITY),
    (0x0004_0000, TEMPERATURE),
    (0x0001_0000, TEMPERATURE),
    (0x0000_0400, ACCELERATION_EVENT),
    (0x0000_0200, FREE_FALL),
    (0x0000_0100, SENSOR_FUSION_COMPACT),
    (0x0000_0080, SENSOR_FUSION),
    (0x0000_0010, ACTIVITY),
    (0x0000_0008, CARRY_POSITION),
    (0x0000_0002, MEMS_GESTURE),
    (0x0000_0001, PEDOMETER),
];

pub const BLUE_COIN_FEATURES: &[(u32, FeatureType)] = &[
    (0x4000_0000, AUDIO_ADPCM_SYNC),
    (0x2000_0000, SWITCH),
    (0x1000_0000, DIRECTION_OF_ARRIVAL),
    (0x0800_0000, AUDIO_ADPCM),
    (0x0400_0000, MIC_LEVEL),
    (0x0080_0000, ACCELERATION),
    (0x0040_0000, GYROSCOPE),
    (0x0020_0000, MAGNETOMETER),
    (0x0010_0000, PRESSURE),
    (0x0004_0000, TEMPERATURE),
    (0x0000_0400, ACCELERATION_EVENT),
    (0x0000_0200, FREE_FALL),
    (0x0000_0100, SENSOR_FUSION_COMPACT),
    (0x0000_0080, SENSOR_FUSION),
    (0x0000_0010, ACTIVITY),
    (0x0000_0008, CARRY_POSITION),
    (0x0000_0002, MEMS_GESTURE),
    (0x0000_0001, PEDOMETER),
];

pub const NUCLEO_FEATURES: &[(u32, FeatureType)] = &[
    (0x4000_0000, AUDIO_ADPCM_SYNC),
    (0x2000_0000, SWITCH),
    (0x1000_0000, DIRECTION_OF_ARRIVAL),
    (0x0800_0000, AUDIO_ADPCM),
    (0x0400_0000, MIC_LEVEL),
    (0x0200_0000, PROXIMITY),
    (0x0100_0000, LUMINOSITY),
    (0x0080_0000, ACCELERATION),
    (0x0040_0000, GYROSCOPE),
    (0x0020_0000, MAGNETOMETER),
    (0x0010_0000, PRESSURE),
    (0x0008_0000, HUMIDITY),
    (0x0004_0000, TEMPERATURE),
    (0x0002_0000, BATTERY),
    (0x0001_0000, TEMPERATURE),
    (0x0000_0400, ACCELERATION_EVENT),
    (0x0000_0200, FREE_FALL),
    (0x0000_0100, SENSOR_FUSION_COMPACT),
    (0x0000_0080, SENSOR_FUSION),
    (0x0000_0010, ACTIVITY),
    (0x0000_0008, CARRY_POSITION),
    (0x0000_0004, PROXIMITY_GESTURE),
    (0x0000_0002, MEMS_GESTURE),
    (0x0000_0001, PEDOMETER),
];

/// Every built-in board table keyed by device type id
pub fn default_boards() -> [(u8, &'static [(u32, FeatureType)]); 5] {
    [
        (GENERIC_DEVICE_ID, &[]),
        (STEVAL_WESU1_DEVICE_ID, STEVAL_WESU1_FEATURES),
        (SENSOR_TILE_DEVICE_ID, SENSOR_TILE_FEATURES),
        (BLUE_COIN_DEVICE_ID, BLUE_COIN_FEATURES),
        (NUCLEO_DEVICE_ID, NUCLEO_FEATURES),
    ]
}
