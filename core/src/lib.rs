// BlueST SDK Core: host side of the BlueST BLE protocol
//
// Advertisement parsing, feature registry and dispatch, the per-device connection
// state machine and discovery bookkeeping. The radio itself is supplied by the platform
// through the `transport` traits.

pub mod config;
pub mod feature;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, SdkConfig};
pub use feature::{
    DecodeError, Feature, FeatureDecoder, FeatureDispatchTable, FeatureListener, FeatureRegistry,
    FeatureType, Field, FieldType, FieldValue, RegistryError, Sample,
};
pub use protocol::{
    parse, AdvertiseError, BoardType, CommandPacket, CommandResponse, DeviceDescriptor,
    ProtocolError,
};
pub use registry::{DeviceRegistry, DiscoveryListener};
pub use session::{
    DebugConsole, DebugListener, NodeSession, NodeState, NodeStateListener, RssiListener,
};
pub use transport::{
    Advertisement, AdvertisementScanner, BleTransport, BondState, ConnectionHandle,
    TransportError, TransportEvent,
};

/// Any error the SDK reports synchronously
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("Advertisement error: {0}")]
    Advertise(#[from] AdvertiseError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SdkError>;
