//! Platform BLE transport seam
//!
//! The SDK never talks to a radio directly. A platform adapter implements
//! [`BleTransport`] (GATT client operations) and [`AdvertisementScanner`] (advertisement
//! source). Operations are non-blocking initiators: they return as soon as the request
//! is accepted and the outcome arrives later as a [`TransportEvent`] on the channel handed
//! over at connect time.

pub mod mock;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one link opened by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Pairing state of a peer as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Errors reported by a transport, either synchronously or in a completion
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Transport busy")]
    Busy,

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Transport not available: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Failures worth retrying after a short delay
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Busy | TransportError::Transient(_))
    }
}

/// What a characteristic allows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    pub fn can_read(&self) -> bool {
        self.read
    }

    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Completions and unsolicited notifications from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link established
    Connected,
    /// Link closed; `error` is set when the platform reported a failure status
    Disconnected { error: Option<TransportError> },
    ServicesDiscovered(Result<Vec<ServiceInfo>, TransportError>),
    CharacteristicRead {
        characteristic: Uuid,
        result: Result<Vec<u8>, TransportError>,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        result: Result<(), TransportError>,
    },
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        result: Result<(), TransportError>,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    RssiRead(Result<i32, TransportError>),
    BondStateChanged(BondState),
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connected => write!(f, "Connected"),
            TransportEvent::Disconnected { error } => match error {
                Some(e) => write!(f, "Disconnected {{ error: {} }}", e),
                None => write!(f, "Disconnected"),
            },
            TransportEvent::ServicesDiscovered(Ok(services)) => {
                write!(f, "ServicesDiscovered {{ services: {} }}", services.len())
            }
            TransportEvent::ServicesDiscovered(Err(e)) => {
                write!(f, "ServicesDiscovered {{ error: {} }}", e)
            }
            TransportEvent::CharacteristicRead { characteristic, result } => write!(
                f,
                "CharacteristicRead {{ characteristic: {}, ok: {} }}",
                characteristic,
                result.is_ok()
            ),
            TransportEvent::CharacteristicWritten { characteristic, result } => write!(
                f,
                "CharacteristicWritten {{ characteristic: {}, ok: {} }}",
                characteristic,
                result.is_ok()
            ),
            TransportEvent::DescriptorWritten {
                characteristic,
                result,
                ..
            } => write!(
                f,
                "DescriptorWritten {{ characteristic: {}, ok: {} }}",
                characteristic,
                result.is_ok()
            ),
            TransportEvent::CharacteristicChanged { characteristic, value } => write!(
                f,
                "CharacteristicChanged {{ characteristic: {}, data: {} }}",
                characteristic,
                hex::encode(value)
            ),
            TransportEvent::RssiRead(result) => write!(f, "RssiRead {{ {:?} }}", result),
            TransportEvent::BondStateChanged(state) => {
                write!(f, "BondStateChanged {{ {:?} }}", state)
            }
        }
    }
}

/// Channel a transport uses to report events for a connection
pub type TransportEventSender = mpsc::UnboundedSender<(ConnectionHandle, TransportEvent)>;

/// GATT client operations supplied by the platform
pub trait BleTransport: Send + Sync {
    /// Start connecting to `address`; events for the link go to `events`
    fn connect(
        &self,
        address: &str,
        events: TransportEventSender,
    ) -> Result<ConnectionHandle, TransportError>;

    fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    fn read_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Toggle local delivery of notifications; completes synchronously
    fn set_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn read_rssi(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    fn bond_state(&self, address: &str) -> BondState;
}

/// One received advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Platform address of the advertiser
    pub address: String,
    pub rssi: i32,
    /// Raw advertisement bytes
    pub data: Vec<u8>,
}

pub type AdvertisementSink = mpsc::UnboundedSender<Advertisement>;

/// Source of advertisements supplied by the platform
#[cfg_attr(test, mockall::automock)]
pub trait AdvertisementScanner: Send + Sync {
    /// Start delivering advertisements to `sink`
    fn start_scan(&self, sink: AdvertisementSink) -> Result<(), TransportError>;

    fn stop_scan(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Busy.is_transient());
        assert!(TransportError::Transient("gatt 133".into()).is_transient());
        assert!(!TransportError::Fatal("gone".into()).is_transient());
        assert!(!TransportError::NotConnected.is_transient());
    }

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties {
            write_without_response: true,
            ..Default::default()
        };
        assert!(props.can_write());
        assert!(!props.can_read());
        assert!(!props.can_notify());
    }

    #[test]
    fn test_event_display() {
        let event = TransportEvent::CharacteristicChanged {
            characteristic: Uuid::nil(),
            value: vec![0xAB, 0x01],
        };
        assert!(event.to_string().contains("ab01"));
        assert_eq!(ConnectionHandle(3).to_string(), "conn#3");
    }
}
