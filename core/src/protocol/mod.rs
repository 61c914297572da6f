/// BlueST wire protocol
///
/// - **advertise**: advertisement records and the vendor field
/// - **uuids**: service, characteristic and descriptor identifiers
/// - **command**: feature command packets and their replies

pub mod advertise;
pub mod command;
pub mod uuids;

pub use advertise::{parse, AdvertiseError, BoardType, DeviceDescriptor};
pub use command::{CommandPacket, CommandResponse, PendingCommands, ProtocolError};
pub use uuids::CharacteristicKind;
