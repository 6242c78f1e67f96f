pub mod capability;
pub mod codec;
pub mod constants;
pub mod hash;
pub mod packet;

use thiserror::Error;

pub use capability::{
    ProtocolCapability, TransferProtocol, CAP_BASIC, CAP_FAILSAFE, CAP_FEC, CAP_UTP,
};
pub use codec::{DirectData, DownloadRequest, RoutedData, TransferErrorPayload};
pub use constants::*;
pub use hash::ContentHash;
pub use packet::{MajorPacketType, MinorPacketType, TransferErrorCode};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated payload: needed {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("invalid payload length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown transfer error code 0x{0:02x}")]
    UnknownErrorCode(u8),

    #[error("unknown transfer protocol 0x{0:02x}")]
    UnknownProtocol(u8),

    #[error("offset {0} out of range")]
    OffsetOutOfRange(u64),
}
