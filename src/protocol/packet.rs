use super::ProtocolError;
use serde::Serialize;
use std::fmt;

/// First byte of every datagram: selects the framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MajorPacketType {
    DirectData = 0xc3,
    Data = 0xaa,
    Unicast = 0x55,
    Broadcast = 0x5a,
    Multicast = 0xa5,
}

impl TryFrom<u8> for MajorPacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0xc3 => Ok(Self::DirectData),
            0xaa => Ok(Self::Data),
            0x55 => Ok(Self::Unicast),
            0x5a => Ok(Self::Broadcast),
            0xa5 => Ok(Self::Multicast),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Second byte of unicast/broadcast/multicast datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MinorPacketType {
    SearchRequest = 0x11,
    SearchForwardRequest = 0x12,
    SearchResult = 0x13,
    TthSearchRequest = 0x14,
    TthSearchForwardRequest = 0x15,
    TthSearchResult = 0x16,
    TransferError = 0x20,
    DownloadRequest = 0x21,
    ProtocolCapabilityQuery = 0x31,
    ProtocolCapabilityResponse = 0x32,
    TthTreeRequest = 0x41,
    TthTreeReply = 0x42,
    Announce = 0x71,
    AnnounceForwardRequest = 0x72,
    AnnounceForwarded = 0x73,
    AnnounceReply = 0x74,
    RequestBucket = 0x81,
    RequestAllBuckets = 0x82,
    BucketExchange = 0x83,
    CidPing = 0x91,
    CidPingForwardRequest = 0x92,
    CidPingForwarded = 0x93,
    CidPingReply = 0x94,
    RevConnect = 0xa1,
    RevConnectReply = 0xa2,
}

impl TryFrom<u8> for MinorPacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MinorPacketType::*;
        let kind = match value {
            0x11 => SearchRequest,
            0x12 => SearchForwardRequest,
            0x13 => SearchResult,
            0x14 => TthSearchRequest,
            0x15 => TthSearchForwardRequest,
            0x16 => TthSearchResult,
            0x20 => TransferError,
            0x21 => DownloadRequest,
            0x31 => ProtocolCapabilityQuery,
            0x32 => ProtocolCapabilityResponse,
            0x41 => TthTreeRequest,
            0x42 => TthTreeReply,
            0x71 => Announce,
            0x72 => AnnounceForwardRequest,
            0x73 => AnnounceForwarded,
            0x74 => AnnounceReply,
            0x81 => RequestBucket,
            0x82 => RequestAllBuckets,
            0x83 => BucketExchange,
            0x91 => CidPing,
            0x92 => CidPingForwardRequest,
            0x93 => CidPingForwarded,
            0x94 => CidPingReply,
            0xa1 => RevConnect,
            0xa2 => RevConnectReply,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        };
        Ok(kind)
    }
}

/// Error codes carried in a transfer-error packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TransferErrorCode {
    PeerAlreadyTransferring = 0x01,
    NoSlotsAvailable = 0x02,
    FileNotSharedError = 0x03,
}

impl TransferErrorCode {
    /// Whether the download side should keep the peer around and retry later.
    pub fn is_transient(self) -> bool {
        !matches!(self, TransferErrorCode::FileNotSharedError)
    }
}

impl TryFrom<u8> for TransferErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::PeerAlreadyTransferring),
            0x02 => Ok(Self::NoSlotsAvailable),
            0x03 => Ok(Self::FileNotSharedError),
            other => Err(ProtocolError::UnknownErrorCode(other)),
        }
    }
}

impl fmt::Display for TransferErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferErrorCode::PeerAlreadyTransferring => write!(f, "peer already transferring"),
            TransferErrorCode::NoSlotsAvailable => write!(f, "no slots available"),
            TransferErrorCode::FileNotSharedError => write!(f, "file not shared"),
        }
    }
}
