use super::state::TransferState;
use crate::protocol::{ContentHash, TransferProtocol};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "Upload"),
            TransferDirection::Download => write!(f, "Download"),
        }
    }
}

/// A download waiting for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadQueueItem {
    pub priority: i32,
    pub hash: ContentHash,
    pub path: String,
    pub size: u64,
    pub source_host: IpAddr,
}

/// An admitted upload request waiting for the file index to resolve its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadQueueItem {
    pub protocol: TransferProtocol,
    pub host: IpAddr,
    pub offset: u64,
    pub length: u64,
    pub segment_id: u32,
}

/// Outcome of an incoming upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadAdmission {
    /// An existing upload for (hash, host) took the new range.
    Restarted,
    /// Slot reserved; waiting on file path resolution.
    Pending,
    Rejected(crate::protocol::TransferErrorCode),
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentStatus {
    pub segment_id: u32,
    pub host: IpAddr,
    pub start: u64,
    pub end: u64,
    pub protocol: Option<TransferProtocol>,
    pub state: TransferState,
}

/// Snapshot of one transfer for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct TransferItemStatus {
    pub hash: ContentHash,
    pub path: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub progress_percent: f32,
    pub rate: u64,
    /// Payload bytes received or sent so far in this session.
    pub bytes_transferred: u64,
    pub host: Option<IpAddr>,
    pub uptime: Duration,
    pub online_segments: usize,
    pub segments: Vec<SegmentStatus>,
    pub bucket_bitmap: Vec<u8>,
}
