use crate::protocol::{ContentHash, TransferErrorCode, TransferProtocol};
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Work the engine hands to its collaborators. Every request that expects an
/// answer comes back as an [`crate::service::EngineEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // File index
    FilePathNameRequest {
        hash: ContentHash,
    },

    // Peer discovery
    SearchTthAlternateSources {
        hash: ContentHash,
    },
    RequestProtocolCapability {
        host: IpAddr,
    },

    // Network IO
    TthTreeRequest {
        host: IpAddr,
        root: ContentHash,
        start_bucket: u32,
        bucket_count: u32,
    },
    SendDownloadRequest {
        protocol: TransferProtocol,
        host: IpAddr,
        hash: ContentHash,
        offset: u64,
        length: u64,
        segment_id: u32,
        cid: Vec<u8>,
    },
    SendTransferError {
        host: IpAddr,
        code: TransferErrorCode,
        hash: ContentHash,
        offset: u64,
    },
    TransmitDatagram {
        host: IpAddr,
        datagram: Vec<u8>,
    },

    // Hashing engine
    HashBucketRequest {
        root: ContentHash,
        bucket_number: u64,
        data: Vec<u8>,
        peer: IpAddr,
    },

    // Disk IO
    FlushBucket {
        hash: ContentHash,
        path: String,
        bucket_number: u64,
        data: Vec<u8>,
    },
    ReadFileRange {
        hash: ContentHash,
        host: IpAddr,
        path: String,
        offset: u64,
        length: u64,
    },
    RenameIncompleteFile {
        path: String,
    },

    // Transfer state persistence
    SaveBucketFlushStateBitmap {
        hash: ContentHash,
        bitmap: Vec<u8>,
    },
    LoadBucketFlushStateBitmap {
        hash: ContentHash,
    },

    // UI notifications
    DownloadStarted {
        hash: ContentHash,
    },
    DownloadCompleted {
        hash: ContentHash,
    },
    DownloadRequeued {
        hash: ContentHash,
    },
    DownloadFailed {
        hash: ContentHash,
        reason: String,
    },
}

pub type CommandSender = mpsc::UnboundedSender<Command>;
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}
