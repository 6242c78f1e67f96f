pub mod bucket;
pub mod command;
pub mod context;
pub mod download;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod segment;
pub mod state;
pub mod types;
pub mod upload;

pub use bucket::SegmentRange;
pub use command::{command_channel, Command, CommandReceiver, CommandSender};
pub use download::{BucketState, Disposition, DownloadTransfer};
pub use manager::TransferManager;
pub use state::{Lifecycle, TransferState};
pub use types::{
    DownloadQueueItem, SegmentStatus, TransferDirection, TransferItemStatus, UploadAdmission,
    UploadQueueItem,
};
pub use upload::UploadTransfer;

use crate::protocol::ContentHash;
use context::TransferContext;
use std::net::IpAddr;
use std::time::Instant;

/// A live upload or download held in the manager's table.
#[derive(Debug)]
pub enum Transfer {
    Upload(UploadTransfer),
    Download(DownloadTransfer),
}

impl Transfer {
    pub fn direction(&self) -> TransferDirection {
        match self {
            Transfer::Upload(_) => TransferDirection::Upload,
            Transfer::Download(_) => TransferDirection::Download,
        }
    }

    pub fn hash(&self) -> ContentHash {
        match self {
            Transfer::Upload(u) => u.hash(),
            Transfer::Download(d) => d.hash(),
        }
    }

    /// Remote end for uploads; downloads span many hosts and have none.
    pub fn host(&self) -> Option<IpAddr> {
        match self {
            Transfer::Upload(u) => Some(u.host()),
            Transfer::Download(_) => None,
        }
    }

    pub fn state(&self) -> TransferState {
        match self {
            Transfer::Upload(u) => u.state(),
            Transfer::Download(d) => d.state(),
        }
    }

    /// Matches on direction, and on host when one is given.
    pub fn matches(&self, direction: TransferDirection, host: Option<IpAddr>) -> bool {
        self.direction() == direction && (host.is_none() || self.host() == host)
    }

    pub fn abort(&mut self, ctx: &mut TransferContext<'_>) {
        match self {
            Transfer::Upload(u) => u.abort(),
            Transfer::Download(d) => d.abort(ctx),
        }
    }

    pub fn on_tick(&mut self, ctx: &mut TransferContext<'_>) {
        match self {
            Transfer::Upload(u) => u.on_tick(ctx),
            Transfer::Download(d) => d.on_tick(ctx),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Transfer::Upload(u) => u.disposition(),
            Transfer::Download(d) => d.disposition(),
        }
    }

    pub fn status(&self, now: Instant) -> TransferItemStatus {
        match self {
            Transfer::Upload(u) => u.status(now),
            Transfer::Download(d) => d.status(now),
        }
    }
}
