use super::bucket::SegmentRange;
use super::command::Command;
use super::context::TransferContext;
use super::download::Disposition;
use super::progress::RateTracker;
use super::state::{Lifecycle, TransferState};
use super::types::{TransferDirection, TransferItemStatus, UploadQueueItem};
use crate::protocol::codec::{encode_direct_data, encode_routed_data};
use crate::protocol::{ContentHash, TransferProtocol, BUCKET_SIZE, NO_SEGMENT_ID, PACKET_DATA_MTU};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Serves byte ranges of one local file to one peer.
///
/// Between requests the upload idles; a fresh request for the same
/// (hash, host) restarts it on the new range.
#[derive(Debug)]
pub struct UploadTransfer {
    hash: ContentHash,
    path: String,
    file_size: u64,
    host: IpAddr,
    protocol: TransferProtocol,
    segment_id: u32,
    range: SegmentRange,
    state: TransferState,
    reads_outstanding: usize,
    bytes_sent: u64,
    rate: RateTracker,
    created_at: Instant,
    last_activity: Instant,
}

impl UploadTransfer {
    pub fn new(
        hash: ContentHash,
        path: String,
        file_size: u64,
        request: &UploadQueueItem,
        now: Instant,
    ) -> Self {
        let mut upload = Self {
            hash,
            path,
            file_size,
            host: request.host,
            protocol: request.protocol,
            segment_id: request.segment_id,
            range: SegmentRange::default(),
            state: TransferState::new(Lifecycle::Initializing),
            reads_outstanding: 0,
            bytes_sent: 0,
            rate: RateTracker::new(now),
            created_at: now,
            last_activity: now,
        };
        upload.set_request(request);
        upload
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn range(&self) -> SegmentRange {
        self.range
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn set_request(&mut self, request: &UploadQueueItem) {
        let end = request
            .offset
            .saturating_add(request.length)
            .min(self.file_size);
        self.range = SegmentRange::new(request.offset.min(self.file_size), end);
        self.protocol = request.protocol;
        self.segment_id = request.segment_id;
    }

    /// Takes a new range from the same peer.
    pub fn restart(&mut self, request: &UploadQueueItem, ctx: &mut TransferContext<'_>) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        debug!(
            "Upload {} to {} restarting at {}",
            self.hash, self.host, request.offset
        );
        self.set_request(request);
        self.start(ctx);
    }

    /// Queues disk reads for the current range, one bucket at a time.
    pub fn start(&mut self, ctx: &mut TransferContext<'_>) {
        self.last_activity = ctx.now;
        if self.range.is_empty() {
            debug!("Upload {} to {} has nothing to send", self.hash, self.host);
            self.state.transition(Lifecycle::Idle);
            return;
        }
        self.state.transition(Lifecycle::Running);
        info!(
            "Uploading {} bytes of {} to {}",
            self.range.len(),
            self.hash,
            self.host
        );

        let mut offset = self.range.start();
        while offset < self.range.end() {
            let length = (self.range.end() - offset).min(BUCKET_SIZE);
            ctx.send(Command::ReadFileRange {
                hash: self.hash,
                host: self.host,
                path: self.path.clone(),
                offset,
                length,
            });
            self.reads_outstanding += 1;
            offset += length;
        }
    }

    /// Disk returned a chunk: cut it into datagrams and send them.
    pub fn file_range_read(&mut self, offset: u64, data: &[u8], ctx: &mut TransferContext<'_>) {
        self.reads_outstanding = self.reads_outstanding.saturating_sub(1);
        if self.state.is_aborting() {
            self.finish_abort_if_drained();
            return;
        }
        if self.state.lifecycle().is_terminal() {
            return;
        }

        let end = (offset + data.len() as u64).min(self.range.end());
        let start = offset.max(self.range.start());
        if start >= end {
            trace!("Read at {} is outside the current range", offset);
        } else {
            let slice = &data[(start - offset) as usize..(end - offset) as usize];
            let mut pos = start;
            for chunk in slice.chunks(PACKET_DATA_MTU) {
                let datagram = if self.segment_id != NO_SEGMENT_ID {
                    encode_direct_data(self.protocol, self.segment_id, pos, chunk)
                } else {
                    encode_routed_data(self.protocol, pos, &self.hash, chunk)
                };
                ctx.send(Command::TransmitDatagram {
                    host: self.host,
                    datagram,
                });
                pos += chunk.len() as u64;
            }
            self.bytes_sent += end - start;
            self.rate.record((end - start) as usize, ctx.now);
        }

        self.last_activity = ctx.now;
        if self.reads_outstanding == 0 {
            self.state.transition(Lifecycle::Idle);
        }
    }

    pub fn file_read_failed(&mut self, offset: u64) {
        self.reads_outstanding = self.reads_outstanding.saturating_sub(1);
        if self.state.is_aborting() {
            self.finish_abort_if_drained();
            return;
        }
        warn!(
            "Reading {} at {} for {} failed",
            self.path, offset, self.host
        );
        self.state.transition(Lifecycle::Failed);
    }

    pub fn on_tick(&mut self, ctx: &mut TransferContext<'_>) {
        self.rate.sample(ctx.now);
        if self.state.lifecycle() == Lifecycle::Idle
            && ctx.now.saturating_duration_since(self.last_activity)
                >= ctx.settings.upload_idle_timeout()
        {
            debug!("Upload {} to {} idle, closing", self.hash, self.host);
            self.state.transition(Lifecycle::Finished);
        }
    }

    pub fn abort(&mut self) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        self.state.transition(Lifecycle::Aborting);
        self.finish_abort_if_drained();
    }

    fn finish_abort_if_drained(&mut self) {
        if self.state.lifecycle() == Lifecycle::Aborting && self.reads_outstanding == 0 {
            self.state.transition(Lifecycle::Aborted);
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.state.lifecycle() {
            Lifecycle::Finished => Disposition::Finished,
            Lifecycle::Aborted => Disposition::Aborted,
            Lifecycle::Failed => Disposition::Failed(format!("could not read {}", self.path)),
            _ => Disposition::Active,
        }
    }

    pub fn status(&self, now: Instant) -> TransferItemStatus {
        let progress_percent = if self.file_size == 0 {
            100.0
        } else {
            (self.bytes_sent.min(self.file_size) as f64 / self.file_size as f64 * 100.0) as f32
        };
        TransferItemStatus {
            hash: self.hash,
            path: self.path.clone(),
            direction: TransferDirection::Upload,
            state: self.state,
            progress_percent,
            rate: self.rate.rate(now),
            bytes_transferred: self.rate.total_bytes(),
            host: Some(self.host),
            uptime: now.saturating_duration_since(self.created_at),
            online_segments: usize::from(self.state.lifecycle() == Lifecycle::Running),
            segments: Vec::new(),
            bucket_bitmap: Vec::new(),
        }
    }
}
