//! One peer's share of a download.
//!
//! A segment is born waiting on its peer's protocol capability. Until that
//! resolves it has no range, issues no requests and drops any data that
//! arrives for it.

use super::bucket::{bucket_number_of, SegmentRange};
use super::command::Command;
use super::state::{Lifecycle, TransferState};
use super::types::SegmentStatus;
use crate::protocol::{ContentHash, ProtocolCapability, TransferProtocol};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapabilityGate {
    Awaiting,
    Resolved(ProtocolCapability),
}

/// A bucket whose bytes have all arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBucket {
    pub bucket_number: u64,
    pub data: Vec<u8>,
}

/// Result of a stall check on tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallCheck {
    Active,
    Retry(Command),
    GiveUp,
}

/// Receive buffer for one bucket, tracking which byte ranges are filled.
#[derive(Debug)]
struct BucketBuffer {
    data: Vec<u8>,
    filled: Vec<(usize, usize)>,
}

impl BucketBuffer {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            filled: Vec::new(),
        }
    }

    fn write(&mut self, at: usize, bytes: &[u8]) {
        let end = (at + bytes.len()).min(self.data.len());
        if at >= end {
            return;
        }
        self.data[at..end].copy_from_slice(&bytes[..end - at]);

        self.filled.push((at, end));
        self.filled.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.filled.len());
        for &(s, e) in &self.filled {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.filled = merged;
    }

    fn is_full(&self) -> bool {
        matches!(self.filled.as_slice(), [(0, e)] if *e == self.data.len())
    }
}

#[derive(Debug)]
pub struct TransferSegment {
    hash: ContentHash,
    segment_id: u32,
    host: IpAddr,
    cid: Vec<u8>,
    range: SegmentRange,
    gate: CapabilityGate,
    protocol: Option<TransferProtocol>,
    state: TransferState,
    buffers: BTreeMap<u64, BucketBuffer>,
    handed_off: BTreeSet<u64>,
    verified: BTreeSet<u64>,
    last_activity: Instant,
    stall_retries: u32,
    bytes_received: u64,
}

impl TransferSegment {
    pub fn new(hash: ContentHash, segment_id: u32, host: IpAddr, cid: Vec<u8>, now: Instant) -> Self {
        Self {
            hash,
            segment_id,
            host,
            cid,
            range: SegmentRange::default(),
            gate: CapabilityGate::Awaiting,
            protocol: None,
            state: TransferState::new(Lifecycle::Initializing),
            buffers: BTreeMap::new(),
            handed_off: BTreeSet::new(),
            verified: BTreeSet::new(),
            last_activity: now,
            stall_retries: 0,
            bytes_received: 0,
        }
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn range(&self) -> SegmentRange {
        self.range
    }

    pub fn protocol(&self) -> Option<TransferProtocol> {
        self.protocol
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn is_awaiting_capability(&self) -> bool {
        self.gate == CapabilityGate::Awaiting
    }

    /// Resolved but holding no range; ready to be given work.
    pub fn is_idle(&self) -> bool {
        !self.is_awaiting_capability() && self.protocol.is_some() && self.range.is_empty()
    }

    /// Picks the transport from the peer's capabilities and our preference
    /// order. `None` means there is nothing in common and the segment failed.
    pub fn resolve_capability(
        &mut self,
        capability: ProtocolCapability,
        preference: &[TransferProtocol],
    ) -> Option<TransferProtocol> {
        if !self.is_awaiting_capability() {
            return self.protocol;
        }
        self.gate = CapabilityGate::Resolved(capability);
        self.protocol = capability.choose(preference);
        match self.protocol {
            Some(protocol) => {
                debug!(
                    "Segment {} to {} will use {}",
                    self.segment_id, self.host, protocol
                );
            }
            None => {
                self.state.transition(Lifecycle::Failed);
            }
        }
        self.protocol
    }

    /// Gives the segment a byte range. Refused while the capability is
    /// still unresolved.
    pub fn assign_range(&mut self, start: u64, end: u64, now: Instant) -> bool {
        if self.is_awaiting_capability() || self.protocol.is_none() {
            debug!(
                "Segment {} cannot be sized before its capability resolves",
                self.segment_id
            );
            return false;
        }
        self.range = SegmentRange::new(start, end);
        self.buffers.clear();
        self.handed_off.clear();
        self.verified.clear();
        self.last_activity = now;
        self.stall_retries = 0;
        self.state.transition(Lifecycle::Running);
        true
    }

    /// Request covering `[offset, range end)`.
    fn request_from(&self, offset: u64, end: u64) -> Option<Command> {
        let protocol = self.protocol?;
        if offset >= end {
            return None;
        }
        Some(Command::SendDownloadRequest {
            protocol,
            host: self.host,
            hash: self.hash,
            offset,
            length: end - offset,
            segment_id: self.segment_id,
            cid: self.cid.clone(),
        })
    }

    pub fn download_request(&self) -> Option<Command> {
        self.request_from(self.range.start(), self.range.end())
    }

    /// Accumulates `data` at `offset`, returning buckets that became whole.
    /// Bytes outside the range or for buckets already handed off are ignored.
    pub fn incoming_data(&mut self, offset: u64, data: &[u8], now: Instant) -> Vec<CompletedBucket> {
        let mut completed = Vec::new();
        if self.range.is_empty() || self.state.is_aborting() {
            trace!("Segment {} not receiving, dropping data", self.segment_id);
            return completed;
        }

        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() && pos < self.range.end() {
            if pos < self.range.start() {
                let skip = (self.range.start() - pos).min(rest.len() as u64) as usize;
                pos += skip as u64;
                rest = &rest[skip..];
                continue;
            }
            let bucket = bucket_number_of(pos);
            let Some((bucket_start, bucket_end)) = self.range.bucket_bounds(bucket) else {
                break;
            };
            let take = (bucket_end - pos).min(rest.len() as u64) as usize;
            if !self.handed_off.contains(&bucket) {
                let buffer = self
                    .buffers
                    .entry(bucket)
                    .or_insert_with(|| BucketBuffer::new((bucket_end - bucket_start) as usize));
                buffer.write((pos - bucket_start) as usize, &rest[..take]);
                self.bytes_received += take as u64;
                if buffer.is_full() {
                    if let Some(buffer) = self.buffers.remove(&bucket) {
                        self.handed_off.insert(bucket);
                        completed.push(CompletedBucket {
                            bucket_number: bucket,
                            data: buffer.data,
                        });
                    }
                }
            }
            pos += take as u64;
            rest = &rest[take..];
        }

        self.last_activity = now;
        self.stall_retries = 0;
        if self.state.lifecycle() == Lifecycle::Stalled {
            self.state.transition(Lifecycle::Running);
        }
        completed
    }

    /// Throws away a bucket that failed verification and asks the peer for
    /// it again.
    pub fn rerequest_bucket(&mut self, bucket: u64) -> Option<Command> {
        let (start, end) = self.range.bucket_bounds(bucket)?;
        self.handed_off.remove(&bucket);
        self.buffers.remove(&bucket);
        self.verified.remove(&bucket);
        self.request_from(start, end)
    }

    pub fn bucket_verified(&mut self, bucket: u64) {
        if self.range.bucket_bounds(bucket).is_some() {
            self.verified.insert(bucket);
        }
    }

    /// Every bucket in the range has passed verification.
    pub fn is_range_complete(&self) -> bool {
        !self.range.is_empty() && self.verified.len() as u64 == self.range.bucket_count()
    }

    pub fn check_stall(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> StallCheck {
        if self.range.is_empty()
            || !matches!(
                self.state.lifecycle(),
                Lifecycle::Running | Lifecycle::Stalled
            )
        {
            return StallCheck::Active;
        }
        if now.saturating_duration_since(self.last_activity) < timeout {
            return StallCheck::Active;
        }

        let Some(first_missing) = self
            .range
            .buckets()
            .find(|b| !self.handed_off.contains(b))
        else {
            // Everything is with the hasher; nothing to wait on from the peer.
            return StallCheck::Active;
        };

        if self.stall_retries >= max_retries {
            self.state.transition(Lifecycle::Failed);
            return StallCheck::GiveUp;
        }
        self.stall_retries += 1;
        self.last_activity = now;
        self.state.transition(Lifecycle::Stalled);

        let offset = self
            .range
            .bucket_bounds(first_missing)
            .map(|(start, _)| start)
            .unwrap_or_else(|| self.range.start());
        self.buffers.retain(|&b, _| b < first_missing);
        match self.request_from(offset, self.range.end()) {
            Some(request) => StallCheck::Retry(request),
            None => StallCheck::Active,
        }
    }

    pub fn abort(&mut self) {
        self.state.transition(Lifecycle::Aborting);
        self.buffers.clear();
        self.state.transition(Lifecycle::Aborted);
    }

    pub fn status(&self) -> SegmentStatus {
        SegmentStatus {
            segment_id: self.segment_id,
            host: self.host,
            start: self.range.start(),
            end: self.range.end(),
            protocol: self.protocol,
            state: self.state,
        }
    }
}
