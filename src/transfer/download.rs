//! A file being fetched from one or more peers.
//!
//! Buckets move `Missing -> Requested -> Hashing -> Flushing -> Flushed`.
//! A hash mismatch sends a bucket back to `Requested` on the same segment;
//! a lost segment or a failed flush sends it back to `Missing`.

use super::bucket::SegmentRange;
use super::command::Command;
use super::context::TransferContext;
use super::progress::RateTracker;
use super::segment::{CompletedBucket, StallCheck, TransferSegment};
use super::state::{Lifecycle, TransferState};
use super::types::{DownloadQueueItem, TransferDirection, TransferItemStatus};
use crate::protocol::{
    ContentHash, ProtocolCapability, HASH_BUCKET_QUEUE_CONGESTION_THRESHOLD,
    HASH_BUCKET_QUEUE_CRITICAL_THRESHOLD,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Missing,
    Requested(u32),
    Hashing,
    Flushing,
    Flushed,
}

/// What the manager should do with a download after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Active,
    Finished,
    Requeue,
    Failed(String),
    Aborted,
}

#[derive(Debug, Clone)]
struct PeerSource {
    host: IpAddr,
    cid: Vec<u8>,
    /// Set after a transient refusal; no segment is opened before it.
    retry_at: Option<Instant>,
}

impl PeerSource {
    fn is_available(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }
}

#[derive(Debug)]
struct PendingBucket {
    data: Vec<u8>,
    segment_id: u32,
    computed: Option<ContentHash>,
}

#[derive(Debug)]
pub struct DownloadTransfer {
    hash: ContentHash,
    path: String,
    file_size: u64,
    source_host: IpAddr,
    file_range: SegmentRange,
    state: TransferState,
    buckets: Vec<BucketState>,
    tree: HashMap<u64, ContentHash>,
    peers: Vec<PeerSource>,
    /// Peers that said they do not share the file.
    refused: HashSet<IpAddr>,
    segments: BTreeMap<u32, TransferSegment>,
    pending_hash: HashMap<u64, PendingBucket>,
    flushing: HashSet<u64>,
    flush_failures: u32,
    tree_requested_at: Instant,
    tree_retries: u32,
    requeue: bool,
    failure: Option<String>,
    rate: RateTracker,
    created_at: Instant,
}

impl DownloadTransfer {
    pub fn new(item: &DownloadQueueItem, now: Instant) -> Self {
        let file_range = SegmentRange::file(item.size);
        Self {
            hash: item.hash,
            path: item.path.clone(),
            file_size: item.size,
            source_host: item.source_host,
            file_range,
            state: TransferState::new(Lifecycle::Initializing),
            buckets: vec![BucketState::Missing; file_range.bucket_count() as usize],
            tree: HashMap::new(),
            peers: Vec::new(),
            refused: HashSet::new(),
            segments: BTreeMap::new(),
            pending_hash: HashMap::new(),
            flushing: HashSet::new(),
            flush_failures: 0,
            tree_requested_at: now,
            tree_retries: 0,
            requeue: false,
            failure: None,
            rate: RateTracker::new(now),
            created_at: now,
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn source_host(&self) -> IpAddr {
        self.source_host
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bucket_state(&self, bucket: u64) -> Option<BucketState> {
        self.buckets.get(bucket as usize).copied()
    }

    pub fn segment_ids(&self) -> Vec<u32> {
        self.segments.keys().copied().collect()
    }

    /// Buckets handed to the hasher or disk and not yet back.
    pub fn in_flight_buckets(&self) -> usize {
        self.pending_hash.len() + self.flushing.len()
    }

    /// Hash and flush requests the collaborators still owe us. Hashed
    /// buckets waiting on a tree entry are not counted.
    fn outstanding_requests(&self) -> usize {
        let hashing = self
            .pending_hash
            .values()
            .filter(|p| p.computed.is_none())
            .count();
        hashing + self.flushing.len()
    }

    pub fn start(&mut self, ctx: &mut TransferContext<'_>) {
        info!(
            "Starting download {} ({} bytes, {} buckets) to {}",
            self.hash,
            self.file_size,
            self.buckets.len(),
            self.path
        );
        ctx.send(Command::LoadBucketFlushStateBitmap { hash: self.hash });
        ctx.send(Command::SearchTthAlternateSources { hash: self.hash });
        if self.buckets.is_empty() {
            self.check_completion(ctx);
            return;
        }
        self.request_tree(self.source_host, 0, self.buckets.len() as u64, ctx);
        self.add_peer(self.source_host, Vec::new(), ctx);
    }

    fn request_tree(&mut self, host: IpAddr, start_bucket: u64, bucket_count: u64, ctx: &mut TransferContext<'_>) {
        ctx.send(Command::TthTreeRequest {
            host,
            root: self.hash,
            start_bucket: start_bucket as u32,
            bucket_count: bucket_count as u32,
        });
        self.tree_requested_at = ctx.now;
    }

    /// First and last unflushed bucket with no tree entry yet.
    fn missing_tree_range(&self) -> Option<(u64, u64)> {
        let mut missing = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(i, b)| **b != BucketState::Flushed && !self.tree.contains_key(&(*i as u64)))
            .map(|(i, _)| i as u64);
        let first = missing.next()?;
        let last = missing.last().unwrap_or(first);
        Some((first, last))
    }

    /// Asks again for tree entries that never arrived. After the stall
    /// retries run out the download goes back to the queue.
    fn check_tree(&mut self, ctx: &mut TransferContext<'_>) {
        let Some((first, last)) = self.missing_tree_range() else {
            return;
        };
        if ctx.now.saturating_duration_since(self.tree_requested_at) < ctx.settings.stall_timeout() {
            return;
        }
        if self.tree_retries >= ctx.settings.max_stall_retries {
            warn!("No hash tree for {} after {} retries", self.hash, self.tree_retries);
            self.release_segments(ctx);
            self.requeue = true;
            return;
        }
        let host = self
            .peers
            .iter()
            .find(|p| p.is_available(ctx.now))
            .map(|p| p.host)
            .unwrap_or(self.source_host);
        self.tree_retries += 1;
        debug!(
            "Re-requesting tree entries {}..={} of {} from {}",
            first, last, self.hash, host
        );
        self.request_tree(host, first, last - first + 1, ctx);
    }

    /// Registers a peer holding the file and opens a segment to it when
    /// the host is free.
    pub fn add_peer(&mut self, host: IpAddr, cid: Vec<u8>, ctx: &mut TransferContext<'_>) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        if self.refused.contains(&host) {
            trace!("{} does not share {}", host, self.hash);
            return;
        }
        match self.peers.iter_mut().find(|p| p.host == host) {
            Some(peer) => {
                if !cid.is_empty() {
                    peer.cid = cid;
                }
            }
            None => {
                debug!("Download {} gained source {}", self.hash, host);
                self.peers.push(PeerSource {
                    host,
                    cid,
                    retry_at: None,
                });
                self.requeue = false;
            }
        }
        self.open_segment(host, ctx);
    }

    fn open_segment(&mut self, host: IpAddr, ctx: &mut TransferContext<'_>) -> bool {
        if ctx.downloading_hosts.contains(&host) || self.segments.values().any(|s| s.host() == host) {
            trace!("Host {} already serving a segment", host);
            return false;
        }
        let Some(peer) = self.peers.iter_mut().find(|p| p.host == host) else {
            return false;
        };
        if !peer.is_available(ctx.now) {
            return false;
        }
        peer.retry_at = None;
        let segment_id = ctx.segments.allocate(self.hash);
        let segment = TransferSegment::new(self.hash, segment_id, host, peer.cid.clone(), ctx.now);
        self.segments.insert(segment_id, segment);
        ctx.downloading_hosts.insert(host);
        ctx.capability_requests.push(host);
        debug!(
            "Opened segment {} to {} for {}",
            segment_id, host, self.hash
        );
        true
    }

    fn fill_idle_peers(&mut self, ctx: &mut TransferContext<'_>) {
        if self.requeue {
            return;
        }
        let hosts: Vec<IpAddr> = self.peers.iter().map(|p| p.host).collect();
        for host in hosts {
            self.open_segment(host, ctx);
        }
    }

    fn drop_segment(&mut self, segment_id: u32, ctx: &mut TransferContext<'_>) {
        let Some(mut segment) = self.segments.remove(&segment_id) else {
            return;
        };
        segment.abort();
        ctx.segments.release(segment_id);
        ctx.downloading_hosts.remove(&segment.host());
        for state in self.buckets.iter_mut() {
            if *state == BucketState::Requested(segment_id) {
                *state = BucketState::Missing;
            }
        }
        trace!("Dropped segment {} for {}", segment_id, self.hash);
    }

    fn drop_peer(&mut self, host: IpAddr, ctx: &mut TransferContext<'_>) {
        let ids: Vec<u32> = self
            .segments
            .values()
            .filter(|s| s.host() == host)
            .map(|s| s.segment_id())
            .collect();
        for id in ids {
            self.drop_segment(id, ctx);
        }
        self.peers.retain(|p| p.host != host);
        self.check_sources(ctx.now);
    }

    /// Drops `host`'s segments but keeps it as a source to try again once
    /// the stall timeout has passed.
    fn back_off_peer(&mut self, host: IpAddr, ctx: &mut TransferContext<'_>) {
        let ids: Vec<u32> = self
            .segments
            .values()
            .filter(|s| s.host() == host)
            .map(|s| s.segment_id())
            .collect();
        for id in ids {
            self.drop_segment(id, ctx);
        }
        if let Some(peer) = self.peers.iter_mut().find(|p| p.host == host) {
            peer.retry_at = Some(ctx.now + ctx.settings.stall_timeout());
        }
        self.check_sources(ctx.now);
    }

    /// Releases every segment; used on teardown.
    pub fn release_segments(&mut self, ctx: &mut TransferContext<'_>) {
        let ids = self.segment_ids();
        for id in ids {
            self.drop_segment(id, ctx);
        }
    }

    /// Flags a requeue once no segment is running and no source can be
    /// tried right now.
    fn check_sources(&mut self, now: Instant) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        let usable = self.peers.iter().any(|p| p.is_available(now));
        if self.segments.is_empty() && !usable {
            debug!("Download {} has no usable sources left", self.hash);
            self.requeue = true;
        }
    }

    /// The capability lookup for `host` went unanswered.
    pub fn capability_unavailable(&mut self, host: IpAddr, ctx: &mut TransferContext<'_>) {
        warn!("{} never answered a capability query for {}", host, self.hash);
        self.back_off_peer(host, ctx);
    }

    /// The capability of `host` is known: size its waiting segments.
    pub fn capability_resolved(
        &mut self,
        host: IpAddr,
        capability: ProtocolCapability,
        ctx: &mut TransferContext<'_>,
    ) {
        let waiting: Vec<u32> = self
            .segments
            .values()
            .filter(|s| s.host() == host && s.is_awaiting_capability())
            .map(|s| s.segment_id())
            .collect();
        for id in waiting {
            let chosen = match self.segments.get_mut(&id) {
                Some(segment) => segment.resolve_capability(capability, &ctx.settings.protocol_preference),
                None => continue,
            };
            if chosen.is_none() {
                warn!(
                    "No common transfer protocol with {} (capability {:#04x})",
                    host,
                    capability.bits()
                );
                self.drop_peer(host, ctx);
                return;
            }
            self.dispatch_segment(id, ctx);
        }
    }

    /// First run of contiguous missing buckets, at most `max` long.
    fn next_range(&self, max: u32) -> Option<(usize, usize)> {
        let first = self.buckets.iter().position(|b| *b == BucketState::Missing)?;
        let mut last = first;
        while last + 1 < self.buckets.len()
            && self.buckets[last + 1] == BucketState::Missing
            && (last + 1 - first) < max as usize
        {
            last += 1;
        }
        Some((first, last))
    }

    /// Gives an idle segment its next range, honouring hash backpressure.
    fn dispatch_segment(&mut self, segment_id: u32, ctx: &mut TransferContext<'_>) {
        if self.state.is_paused() || self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        let in_flight = self.in_flight_buckets();
        if in_flight >= HASH_BUCKET_QUEUE_CRITICAL_THRESHOLD {
            if !self.state.is_io_wait() {
                debug!("Download {} waiting on {} hashed buckets", self.hash, in_flight);
            }
            self.state.set_io_wait(true);
            return;
        }
        let max = if in_flight >= HASH_BUCKET_QUEUE_CONGESTION_THRESHOLD {
            1
        } else {
            ctx.settings.max_segment_buckets.max(1)
        };

        let Some((first, last)) = self.next_range(max) else {
            trace!("Nothing left to request for {}", self.hash);
            self.drop_segment(segment_id, ctx);
            return;
        };
        let (Some((start, _)), Some((_, end))) = (
            self.file_range.bucket_bounds(first as u64),
            self.file_range.bucket_bounds(last as u64),
        ) else {
            return;
        };
        let Some(segment) = self.segments.get_mut(&segment_id) else {
            return;
        };
        if !segment.assign_range(start, end, ctx.now) {
            return;
        }
        for state in &mut self.buckets[first..=last] {
            *state = BucketState::Requested(segment_id);
        }
        if let Some(request) = segment.download_request() {
            ctx.send(request);
        }
        self.state.transition(Lifecycle::Running);
    }

    fn dispatch_idle_segments(&mut self, ctx: &mut TransferContext<'_>) {
        let idle: Vec<u32> = self
            .segments
            .values()
            .filter(|s| s.is_idle())
            .map(|s| s.segment_id())
            .collect();
        for id in idle {
            self.dispatch_segment(id, ctx);
        }
    }

    fn resume_io_wait(&mut self, ctx: &mut TransferContext<'_>) {
        if self.state.is_io_wait() && self.in_flight_buckets() < HASH_BUCKET_QUEUE_CONGESTION_THRESHOLD {
            debug!("Download {} leaving IO wait", self.hash);
            self.state.set_io_wait(false);
            self.dispatch_idle_segments(ctx);
        }
    }

    /// Routed data addressed by file offset.
    pub fn incoming_data(&mut self, offset: u64, data: &[u8], ctx: &mut TransferContext<'_>) {
        let owner = self
            .segments
            .values()
            .find(|s| s.range().contains(offset))
            .map(|s| s.segment_id());
        match owner {
            Some(id) => self.accept_segment_data(id, offset, data, ctx),
            None => trace!("No segment of {} covers offset {}", self.hash, offset),
        }
    }

    /// Data addressed to one of our segment ids.
    pub fn incoming_direct_data(
        &mut self,
        segment_id: u32,
        offset: u64,
        data: &[u8],
        ctx: &mut TransferContext<'_>,
    ) {
        if self.segments.contains_key(&segment_id) {
            self.accept_segment_data(segment_id, offset, data, ctx);
        }
    }

    fn accept_segment_data(
        &mut self,
        segment_id: u32,
        offset: u64,
        data: &[u8],
        ctx: &mut TransferContext<'_>,
    ) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        let Some(segment) = self.segments.get_mut(&segment_id) else {
            return;
        };
        let completed = segment.incoming_data(offset, data, ctx.now);
        self.rate.record(data.len(), ctx.now);
        if self.state.lifecycle() == Lifecycle::Stalled {
            self.state.transition(Lifecycle::Running);
        }
        for bucket in completed {
            self.bucket_received(segment_id, bucket, ctx);
        }
    }

    fn bucket_received(&mut self, segment_id: u32, bucket: CompletedBucket, ctx: &mut TransferContext<'_>) {
        let number = bucket.bucket_number;
        let Some(state) = self.buckets.get_mut(number as usize) else {
            return;
        };
        if *state != BucketState::Requested(segment_id) {
            trace!("Bucket {} of {} arrived in state {:?}", number, self.hash, state);
            return;
        }
        *state = BucketState::Hashing;
        ctx.send(Command::HashBucketRequest {
            root: self.hash,
            bucket_number: number,
            data: bucket.data.clone(),
            peer: self
                .segments
                .get(&segment_id)
                .map(|s| s.host())
                .unwrap_or(self.source_host),
        });
        self.pending_hash.insert(
            number,
            PendingBucket {
                data: bucket.data,
                segment_id,
                computed: None,
            },
        );
        if self.in_flight_buckets() >= HASH_BUCKET_QUEUE_CRITICAL_THRESHOLD {
            self.state.set_io_wait(true);
        }
    }

    /// The hasher finished a bucket.
    pub fn hash_bucket_reply(&mut self, bucket: u64, computed: ContentHash, ctx: &mut TransferContext<'_>) {
        if self.state.is_aborting() {
            self.pending_hash.remove(&bucket);
            self.finish_abort_if_drained();
            return;
        }
        let Some(pending) = self.pending_hash.get_mut(&bucket) else {
            trace!("Unexpected hash reply for bucket {} of {}", bucket, self.hash);
            return;
        };
        pending.computed = Some(computed);
        self.verify_bucket(bucket, ctx);
        self.resume_io_wait(ctx);
    }

    fn verify_bucket(&mut self, bucket: u64, ctx: &mut TransferContext<'_>) {
        let Some(expected) = self.tree.get(&bucket).copied() else {
            debug!("Bucket {} of {} waiting on its tree entry", bucket, self.hash);
            return;
        };
        match self.pending_hash.get(&bucket) {
            Some(PendingBucket { computed: Some(_), .. }) => {}
            _ => return,
        }
        let Some(pending) = self.pending_hash.remove(&bucket) else {
            return;
        };

        if pending.computed == Some(expected) {
            self.buckets[bucket as usize] = BucketState::Flushing;
            self.flushing.insert(bucket);
            ctx.send(Command::FlushBucket {
                hash: self.hash,
                path: self.path.clone(),
                bucket_number: bucket,
                data: pending.data,
            });
            let complete = match self.segments.get_mut(&pending.segment_id) {
                Some(segment) => {
                    segment.bucket_verified(bucket);
                    segment.is_range_complete()
                }
                None => false,
            };
            if complete {
                self.segment_range_complete(pending.segment_id, ctx);
            }
            return;
        }

        warn!(
            "Bucket {} of {} failed verification, requesting it again",
            bucket, self.hash
        );
        match self.segments.get_mut(&pending.segment_id) {
            Some(segment) => {
                self.buckets[bucket as usize] = BucketState::Requested(pending.segment_id);
                if let Some(request) = segment.rerequest_bucket(bucket) {
                    ctx.send(request);
                }
            }
            None => {
                self.buckets[bucket as usize] = BucketState::Missing;
                self.fill_idle_peers(ctx);
                self.dispatch_idle_segments(ctx);
            }
        }
    }

    /// A segment delivered its whole range: retire it and hand the peer
    /// fresh work on a new segment.
    fn segment_range_complete(&mut self, segment_id: u32, ctx: &mut TransferContext<'_>) {
        let Some(host) = self.segments.get(&segment_id).map(|s| s.host()) else {
            return;
        };
        self.drop_segment(segment_id, ctx);
        if self.buckets.contains(&BucketState::Missing) {
            self.open_segment(host, ctx);
        }
    }

    pub fn tth_tree_reply(&mut self, entries: &[(u32, ContentHash)], ctx: &mut TransferContext<'_>) {
        let mut added = 0usize;
        for &(bucket, hash) in entries {
            if (bucket as usize) < self.buckets.len() {
                self.tree.insert(bucket as u64, hash);
                added += 1;
            }
        }
        debug!("Download {} got {} tree entries", self.hash, added);
        if added > 0 {
            self.tree_requested_at = ctx.now;
            self.tree_retries = 0;
        }
        if self.state.is_aborting() {
            return;
        }
        let waiting: Vec<u64> = self
            .pending_hash
            .iter()
            .filter(|(_, p)| p.computed.is_some())
            .map(|(b, _)| *b)
            .collect();
        for bucket in waiting {
            self.verify_bucket(bucket, ctx);
        }
        self.resume_io_wait(ctx);
    }

    pub fn bucket_flushed(&mut self, bucket: u64, ctx: &mut TransferContext<'_>) {
        if !self.flushing.remove(&bucket) {
            trace!("Unexpected flush reply for bucket {} of {}", bucket, self.hash);
            return;
        }
        if self.state.is_aborting() {
            self.finish_abort_if_drained();
            return;
        }
        self.buckets[bucket as usize] = BucketState::Flushed;
        self.check_completion(ctx);
        self.resume_io_wait(ctx);
    }

    pub fn bucket_flush_failed(&mut self, bucket: u64, ctx: &mut TransferContext<'_>) {
        if !self.flushing.remove(&bucket) {
            return;
        }
        if self.state.is_aborting() {
            self.finish_abort_if_drained();
            return;
        }
        self.flush_failures += 1;
        warn!(
            "Flushing bucket {} of {} failed ({} of {})",
            bucket, self.hash, self.flush_failures, ctx.settings.max_flush_failures
        );
        if self.flush_failures >= ctx.settings.max_flush_failures {
            self.fail(format!("could not write {}", self.path), ctx);
            return;
        }
        self.buckets[bucket as usize] = BucketState::Missing;
        self.fill_idle_peers(ctx);
        self.dispatch_idle_segments(ctx);
        self.resume_io_wait(ctx);
    }

    /// Marks buckets a previous session already wrote.
    pub fn restore_bucket_flush_state(&mut self, bitmap: &[u8], ctx: &mut TransferContext<'_>) {
        if self.state.is_aborting() {
            return;
        }
        let mut restored = 0usize;
        for (state, flag) in self.buckets.iter_mut().zip(bitmap) {
            if *flag != 0 && *state == BucketState::Missing {
                *state = BucketState::Flushed;
                restored += 1;
            }
        }
        if restored > 0 {
            info!("Download {} resumed with {} buckets on disk", self.hash, restored);
        }
        self.check_completion(ctx);
    }

    /// One byte per bucket, 1 when the bucket is on disk.
    pub fn bucket_flush_bitmap(&self) -> Vec<u8> {
        self.buckets
            .iter()
            .map(|b| u8::from(*b == BucketState::Flushed))
            .collect()
    }

    fn check_completion(&mut self, ctx: &mut TransferContext<'_>) {
        if self.state.lifecycle().is_terminal() || self.state.is_aborting() {
            return;
        }
        if !self.buckets.iter().all(|b| *b == BucketState::Flushed) {
            return;
        }
        self.release_segments(ctx);
        ctx.send(Command::RenameIncompleteFile {
            path: self.path.clone(),
        });
        ctx.send(Command::SaveBucketFlushStateBitmap {
            hash: self.hash,
            bitmap: self.bucket_flush_bitmap(),
        });
        self.state.transition(Lifecycle::Running);
        self.state.transition(Lifecycle::Finished);
        info!("Download {} finished", self.hash);
    }

    fn fail(&mut self, reason: String, ctx: &mut TransferContext<'_>) {
        warn!("Download {} failed: {}", self.hash, reason);
        self.release_segments(ctx);
        ctx.send(Command::SaveBucketFlushStateBitmap {
            hash: self.hash,
            bitmap: self.bucket_flush_bitmap(),
        });
        self.state.transition(Lifecycle::Failed);
        self.failure = Some(reason);
    }

    /// A peer refused or could not serve us.
    pub fn incoming_transfer_error(
        &mut self,
        host: IpAddr,
        code: crate::protocol::TransferErrorCode,
        ctx: &mut TransferContext<'_>,
    ) {
        if code.is_transient() {
            info!("Peer {} refused {} for now: {}", host, self.hash, code);
            self.back_off_peer(host, ctx);
            return;
        }
        warn!("Peer {} refused {}: {}", host, self.hash, code);
        self.refused.insert(host);
        self.drop_peer(host, ctx);
        if self.peers.is_empty() {
            self.fail(format!("no source shares {}", self.hash), ctx);
        }
    }

    pub fn set_paused(&mut self, paused: bool, ctx: &mut TransferContext<'_>) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        self.state.set_paused(paused);
        if !paused {
            self.dispatch_idle_segments(ctx);
        }
    }

    pub fn on_tick(&mut self, ctx: &mut TransferContext<'_>) {
        self.rate.sample(ctx.now);
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        let timeout = ctx.settings.stall_timeout();
        let retries = ctx.settings.max_stall_retries;
        let mut dead = Vec::new();
        for segment in self.segments.values_mut() {
            match segment.check_stall(ctx.now, timeout, retries) {
                StallCheck::Active => {}
                StallCheck::Retry(request) => {
                    debug!("Segment {} stalled, re-requesting", segment.segment_id());
                    ctx.send(request);
                }
                StallCheck::GiveUp => dead.push(segment.host()),
            }
        }
        for host in dead {
            warn!("Giving up on {} for {}", host, self.hash);
            self.drop_peer(host, ctx);
        }

        let live = self
            .segments
            .values()
            .filter(|s| !s.range().is_empty())
            .count();
        let stalled = self
            .segments
            .values()
            .filter(|s| s.state().lifecycle() == Lifecycle::Stalled)
            .count();
        if live > 0 && stalled == live {
            self.state.transition(Lifecycle::Stalled);
        }

        self.check_tree(ctx);
        if self.requeue {
            return;
        }
        // Sources that were busy with another download or backing off.
        if !self.state.is_paused() && self.buckets.contains(&BucketState::Missing) {
            self.fill_idle_peers(ctx);
        }
        self.check_sources(ctx.now);
    }

    /// Stops issuing work. The transfer stays until the hasher and the disk
    /// have answered for everything already handed to them.
    pub fn abort(&mut self, ctx: &mut TransferContext<'_>) {
        if self.state.is_aborting() || self.state.lifecycle().is_terminal() {
            return;
        }
        info!("Aborting download {}", self.hash);
        self.state.transition(Lifecycle::Aborting);
        self.release_segments(ctx);
        ctx.send(Command::SaveBucketFlushStateBitmap {
            hash: self.hash,
            bitmap: self.bucket_flush_bitmap(),
        });
        // Hashed buckets waiting on the tree owe us nothing more.
        self.pending_hash.retain(|_, p| p.computed.is_none());
        for pending in self.pending_hash.values_mut() {
            pending.data = Vec::new();
        }
        self.finish_abort_if_drained();
    }

    fn finish_abort_if_drained(&mut self) {
        if self.state.lifecycle() == Lifecycle::Aborting && self.outstanding_requests() == 0 {
            self.state.transition(Lifecycle::Aborted);
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.state.lifecycle() {
            Lifecycle::Finished => Disposition::Finished,
            Lifecycle::Aborted => Disposition::Aborted,
            Lifecycle::Failed => Disposition::Failed(
                self.failure
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string()),
            ),
            Lifecycle::Aborting => Disposition::Active,
            // Let the hasher and the disk finish with what they hold first.
            _ if self.requeue && self.outstanding_requests() == 0 => Disposition::Requeue,
            _ => Disposition::Active,
        }
    }

    pub fn status(&self, now: Instant) -> TransferItemStatus {
        let flushed: u64 = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == BucketState::Flushed)
            .filter_map(|(i, _)| self.file_range.bucket_len(i as u64))
            .sum();
        let progress_percent = if self.file_size == 0 {
            100.0
        } else {
            (flushed as f64 / self.file_size as f64 * 100.0) as f32
        };
        TransferItemStatus {
            hash: self.hash,
            path: self.path.clone(),
            direction: TransferDirection::Download,
            state: self.state,
            progress_percent,
            rate: self.rate.rate(now),
            bytes_transferred: self.rate.total_bytes(),
            host: None,
            uptime: now.saturating_duration_since(self.created_at),
            online_segments: self.segments.len(),
            segments: self.segments.values().map(|s| s.status()).collect(),
            bucket_bitmap: self.bucket_flush_bitmap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferSettings;
    use crate::protocol::{TransferErrorCode, TransferProtocol, BUCKET_SIZE, CAP_BASIC};
    use crate::transfer::command::{command_channel, CommandReceiver};
    use crate::transfer::registry::SegmentRegistry;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct Harness {
        tx: crate::transfer::command::CommandSender,
        rx: CommandReceiver,
        segments: SegmentRegistry,
        hosts: HashSet<IpAddr>,
        settings: TransferSettings,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = command_channel();
            Self {
                tx,
                rx,
                segments: SegmentRegistry::with_seed(7),
                hosts: HashSet::new(),
                settings: TransferSettings::default(),
                now: Instant::now(),
            }
        }

        fn run<R>(&mut self, f: impl FnOnce(&mut TransferContext<'_>) -> R) -> (R, Vec<IpAddr>) {
            let mut ctx = TransferContext::new(
                &self.tx,
                &mut self.segments,
                &mut self.hosts,
                &self.settings,
                self.now,
            );
            let out = f(&mut ctx);
            (out, ctx.capability_requests)
        }

        fn drain(&mut self) -> Vec<Command> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.rx.try_recv() {
                out.push(cmd);
            }
            out
        }
    }

    fn host(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn item(size: u64) -> DownloadQueueItem {
        DownloadQueueItem {
            priority: 1,
            hash: ContentHash::new([0xab; 24]),
            path: "/downloads/file.bin".to_string(),
            size,
            source_host: host(1),
        }
    }

    fn basic() -> ProtocolCapability {
        ProtocolCapability::from_bits(CAP_BASIC)
    }

    fn started(h: &mut Harness, size: u64) -> DownloadTransfer {
        let mut dl = DownloadTransfer::new(&item(size), h.now);
        let (_, caps) = h.run(|ctx| dl.start(ctx));
        assert_eq!(caps, vec![host(1)]);
        dl
    }

    #[test]
    fn start_requests_tree_and_waits_on_capability() {
        let mut h = Harness::new();
        let dl = started(&mut h, 3 * BUCKET_SIZE);
        let cmds = h.drain();

        assert!(cmds.contains(&Command::LoadBucketFlushStateBitmap { hash: dl.hash() }));
        assert!(cmds.contains(&Command::TthTreeRequest {
            host: host(1),
            root: dl.hash(),
            start_bucket: 0,
            bucket_count: 3,
        }));
        // Nothing is requested before the capability resolves.
        assert!(!cmds
            .iter()
            .any(|c| matches!(c, Command::SendDownloadRequest { .. })));
        assert_eq!(dl.state().lifecycle(), Lifecycle::Initializing);
        assert!(h.hosts.contains(&host(1)));
    }

    #[test]
    fn resolved_capability_requests_a_bounded_range() {
        let mut h = Harness::new();
        h.settings.max_segment_buckets = 2;
        let mut dl = started(&mut h, 3 * BUCKET_SIZE + 5);
        h.drain();

        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        let cmds = h.drain();
        let request = cmds
            .iter()
            .find_map(|c| match c {
                Command::SendDownloadRequest {
                    protocol,
                    offset,
                    length,
                    ..
                } => Some((*protocol, *offset, *length)),
                _ => None,
            })
            .expect("download request");
        assert_eq!(request, (TransferProtocol::Basic, 0, 2 * BUCKET_SIZE));
        assert_eq!(dl.state().lifecycle(), Lifecycle::Running);
        assert!(matches!(dl.bucket_state(1), Some(BucketState::Requested(_))));
        assert_eq!(dl.bucket_state(2), Some(BucketState::Missing));
    }

    #[test]
    fn empty_file_finishes_immediately() {
        let mut h = Harness::new();
        let mut dl = DownloadTransfer::new(&item(0), h.now);
        let (_, caps) = h.run(|ctx| dl.start(ctx));
        assert!(caps.is_empty());
        assert_eq!(dl.disposition(), Disposition::Finished);
        let cmds = h.drain();
        assert!(cmds.contains(&Command::RenameIncompleteFile {
            path: "/downloads/file.bin".into()
        }));
        assert!(h.segments.is_empty());
        assert!(h.hosts.is_empty());
    }

    #[test]
    fn verified_bucket_is_flushed_and_completes_download() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 1000);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        let good = ContentHash::new([1; 24]);
        h.run(|ctx| dl.tth_tree_reply(&[(0, good)], ctx));
        h.drain();

        h.run(|ctx| dl.incoming_data(0, &[9; 1000], ctx));
        assert_eq!(dl.bucket_state(0), Some(BucketState::Hashing));
        assert_eq!(dl.in_flight_buckets(), 1);

        h.run(|ctx| dl.hash_bucket_reply(0, good, ctx));
        assert_eq!(dl.bucket_state(0), Some(BucketState::Flushing));
        let flushes: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|c| matches!(c, Command::FlushBucket { .. }))
            .collect();
        assert_eq!(flushes.len(), 1);

        h.run(|ctx| dl.bucket_flushed(0, ctx));
        assert_eq!(dl.disposition(), Disposition::Finished);
        assert_eq!(dl.bucket_flush_bitmap(), vec![1]);
        assert!(h.segments.is_empty());
    }

    #[test]
    fn hash_before_tree_waits_for_tree() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 1000);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.incoming_data(0, &[9; 1000], ctx));
        let good = ContentHash::new([1; 24]);
        h.run(|ctx| dl.hash_bucket_reply(0, good, ctx));
        assert_eq!(dl.bucket_state(0), Some(BucketState::Hashing));

        h.run(|ctx| dl.tth_tree_reply(&[(0, good)], ctx));
        assert_eq!(dl.bucket_state(0), Some(BucketState::Flushing));
    }

    #[test]
    fn restored_bitmap_skips_written_buckets() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 3 * BUCKET_SIZE);
        h.run(|ctx| dl.restore_bucket_flush_state(&[1, 0, 1], ctx));
        h.drain();
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        let cmds = h.drain();
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::SendDownloadRequest { offset, length, .. }
                if *offset == BUCKET_SIZE && *length == BUCKET_SIZE
        )));
    }

    #[test]
    fn losing_the_only_peer_requests_requeue() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 1000);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.incoming_transfer_error(host(1), TransferErrorCode::NoSlotsAvailable, ctx));
        assert_eq!(dl.disposition(), Disposition::Requeue);
        assert!(h.hosts.is_empty());
        assert!(h.segments.is_empty());
        assert_eq!(dl.bucket_state(0), Some(BucketState::Missing));
    }

    #[test]
    fn second_peer_takes_next_range() {
        let mut h = Harness::new();
        h.settings.max_segment_buckets = 1;
        let mut dl = started(&mut h, 2 * BUCKET_SIZE);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        let (_, caps) = h.run(|ctx| dl.add_peer(host(2), vec![1, 2], ctx));
        assert_eq!(caps, vec![host(2)]);
        h.drain();

        h.run(|ctx| dl.capability_resolved(host(2), basic(), ctx));
        let cmds = h.drain();
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::SendDownloadRequest { host: to, offset, cid, .. }
                if *to == host(2) && *offset == BUCKET_SIZE && cid == &vec![1, 2]
        )));
        assert_eq!(dl.segment_ids().len(), 2);
    }

    #[test]
    fn flush_failures_eventually_fail_the_download() {
        let mut h = Harness::new();
        h.settings.max_flush_failures = 2;
        let mut dl = started(&mut h, 1000);
        let good = ContentHash::new([1; 24]);
        h.run(|ctx| dl.tth_tree_reply(&[(0, good)], ctx));

        for _ in 0..2 {
            // Each failure reopens a segment that waits on the capability again.
            h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
            h.run(|ctx| dl.incoming_data(0, &[9; 1000], ctx));
            h.run(|ctx| dl.hash_bucket_reply(0, good, ctx));
            h.run(|ctx| dl.bucket_flush_failed(0, ctx));
        }
        assert!(matches!(dl.disposition(), Disposition::Failed(_)));
    }

    #[test]
    fn abort_waits_for_outstanding_hash() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 1000);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.incoming_data(0, &[9; 1000], ctx));

        h.run(|ctx| dl.abort(ctx));
        assert_eq!(dl.state().lifecycle(), Lifecycle::Aborting);
        assert_eq!(dl.disposition(), Disposition::Active);
        assert!(h.hosts.is_empty());

        h.run(|ctx| dl.hash_bucket_reply(0, ContentHash::new([1; 24]), ctx));
        assert_eq!(dl.disposition(), Disposition::Aborted);
    }

    #[test]
    fn hash_backlog_holds_requests_until_it_drains() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 4 * BUCKET_SIZE);
        // Stand-ins for buckets of other segments still at the hasher.
        for b in 0..HASH_BUCKET_QUEUE_CRITICAL_THRESHOLD as u64 {
            dl.pending_hash.insert(
                1000 + b,
                PendingBucket {
                    data: Vec::new(),
                    segment_id: 0,
                    computed: None,
                },
            );
        }
        h.drain();

        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        assert!(dl.state().is_io_wait());
        assert!(!h
            .drain()
            .iter()
            .any(|c| matches!(c, Command::SendDownloadRequest { .. })));

        let keep = 1000 + HASH_BUCKET_QUEUE_CONGESTION_THRESHOLD as u64 - 2;
        dl.pending_hash.retain(|b, _| *b <= keep);
        h.run(|ctx| dl.hash_bucket_reply(1000, ContentHash::new([0; 24]), ctx));

        assert!(!dl.state().is_io_wait());
        assert!(h.drain().iter().any(|c| matches!(
            c,
            Command::SendDownloadRequest { offset: 0, length, .. } if *length == 4 * BUCKET_SIZE
        )));
    }

    fn tree_requests(cmds: &[Command]) -> Vec<(u32, u32)> {
        cmds.iter()
            .filter_map(|c| match c {
                Command::TthTreeRequest {
                    start_bucket,
                    bucket_count,
                    ..
                } => Some((*start_bucket, *bucket_count)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lost_tree_reply_is_requested_again_then_requeued() {
        let mut h = Harness::new();
        let t0 = h.now;
        let mut dl = started(&mut h, 3 * BUCKET_SIZE);
        h.drain();

        h.now = t0 + Duration::from_secs(10);
        h.run(|ctx| dl.on_tick(ctx));
        assert!(tree_requests(&h.drain()).is_empty());

        h.now = t0 + Duration::from_secs(31);
        h.run(|ctx| dl.on_tick(ctx));
        assert_eq!(tree_requests(&h.drain()), vec![(0, 3)]);

        // A partial answer narrows the next request and resets the count.
        h.run(|ctx| dl.tth_tree_reply(&[(0, ContentHash::new([1; 24]))], ctx));
        for step in 1..=3u64 {
            h.now = t0 + Duration::from_secs(31 + 31 * step);
            h.run(|ctx| dl.on_tick(ctx));
            assert_eq!(tree_requests(&h.drain()), vec![(1, 2)]);
        }
        assert_eq!(dl.disposition(), Disposition::Active);

        h.now = t0 + Duration::from_secs(31 + 31 * 4);
        h.run(|ctx| dl.on_tick(ctx));
        assert_eq!(dl.disposition(), Disposition::Requeue);
        assert!(h.hosts.is_empty());
        assert!(h.segments.is_empty());
    }

    #[test]
    fn file_not_shared_from_the_only_source_fails() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, 1000);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.incoming_transfer_error(host(1), TransferErrorCode::FileNotSharedError, ctx));
        assert!(matches!(dl.disposition(), Disposition::Failed(_)));
        assert!(h.hosts.is_empty());
    }

    #[test]
    fn file_not_shared_drops_that_source_for_good() {
        let mut h = Harness::new();
        h.settings.max_segment_buckets = 1;
        let mut dl = started(&mut h, 4 * BUCKET_SIZE);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.add_peer(host(2), Vec::new(), ctx));
        h.run(|ctx| dl.capability_resolved(host(2), basic(), ctx));

        h.run(|ctx| dl.incoming_transfer_error(host(2), TransferErrorCode::FileNotSharedError, ctx));
        assert_eq!(dl.disposition(), Disposition::Active);
        assert_eq!(dl.segment_ids().len(), 1);

        // Alternate-source search turning the host up again changes nothing.
        let (_, caps) = h.run(|ctx| dl.add_peer(host(2), Vec::new(), ctx));
        assert!(caps.is_empty());
        assert!(!h.hosts.contains(&host(2)));
    }

    #[test]
    fn busy_source_is_retried_after_backing_off() {
        let mut h = Harness::new();
        h.settings.max_segment_buckets = 1;
        let t0 = h.now;
        let mut dl = started(&mut h, 4 * BUCKET_SIZE);
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.add_peer(host(2), Vec::new(), ctx));
        h.run(|ctx| dl.capability_resolved(host(2), basic(), ctx));
        assert_eq!(dl.segment_ids().len(), 2);

        h.run(|ctx| dl.incoming_transfer_error(host(2), TransferErrorCode::NoSlotsAvailable, ctx));
        assert_eq!(dl.disposition(), Disposition::Active);
        assert_eq!(dl.segment_ids().len(), 1);
        assert!(!h.hosts.contains(&host(2)));

        h.now = t0 + Duration::from_secs(5);
        let (_, caps) = h.run(|ctx| dl.on_tick(ctx));
        assert!(caps.is_empty());

        h.now = t0 + h.settings.stall_timeout() + Duration::from_secs(1);
        let (_, caps) = h.run(|ctx| dl.on_tick(ctx));
        assert_eq!(caps, vec![host(2)]);
        assert!(h.hosts.contains(&host(2)));
    }

    #[test]
    fn requeue_waits_for_buckets_already_handed_off() {
        let mut h = Harness::new();
        let mut dl = started(&mut h, BUCKET_SIZE + 10);
        let good = ContentHash::new([1; 24]);
        h.run(|ctx| dl.tth_tree_reply(&[(0, good), (1, good)], ctx));
        h.run(|ctx| dl.capability_resolved(host(1), basic(), ctx));
        h.run(|ctx| dl.incoming_data(0, &vec![3u8; BUCKET_SIZE as usize], ctx));
        assert_eq!(dl.bucket_state(0), Some(BucketState::Hashing));

        h.run(|ctx| dl.incoming_transfer_error(host(1), TransferErrorCode::PeerAlreadyTransferring, ctx));
        assert_eq!(dl.disposition(), Disposition::Active);

        h.run(|ctx| dl.hash_bucket_reply(0, good, ctx));
        assert_eq!(dl.bucket_state(0), Some(BucketState::Flushing));
        assert_eq!(dl.disposition(), Disposition::Active);

        h.run(|ctx| dl.bucket_flushed(0, ctx));
        assert_eq!(dl.disposition(), Disposition::Requeue);
        assert_eq!(dl.bucket_flush_bitmap(), vec![1, 0]);
    }
}
