//! The transfer engine's single owner.
//!
//! `TransferManager` holds every table: live transfers by content hash, the
//! download queue, upload slot reservations, the segment id registry and the
//! capability cache. Nothing here blocks; work for collaborators leaves as a
//! [`Command`] and their answers come back through the methods below.

use super::command::{Command, CommandSender};
use super::context::TransferContext;
use super::download::{Disposition, DownloadTransfer};
use super::queue::DownloadQueue;
use super::registry::SegmentRegistry;
use super::types::{
    DownloadQueueItem, TransferDirection, TransferItemStatus, UploadAdmission, UploadQueueItem,
};
use super::upload::UploadTransfer;
use super::Transfer;
use crate::config::TransferSettings;
use crate::protocol::codec::{decode_routed_data, decode_tth_tree};
use crate::protocol::{ContentHash, ProtocolCapability, TransferErrorCode, TransferProtocol};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// An unanswered capability query and the downloads waiting on it.
#[derive(Debug)]
struct CapabilityLookup {
    waiters: Vec<ContentHash>,
    sent_at: Instant,
    retries: u32,
}

pub struct TransferManager {
    settings: TransferSettings,
    commands: CommandSender,
    transfers: HashMap<ContentHash, Vec<Transfer>>,
    download_queue: DownloadQueue,
    /// Upload requests waiting on the file index, one per hash.
    pending_uploads: HashMap<ContentHash, UploadQueueItem>,
    uploading_hosts: HashSet<IpAddr>,
    downloading_hosts: HashSet<IpAddr>,
    peer_capabilities: HashMap<IpAddr, ProtocolCapability>,
    capability_lookups: HashMap<IpAddr, CapabilityLookup>,
    segments: SegmentRegistry,
}

impl TransferManager {
    pub fn new(settings: TransferSettings, commands: CommandSender) -> Self {
        Self::with_segments(settings, commands, SegmentRegistry::new())
    }

    pub fn with_segments(
        settings: TransferSettings,
        commands: CommandSender,
        segments: SegmentRegistry,
    ) -> Self {
        Self {
            settings,
            commands,
            transfers: HashMap::new(),
            download_queue: DownloadQueue::new(),
            pending_uploads: HashMap::new(),
            uploading_hosts: HashSet::new(),
            downloading_hosts: HashSet::new(),
            peer_capabilities: HashMap::new(),
            capability_lookups: HashMap::new(),
            segments,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Command channel closed, dropping command");
        }
    }

    fn find(
        &self,
        hash: &ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
    ) -> Option<&Transfer> {
        self.transfers
            .get(hash)?
            .iter()
            .find(|t| t.matches(direction, host))
    }

    /// Runs `f` against one transfer with a context over the manager's
    /// tables, then follows up on capability lookups it asked for and on
    /// whatever state it ended in.
    fn with_transfer<R>(
        &mut self,
        hash: &ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
        now: Instant,
        f: impl FnOnce(&mut Transfer, &mut TransferContext<'_>) -> R,
    ) -> Option<R> {
        let transfer = self
            .transfers
            .get_mut(hash)?
            .iter_mut()
            .find(|t| t.matches(direction, host))?;
        let settle_host = transfer.host();
        let mut ctx = TransferContext::new(
            &self.commands,
            &mut self.segments,
            &mut self.downloading_hosts,
            &self.settings,
            now,
        );
        let out = f(transfer, &mut ctx);
        let requests = ctx.capability_requests;

        for peer in requests {
            self.request_peer_protocol_capability(peer, *hash, now);
        }
        self.settle(hash, direction, settle_host, now);
        Some(out)
    }

    fn with_download<R>(
        &mut self,
        hash: &ContentHash,
        now: Instant,
        f: impl FnOnce(&mut DownloadTransfer, &mut TransferContext<'_>) -> R,
    ) -> Option<R> {
        self.with_transfer(hash, TransferDirection::Download, None, now, |t, ctx| match t {
            Transfer::Download(d) => Some(f(d, ctx)),
            Transfer::Upload(_) => None,
        })
        .flatten()
    }

    fn with_upload<R>(
        &mut self,
        hash: &ContentHash,
        host: IpAddr,
        now: Instant,
        f: impl FnOnce(&mut UploadTransfer, &mut TransferContext<'_>) -> R,
    ) -> Option<R> {
        self.with_transfer(hash, TransferDirection::Upload, Some(host), now, |t, ctx| match t {
            Transfer::Upload(u) => Some(f(u, ctx)),
            Transfer::Download(_) => None,
        })
        .flatten()
    }

    /// Acts on a transfer's disposition after an event touched it.
    fn settle(
        &mut self,
        hash: &ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
        now: Instant,
    ) {
        let Some(disposition) = self.find(hash, direction, host).map(Transfer::disposition) else {
            return;
        };
        match disposition {
            Disposition::Active => {}
            Disposition::Finished => {
                if direction == TransferDirection::Download {
                    info!("Download {} completed", hash);
                    self.send(Command::DownloadCompleted { hash: *hash });
                }
                self.destroy_transfer(hash, direction, host, now);
            }
            Disposition::Requeue => self.requeue_download(hash, now),
            Disposition::Failed(reason) => {
                if direction == TransferDirection::Download {
                    self.send(Command::DownloadFailed {
                        hash: *hash,
                        reason,
                    });
                }
                self.destroy_transfer(hash, direction, host, now);
            }
            Disposition::Aborted => {
                self.destroy_transfer(hash, direction, host, now);
            }
        }
    }

    /// Removes a transfer and everything that refers to it, then re-runs
    /// download admission.
    fn destroy_transfer(
        &mut self,
        hash: &ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
        now: Instant,
    ) -> Option<Transfer> {
        let list = self.transfers.get_mut(hash)?;
        let index = list.iter().position(|t| t.matches(direction, host))?;
        let mut transfer = list.remove(index);
        if list.is_empty() {
            self.transfers.remove(hash);
        }

        match &mut transfer {
            Transfer::Upload(upload) => {
                self.uploading_hosts.remove(&upload.host());
            }
            Transfer::Download(download) => {
                let mut ctx = TransferContext::new(
                    &self.commands,
                    &mut self.segments,
                    &mut self.downloading_hosts,
                    &self.settings,
                    now,
                );
                download.release_segments(&mut ctx);
                self.segments.release_owner(hash);
                for lookup in self.capability_lookups.values_mut() {
                    lookup.waiters.retain(|h| h != hash);
                }
                self.capability_lookups.retain(|_, l| !l.waiters.is_empty());
            }
        }
        debug!("Destroyed {} transfer {}", direction, hash);

        self.start_next_downloads(now);
        Some(transfer)
    }

    // ---- Download admission ----

    /// Downloads holding a slot. An aborting download has given its slot up.
    pub fn active_download_count(&self) -> usize {
        self.transfers
            .values()
            .flatten()
            .filter(|t| {
                t.direction() == TransferDirection::Download && !t.state().is_aborting()
            })
            .count()
    }

    /// Running uploads plus reservations still waiting on the file index.
    pub fn active_upload_count(&self) -> usize {
        let running = self
            .transfers
            .values()
            .flatten()
            .filter(|t| t.direction() == TransferDirection::Upload && !t.state().is_aborting())
            .count();
        running + self.pending_uploads.len()
    }

    pub fn queued_downloads(&self) -> Vec<DownloadQueueItem> {
        self.download_queue.items()
    }

    pub fn has_download(&self, hash: &ContentHash) -> bool {
        self.find(hash, TransferDirection::Download, None).is_some()
    }

    /// Queues a download unless one for `hash` is already queued or live.
    /// Returns whether anything was queued.
    pub fn queue_download(
        &mut self,
        priority: i32,
        hash: ContentHash,
        path: String,
        size: u64,
        source_host: IpAddr,
        now: Instant,
    ) -> bool {
        if self.download_queue.contains(&hash) || self.has_download(&hash) {
            debug!("Download {} already queued or running", hash);
            return false;
        }
        info!("Queued download {} at priority {}", hash, priority);
        self.download_queue.push(DownloadQueueItem {
            priority,
            hash,
            path,
            size,
            source_host,
        });
        self.start_next_downloads(now);
        true
    }

    pub fn change_queued_download_priority(
        &mut self,
        old_priority: i32,
        new_priority: i32,
        hash: &ContentHash,
    ) -> bool {
        self.download_queue
            .change_priority(old_priority, new_priority, hash)
    }

    /// Drops a download from the queue, or stops it if it already started.
    pub fn remove_queued_download(&mut self, priority: i32, hash: &ContentHash, now: Instant) -> bool {
        let removed = self.download_queue.remove(priority, hash).is_some();
        if removed {
            info!("Removed queued download {}", hash);
        }
        let stopped = self.stop_transfer(hash, TransferDirection::Download, None, now);
        removed || stopped
    }

    fn start_next_downloads(&mut self, now: Instant) {
        while self.active_download_count() < self.settings.max_simultaneous_downloads {
            let Some(item) = self.download_queue.pop_next() else {
                break;
            };
            if self.has_download(&item.hash) {
                debug!("Download {} still winding down, skipping", item.hash);
                continue;
            }
            self.start_download(item, now);
        }
    }

    fn start_download(&mut self, item: DownloadQueueItem, now: Instant) {
        info!("Starting download {} from {}", item.hash, item.source_host);
        let hash = item.hash;
        self.transfers
            .entry(hash)
            .or_default()
            .push(Transfer::Download(DownloadTransfer::new(&item, now)));
        self.send(Command::DownloadStarted { hash });
        self.with_download(&hash, now, |d, ctx| d.start(ctx));
    }

    /// A download ran out of sources. It goes back to the queue at the
    /// requeue priority and becomes eligible again on the next tick.
    fn requeue_download(&mut self, hash: &ContentHash, now: Instant) {
        let Some(Transfer::Download(download)) =
            self.destroy_transfer(hash, TransferDirection::Download, None, now)
        else {
            return;
        };
        warn!("Download {} lost all sources, requeueing", hash);
        self.send(Command::SaveBucketFlushStateBitmap {
            hash: *hash,
            bitmap: download.bucket_flush_bitmap(),
        });
        self.send(Command::DownloadRequeued { hash: *hash });
        self.download_queue.hold(DownloadQueueItem {
            priority: self.settings.requeue_priority,
            hash: *hash,
            path: download.path().to_string(),
            size: download.file_size(),
            source_host: download.source_host(),
        });
    }

    /// Aborts a live transfer. With no host every transfer of that
    /// direction for `hash` is stopped.
    pub fn stop_transfer(
        &mut self,
        hash: &ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
        now: Instant,
    ) -> bool {
        let targets: Vec<Option<IpAddr>> = match self.transfers.get(hash) {
            Some(list) => list
                .iter()
                .filter(|t| t.matches(direction, host))
                .map(Transfer::host)
                .collect(),
            None => Vec::new(),
        };
        for target in &targets {
            self.with_transfer(hash, direction, *target, now, |t, ctx| t.abort(ctx));
        }
        self.start_next_downloads(now);
        !targets.is_empty()
    }

    pub fn set_download_paused(&mut self, hash: &ContentHash, paused: bool, now: Instant) -> bool {
        self.with_download(hash, now, |d, ctx| d.set_paused(paused, ctx))
            .is_some()
    }

    pub fn set_max_simultaneous_downloads(&mut self, max: usize, now: Instant) {
        self.settings.max_simultaneous_downloads = max;
        self.start_next_downloads(now);
    }

    pub fn set_max_simultaneous_uploads(&mut self, max: usize) {
        self.settings.max_simultaneous_uploads = max;
    }

    pub fn set_protocol_preference(&mut self, preference: Vec<TransferProtocol>) {
        self.settings.protocol_preference = preference;
    }

    // ---- Upload admission ----

    fn reject_upload(
        &self,
        host: IpAddr,
        code: TransferErrorCode,
        hash: ContentHash,
        offset: u64,
    ) -> UploadAdmission {
        info!("Rejecting upload of {} to {}: {}", hash, host, code);
        self.send(Command::SendTransferError {
            host,
            code,
            hash,
            offset,
        });
        UploadAdmission::Rejected(code)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn incoming_upload_request(
        &mut self,
        protocol: TransferProtocol,
        host: IpAddr,
        hash: ContentHash,
        offset: u64,
        length: u64,
        segment_id: u32,
        now: Instant,
    ) -> UploadAdmission {
        let request = UploadQueueItem {
            protocol,
            host,
            offset,
            length,
            segment_id,
        };

        if let Some(existing) = self.find(&hash, TransferDirection::Upload, Some(host)) {
            if existing.state().is_aborting() {
                return self.reject_upload(host, TransferErrorCode::PeerAlreadyTransferring, hash, offset);
            }
            self.with_upload(&hash, host, now, |u, ctx| u.restart(&request, ctx));
            return UploadAdmission::Restarted;
        }

        if self.uploading_hosts.contains(&host) {
            return self.reject_upload(host, TransferErrorCode::PeerAlreadyTransferring, hash, offset);
        }
        if self.active_upload_count() >= self.settings.max_simultaneous_uploads {
            return self.reject_upload(host, TransferErrorCode::NoSlotsAvailable, hash, offset);
        }

        // One pending request per hash: a newer one replaces the older, and
        // only the newest is served when the path comes back.
        if let Some(displaced) = self.pending_uploads.insert(hash, request) {
            debug!(
                "Upload request for {} from {} superseded by {}",
                hash, displaced.host, host
            );
            self.uploading_hosts.remove(&displaced.host);
        }
        self.uploading_hosts.insert(host);
        info!("Upload slot reserved for {} to {}", hash, host);
        self.send(Command::FilePathNameRequest { hash });
        UploadAdmission::Pending
    }

    /// The file index resolved (or failed to resolve) a requested hash.
    pub fn file_path_name_reply(&mut self, hash: ContentHash, path: String, file_size: u64, now: Instant) {
        let Some(request) = self.pending_uploads.remove(&hash) else {
            debug!("No pending upload for {}", hash);
            return;
        };
        if path.is_empty() {
            self.uploading_hosts.remove(&request.host);
            self.reject_upload(request.host, TransferErrorCode::FileNotSharedError, hash, request.offset);
            return;
        }

        let host = request.host;
        let upload = UploadTransfer::new(hash, path, file_size, &request, now);
        self.transfers
            .entry(hash)
            .or_default()
            .push(Transfer::Upload(upload));
        self.with_upload(&hash, host, now, |u, ctx| u.start(ctx));
    }

    pub fn file_range_read(&mut self, hash: ContentHash, host: IpAddr, offset: u64, data: &[u8], now: Instant) {
        if self
            .with_upload(&hash, host, now, |u, ctx| u.file_range_read(offset, data, ctx))
            .is_none()
        {
            trace!("Read for {} to {} has no upload", hash, host);
        }
    }

    pub fn file_range_read_failed(&mut self, hash: ContentHash, host: IpAddr, offset: u64, now: Instant) {
        self.with_upload(&hash, host, now, |u, _| u.file_read_failed(offset));
    }

    // ---- Data path ----

    /// A routed data datagram, addressed by content hash and offset.
    pub fn incoming_data_packet(&mut self, datagram: &[u8], now: Instant) {
        let packet = match decode_routed_data(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed data packet: {}", e);
                return;
            }
        };
        let hash = packet.hash;
        if self
            .with_download(&hash, now, |d, ctx| {
                d.incoming_data(packet.offset, packet.data, ctx)
            })
            .is_none()
        {
            trace!("Data for unknown transfer {} dropped", hash);
        }
    }

    /// Direct-dispatch data, addressed by segment id.
    pub fn incoming_direct_data_packet(&mut self, segment_id: u32, offset: u64, data: &[u8], now: Instant) {
        let Some(hash) = self.segments.lookup(segment_id) else {
            trace!("Data for unknown segment {} dropped", segment_id);
            return;
        };
        self.with_download(&hash, now, |d, ctx| {
            d.incoming_direct_data(segment_id, offset, data, ctx)
        });
    }

    pub fn incoming_transfer_error(
        &mut self,
        host: IpAddr,
        hash: ContentHash,
        offset: u64,
        code: TransferErrorCode,
        now: Instant,
    ) {
        debug!("Transfer error {} from {} for {} at {}", code, host, hash, offset);
        self.with_download(&hash, now, |d, ctx| d.incoming_transfer_error(host, code, ctx));
    }

    pub fn incoming_tth_source(&mut self, hash: ContentHash, peer: IpAddr, cid: Vec<u8>, now: Instant) {
        self.with_download(&hash, now, |d, ctx| d.add_peer(peer, cid, ctx));
    }

    pub fn incoming_tth_tree(&mut self, hash: ContentHash, tree: &[u8], now: Instant) {
        let entries = match decode_tth_tree(tree) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Bad hash tree for {}: {}", hash, e);
                return;
            }
        };
        self.with_download(&hash, now, |d, ctx| d.tth_tree_reply(&entries, ctx));
    }

    // ---- Collaborator replies ----

    pub fn hash_bucket_reply(
        &mut self,
        root: ContentHash,
        bucket_number: u64,
        bucket_hash: ContentHash,
        peer: IpAddr,
        now: Instant,
    ) {
        trace!("Hash of bucket {} of {} from {}", bucket_number, root, peer);
        self.with_download(&root, now, |d, ctx| {
            d.hash_bucket_reply(bucket_number, bucket_hash, ctx)
        });
    }

    pub fn bucket_flushed(&mut self, hash: ContentHash, bucket_number: u64, now: Instant) {
        self.with_download(&hash, now, |d, ctx| d.bucket_flushed(bucket_number, ctx));
    }

    pub fn bucket_flush_failed(&mut self, hash: ContentHash, bucket_number: u64, now: Instant) {
        self.with_download(&hash, now, |d, ctx| d.bucket_flush_failed(bucket_number, ctx));
    }

    pub fn restore_bucket_flush_state_bitmap(&mut self, hash: ContentHash, bitmap: &[u8], now: Instant) {
        self.with_download(&hash, now, |d, ctx| d.restore_bucket_flush_state(bitmap, ctx));
    }

    // ---- Protocol capability ----

    /// Asks for `host`'s capability on behalf of `requester`. Only one
    /// lookup per host is ever outstanding; a cached answer is delivered
    /// straight away.
    pub fn request_peer_protocol_capability(&mut self, host: IpAddr, requester: ContentHash, now: Instant) {
        if let Some(capability) = self.peer_capabilities.get(&host).copied() {
            self.deliver_capability(host, capability, &[requester], now);
            return;
        }
        if let Some(lookup) = self.capability_lookups.get_mut(&host) {
            if !lookup.waiters.contains(&requester) {
                lookup.waiters.push(requester);
            }
            return;
        }
        debug!("Requesting protocol capability of {}", host);
        self.capability_lookups.insert(
            host,
            CapabilityLookup {
                waiters: vec![requester],
                sent_at: now,
                retries: 0,
            },
        );
        self.send(Command::RequestProtocolCapability { host });
    }

    /// Re-asks hosts that have not answered within the stall timeout.
    /// Once the retries run out the waiting downloads back off that host.
    fn retry_capability_lookups(&mut self, now: Instant) {
        let timeout = self.settings.stall_timeout();
        let max_retries = self.settings.max_stall_retries;
        let mut expired = Vec::new();
        for (host, lookup) in self.capability_lookups.iter_mut() {
            if now.saturating_duration_since(lookup.sent_at) < timeout {
                continue;
            }
            if lookup.retries >= max_retries {
                expired.push(*host);
                continue;
            }
            lookup.retries += 1;
            lookup.sent_at = now;
            debug!("Asking {} for its capability again ({})", host, lookup.retries);
            if self
                .commands
                .send(Command::RequestProtocolCapability { host: *host })
                .is_err()
            {
                debug!("Command channel closed, dropping command");
            }
        }
        for host in expired {
            let Some(lookup) = self.capability_lookups.remove(&host) else {
                continue;
            };
            for hash in lookup.waiters {
                self.with_download(&hash, now, |d, ctx| d.capability_unavailable(host, ctx));
            }
        }
    }

    pub fn incoming_protocol_capability_response(
        &mut self,
        host: IpAddr,
        capability: ProtocolCapability,
        now: Instant,
    ) {
        debug!("Capability of {} is {:#04x}", host, capability.bits());
        self.peer_capabilities.insert(host, capability);
        let waiters = self
            .capability_lookups
            .remove(&host)
            .map(|l| l.waiters)
            .unwrap_or_default();
        self.deliver_capability(host, capability, &waiters, now);
    }

    fn deliver_capability(
        &mut self,
        host: IpAddr,
        capability: ProtocolCapability,
        requesters: &[ContentHash],
        now: Instant,
    ) {
        for hash in requesters {
            self.with_download(hash, now, |d, ctx| {
                d.capability_resolved(host, capability, ctx)
            });
        }
    }

    pub fn capability_waiter_count(&self) -> usize {
        self.capability_lookups.values().map(|l| l.waiters.len()).sum()
    }

    // ---- Housekeeping ----

    /// Periodic keepalive: stall retries, unanswered capability queries,
    /// idle uploads, rate samples, and admission for requeued downloads.
    pub fn on_tick(&mut self, now: Instant) {
        self.download_queue.release_held();
        self.retry_capability_lookups(now);
        let keys: Vec<(ContentHash, TransferDirection, Option<IpAddr>)> = self
            .transfers
            .values()
            .flatten()
            .map(|t| (t.hash(), t.direction(), t.host()))
            .collect();
        for (hash, direction, host) in keys {
            self.with_transfer(&hash, direction, host, now, |t, ctx| t.on_tick(ctx));
        }
        self.start_next_downloads(now);
    }

    pub fn global_transfer_status(&self, now: Instant) -> Vec<TransferItemStatus> {
        self.transfers
            .values()
            .flatten()
            .map(|t| t.status(now))
            .collect()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.values().map(Vec::len).sum()
    }

    /// Client is going away: abort everything and drop pending uploads.
    pub fn close_client_event(&mut self, now: Instant) {
        info!("Closing transfer engine, aborting {} transfers", self.transfer_count());
        self.download_queue = DownloadQueue::new();
        for request in std::mem::take(&mut self.pending_uploads).into_values() {
            self.uploading_hosts.remove(&request.host);
        }
        let keys: Vec<(ContentHash, TransferDirection, Option<IpAddr>)> = self
            .transfers
            .values()
            .flatten()
            .map(|t| (t.hash(), t.direction(), t.host()))
            .collect();
        for (hash, direction, host) in keys {
            self.with_transfer(&hash, direction, host, now, |t, ctx| t.abort(ctx));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{encode_routed_data, encode_tth_tree};
    use crate::protocol::{CAP_BASIC, CAP_UTP};
    use crate::transfer::command::{command_channel, CommandReceiver};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn host(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn hash(tag: u8) -> ContentHash {
        ContentHash::new([tag; 24])
    }

    fn manager(settings: TransferSettings) -> (TransferManager, CommandReceiver) {
        let (tx, rx) = command_channel();
        let m = TransferManager::with_segments(settings, tx, SegmentRegistry::with_seed(1000));
        (m, rx)
    }

    fn drain(rx: &mut CommandReceiver) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    fn basic() -> ProtocolCapability {
        ProtocolCapability::from_bits(CAP_BASIC)
    }

    fn first_download_request(cmds: &[Command]) -> Option<(u64, u64, u32)> {
        cmds.iter().find_map(|c| match c {
            Command::SendDownloadRequest {
                offset,
                length,
                segment_id,
                ..
            } => Some((*offset, *length, *segment_id)),
            _ => None,
        })
    }

    #[test]
    fn duplicate_queue_download_keeps_one_entry() {
        let mut settings = TransferSettings::default();
        settings.max_simultaneous_downloads = 1;
        let (mut m, _rx) = manager(settings);
        let now = Instant::now();

        // Occupy the only slot so H stays queued.
        assert!(m.queue_download(1, hash(9), "/busy".into(), 10, host(9), now));
        assert!(m.queue_download(1, hash(1), "/f".into(), 1000, host(1), now));
        assert!(!m.queue_download(1, hash(1), "/f".into(), 1000, host(2), now));
        assert_eq!(m.queued_downloads().len(), 1);

        // Same for a hash that is already running.
        assert!(!m.queue_download(4, hash(9), "/busy".into(), 10, host(3), now));
        assert_eq!(m.active_download_count(), 1);
    }

    #[test]
    fn running_downloads_never_exceed_maximum() {
        let mut settings = TransferSettings::default();
        settings.max_simultaneous_downloads = 2;
        let (mut m, mut rx) = manager(settings);
        let now = Instant::now();

        for tag in 1..=5 {
            m.queue_download(1, hash(tag), format!("/f{tag}"), 100, host(tag), now);
            assert!(m.active_download_count() <= 2);
        }
        assert_eq!(m.active_download_count(), 2);
        assert_eq!(m.queued_downloads().len(), 3);

        assert!(m.stop_transfer(&hash(1), TransferDirection::Download, None, now));
        assert_eq!(m.active_download_count(), 2);
        assert_eq!(m.queued_downloads().len(), 2);
        assert!(m.has_download(&hash(3)));

        let started = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, Command::DownloadStarted { .. }))
            .count();
        assert_eq!(started, 3);
    }

    #[test]
    fn removing_queued_download_leaves_others() {
        let mut settings = TransferSettings::default();
        settings.max_simultaneous_downloads = 0;
        let (mut m, _rx) = manager(settings);
        let now = Instant::now();
        m.queue_download(2, hash(1), "/a".into(), 1, host(1), now);
        m.queue_download(2, hash(2), "/b".into(), 1, host(1), now);
        assert!(m.change_queued_download_priority(2, 1, &hash(2)));
        assert_eq!(m.queued_downloads()[0].hash, hash(2));

        assert!(!m.remove_queued_download(2, &hash(2), now));
        assert!(m.remove_queued_download(1, &hash(2), now));
        assert_eq!(m.queued_downloads().len(), 1);

        m.set_max_simultaneous_downloads(1, now);
        assert!(m.has_download(&hash(1)));
    }

    #[test]
    fn fourth_uploader_gets_no_slots() {
        let mut settings = TransferSettings::default();
        settings.max_simultaneous_uploads = 3;
        let (mut m, mut rx) = manager(settings);
        let now = Instant::now();

        for tag in 1..=3 {
            let admission =
                m.incoming_upload_request(TransferProtocol::Basic, host(tag), hash(tag), 0, 100, 0, now);
            assert_eq!(admission, UploadAdmission::Pending);
        }
        drain(&mut rx);

        let admission =
            m.incoming_upload_request(TransferProtocol::Basic, host(4), hash(4), 0, 100, 0, now);
        assert_eq!(
            admission,
            UploadAdmission::Rejected(TransferErrorCode::NoSlotsAvailable)
        );
        assert_eq!(
            drain(&mut rx),
            vec![Command::SendTransferError {
                host: host(4),
                code: TransferErrorCode::NoSlotsAvailable,
                hash: hash(4),
                offset: 0,
            }]
        );
        assert_eq!(m.active_upload_count(), 3);
    }

    #[test]
    fn uploading_host_is_rejected_regardless_of_capacity() {
        let (mut m, _rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(1), 0, 10, 0, now);
        let admission =
            m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(2), 0, 10, 0, now);
        assert_eq!(
            admission,
            UploadAdmission::Rejected(TransferErrorCode::PeerAlreadyTransferring)
        );
    }

    #[test]
    fn newest_pending_upload_request_wins() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        let h = hash(7);

        m.incoming_upload_request(TransferProtocol::Basic, host(1), h, 0, 50, 0, now);
        m.incoming_upload_request(TransferProtocol::Basic, host(2), h, 10, 50, 0, now);
        assert_eq!(m.active_upload_count(), 1);
        drain(&mut rx);

        m.file_path_name_reply(h, "/share/x".into(), 100, now);
        let cmds = drain(&mut rx);
        assert_eq!(
            cmds,
            vec![Command::ReadFileRange {
                hash: h,
                host: host(2),
                path: "/share/x".into(),
                offset: 10,
                length: 50,
            }]
        );
        assert!(m.find(&h, TransferDirection::Upload, Some(host(1))).is_none());
        assert!(m.find(&h, TransferDirection::Upload, Some(host(2))).is_some());

        // The superseded host holds no reservation and can ask again.
        let again = m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(8), 0, 5, 0, now);
        assert_eq!(again, UploadAdmission::Pending);
    }

    #[test]
    fn unresolvable_hash_is_not_shared() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(1), 64, 10, 0, now);
        drain(&mut rx);

        m.file_path_name_reply(hash(1), String::new(), 0, now);
        assert_eq!(
            drain(&mut rx),
            vec![Command::SendTransferError {
                host: host(1),
                code: TransferErrorCode::FileNotSharedError,
                hash: hash(1),
                offset: 64,
            }]
        );
        assert_eq!(m.active_upload_count(), 0);
        assert_eq!(
            m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(2), 0, 10, 0, now),
            UploadAdmission::Pending
        );
    }

    #[test]
    fn repeat_request_restarts_existing_upload() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(1), 0, 10, 0, now);
        m.file_path_name_reply(hash(1), "/s".into(), 1000, now);
        m.file_range_read(hash(1), host(1), 0, &[1; 10], now);
        drain(&mut rx);

        let admission =
            m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(1), 500, 20, 3, now);
        assert_eq!(admission, UploadAdmission::Restarted);
        assert!(drain(&mut rx).contains(&Command::ReadFileRange {
            hash: hash(1),
            host: host(1),
            path: "/s".into(),
            offset: 500,
            length: 20,
        }));
    }

    #[test]
    fn idle_upload_is_destroyed_and_slot_released() {
        let (mut m, _rx) = manager(TransferSettings::default());
        let t0 = Instant::now();
        m.incoming_upload_request(TransferProtocol::Basic, host(1), hash(1), 0, 10, 0, t0);
        m.file_path_name_reply(hash(1), "/s".into(), 10, t0);
        m.file_range_read(hash(1), host(1), 0, &[1; 10], t0);
        assert_eq!(m.active_upload_count(), 1);

        m.on_tick(t0 + m.settings().upload_idle_timeout() + Duration::from_secs(1));
        assert_eq!(m.active_upload_count(), 0);
        assert_eq!(m.transfer_count(), 0);
    }

    #[test]
    fn failed_verification_is_retried_and_flushed_once() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        let h = hash(0x42);
        let good_bytes = vec![7u8; 1000];
        let bad_bytes = vec![8u8; 1000];
        let good = hash(0x01);
        let bad = hash(0x02);

        assert!(m.queue_download(1, h, "/f".into(), 1000, host(1), now));
        m.incoming_protocol_capability_response(host(1), basic(), now);
        let (offset, length, segment_id) =
            first_download_request(&drain(&mut rx)).expect("initial request");
        assert_eq!((offset, length), (0, 1000));
        assert_ne!(segment_id, 0);

        m.incoming_tth_tree(h, &encode_tth_tree(&[(0, good)]), now);
        m.incoming_data_packet(
            &encode_routed_data(TransferProtocol::Basic, 0, &h, &bad_bytes),
            now,
        );
        let mut all = drain(&mut rx);
        assert!(all.iter().any(
            |c| matches!(c, Command::HashBucketRequest { data, .. } if data == &bad_bytes)
        ));

        m.hash_bucket_reply(h, 0, bad, host(1), now);
        let retry = drain(&mut rx);
        assert_eq!(first_download_request(&retry), Some((0, 1000, segment_id)));
        all.extend(retry);

        m.incoming_direct_data_packet(segment_id, 0, &good_bytes, now);
        m.hash_bucket_reply(h, 0, good, host(1), now);
        all.extend(drain(&mut rx));

        let flushes: Vec<&Vec<u8>> = all
            .iter()
            .filter_map(|c| match c {
                Command::FlushBucket { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(flushes, vec![&good_bytes]);

        m.bucket_flushed(h, 0, now);
        let done = drain(&mut rx);
        assert!(done.contains(&Command::RenameIncompleteFile { path: "/f".into() }));
        assert!(done.contains(&Command::DownloadCompleted { hash: h }));
        assert_eq!(m.active_download_count(), 0);
        assert!(m.segments.is_empty());
    }

    #[test]
    fn capability_lookup_is_shared_per_host() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.request_peer_protocol_capability(host(5), hash(1), now);
        m.request_peer_protocol_capability(host(5), hash(2), now);
        m.request_peer_protocol_capability(host(5), hash(2), now);
        assert_eq!(
            drain(&mut rx),
            vec![Command::RequestProtocolCapability { host: host(5) }]
        );
        assert_eq!(m.capability_waiter_count(), 2);

        m.incoming_protocol_capability_response(host(5), ProtocolCapability::from_bits(CAP_UTP), now);
        assert_eq!(m.capability_waiter_count(), 0);

        // Cached from here on.
        m.request_peer_protocol_capability(host(5), hash(3), now);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn stale_packets_are_dropped_quietly() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.incoming_data_packet(&encode_routed_data(TransferProtocol::Basic, 0, &hash(1), &[1; 8]), now);
        m.incoming_data_packet(&[0xaa, 0x02, 0x00], now);
        m.incoming_direct_data_packet(12345, 0, &[1; 8], now);
        m.hash_bucket_reply(hash(1), 0, hash(2), host(1), now);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn segment_ids_skip_zero_on_wrap() {
        let (tx, mut rx) = command_channel();
        let mut m = TransferManager::with_segments(
            TransferSettings::default(),
            tx,
            SegmentRegistry::with_seed(u32::MAX),
        );
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        m.incoming_protocol_capability_response(host(1), basic(), now);
        let (_, _, segment_id) = first_download_request(&drain(&mut rx)).expect("request");
        assert_eq!(segment_id, 1);
    }

    #[test]
    fn losing_every_source_requeues_at_low_priority() {
        let mut settings = TransferSettings::default();
        settings.requeue_priority = 9;
        let (mut m, mut rx) = manager(settings);
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        m.incoming_protocol_capability_response(host(1), basic(), now);
        drain(&mut rx);

        m.incoming_transfer_error(host(1), hash(1), 0, TransferErrorCode::NoSlotsAvailable, now);
        assert!(drain(&mut rx).contains(&Command::DownloadRequeued { hash: hash(1) }));
        assert!(!m.has_download(&hash(1)));
        assert_eq!(m.queued_downloads()[0].priority, 9);

        m.on_tick(now);
        assert!(m.has_download(&hash(1)));
    }

    #[test]
    fn destroying_a_download_purges_its_capability_wait() {
        let (mut m, _rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        assert_eq!(m.capability_waiter_count(), 1);

        m.stop_transfer(&hash(1), TransferDirection::Download, None, now);
        assert_eq!(m.capability_waiter_count(), 0);
        assert_eq!(m.transfer_count(), 0);
        assert!(m.segments.is_empty());

        // A late reply finds nobody to deliver to.
        m.incoming_protocol_capability_response(host(1), basic(), now);
    }

    #[test]
    fn second_source_gets_its_own_segment() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        let size = 40 * crate::protocol::BUCKET_SIZE;
        m.queue_download(1, hash(1), "/big".into(), size, host(1), now);
        assert!(drain(&mut rx).contains(&Command::SearchTthAlternateSources { hash: hash(1) }));
        m.incoming_protocol_capability_response(host(1), basic(), now);
        m.incoming_tth_source(hash(1), host(2), vec![0xc1], now);
        m.incoming_protocol_capability_response(host(2), basic(), now);

        let status = m.global_transfer_status(now);
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].online_segments, 2);
        let requests: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, Command::SendDownloadRequest { .. }))
            .collect();
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn paused_download_issues_no_requests_until_resumed() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        assert!(m.set_download_paused(&hash(1), true, now));
        m.incoming_protocol_capability_response(host(1), basic(), now);
        assert!(first_download_request(&drain(&mut rx)).is_none());

        m.set_download_paused(&hash(1), false, now);
        assert!(first_download_request(&drain(&mut rx)).is_some());
    }

    #[test]
    fn close_client_aborts_everything() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        m.incoming_upload_request(TransferProtocol::Basic, host(2), hash(2), 0, 10, 0, now);
        drain(&mut rx);

        m.close_client_event(now);
        assert_eq!(m.transfer_count(), 0);
        assert_eq!(m.active_upload_count(), 0);
        assert!(drain(&mut rx)
            .iter()
            .any(|c| matches!(c, Command::SaveBucketFlushStateBitmap { .. })));
    }

    fn requested_hashes(cmds: &[Command]) -> Vec<ContentHash> {
        cmds.iter()
            .filter_map(|c| match c {
                Command::SendDownloadRequest { hash, .. } => Some(*hash),
                _ => None,
            })
            .collect()
    }

    fn capability_asks(cmds: &[Command]) -> usize {
        cmds.iter()
            .filter(|c| matches!(c, Command::RequestProtocolCapability { .. }))
            .count()
    }

    #[test]
    fn two_files_from_one_host_take_turns() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let t0 = Instant::now();
        let (first, second) = (hash(0x11), hash(0x22));
        let good = hash(0x01);

        m.queue_download(1, first, "/a".into(), 1000, host(1), t0);
        m.queue_download(1, second, "/b".into(), 1000, host(1), t0);
        m.incoming_tth_tree(first, &encode_tth_tree(&[(0, good)]), t0);
        m.incoming_tth_tree(second, &encode_tth_tree(&[(0, good)]), t0);
        m.incoming_protocol_capability_response(host(1), basic(), t0);
        assert_eq!(requested_hashes(&drain(&mut rx)), vec![first]);

        m.incoming_data_packet(&encode_routed_data(TransferProtocol::Basic, 0, &first, &[5; 1000]), t0);
        m.hash_bucket_reply(first, 0, good, host(1), t0);
        m.bucket_flushed(first, 0, t0);
        assert!(drain(&mut rx).contains(&Command::DownloadCompleted { hash: first }));

        // The host is free again; the next tick puts it to work on the other file.
        m.on_tick(t0 + Duration::from_secs(1));
        assert_eq!(requested_hashes(&drain(&mut rx)), vec![second]);
    }

    #[test]
    fn unanswered_capability_query_is_repeated_then_requeued() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let t0 = Instant::now();
        let h = hash(3);
        m.queue_download(1, h, "/f".into(), 1000, host(1), t0);
        m.incoming_tth_tree(h, &encode_tth_tree(&[(0, hash(1))]), t0);
        assert_eq!(capability_asks(&drain(&mut rx)), 1);

        m.on_tick(t0 + Duration::from_secs(10));
        assert_eq!(capability_asks(&drain(&mut rx)), 0);

        for step in 1..=3u64 {
            m.on_tick(t0 + Duration::from_secs(31 * step));
            assert_eq!(capability_asks(&drain(&mut rx)), 1);
        }
        assert_eq!(m.capability_waiter_count(), 1);
        assert_eq!(m.active_download_count(), 1);

        m.on_tick(t0 + Duration::from_secs(31 * 4));
        let cmds = drain(&mut rx);
        assert!(cmds.contains(&Command::DownloadRequeued { hash: h }));
        assert!(!m.has_download(&h));
        assert_eq!(m.capability_waiter_count(), 0);

        // Back in the queue; the next tick restarts it with a fresh query.
        m.on_tick(t0 + Duration::from_secs(31 * 4 + 1));
        let cmds = drain(&mut rx);
        assert!(cmds.contains(&Command::DownloadStarted { hash: h }));
        assert_eq!(capability_asks(&cmds), 1);
        assert!(m.has_download(&h));
    }

    #[test]
    fn removing_a_started_download_stops_it() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        assert!(m.has_download(&hash(1)));
        drain(&mut rx);

        assert!(m.remove_queued_download(1, &hash(1), now));
        assert!(!m.has_download(&hash(1)));
        assert_eq!(m.active_download_count(), 0);
        assert!(drain(&mut rx)
            .iter()
            .any(|c| matches!(c, Command::SaveBucketFlushStateBitmap { .. })));
    }

    #[test]
    fn file_not_shared_fails_without_requeue() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        m.incoming_protocol_capability_response(host(1), basic(), now);
        drain(&mut rx);

        m.incoming_transfer_error(host(1), hash(1), 0, TransferErrorCode::FileNotSharedError, now);
        let cmds = drain(&mut rx);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::DownloadFailed { hash: h, .. } if *h == hash(1))));
        assert!(!cmds.contains(&Command::DownloadRequeued { hash: hash(1) }));
        assert!(m.queued_downloads().is_empty());
        assert!(!m.has_download(&hash(1)));
    }

    #[test]
    fn peer_without_common_protocol_requeues_once_per_tick() {
        let (mut m, mut rx) = manager(TransferSettings::default());
        let now = Instant::now();
        m.queue_download(1, hash(1), "/f".into(), 10, host(1), now);
        m.incoming_protocol_capability_response(host(1), ProtocolCapability::from_bits(0), now);
        assert!(drain(&mut rx).contains(&Command::DownloadRequeued { hash: hash(1) }));
        assert!(!m.has_download(&hash(1)));

        // The cached capability fails it again at once, but only once.
        m.on_tick(now + Duration::from_secs(1));
        let cmds = drain(&mut rx);
        let count = |want: fn(&Command) -> bool| cmds.iter().filter(|c| want(c)).count();
        assert_eq!(count(|c| matches!(c, Command::DownloadStarted { .. })), 1);
        assert_eq!(count(|c| matches!(c, Command::DownloadRequeued { .. })), 1);
        assert_eq!(m.queued_downloads().len(), 1);
    }
}
