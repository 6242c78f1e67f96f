//! Runs the [`TransferManager`] on one tokio task.
//!
//! Everything that touches the engine arrives as an [`EngineEvent`] on a
//! single channel, so the manager never sees concurrent mutation. Keepalive
//! ticks come from an interval polled in the same loop.

use crate::config::Settings;
use crate::protocol::codec::{
    decode_capability_response, decode_direct_data, decode_download_request,
    decode_transfer_error,
};
use crate::protocol::{ContentHash, ProtocolCapability, TransferErrorCode, TransferProtocol};
use crate::transfer::{
    CommandSender, DownloadQueueItem, TransferDirection, TransferItemStatus, TransferManager,
    UploadAdmission,
};
use crate::{Result, TransferError};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum EngineEvent {
    // Local requests
    QueueDownload {
        priority: i32,
        hash: ContentHash,
        path: String,
        size: u64,
        source_host: IpAddr,
    },
    ChangeQueuedDownloadPriority {
        old_priority: i32,
        new_priority: i32,
        hash: ContentHash,
    },
    RemoveQueuedDownload {
        priority: i32,
        hash: ContentHash,
    },
    StopTransfer {
        hash: ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
    },
    SetDownloadPaused {
        hash: ContentHash,
        paused: bool,
    },
    SetMaxSimultaneousDownloads {
        max: usize,
    },
    SetMaxSimultaneousUploads {
        max: usize,
    },
    SetProtocolPreference {
        preference: Vec<TransferProtocol>,
    },
    GlobalStatus {
        reply: oneshot::Sender<Vec<TransferItemStatus>>,
    },
    QueuedDownloads {
        reply: oneshot::Sender<Vec<DownloadQueueItem>>,
    },

    // Network
    UploadRequest {
        protocol: TransferProtocol,
        host: IpAddr,
        hash: ContentHash,
        offset: u64,
        length: u64,
        segment_id: u32,
        reply: Option<oneshot::Sender<UploadAdmission>>,
    },
    DownloadRequestPacket {
        host: IpAddr,
        payload: Vec<u8>,
    },
    DataPacket {
        datagram: Vec<u8>,
    },
    /// Direct-dispatch datagram with its two framing bytes already removed.
    DirectDataPacket {
        payload: Vec<u8>,
    },
    TransferError {
        host: IpAddr,
        hash: ContentHash,
        offset: u64,
        code: TransferErrorCode,
    },
    TransferErrorPacket {
        host: IpAddr,
        payload: Vec<u8>,
    },
    ProtocolCapabilityResponse {
        host: IpAddr,
        capability: ProtocolCapability,
    },
    ProtocolCapabilityPacket {
        host: IpAddr,
        payload: Vec<u8>,
    },
    TthTree {
        hash: ContentHash,
        tree: Vec<u8>,
    },
    TthSource {
        hash: ContentHash,
        peer: IpAddr,
        cid: Vec<u8>,
    },

    // Collaborator replies
    FilePathNameReply {
        hash: ContentHash,
        path: String,
        size: u64,
    },
    HashBucketReply {
        root: ContentHash,
        bucket_number: u64,
        bucket_hash: ContentHash,
        peer: IpAddr,
    },
    BucketFlushed {
        hash: ContentHash,
        bucket_number: u64,
    },
    BucketFlushFailed {
        hash: ContentHash,
        bucket_number: u64,
    },
    BucketFlushStateBitmap {
        hash: ContentHash,
        bitmap: Vec<u8>,
    },
    FileRangeRead {
        hash: ContentHash,
        host: IpAddr,
        offset: u64,
        data: Vec<u8>,
    },
    FileRangeReadFailed {
        hash: ContentHash,
        host: IpAddr,
        offset: u64,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Fire-and-forget delivery of any event.
    pub async fn send(&self, event: EngineEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TransferError::ChannelClosed)
    }

    pub async fn queue_download(
        &self,
        priority: i32,
        hash: ContentHash,
        path: impl Into<String>,
        size: u64,
        source_host: IpAddr,
    ) -> Result<()> {
        self.send(EngineEvent::QueueDownload {
            priority,
            hash,
            path: path.into(),
            size,
            source_host,
        })
        .await
    }

    pub async fn stop_transfer(
        &self,
        hash: ContentHash,
        direction: TransferDirection,
        host: Option<IpAddr>,
    ) -> Result<()> {
        self.send(EngineEvent::StopTransfer {
            hash,
            direction,
            host,
        })
        .await
    }

    pub async fn upload_request(
        &self,
        protocol: TransferProtocol,
        host: IpAddr,
        hash: ContentHash,
        offset: u64,
        length: u64,
        segment_id: u32,
    ) -> Result<UploadAdmission> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::UploadRequest {
            protocol,
            host,
            hash,
            offset,
            length,
            segment_id,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| TransferError::ChannelClosed)
    }

    pub async fn global_status(&self) -> Result<Vec<TransferItemStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::GlobalStatus { reply: tx }).await?;
        rx.await.map_err(|_| TransferError::ChannelClosed)
    }

    pub async fn queued_downloads(&self) -> Result<Vec<DownloadQueueItem>> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::QueuedDownloads { reply: tx }).await?;
        rx.await.map_err(|_| TransferError::ChannelClosed)
    }

    /// Aborts every transfer and stops the engine task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::Shutdown { reply: tx }).await?;
        rx.await.map_err(|_| TransferError::ChannelClosed)
    }
}

pub struct TransferService {
    manager: TransferManager,
    events: mpsc::Receiver<EngineEvent>,
    tick_interval: Duration,
    download_dir: PathBuf,
}

impl TransferService {
    pub fn new(settings: &Settings, commands: CommandSender) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(settings.engine.command_buffer.max(1));
        let service = Self {
            manager: TransferManager::new(settings.transfer.clone(), commands),
            events: rx,
            tick_interval: Duration::from_millis(settings.engine.tick_interval_ms.max(1)),
            download_dir: settings.storage.download_dir.clone(),
        };
        (service, EngineHandle { tx })
    }

    /// Spawns the engine loop.
    pub fn start(settings: &Settings, commands: CommandSender) -> (EngineHandle, JoinHandle<Result<()>>) {
        let (service, handle) = Self::new(settings, commands);
        let join = tokio::spawn(service.run());
        (handle, join)
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            "Transfer engine running ({} download slots, {} upload slots)",
            self.manager.settings().max_simultaneous_downloads,
            self.manager.settings().max_simultaneous_uploads
        );
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(EngineEvent::Shutdown { reply }) => {
                        self.manager.close_client_event(Instant::now());
                        let _ = reply.send(());
                        info!("Transfer engine stopped");
                        return Ok(());
                    }
                    Some(event) => self.handle(event, Instant::now()),
                    None => {
                        debug!("All engine handles dropped, closing");
                        self.manager.close_client_event(Instant::now());
                        return Ok(());
                    }
                },
                _ = tick.tick() => self.manager.on_tick(Instant::now()),
            }
        }
    }

    /// Relative download paths land in the configured download directory.
    fn resolve_download_path(&self, path: String) -> String {
        if Path::new(&path).is_absolute() {
            path
        } else {
            self.download_dir.join(path).to_string_lossy().into_owned()
        }
    }

    fn handle(&mut self, event: EngineEvent, now: Instant) {
        let event = match event {
            EngineEvent::QueueDownload {
                priority,
                hash,
                path,
                size,
                source_host,
            } => EngineEvent::QueueDownload {
                priority,
                hash,
                path: self.resolve_download_path(path),
                size,
                source_host,
            },
            other => other,
        };
        let m = &mut self.manager;
        match event {
            EngineEvent::QueueDownload {
                priority,
                hash,
                path,
                size,
                source_host,
            } => {
                m.queue_download(priority, hash, path, size, source_host, now);
            }
            EngineEvent::ChangeQueuedDownloadPriority {
                old_priority,
                new_priority,
                hash,
            } => {
                m.change_queued_download_priority(old_priority, new_priority, &hash);
            }
            EngineEvent::RemoveQueuedDownload { priority, hash } => {
                m.remove_queued_download(priority, &hash, now);
            }
            EngineEvent::StopTransfer {
                hash,
                direction,
                host,
            } => {
                m.stop_transfer(&hash, direction, host, now);
            }
            EngineEvent::SetDownloadPaused { hash, paused } => {
                m.set_download_paused(&hash, paused, now);
            }
            EngineEvent::SetMaxSimultaneousDownloads { max } => {
                info!("Download slots set to {}", max);
                m.set_max_simultaneous_downloads(max, now);
            }
            EngineEvent::SetMaxSimultaneousUploads { max } => {
                info!("Upload slots set to {}", max);
                m.set_max_simultaneous_uploads(max);
            }
            EngineEvent::SetProtocolPreference { preference } => {
                if preference.is_empty() {
                    warn!("Ignoring empty protocol preference");
                } else {
                    m.set_protocol_preference(preference);
                }
            }
            EngineEvent::GlobalStatus { reply } => {
                let _ = reply.send(m.global_transfer_status(now));
            }
            EngineEvent::QueuedDownloads { reply } => {
                let _ = reply.send(m.queued_downloads());
            }
            EngineEvent::UploadRequest {
                protocol,
                host,
                hash,
                offset,
                length,
                segment_id,
                reply,
            } => {
                let admission =
                    m.incoming_upload_request(protocol, host, hash, offset, length, segment_id, now);
                if let Some(reply) = reply {
                    let _ = reply.send(admission);
                }
            }
            EngineEvent::DownloadRequestPacket { host, payload } => {
                match decode_download_request(&payload) {
                    Ok(req) => {
                        m.incoming_upload_request(
                            req.protocol,
                            host,
                            req.hash,
                            req.offset,
                            req.length,
                            req.segment_id,
                            now,
                        );
                    }
                    Err(e) => warn!("Bad download request from {}: {}", host, e),
                }
            }
            EngineEvent::DataPacket { datagram } => m.incoming_data_packet(&datagram, now),
            EngineEvent::DirectDataPacket { payload } => match decode_direct_data(&payload) {
                Ok(packet) => {
                    m.incoming_direct_data_packet(packet.segment_id, packet.offset, packet.data, now)
                }
                Err(e) => debug!("Dropping malformed direct packet: {}", e),
            },
            EngineEvent::TransferError {
                host,
                hash,
                offset,
                code,
            } => m.incoming_transfer_error(host, hash, offset, code, now),
            EngineEvent::TransferErrorPacket { host, payload } => {
                match decode_transfer_error(&payload) {
                    Ok(err) => m.incoming_transfer_error(host, err.hash, err.offset, err.code, now),
                    Err(e) => warn!("Bad transfer error from {}: {}", host, e),
                }
            }
            EngineEvent::ProtocolCapabilityResponse { host, capability } => {
                m.incoming_protocol_capability_response(host, capability, now)
            }
            EngineEvent::ProtocolCapabilityPacket { host, payload } => {
                match decode_capability_response(&payload) {
                    Ok(capability) => m.incoming_protocol_capability_response(host, capability, now),
                    Err(e) => warn!("Bad capability response from {}: {}", host, e),
                }
            }
            EngineEvent::TthTree { hash, tree } => m.incoming_tth_tree(hash, &tree, now),
            EngineEvent::TthSource { hash, peer, cid } => m.incoming_tth_source(hash, peer, cid, now),
            EngineEvent::FilePathNameReply { hash, path, size } => {
                m.file_path_name_reply(hash, path, size, now)
            }
            EngineEvent::HashBucketReply {
                root,
                bucket_number,
                bucket_hash,
                peer,
            } => m.hash_bucket_reply(root, bucket_number, bucket_hash, peer, now),
            EngineEvent::BucketFlushed {
                hash,
                bucket_number,
            } => m.bucket_flushed(hash, bucket_number, now),
            EngineEvent::BucketFlushFailed {
                hash,
                bucket_number,
            } => m.bucket_flush_failed(hash, bucket_number, now),
            EngineEvent::BucketFlushStateBitmap { hash, bitmap } => {
                m.restore_bucket_flush_state_bitmap(hash, &bitmap, now)
            }
            EngineEvent::FileRangeRead {
                hash,
                host,
                offset,
                data,
            } => m.file_range_read(hash, host, offset, &data, now),
            EngineEvent::FileRangeReadFailed { hash, host, offset } => {
                m.file_range_read_failed(hash, host, offset, now)
            }
            EngineEvent::Shutdown { reply } => {
                // Handled by the run loop; answer anyway.
                let _ = reply.send(());
            }
        }
    }
}
