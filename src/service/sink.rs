use crate::protocol::codec::{encode_download_request, encode_transfer_error};
use crate::protocol::{DownloadRequest, TransferErrorPayload};
use crate::transfer::{Command, CommandReceiver};
use tracing::{debug, info};

/// Stand-in collaborator that logs every command the engine emits.
///
/// Network-bound commands are encoded to their wire form so the logged size
/// matches what a real transport would send. Returns the number of commands
/// seen once the engine drops its sender.
pub async fn log_commands(mut rx: CommandReceiver) -> usize {
    let mut seen = 0;
    while let Some(command) = rx.recv().await {
        seen += 1;
        match command {
            Command::SendDownloadRequest {
                protocol,
                host,
                hash,
                offset,
                length,
                segment_id,
                cid,
            } => {
                let wire = encode_download_request(&DownloadRequest {
                    protocol,
                    hash,
                    offset,
                    length,
                    segment_id,
                    cid,
                });
                debug!(
                    "-> {} download request {} [{}+{}] ({} bytes)",
                    host,
                    hash,
                    offset,
                    length,
                    wire.len()
                );
            }
            Command::SendTransferError {
                host,
                code,
                hash,
                offset,
            } => {
                let wire = encode_transfer_error(&TransferErrorPayload { code, hash, offset });
                debug!("-> {} transfer error {} ({} bytes)", host, code, wire.len());
            }
            Command::TransmitDatagram { host, datagram } => {
                debug!("-> {} datagram ({} bytes)", host, datagram.len());
            }
            Command::DownloadCompleted { hash } => info!("Download {} completed", hash),
            Command::DownloadFailed { hash, reason } => info!("Download {} failed: {}", hash, reason),
            other => debug!("Command: {:?}", other),
        }
    }
    seen
}
