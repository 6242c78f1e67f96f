//! Byte layouts for the payloads the transfer engine produces and consumes.
//!
//! Data datagrams start with `[major type][transfer protocol]`; for routed
//! data these two bytes form the reserved header the receiver skips. The
//! network layer strips them from direct-dispatch datagrams before handing
//! the payload over. Integers are big-endian.

use super::capability::{ProtocolCapability, TransferProtocol};
use super::constants::{
    CONTENT_HASH_LEN, DIRECT_DATA_HEADER_LEN, ROUTED_DATA_HEADER_LEN, TTH_TREE_ENTRY_LEN,
};
use super::hash::ContentHash;
use super::packet::{MajorPacketType, TransferErrorCode};
use super::ProtocolError;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Routed data: addressed by content hash and file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedData<'a> {
    pub offset: u64,
    pub hash: ContentHash,
    pub data: &'a [u8],
}

/// Direct-dispatch data: addressed by segment id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectData<'a> {
    pub segment_id: u32,
    pub offset: u64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub protocol: TransferProtocol,
    pub hash: ContentHash,
    pub offset: u64,
    pub length: u64,
    pub segment_id: u32,
    pub cid: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferErrorPayload {
    pub code: TransferErrorCode,
    pub hash: ContentHash,
    pub offset: u64,
}

pub fn encode_routed_data(
    protocol: TransferProtocol,
    offset: u64,
    hash: &ContentHash,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(ROUTED_DATA_HEADER_LEN + data.len());
    out.push(MajorPacketType::Data as u8);
    out.push(protocol.bit());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(hash.as_bytes());
    out.extend_from_slice(data);
    out
}

pub fn decode_routed_data(datagram: &[u8]) -> Result<RoutedData<'_>> {
    ensure_len(datagram, ROUTED_DATA_HEADER_LEN)?;
    let offset = read_offset(datagram, 2)?;
    let hash = ContentHash::from_slice(&datagram[10..ROUTED_DATA_HEADER_LEN])?;
    Ok(RoutedData {
        offset,
        hash,
        data: &datagram[ROUTED_DATA_HEADER_LEN..],
    })
}

pub fn encode_direct_data(
    protocol: TransferProtocol,
    segment_id: u32,
    offset: u64,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + DIRECT_DATA_HEADER_LEN + data.len());
    out.push(MajorPacketType::DirectData as u8);
    out.push(protocol.bit());
    out.extend_from_slice(&segment_id.to_be_bytes());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// `payload` is the datagram without its two framing bytes.
pub fn decode_direct_data(payload: &[u8]) -> Result<DirectData<'_>> {
    ensure_len(payload, DIRECT_DATA_HEADER_LEN)?;
    let segment_id = read_u32(payload, 0)?;
    let offset = read_offset(payload, 4)?;
    Ok(DirectData {
        segment_id,
        offset,
        data: &payload[DIRECT_DATA_HEADER_LEN..],
    })
}

pub fn encode_download_request(req: &DownloadRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + CONTENT_HASH_LEN + 8 + 8 + 4 + req.cid.len());
    out.push(req.protocol.bit());
    out.extend_from_slice(req.hash.as_bytes());
    out.extend_from_slice(&req.offset.to_be_bytes());
    out.extend_from_slice(&req.length.to_be_bytes());
    out.extend_from_slice(&req.segment_id.to_be_bytes());
    out.extend_from_slice(&req.cid);
    out
}

pub fn decode_download_request(payload: &[u8]) -> Result<DownloadRequest> {
    const FIXED: usize = 1 + CONTENT_HASH_LEN + 8 + 8 + 4;
    ensure_len(payload, FIXED)?;
    let protocol = TransferProtocol::try_from(payload[0])?;
    let hash = ContentHash::from_slice(&payload[1..1 + CONTENT_HASH_LEN])?;
    let mut idx = 1 + CONTENT_HASH_LEN;
    let offset = read_offset(payload, idx)?;
    idx += 8;
    let length = read_u64(payload, idx)?;
    idx += 8;
    let segment_id = read_u32(payload, idx)?;
    Ok(DownloadRequest {
        protocol,
        hash,
        offset,
        length,
        segment_id,
        cid: payload[FIXED..].to_vec(),
    })
}

pub fn encode_transfer_error(err: &TransferErrorPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + CONTENT_HASH_LEN + 8);
    out.push(err.code as u8);
    out.extend_from_slice(err.hash.as_bytes());
    out.extend_from_slice(&err.offset.to_be_bytes());
    out
}

pub fn decode_transfer_error(payload: &[u8]) -> Result<TransferErrorPayload> {
    const EXPECTED: usize = 1 + CONTENT_HASH_LEN + 8;
    if payload.len() != EXPECTED {
        return Err(ProtocolError::InvalidLength {
            expected: EXPECTED,
            actual: payload.len(),
        });
    }
    Ok(TransferErrorPayload {
        code: TransferErrorCode::try_from(payload[0])?,
        hash: ContentHash::from_slice(&payload[1..1 + CONTENT_HASH_LEN])?,
        offset: read_offset(payload, 1 + CONTENT_HASH_LEN)?,
    })
}

pub fn encode_capability_response(caps: ProtocolCapability) -> Vec<u8> {
    vec![caps.bits()]
}

pub fn decode_capability_response(payload: &[u8]) -> Result<ProtocolCapability> {
    ensure_len(payload, 1)?;
    Ok(ProtocolCapability::from_bits(payload[0]))
}

/// Parses a (possibly partial) hash tree: repeated `[4 bucket][24 hash]`.
pub fn decode_tth_tree(payload: &[u8]) -> Result<Vec<(u32, ContentHash)>> {
    if payload.len() % TTH_TREE_ENTRY_LEN != 0 {
        return Err(ProtocolError::InvalidLength {
            expected: payload.len() - payload.len() % TTH_TREE_ENTRY_LEN,
            actual: payload.len(),
        });
    }
    payload
        .chunks_exact(TTH_TREE_ENTRY_LEN)
        .map(|entry| {
            let bucket = read_u32(entry, 0)?;
            let hash = ContentHash::from_slice(&entry[4..])?;
            Ok((bucket, hash))
        })
        .collect()
}

pub fn encode_tth_tree(entries: &[(u32, ContentHash)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * TTH_TREE_ENTRY_LEN);
    for (bucket, hash) in entries {
        out.extend_from_slice(&bucket.to_be_bytes());
        out.extend_from_slice(hash.as_bytes());
    }
    out
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u32(buf: &[u8], idx: usize) -> Result<u32> {
    let end = idx + 4;
    let raw = buf.get(idx..end).ok_or(ProtocolError::Truncated {
        needed: end,
        actual: buf.len(),
    })?;
    let mut b = [0u8; 4];
    b.copy_from_slice(raw);
    Ok(u32::from_be_bytes(b))
}

fn read_u64(buf: &[u8], idx: usize) -> Result<u64> {
    let end = idx + 8;
    let raw = buf.get(idx..end).ok_or(ProtocolError::Truncated {
        needed: end,
        actual: buf.len(),
    })?;
    let mut b = [0u8; 8];
    b.copy_from_slice(raw);
    Ok(u64::from_be_bytes(b))
}

/// File offsets must fit a signed 64-bit position.
fn read_offset(buf: &[u8], idx: usize) -> Result<u64> {
    let offset = read_u64(buf, idx)?;
    if offset > i64::MAX as u64 {
        return Err(ProtocolError::OffsetOutOfRange(offset));
    }
    Ok(offset)
}
