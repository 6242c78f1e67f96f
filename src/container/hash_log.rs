use super::{write_string, ContainerIndex, Cursor};
use crate::{Result, TransferError};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// One resolved file appended after a container's index:
/// `[string path][2 hash length][hash][8 file size]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashLogEntry {
    pub path: String,
    #[serde(serialize_with = "serialize_hex")]
    pub hash: Vec<u8>,
    pub file_size: u64,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

impl HashLogEntry {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        write_string(out, &self.path)?;
        let len = u16::try_from(self.hash.len())
            .map_err(|_| TransferError::Container("hash too long".to_string()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.file_size.to_be_bytes());
        Ok(())
    }
}

pub fn append_hash_log(container: &Path, entries: &[HashLogEntry]) -> Result<()> {
    let mut buf = Vec::new();
    for entry in entries {
        entry.encode(&mut buf)?;
    }
    let mut file = OpenOptions::new().append(true).open(container)?;
    file.write_all(&buf)?;
    Ok(())
}

/// Entries following the index, in the order they were appended.
pub fn read_hash_log(container: &Path) -> Result<Vec<HashLogEntry>> {
    let bytes = fs::read(container)?;
    let (_, index_end) = ContainerIndex::decode(&bytes)?;
    let mut cursor = Cursor::new(&bytes[index_end..]);
    let mut entries = Vec::new();
    while !cursor.is_empty() {
        let path = cursor.string()?;
        let hash_len = cursor.u16()? as usize;
        let hash = cursor.take(hash_len)?.to_vec();
        let file_size = cursor.u64()?;
        entries.push(HashLogEntry {
            path,
            hash,
            file_size,
        });
    }
    Ok(entries)
}
