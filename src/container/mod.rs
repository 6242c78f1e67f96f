//! Container files: a named bundle of shared paths.
//!
//! Layout: `[8 total size][8 index length][index][hash log entries...]`.
//! The index is repeated `[string path][8 path size]`; strings are
//! `[2-byte length][UTF-8]`. Integers are big-endian.

pub mod hash_log;

pub use hash_log::{append_hash_log, read_hash_log, HashLogEntry};

use crate::{Result, TransferError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONTAINER_EXTENSION: &str = "container";
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerIndex {
    pub total_size: u64,
    pub entries: BTreeMap<String, u64>,
}

impl ContainerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, size: u64) {
        if let Some(old) = self.entries.insert(path.into(), size) {
            self.total_size -= old;
        }
        self.total_size += size;
    }

    /// Builds an index from shared paths, sizing each as the sum of the
    /// regular files beneath it. Symlinks are not followed.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut index = Self::new();
        for path in paths {
            let path = path.as_ref();
            let size = tree_size(path)?;
            debug!("{} holds {} bytes", path.display(), size);
            index.insert(path.to_string_lossy().into_owned(), size);
        }
        Ok(index)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for (path, size) in &self.entries {
            write_string(&mut body, path)?;
            body.extend_from_slice(&size.to_be_bytes());
        }
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes the header and index; trailing bytes (the hash log) are
    /// ignored. Returns the index and the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(bytes);
        let total_size = cursor.u64()?;
        let index_len = usize::try_from(cursor.u64()?)
            .map_err(|_| TransferError::Container("index length out of range".to_string()))?;
        let body = cursor.take(index_len)?;

        let mut entries = BTreeMap::new();
        let mut body = Cursor::new(body);
        while !body.is_empty() {
            let path = body.string()?;
            let size = body.u64()?;
            entries.insert(path, size);
        }
        Ok((
            Self {
                total_size,
                entries,
            },
            HEADER_LEN + index_len,
        ))
    }

    /// Writes a fresh container file, replacing any hash log it had.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.encode()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).map_err(|_| {
            TransferError::Container(format!("{} is too short for a header", path.display()))
        })?;
        let index_len = u64::from_be_bytes(header_field(&header, 8));
        let body_len = file.metadata()?.len().saturating_sub(HEADER_LEN as u64);
        if index_len > body_len {
            return Err(TransferError::Container(format!(
                "{} claims a {} byte index but holds {} bytes",
                path.display(),
                index_len,
                body_len
            )));
        }
        let total_len = usize::try_from(index_len)
            .ok()
            .and_then(|len| len.checked_add(HEADER_LEN))
            .ok_or_else(|| {
                TransferError::Container(format!("{} has an oversized index", path.display()))
            })?;
        let mut bytes = header.to_vec();
        bytes.resize(total_len, 0);
        file.read_exact(&mut bytes[HEADER_LEN..]).map_err(|_| {
            TransferError::Container(format!("{} has a truncated index", path.display()))
        })?;
        Self::decode(&bytes).map(|(index, _)| index)
    }
}

fn header_field(header: &[u8; HEADER_LEN], at: usize) -> [u8; 8] {
    let mut field = [0u8; 8];
    field.copy_from_slice(&header[at..at + 8]);
    field
}

fn tree_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    if !meta.is_dir() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

/// Reads every `*.container` in `dir`, keyed by file stem. Unreadable
/// containers are skipped with a warning.
pub fn scan_containers(dir: &Path) -> Result<BTreeMap<String, ContainerIndex>> {
    let mut containers = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path: PathBuf = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CONTAINER_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match ContainerIndex::read_from(&path) {
            Ok(index) => {
                containers.insert(name.to_string(), index);
            }
            Err(e) => warn!("Skipping container {}: {}", path.display(), e),
        }
    }
    Ok(containers)
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| TransferError::Container(format!("string of {} bytes too long", s.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Minimal big-endian reader over a byte slice.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(TransferError::Container(format!(
                "truncated container: needed {} bytes, {} left",
                n,
                self.bytes.len()
            )));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| TransferError::Container(format!("path is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn index_round_trips_through_a_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("music.container");

        let mut index = ContainerIndex::new();
        index.insert("/home/a/Music", 7_000_000_000);
        index.insert("/home/a/Podcasts/ünïcode", 12);
        index.write_to(&path).unwrap();

        let back = ContainerIndex::read_from(&path).unwrap();
        assert_eq!(back, index);
        assert_eq!(back.total_size, 7_000_000_012);
    }

    #[test]
    fn reinserting_a_path_replaces_its_size() {
        let mut index = ContainerIndex::new();
        index.insert("/a", 10);
        index.insert("/a", 4);
        assert_eq!(index.total_size, 4);
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn truncated_index_is_an_error() {
        let mut index = ContainerIndex::new();
        index.insert("/a", 10);
        let bytes = index.encode().unwrap();
        assert!(ContainerIndex::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(ContainerIndex::decode(&bytes[..5]).is_err());
    }

    #[test]
    fn from_paths_sums_files_recursively() {
        let dir = TempDir::new().unwrap();
        let share = dir.path().join("share");
        fs::create_dir_all(share.join("nested")).unwrap();
        fs::write(share.join("one.bin"), vec![0u8; 100]).unwrap();
        fs::write(share.join("nested/two.bin"), vec![0u8; 23]).unwrap();
        let single = dir.path().join("single.txt");
        fs::write(&single, b"hello").unwrap();

        let index = ContainerIndex::from_paths(&[share.clone(), single.clone()]).unwrap();
        assert_eq!(index.entries[&share.to_string_lossy().into_owned()], 123);
        assert_eq!(index.entries[&single.to_string_lossy().into_owned()], 5);
        assert_eq!(index.total_size, 128);
    }

    #[test]
    fn scan_picks_up_only_container_files() {
        let dir = TempDir::new().unwrap();
        let mut index = ContainerIndex::new();
        index.insert("/x", 1);
        index.write_to(&dir.path().join("first.container")).unwrap();
        index.write_to(&dir.path().join("second.container")).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join("broken.container"), b"abc").unwrap();

        let found = scan_containers(dir.path()).unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[test]
    fn oversized_index_length_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.container");
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            ContainerIndex::read_from(&path),
            Err(TransferError::Container(_))
        ));
        assert!(ContainerIndex::decode(&bytes).is_err());

        // A length just past the end of the file is caught the same way.
        let mut short = vec![0u8; 8];
        short.extend_from_slice(&1000u64.to_be_bytes());
        short.extend_from_slice(&[0u8; 10]);
        fs::write(&path, &short).unwrap();
        assert!(matches!(
            ContainerIndex::read_from(&path),
            Err(TransferError::Container(_))
        ));

        // And a scan skips it instead of failing.
        let mut good = ContainerIndex::new();
        good.insert("/ok", 1);
        good.write_to(&dir.path().join("fine.container")).unwrap();
        let found = scan_containers(dir.path()).unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["fine"]);
    }
}
