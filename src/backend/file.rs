//! Snapshot-file backend
//!
//! Keeps the data in an ordered in-memory map and persists the whole map to
//! one file on `flush()`/`close()`. The file is reloaded on open.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "KSNP" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Payload (variable)                                      │
//! │   bincode(BTreeMap<i64, T>)                             │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   PayloadLen: u64 (8) | PayloadCRC: u32 (4) | Pad (4)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//! Snapshots are written to `<path>.tmp` and renamed over the old file, so a
//! crash mid-write leaves the previous snapshot intact.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::combinator::SharedCombinator;
use crate::error::{KeystackError, Result};
use crate::interface::{DataInterface, DataStream, KeyValue, Value};

use super::memory::MemoryDataInterface;
use super::store::OrderedStore;

/// Magic bytes identifying a keystack snapshot file
const MAGIC: &[u8; 4] = b"KSNP";

/// Current snapshot format version
const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
const HEADER_SIZE: usize = 14;

/// Footer size: PayloadLen (8) + PayloadCRC (4) + Padding (4) = 16 bytes
const FOOTER_SIZE: usize = 16;

/// `DataInterface` persisted as a single snapshot file
pub struct FileDataInterface<T> {
    memory: MemoryDataInterface<T>,
    path: PathBuf,
    /// Set by every mutation, cleared by a successful snapshot
    dirty: AtomicBool,
    /// Serializes snapshot writes
    io_lock: Mutex<()>,
}

impl<T> FileDataInterface<T>
where
    T: Value + Serialize + DeserializeOwned,
{
    /// Open the snapshot at `path`, or start empty if there is none
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        combinator: SharedCombinator<T>,
    ) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let map = if path.exists() {
            let map = Self::load(&path)?;
            tracing::debug!(name = %name, entries = map.len(), path = %path.display(), "Loaded snapshot");
            map
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            memory: MemoryDataInterface::with_store(name, combinator, OrderedStore::from_map(map)),
            path,
            dirty: AtomicBool::new(false),
            io_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<i64, T>> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(KeystackError::Corruption(format!(
                "Snapshot {} too short: {} bytes",
                path.display(),
                bytes.len()
            )));
        }

        if &bytes[0..4] != MAGIC {
            return Err(KeystackError::Corruption(format!(
                "Invalid snapshot magic: expected KSNP, got {:?}",
                &bytes[0..4]
            )));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(KeystackError::Corruption(format!(
                "Unsupported snapshot version: {}",
                version
            )));
        }

        let entry_count = read_u64(&bytes[6..14]);

        let footer = &bytes[bytes.len() - FOOTER_SIZE..];
        let payload_len = read_u64(&footer[0..8]) as usize;
        let expected_crc = u32::from_le_bytes([footer[8], footer[9], footer[10], footer[11]]);

        if HEADER_SIZE + payload_len + FOOTER_SIZE != bytes.len() {
            return Err(KeystackError::Corruption(format!(
                "Snapshot payload length {} does not match file size {}",
                payload_len,
                bytes.len()
            )));
        }

        let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            return Err(KeystackError::Corruption(format!(
                "Snapshot CRC mismatch: expected {:08x}, got {:08x}",
                expected_crc, actual_crc
            )));
        }

        let map: BTreeMap<i64, T> = bincode::deserialize(payload)?;
        if map.len() as u64 != entry_count {
            return Err(KeystackError::Corruption(format!(
                "Snapshot entry count mismatch: header says {}, payload has {}",
                entry_count,
                map.len()
            )));
        }
        Ok(map)
    }

    /// Write the current map to disk if anything changed since the last write
    fn persist(&self) -> Result<()> {
        let _io = self.io_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.write_snapshot();
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    fn write_snapshot(&self) -> Result<()> {
        let (payload, entry_count) = self
            .memory
            .store()
            .with_map(|map| bincode::serialize(map).map(|bytes| (bytes, map.len() as u64)))?;

        let tmp_path = self.path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        // Header
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&entry_count.to_le_bytes())?;

        // Payload
        writer.write_all(&payload)?;

        // Footer: payload_len (8) + payload_crc (4) + padding (4)
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        writer.flush()?;

        let file = writer
            .into_inner()
            .map_err(|e| KeystackError::BackendUnavailable(format!("Failed to flush snapshot: {}", e)))?;
        file.sync_all()?;

        fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(name = %self.memory.name(), entries = entry_count, "Snapshot written");
        Ok(())
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

impl<T> DataInterface<T> for FileDataInterface<T>
where
    T: Value + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        self.memory.name()
    }

    fn read(&self, key: i64) -> Result<Option<T>> {
        self.memory.read(key)
    }

    fn write(&self, key: i64, value: Option<T>) -> Result<()> {
        let result = self.memory.write(key, value);
        if result.is_ok() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    fn write_all(&self, entries: Vec<KeyValue<T>>) -> Result<()> {
        if entries.is_empty() {
            return self.memory.ensure_open();
        }
        let result = self.memory.write_all(entries);
        // conflicts still applied the rest of the batch
        if result.is_ok() || matches!(&result, Err(e) if e.is_merge_conflict()) {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    fn iter(&self) -> Result<DataStream<KeyValue<T>>> {
        self.memory.iter()
    }

    fn key_iter(&self) -> Result<DataStream<i64>> {
        self.memory.key_iter()
    }

    fn iter_keys(&self, keys: &BTreeSet<i64>) -> Result<DataStream<KeyValue<T>>> {
        self.memory.iter_keys(keys)
    }

    fn flush(&self) -> Result<()> {
        self.memory.ensure_open()?;
        self.persist()
    }

    fn drop_all_data(&self) -> Result<()> {
        self.memory.drop_all_data()?;
        let _io = self.io_lock.lock();
        self.dirty.store(false, Ordering::Release);
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn appr_size(&self) -> u64 {
        self.memory.appr_size()
    }

    fn exact_size(&self) -> Result<u64> {
        self.memory.exact_size()
    }

    fn close(&self) -> Result<()> {
        if self.memory.is_closed() {
            return Ok(());
        }
        let result = self.persist();
        self.memory.mark_closed();
        result
    }
}
