use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use objloader_types::{BaseId, Item};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Flush/sync strategy for the log file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every stored batch.
    EveryBatch,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

/// Configuration for [`LogObjectStore`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub sync_mode: SyncMode,
    /// Open without write access; `put_batch` fails with [`StoreError::ReadOnly`].
    pub read_only: bool,
}

/// What `open` found while rebuilding the index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub entries: usize,
    /// Entries skipped for a bad checksum or undecodable payload.
    pub skipped: usize,
    /// Bytes cut from a torn tail.
    pub truncated_bytes: u64,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    len: u32,
    crc: u32,
}

struct LogWriter {
    writer: BufWriter<File>,
    offset: u64,
}

/// Append-only, checksummed log of Items with an in-memory id index.
///
/// On-disk format, one record per stored Item:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (JSON-serialized Item)]
/// ```
///
/// The index is rebuilt by scanning the file on open. Records that fail the
/// CRC check are skipped; a record whose length runs past the end of the file
/// is a torn write and is truncated away.
pub struct LogObjectStore {
    path: PathBuf,
    index: RwLock<HashMap<BaseId, Slot>>,
    writer: Option<Mutex<LogWriter>>,
    reader: Mutex<File>,
    config: LogConfig,
    recovery: RecoveryStats,
}

impl LogObjectStore {
    /// Open (or create) a log file at the given path and rebuild its index.
    pub fn open(path: &Path, config: LogConfig) -> StoreResult<Self> {
        if !config.read_only {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let (index, valid_end, mut recovery) = if path.exists() {
            Self::scan(path)?
        } else {
            (HashMap::new(), 0, RecoveryStats::default())
        };

        let writer = if config.read_only {
            None
        } else {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(path)?;
            let file_len = file.metadata()?.len();
            if file_len > valid_end {
                warn!(
                    path = %path.display(),
                    valid_end,
                    file_len,
                    "truncating torn tail of object log"
                );
                file.set_len(valid_end)?;
                recovery.truncated_bytes = file_len - valid_end;
            }
            Some(Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                offset: valid_end,
            }))
        };

        let reader = File::open(path)?;
        info!(
            path = %path.display(),
            entries = recovery.entries,
            skipped = recovery.skipped,
            "object log opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            index: RwLock::new(index),
            writer,
            reader: Mutex::new(reader),
            config,
            recovery,
        })
    }

    /// Read the file front-to-back, returning the index, the end offset of
    /// the last intact record, and recovery counters.
    fn scan(path: &Path) -> StoreResult<(HashMap<BaseId, Slot>, u64, RecoveryStats)> {
        let mut file = BufReader::new(File::open(path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut index = HashMap::new();
        let mut stats = RecoveryStats::default();
        let mut offset: u64 = 0;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let (len, crc) = decode_header(&header);

            if len == 0 || offset + HEADER_SIZE as u64 + len as u64 > file_len {
                warn!(offset, len, file_len, "invalid record length; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; len as usize];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(offset, "truncated record; stopping recovery");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let next = offset + HEADER_SIZE as u64 + len as u64;
            if crc32fast::hash(&payload) != crc {
                warn!(offset, len, "record CRC mismatch; skipping");
                stats.skipped += 1;
                offset = next;
                continue;
            }
            match Item::from_json_slice(&payload) {
                Ok(item) => {
                    index.entry(item.base_id).or_insert(Slot { offset, len, crc });
                    stats.entries += 1;
                }
                Err(e) => {
                    warn!(offset, error = %e, "undecodable record; skipping");
                    stats.skipped += 1;
                }
            }
            offset = next;
        }

        // Anything past the last intact record is a torn write.
        Ok((index, offset.min(file_len), stats))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Counters from the index rebuild performed by `open`.
    pub fn recovery(&self) -> RecoveryStats {
        self.recovery
    }

    /// Bytes of intact records in the log.
    pub fn log_size(&self) -> u64 {
        match &self.writer {
            Some(w) => w.lock().expect("log writer poisoned").offset,
            None => self
                .index
                .read()
                .expect("lock poisoned")
                .values()
                .map(|s| s.offset + HEADER_SIZE as u64 + s.len as u64)
                .max()
                .unwrap_or(0),
        }
    }

    fn read_slot(&self, id: &BaseId, slot: Slot) -> StoreResult<Item> {
        let mut payload = vec![0u8; slot.len as usize];
        {
            let mut file = self.reader.lock().expect("log reader poisoned");
            file.seek(SeekFrom::Start(slot.offset + HEADER_SIZE as u64))?;
            file.read_exact(&mut payload)?;
        }
        if crc32fast::hash(&payload) != slot.crc {
            return Err(StoreError::Corrupt {
                id: id.clone(),
                reason: "checksum mismatch".into(),
            });
        }
        let item = Item::from_json_slice(&payload).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        if &item.base_id != id {
            return Err(StoreError::Corrupt {
                id: id.clone(),
                reason: format!("record holds {}", item.base_id),
            });
        }
        Ok(item)
    }
}

fn decode_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (len, crc)
}

impl ObjectStore for LogObjectStore {
    fn get(&self, id: &BaseId) -> StoreResult<Option<Item>> {
        let slot = self.index.read().expect("lock poisoned").get(id).copied();
        match slot {
            Some(slot) => self.read_slot(id, slot).map(Some),
            None => Ok(None),
        }
    }

    fn contains(&self, id: &BaseId) -> StoreResult<bool> {
        Ok(self.index.read().expect("lock poisoned").contains_key(id))
    }

    fn put_batch(&self, items: &[Item]) -> StoreResult<usize> {
        let writer = self.writer.as_ref().ok_or(StoreError::ReadOnly)?;
        let mut w = writer.lock().expect("log writer poisoned");

        let mut written: Vec<(BaseId, Slot)> = Vec::new();
        let mut seen: HashSet<&BaseId> = HashSet::new();
        {
            let index = self.index.read().expect("lock poisoned");
            for item in items {
                if index.contains_key(&item.base_id) || !seen.insert(&item.base_id) {
                    continue;
                }
                let payload = item
                    .to_json_bytes()
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let len = u32::try_from(payload.len()).map_err(|_| {
                    StoreError::Serialization(format!("item {} exceeds record size", item.base_id))
                })?;
                let crc = crc32fast::hash(&payload);

                w.writer.write_all(&len.to_le_bytes())?;
                w.writer.write_all(&crc.to_le_bytes())?;
                w.writer.write_all(&payload)?;

                let offset = w.offset;
                w.offset += HEADER_SIZE as u64 + len as u64;
                written.push((item.base_id.clone(), Slot { offset, len, crc }));
            }
        }

        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryBatch {
            w.writer.get_ref().sync_all()?;
        }

        let stored = written.len();
        if stored > 0 {
            let mut index = self.index.write().expect("lock poisoned");
            index.extend(written);
        }
        debug!(stored, offered = items.len(), offset = w.offset, "object log append");
        Ok(stored)
    }

    fn len(&self) -> usize {
        self.index.read().expect("lock poisoned").len()
    }

    fn flush(&self) -> StoreResult<()> {
        if let Some(writer) = &self.writer {
            let mut w = writer.lock().expect("log writer poisoned");
            w.writer.flush()?;
            w.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogObjectStore")
            .field("path", &self.path)
            .field("item_count", &self.len())
            .field("read_only", &self.config.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objloader_types::{Base, Closure};
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str) -> Item {
        Item::new(Base::new(id).with_field("speckle_type", json!("Objects.Point")))
    }

    fn open(path: &Path) -> LogObjectStore {
        LogObjectStore::open(path, LogConfig::default()).unwrap()
    }

    #[test]
    fn put_then_get_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");
        let parent = Item::new(
            Base::new("p").with_closure([(BaseId::new("a"), 1)].into_iter().collect::<Closure>()),
        );
        {
            let store = open(&path);
            assert_eq!(store.put_batch(&[item("a"), parent.clone()]).unwrap(), 2);
            assert_eq!(store.get(&BaseId::new("p")).unwrap(), Some(parent.clone()));
        }
        let store = open(&path);
        assert_eq!(store.len(), 2);
        assert_eq!(store.recovery().entries, 2);
        assert_eq!(store.get(&BaseId::new("p")).unwrap(), Some(parent));
        assert_eq!(store.get(&BaseId::new("a")).unwrap(), Some(item("a")));
    }

    #[test]
    fn duplicate_ids_are_written_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir.path().join("objects.log"));
        assert_eq!(store.put_batch(&[item("a"), item("a")]).unwrap(), 1);
        let size = store.log_size();
        assert_eq!(store.put_batch(&[item("a")]).unwrap(), 0);
        assert_eq!(store.log_size(), size);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn corrupted_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");
        {
            let store = open(&path);
            store.put_batch(&[item("a")]).unwrap();
            store.put_batch(&[item("b")]).unwrap();
        }
        // Flip one payload byte of the first record.
        let mut data = fs::read(&path).unwrap();
        data[HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let store = open(&path);
        assert_eq!(store.recovery().skipped, 1);
        assert!(store.get(&BaseId::new("a")).unwrap().is_none());
        assert_eq!(store.get(&BaseId::new("b")).unwrap(), Some(item("b")));
    }

    #[test]
    fn torn_tail_is_truncated_and_appends_continue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");
        {
            let store = open(&path);
            store.put_batch(&[item("a"), item("b")]).unwrap();
        }
        let total = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(total - 4).unwrap();
        drop(file);

        let store = open(&path);
        assert_eq!(store.len(), 1);
        assert!(store.recovery().truncated_bytes > 0);
        assert_eq!(store.put_batch(&[item("c")]).unwrap(), 1);
        drop(store);

        let store = open(&path);
        assert_eq!(store.len(), 2);
        assert_eq!(store.recovery().skipped, 0);
        assert_eq!(store.get(&BaseId::new("c")).unwrap(), Some(item("c")));
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.log");
        open(&path).put_batch(&[item("a")]).unwrap();

        let config = LogConfig {
            read_only: true,
            ..LogConfig::default()
        };
        let store = LogObjectStore::open(&path, config).unwrap();
        assert!(store.contains(&BaseId::new("a")).unwrap());
        assert!(matches!(store.put_batch(&[item("b")]), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn read_only_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            read_only: true,
            ..LogConfig::default()
        };
        let err = LogObjectStore::open(&dir.path().join("absent.log"), config).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn sync_every_batch_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/objects.log");
        let config = LogConfig {
            sync_mode: SyncMode::EveryBatch,
            ..LogConfig::default()
        };
        let store = LogObjectStore::open(&path, config).unwrap();
        store.put_batch(&[item("a")]).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), store.log_size());
    }
}
