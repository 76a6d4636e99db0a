//! Append-only partition log.
//!
//! A [`LogStream`] assigns positions and hands batches to a [`LogStorage`].
//! Each batch is one file entry framed as
//! `[length:4][first_position:8][batch_json:N][crc32:4]` (little endian), so a
//! torn or corrupted tail drops whole batches on load, never part of one.

use gatecore::{GateError, PartitionId, Record, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const ENTRY_OVERHEAD: usize = 4 + 8 + 4;

/// Storage backend for a partition log
pub trait LogStorage: Send {
    /// Persist a batch; either the whole batch is durable or the call fails.
    fn append(&mut self, records: &[Record]) -> Result<()>;

    /// Every record written so far, in position order.
    fn load(&mut self) -> Result<Vec<Record>>;
}

/// In-memory storage. Clones share the same records, which lets tests
/// restart a partition on the log of a previous one.
#[derive(Clone, Default)]
pub struct MemoryLogStorage {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| GateError::Log("memory log lock poisoned".into()))?;
        stored.extend_from_slice(records);
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<Record>> {
        let stored = self
            .records
            .lock()
            .map_err(|_| GateError::Log("memory log lock poisoned".into()))?;
        Ok(stored.clone())
    }
}

/// One file per partition under a data directory
pub struct FileLogStorage {
    path: PathBuf,
    file: File,
}

impl FileLogStorage {
    pub fn open(data_dir: impl AsRef<Path>, partition_id: PartitionId) -> Result<Self> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let path = Self::partition_path(data_dir, partition_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(path = %path.display(), partition_id, "Opened partition log");
        Ok(Self { path, file })
    }

    pub fn partition_path(data_dir: impl AsRef<Path>, partition_id: PartitionId) -> PathBuf {
        data_dir
            .as_ref()
            .join(format!("partition-{:04}.log", partition_id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decoded records and the number of bytes they occupy.
    fn decode_entries(bytes: &[u8]) -> Result<(Vec<Record>, usize)> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() {
            if bytes.len() - offset < ENTRY_OVERHEAD {
                warn!(offset, "Truncated log entry header, dropping tail");
                break;
            }

            let length = u32::from_le_bytes(read_array(&bytes[offset..offset + 4])) as usize;
            let position = u64::from_le_bytes(read_array(&bytes[offset + 4..offset + 12]));
            let body_start = offset + 12;
            let body_end = body_start + length;

            if bytes.len() < body_end + 4 {
                warn!(offset, position, "Truncated log entry, dropping tail");
                break;
            }

            let body = &bytes[body_start..body_end];
            let stored_crc = u32::from_le_bytes(read_array(&bytes[body_end..body_end + 4]));
            if crc32fast::hash(body) != stored_crc {
                warn!(offset, position, "CRC mismatch in log entry, dropping tail");
                break;
            }

            let batch: Vec<Record> = serde_json::from_slice(body)?;
            let first = batch.first().map(|r| r.position);
            if first != Some(position) {
                return Err(GateError::Log(format!(
                    "entry at offset {} claims position {} but starts at {:?}",
                    offset, position, first
                )));
            }

            records.extend(batch);
            offset = body_end + 4;
        }

        Ok((records, offset))
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(&bytes[..N]);
    array
}

impl LogStorage for FileLogStorage {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let body = serde_json::to_vec(records)?;
        let length = u32::try_from(body.len())
            .map_err(|_| GateError::Log(format!("batch of {} bytes is too large", body.len())))?;

        let mut buf = Vec::with_capacity(ENTRY_OVERHEAD + body.len());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&first.position.to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<Record>> {
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;

        let (records, valid_length) = Self::decode_entries(&bytes)?;
        if valid_length < bytes.len() {
            self.file.set_len(valid_length as u64)?;
            self.file.sync_data()?;
        }
        Ok(records)
    }
}

/// Positioned view of a partition log
pub struct LogStream {
    partition_id: PartitionId,
    storage: Box<dyn LogStorage>,
    next_position: u64,
}

impl LogStream {
    pub fn new(partition_id: PartitionId, storage: Box<dyn LogStorage>) -> Self {
        Self {
            partition_id,
            storage,
            next_position: 1,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    /// Read back everything written so far and continue after it.
    pub fn recover(&mut self) -> Result<Vec<Record>> {
        let records = self.storage.load()?;
        if let Some(last) = records.last() {
            self.next_position = last.position + 1;
        }
        debug!(
            partition_id = self.partition_id,
            records = records.len(),
            next_position = self.next_position,
            "Recovered log"
        );
        Ok(records)
    }

    /// Append a batch whose positions start at [`Self::next_position`].
    pub fn append(&mut self, records: &[Record]) -> Result<()> {
        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(()),
        };

        if first.position != self.next_position {
            return Err(GateError::Log(format!(
                "batch starts at position {} but the log expects {}",
                first.position, self.next_position
            )));
        }

        self.storage.append(records)?;
        self.next_position = last.position + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatecore::record::{MessageIntent, MessageRecord};

    fn message(position: u64) -> Record {
        let mut record = Record::command(
            -1,
            MessageIntent::Publish,
            MessageRecord {
                name: "msg".into(),
                correlation_key: "key".into(),
                variables: Default::default(),
                time_to_live_ms: 0,
                message_id: None,
                deadline: 0,
            },
        );
        record.position = position;
        record.partition_id = 1;
        record
    }

    #[test]
    fn stream_rejects_out_of_order_batches() {
        let storage = MemoryLogStorage::new();
        let mut log = LogStream::new(1, Box::new(storage.clone()));

        log.append(&[message(1), message(2)]).unwrap();
        assert_eq!(log.next_position(), 3);
        assert!(log.append(&[message(5)]).is_err());
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn file_log_survives_reopen_and_drops_torn_tail() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut log = LogStream::new(1, Box::new(FileLogStorage::open(dir.path(), 1).unwrap()));
            log.append(&[message(1), message(2)]).unwrap();
            log.append(&[message(3)]).unwrap();
        }

        let path = FileLogStorage::partition_path(dir.path(), 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 4]).unwrap();

        let mut log = LogStream::new(1, Box::new(FileLogStorage::open(dir.path(), 1).unwrap()));
        let records = log.recover().unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[2], message(3));
        assert_eq!(log.next_position(), 4);

        log.append(&[message(4)]).unwrap();
        drop(log);

        let mut log = LogStream::new(1, Box::new(FileLogStorage::open(dir.path(), 1).unwrap()));
        assert_eq!(log.recover().unwrap().len(), 4);
    }

    #[test]
    fn torn_batch_is_dropped_as_a_whole() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut log = LogStream::new(1, Box::new(FileLogStorage::open(dir.path(), 1).unwrap()));
            log.append(&[message(1)]).unwrap();
            log.append(&[message(2), message(3), message(4)]).unwrap();
        }

        let path = FileLogStorage::partition_path(dir.path(), 1);
        let length = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(length - 10)
            .unwrap();

        let mut log = LogStream::new(1, Box::new(FileLogStorage::open(dir.path(), 1).unwrap()));
        let records = log.recover().unwrap();
        assert_eq!(records, vec![message(1)]);
        assert_eq!(log.next_position(), 2);

        log.append(&[message(2)]).unwrap();
        drop(log);

        let mut log = LogStream::new(1, Box::new(FileLogStorage::open(dir.path(), 1).unwrap()));
        assert_eq!(log.recover().unwrap().len(), 2);
    }
}
