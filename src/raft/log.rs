//! Durable Raft log with snapshot-based compaction
//!
//! Log record format: [MAGIC][TERM][INDEX][LEN][COMMAND][CRC32]
//! Snapshot file format: [MAGIC][INDEX][TERM][LEN][DATA][CRC32]
//!
//! All integers are little-endian. The CRC covers everything between the magic and the
//! checksum. On open, the log is read up to the first damaged record; anything after it
//! is a torn write from a crash and is cut off.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{atomic_write, crc32, Error, LogSyncPolicy, Result};

const LOG_MAGIC: [u8; 4] = *b"QLG1";
const SNAPSHOT_MAGIC: [u8; 4] = *b"QSN1";
const LOG_FILE: &str = "log";
const SNAPSHOT_FILE: &str = "snapshot";

/// Header bytes before the command: magic + term + index + len
const RECORD_HEADER: usize = 4 + 8 + 8 + 4;

/// One replicated command. An empty command is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self {
            term,
            index,
            command,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }

    fn encoded_len(&self) -> u64 {
        (RECORD_HEADER + self.command.len() + 4) as u64
    }
}

/// A compacted prefix of the log: state as of `index`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

pub struct LogStore {
    dir: PathBuf,
    writer: BufWriter<File>,
    entries: Vec<LogEntry>,
    /// Byte offset of each entry in the log file, parallel to `entries`
    offsets: Vec<u64>,
    file_len: u64,
    snapshot_index: u64,
    snapshot_term: u64,
    sync_policy: LogSyncPolicy,
}

impl LogStore {
    /// Open or create the log in `dir`, recovering from a torn tail if needed
    pub fn open(dir: impl AsRef<Path>, sync_policy: LogSyncPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let (snapshot_index, snapshot_term) = match Self::read_snapshot_file(&dir)? {
            Some(snapshot) => (snapshot.index, snapshot.term),
            None => (0, 0),
        };

        let log_path = dir.join(LOG_FILE);
        let (records, good_len) = Self::scan(&log_path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&log_path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > good_len {
            tracing::warn!(
                "Log {} has a damaged tail: dropping {} bytes after offset {}",
                log_path.display(),
                on_disk - good_len,
                good_len
            );
            file.set_len(good_len)?;
            file.sync_all()?;
        }
        drop(file);

        let mut entries = Vec::with_capacity(records.len());
        let mut offsets = Vec::with_capacity(records.len());
        for (offset, entry) in records {
            // Left over from a crash between writing a snapshot and rewriting the log
            if entry.index <= snapshot_index {
                continue;
            }
            let expected = snapshot_index + entries.len() as u64 + 1;
            if entry.index != expected {
                return Err(Error::Corrupted(format!(
                    "log gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
            offsets.push(offset);
            entries.push(entry);
        }

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&log_path)?);

        tracing::debug!(
            "Opened log at {} (snapshot {}@{}, {} entries)",
            dir.display(),
            snapshot_index,
            snapshot_term,
            entries.len()
        );

        Ok(Self {
            dir,
            writer,
            entries,
            offsets,
            file_len: good_len,
            snapshot_index,
            snapshot_term,
            sync_policy,
        })
    }

    /// Read every intact record, returning them with their offsets and the length of the
    /// intact prefix
    fn scan(path: &Path) -> Result<(Vec<(u64, LogEntry)>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut offset = 0u64;

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some(entry)) => {
                    let len = entry.encoded_len();
                    records.push((offset, entry));
                    offset += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Log scan stopped at offset {}: {}", offset, e);
                    break;
                }
            }
        }

        Ok((records, offset))
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<LogEntry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != LOG_MAGIC {
            return Err(Error::Log("invalid record magic".into()));
        }

        let mut header = [0u8; 20];
        reader.read_exact(&mut header)?;
        let term = u64::from_le_bytes(header[0..8].try_into().map_err(corrupt_header)?);
        let index = u64::from_le_bytes(header[8..16].try_into().map_err(corrupt_header)?);
        let len = u32::from_le_bytes(header[16..20].try_into().map_err(corrupt_header)?) as usize;

        let mut command = vec![0u8; len];
        reader.read_exact(&mut command)?;

        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum)?;

        let mut covered = Vec::with_capacity(header.len() + len);
        covered.extend_from_slice(&header);
        covered.extend_from_slice(&command);
        if crc32(&covered) != u32::from_le_bytes(checksum) {
            return Err(Error::Log(format!("checksum mismatch at index {}", index)));
        }

        Ok(Some(LogEntry {
            term,
            index,
            command,
        }))
    }

    fn encode_record(entry: &LogEntry) -> Vec<u8> {
        let mut body = Vec::with_capacity(20 + entry.command.len());
        body.extend_from_slice(&entry.term.to_le_bytes());
        body.extend_from_slice(&entry.index.to_le_bytes());
        body.extend_from_slice(&(entry.command.len() as u32).to_le_bytes());
        body.extend_from_slice(&entry.command);

        let mut record = Vec::with_capacity(entry.encoded_len() as usize);
        record.extend_from_slice(&LOG_MAGIC);
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc32(&body).to_le_bytes());
        record
    }

    /// Append entries that directly follow the current last index.
    /// Returns once the entries are as durable as the sync policy allows.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(Error::Log(format!(
                    "non-contiguous append: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            if entry.command.len() > u32::MAX as usize {
                return Err(Error::Log(format!(
                    "entry {} command too large ({} bytes)",
                    entry.index,
                    entry.command.len()
                )));
            }
            self.writer.write_all(&Self::encode_record(entry))?;
            self.offsets.push(self.file_len);
            self.file_len += entry.encoded_len();
            self.entries.push(entry.clone());
        }
        self.maybe_sync()
    }

    /// Discard every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index <= self.snapshot_index {
            return Err(Error::Log(format!(
                "cannot truncate at {}: compacted through {}",
                index, self.snapshot_index
            )));
        }
        if index > self.last_index() {
            return Ok(());
        }
        let pos = (index - self.snapshot_index - 1) as usize;
        let offset = self.offsets[pos];

        self.writer.flush()?;
        let file = OpenOptions::new()
            .write(true)
            .open(self.dir.join(LOG_FILE))?;
        file.set_len(offset)?;
        file.sync_all()?;

        self.entries.truncate(pos);
        self.offsets.truncate(pos);
        self.file_len = offset;
        self.reopen_writer()?;

        tracing::debug!("Truncated log from index {}", index);
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index {
            return Vec::new();
        }
        let pos = (start - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(pos).take(max).cloned().collect()
    }

    /// Entries with index in `(after, through]` still held in the log
    pub fn entries_between(&self, after: u64, through: u64) -> impl Iterator<Item = &LogEntry> {
        self.entries
            .iter()
            .filter(move |e| e.index > after && e.index <= through)
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Term of the entry at `index`; index 0 has term 0. `None` if compacted away or absent.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Number of entries not yet folded into a snapshot
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Self::read_snapshot_file(&self.dir)
    }

    /// Replace the log prefix through `index` with `data`.
    ///
    /// If the log holds an entry at `index` with the same term, the entries after it are
    /// kept; otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, index: u64, term: u64, data: &[u8]) -> Result<()> {
        if index < self.snapshot_index {
            return Err(Error::Log(format!(
                "snapshot at {} is older than current snapshot {}",
                index, self.snapshot_index
            )));
        }

        let mut contents = Vec::with_capacity(data.len() + 28);
        contents.extend_from_slice(&SNAPSHOT_MAGIC);
        let mut body = Vec::with_capacity(data.len() + 24);
        body.extend_from_slice(&index.to_le_bytes());
        body.extend_from_slice(&term.to_le_bytes());
        body.extend_from_slice(&(data.len() as u64).to_le_bytes());
        body.extend_from_slice(data);
        contents.extend_from_slice(&body);
        contents.extend_from_slice(&crc32(&body).to_le_bytes());
        atomic_write(&self.dir.join(SNAPSHOT_FILE), &contents)?;

        let keep_suffix = self.term_at(index) == Some(term);
        let kept: Vec<LogEntry> = if keep_suffix {
            self.entries
                .iter()
                .filter(|e| e.index > index)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut file_bytes = Vec::new();
        let mut offsets = Vec::with_capacity(kept.len());
        for entry in &kept {
            offsets.push(file_bytes.len() as u64);
            file_bytes.extend_from_slice(&Self::encode_record(entry));
        }
        self.writer.flush()?;
        atomic_write(&self.dir.join(LOG_FILE), &file_bytes)?;

        self.file_len = file_bytes.len() as u64;
        self.entries = kept;
        self.offsets = offsets;
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.reopen_writer()?;

        tracing::info!(
            "Installed snapshot at {}@{} ({} bytes, {} entries retained)",
            index,
            term,
            data.len(),
            self.entries.len()
        );
        Ok(())
    }

    fn read_snapshot_file(dir: &Path) -> Result<Option<Snapshot>> {
        let bytes = match fs::read(dir.join(SNAPSHOT_FILE)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 + 24 + 4 || bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(Error::Corrupted("snapshot header".into()));
        }
        let (body, checksum) = bytes[4..].split_at(bytes.len() - 8);
        let stored = u32::from_le_bytes(checksum.try_into().map_err(corrupt_header)?);
        if crc32(body) != stored {
            return Err(Error::Corrupted("snapshot checksum mismatch".into()));
        }
        let index = u64::from_le_bytes(body[0..8].try_into().map_err(corrupt_header)?);
        let term = u64::from_le_bytes(body[8..16].try_into().map_err(corrupt_header)?);
        let len = u64::from_le_bytes(body[16..24].try_into().map_err(corrupt_header)?) as usize;
        if body.len() != 24 + len {
            return Err(Error::Corrupted("snapshot length mismatch".into()));
        }
        Ok(Some(Snapshot {
            index,
            term,
            data: body[24..].to_vec(),
        }))
    }

    fn reopen_writer(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            LogSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            LogSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            LogSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Flush and fsync regardless of policy
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

fn corrupt_header(_: std::array::TryFromSliceError) -> Error {
    Error::Corrupted("short header".into())
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("dir", &self.dir)
            .field("snapshot_index", &self.snapshot_index)
            .field("last_index", &self.last_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, format!("cmd{}", index).into_bytes())
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
            log.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();
            assert_eq!(log.last_index(), 3);
            assert_eq!(log.last_term(), 2);
        }

        let log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get(2).unwrap().command, b"cmd2");
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.get(4).is_none());
    }

    #[test]
    fn test_rejects_gaps() {
        let dir = tempdir().unwrap();
        let mut log = LogStore::open(dir.path(), LogSyncPolicy::Never).unwrap();
        log.append(&[entry(1, 1)]).unwrap();
        assert!(log.append(&[entry(1, 3)]).is_err());
    }

    #[test]
    fn test_truncate_then_append() {
        let dir = tempdir().unwrap();
        {
            let mut log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
            log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
            log.truncate_from(2).unwrap();
            assert_eq!(log.last_index(), 1);
            log.append(&[entry(3, 2)]).unwrap();
        }
        let log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(3));
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
            log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        }
        // Simulate a crash halfway through a third record
        let path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let partial = LogStore::encode_record(&entry(1, 3));
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        fs::write(&path, &bytes).unwrap();

        let mut log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 2);
        log.append(&[entry(1, 3)]).unwrap();
        drop(log);

        let log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_snapshot_keeps_matching_suffix() {
        let dir = tempdir().unwrap();
        let mut log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(2, 3), entry(2, 4)])
            .unwrap();
        log.install_snapshot(2, 1, b"state@2").unwrap();

        assert_eq!(log.snapshot_index(), 2);
        assert_eq!(log.first_index(), 3);
        assert!(log.get(2).is_none());
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.last_index(), 4);
        drop(log);

        let mut log = LogStore::open(dir.path(), LogSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.load_snapshot().unwrap().unwrap().data, b"state@2");
        assert!(log.truncate_from(2).is_err());

        // A snapshot from a different history discards everything
        log.install_snapshot(4, 7, b"other").unwrap();
        assert_eq!(log.last_index(), 4);
        assert!(log.is_empty());
        log.append(&[entry(7, 5)]).unwrap();
        assert_eq!(log.entries_from(5, 10).len(), 1);
    }
}
