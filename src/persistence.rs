//! Write-ahead log and snapshot persistence
//!
//! Layout of the data directory:
//! - `messages.wal`: one JSON `ChatMessage` per line, append-only, fsynced
//!   after every record
//! - `snapshot.json`: pretty-printed JSON array of every message, replaced
//!   by writing `snapshot.json.tmp` and renaming it over the live file
//!
//! All methods are synchronous and are only called from the room actor.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::PersistenceError;
use crate::message::ChatMessage;

const WAL_FILE: &str = "messages.wal";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";
const SNAPSHOT_CORRUPT_FILE: &str = "snapshot.json.corrupt";

/// History rebuilt at startup
#[derive(Debug, Default)]
pub struct Recovered {
    pub history: Vec<ChatMessage>,
    /// One past the highest id seen
    pub next_message_id: u64,
    /// Messages taken from the snapshot
    pub from_snapshot: usize,
    /// Messages replayed from the WAL
    pub from_wal: usize,
    /// WAL lines that failed to parse
    pub skipped: usize,
    /// The WAL ended without a newline and was sealed before appending
    pub sealed_torn_tail: bool,
}

#[derive(Debug)]
pub struct PersistenceLog {
    wal_path: PathBuf,
    snapshot_path: PathBuf,
    tmp_path: PathBuf,
    /// `None` after `close` or after a failed truncation
    wal: Option<File>,
    closed: bool,
}

impl PersistenceLog {
    /// Create the data directory if needed, recover history and open the
    /// WAL for appending.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<(Self, Recovered), PersistenceError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;

        let mut log = Self {
            wal_path: dir.join(WAL_FILE),
            snapshot_path: dir.join(SNAPSHOT_FILE),
            tmp_path: dir.join(SNAPSHOT_TMP_FILE),
            wal: None,
            closed: false,
        };

        let recovered = log.recover(dir)?;
        let mut wal = open_append(&log.wal_path)?;
        if recovered.sealed_torn_tail {
            // New records must start on their own line
            write_synced(&mut wal, b"\n").map_err(|e| PersistenceError::io(&log.wal_path, e))?;
            warn!(path = %log.wal_path.display(), "Sealed torn WAL tail");
        }
        log.wal = Some(wal);
        info!(
            path = %log.wal_path.display(),
            snapshot = recovered.from_snapshot,
            wal = recovered.from_wal,
            skipped = recovered.skipped,
            next_id = recovered.next_message_id,
            "WAL initialized"
        );

        Ok((log, recovered))
    }

    fn recover(&self, dir: &Path) -> Result<Recovered, PersistenceError> {
        let mut recovered = Recovered::default();

        match self.load_snapshot() {
            Ok(history) => recovered.history = history,
            Err(PersistenceError::Json { source, .. }) => {
                let aside = dir.join(SNAPSHOT_CORRUPT_FILE);
                error!(error = %source, moved_to = %aside.display(), "Snapshot unreadable, continuing from WAL");
                fs::rename(&self.snapshot_path, &aside)
                    .map_err(|e| PersistenceError::io(&self.snapshot_path, e))?;
            }
            Err(e) => return Err(e),
        }
        recovered.from_snapshot = recovered.history.len();

        let mut next_id = recovered
            .history
            .iter()
            .map(|m| m.id + 1)
            .max()
            .unwrap_or(0);

        let file = match File::open(&self.wal_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No WAL file found (fresh start)");
                recovered.next_message_id = next_id;
                return Ok(recovered);
            }
            Err(e) => return Err(PersistenceError::io(&self.wal_path, e)),
        };

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut number = 0usize;
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| PersistenceError::io(&self.wal_path, e))?;
            if read == 0 {
                break;
            }
            number += 1;
            recovered.sealed_torn_tail = line.last() != Some(&b'\n');

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            // Raw bytes: a torn or garbled record may not even be UTF-8
            let msg: ChatMessage = match serde_json::from_slice(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(line = number, error = %e, "Skipping corrupt WAL line");
                    recovered.skipped += 1;
                    continue;
                }
            };
            // Already covered by a snapshot whose WAL was never truncated
            if msg.id < next_id {
                debug!(id = msg.id, "Skipping WAL record already in snapshot");
                continue;
            }
            next_id = msg.id + 1;
            recovered.history.push(msg);
            recovered.from_wal += 1;
        }

        recovered.next_message_id = next_id;
        Ok(recovered)
    }

    fn load_snapshot(&self) -> Result<Vec<ChatMessage>, PersistenceError> {
        let file = match File::open(&self.snapshot_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.snapshot_path, e)),
        };
        let mut history: Vec<ChatMessage> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PersistenceError::json(&self.snapshot_path, e))?;
        history.sort_by_key(|m| m.id);
        info!(count = history.len(), "Loaded messages from snapshot");
        Ok(history)
    }

    fn wal(&mut self) -> Result<&mut File, PersistenceError> {
        if self.closed {
            return Err(PersistenceError::WalClosed);
        }
        if self.wal.is_none() {
            self.wal = Some(open_append(&self.wal_path)?);
        }
        self.wal.as_mut().ok_or(PersistenceError::WalClosed)
    }

    /// Append one record and fsync before returning
    pub fn append(&mut self, msg: &ChatMessage) -> Result<(), PersistenceError> {
        let mut record =
            serde_json::to_vec(msg).map_err(|e| PersistenceError::json(&self.wal_path, e))?;
        record.push(b'\n');

        let path = self.wal_path.clone();
        write_synced(self.wal()?, &record).map_err(|e| PersistenceError::io(path, e))
    }

    /// Write the full history to the snapshot file, then truncate the WAL
    pub fn snapshot(&mut self, history: &[ChatMessage]) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::WalClosed);
        }

        let file = File::create(&self.tmp_path).map_err(|e| PersistenceError::io(&self.tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, history)
            .map_err(|e| PersistenceError::json(&self.tmp_path, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| PersistenceError::io(&self.tmp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| PersistenceError::io(&self.tmp_path, e))?;
        drop(file);

        fs::rename(&self.tmp_path, &self.snapshot_path)
            .map_err(|e| PersistenceError::io(&self.snapshot_path, e))?;
        info!(count = history.len(), "Snapshot created");

        self.truncate_wal()
    }

    fn truncate_wal(&mut self) -> Result<(), PersistenceError> {
        self.wal = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| PersistenceError::io(&self.wal_path, e))?;
        file.sync_all()
            .map_err(|e| PersistenceError::io(&self.wal_path, e))?;
        self.wal = Some(file);
        debug!("WAL truncated");
        Ok(())
    }

    /// Sync and release the WAL handle. Later appends fail with `WalClosed`.
    pub fn close(&mut self) -> Result<(), PersistenceError> {
        self.closed = true;
        match self.wal.take() {
            Some(file) => file
                .sync_all()
                .map_err(|e| PersistenceError::io(&self.wal_path, e)),
            None => Ok(()),
        }
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

fn write_synced(file: &mut File, record: &[u8]) -> std::io::Result<()> {
    file.write_all(record)?;
    file.flush()?;
    file.sync_data()
}

fn open_append(path: &Path) -> Result<File, PersistenceError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PersistenceError::io(path, e))
}
