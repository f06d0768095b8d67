//! # raft-storage
//!
//! why: term, vote and log must survive a crash before a node talks to anyone
//! relations: fed from raft-core's Ready output by raft-runtime, read back on restart
//! what: Storage trait with persist/recover, json-file backend, in-memory backend

use raft_core::{HardState, LogDelta, LogEntry, LogIndex};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to (de)serialize persisted state: {0}")]
    Serialization(#[from] serde_json::Error),

    /// persisted state is inconsistent with the requested operation
    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// durable home of a node's hard state and log
///
/// everything written here must be on stable storage before the node
/// that produced it sends a message
pub trait Storage {
    /// overwrite the stored term and vote
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()>;

    /// load the persisted term and voted_for, term 0 and no vote if none
    fn load_hard_state(&self) -> Result<HardState>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// every stored entry, position is the log index
    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// drop every entry at position `from` and after (for conflict resolution)
    fn truncate_log_from(&mut self, from: LogIndex) -> Result<()>;

    /// forget everything, as if freshly created
    fn clear(&mut self) -> Result<()>;

    /// apply the durable part of a node's output: truncate, append, then save the vote
    fn persist(&mut self, hard_state: Option<&HardState>, delta: Option<&LogDelta>) -> Result<()> {
        if let Some(delta) = delta {
            self.truncate_log_from(delta.from)?;
            self.append_entries(&delta.entries)?;
        }
        if let Some(hard_state) = hard_state {
            self.save_hard_state(hard_state)?;
        }
        Ok(())
    }

    /// load everything a node needs to restart
    fn recover(&self) -> Result<(HardState, Vec<LogEntry>)> {
        Ok((self.load_hard_state()?, self.load_log()?))
    }
}

/// truncating past the end would leave a gap in the log
fn check_truncate(len: usize, from: LogIndex) -> Result<()> {
    if from > len as u64 {
        return Err(StorageError::Corrupt(format!(
            "cannot truncate from {from}, log holds {len} entries"
        )));
    }
    Ok(())
}

// -- json files --

/// one directory per node holding:
/// - meta.json: the hard state
/// - log.json: array of log entries, position is the index
///
/// every write rewrites and fsyncs a whole file, so persisting a batch costs
/// time proportional to the log length and blocks the calling thread
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// open (or create) the state directory at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    /// atomic write: write to temp file, fsync, then rename over the target
    fn write_atomic(&self, temp_name: &str, target: PathBuf, json: &str) -> Result<()> {
        let temp_path = self.dir.join(temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok(())
    }

    fn write_log(&self, log: &[LogEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(log)?;
        self.write_atomic("log.tmp", self.log_path(), &json)
    }
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        let json = serde_json::to_string_pretty(hard_state)?;
        self.write_atomic("meta.tmp", self.meta_path(), &json)
    }

    fn load_hard_state(&self) -> Result<HardState> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(HardState::default()); // default for new nodes
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut log = self.load_log()?;
        log.extend_from_slice(entries);
        // whole-file rewrite keeps every write atomic
        self.write_log(&log)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn truncate_log_from(&mut self, from: LogIndex) -> Result<()> {
        let mut log = self.load_log()?;
        check_truncate(log.len(), from)?;
        if from as usize == log.len() {
            return Ok(());
        }
        log.truncate(from as usize);
        self.write_log(&log)
    }

    fn clear(&mut self) -> Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// one log rewrite per batch instead of truncate + append
    fn persist(&mut self, hard_state: Option<&HardState>, delta: Option<&LogDelta>) -> Result<()> {
        if let Some(delta) = delta {
            let mut log = self.load_log()?;
            check_truncate(log.len(), delta.from)?;
            log.truncate(delta.from as usize);
            log.extend_from_slice(&delta.entries);
            self.write_log(&log)?;
        }
        if let Some(hard_state) = hard_state {
            self.save_hard_state(hard_state)?;
        }
        Ok(())
    }
}

// -- in memory --

/// keeps state in the process, lost when dropped
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_hard_state(&mut self, hard_state: &HardState) -> Result<()> {
        self.hard_state = *hard_state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.log.extend_from_slice(entries);
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from: LogIndex) -> Result<()> {
        check_truncate(self.log.len(), from)?;
        self.log.truncate(from as usize);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.hard_state = HardState::default();
        self.log.clear();
        Ok(())
    }
}
