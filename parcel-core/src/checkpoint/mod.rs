//! Resumable progress of a pipeline stage.
//!
//! Each stage owns two files in the checkpoint directory:
//!
//! - `<stage>.checkpoint`: completed keys, one per line. Lines starting with `#` are comments;
//!   every flush appends one with the flush time.
//! - `<stage>.journal.jsonl`: the result of every completed key as a [`JournalEntry`].
//!
//! Journal entries are synced before the keys they belong to, so after a crash a key is either
//! missing (and its work is redone) or its result is on disk. Removing the checkpoint file
//! starts the stage over.

mod journal;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub use journal::JournalEntry;
use journal::{Journal, complete_lines_len};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Errors of the checkpoint files. All of them abort the stage.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    /// The checkpoint directory could not be created.
    #[error("Unable to create checkpoint directory {1}: {0}")]
    CreateDirError(#[source] std::io::Error, PathBuf),

    /// A checkpoint file exists but could not be read.
    #[error("Unable to read checkpoint file {1}: {0}")]
    ReadError(#[source] std::io::Error, PathBuf),

    /// A checkpoint file could not be written or synced.
    #[error("Unable to write checkpoint file {1}: {0}")]
    WriteError(#[source] std::io::Error, PathBuf),

    /// A journal line other than the last one is not valid JSON.
    #[error("Journal {1} is corrupt at line {2}: {0}")]
    CorruptJournal(#[source] serde_json::Error, PathBuf, usize),

    /// The result of a key could not be serialized.
    #[error("Unable to serialize the result of {1}: {0}")]
    SerializeError(#[source] serde_json::Error, String),
}

/// Pipeline stage owning a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Tiles to parcel centroids. Keys are `z/x/y` tile coordinates.
    Tiles,
    /// Parcel centroids to enriched records. Keys are parcel ids.
    Enrich,
}

impl Stage {
    /// File name stem of the stage's checkpoint files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Tiles => "tiles",
            Self::Enrich => "enrich",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// When buffered keys are written to disk: after `every` keys or `interval`, whichever comes
/// first. A crash loses at most one such batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Number of completed keys per flush.
    pub every: usize,
    /// Longest time between flushes while keys are completing.
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every: 1000,
            interval: Duration::from_secs(30),
        }
    }
}

/// Append-only ledger of completed keys of one stage, with a journal of their results.
#[derive(Debug)]
pub struct CheckpointStore<T> {
    stage: Stage,
    dir: PathBuf,
    keys_path: PathBuf,
    keys_file: File,
    completed: HashSet<String>,
    unflushed: Vec<String>,
    journal: Journal<T>,
    policy: FlushPolicy,
    last_flush: Instant,
}

impl<T: Serialize + DeserializeOwned> CheckpointStore<T> {
    /// Opens the checkpoint of `stage` in `dir` and returns the journal of previous runs.
    ///
    /// With `fresh`, or when the checkpoint file does not exist, the stage starts over and the
    /// journal is emptied.
    pub fn open(
        dir: &Path,
        stage: Stage,
        policy: FlushPolicy,
        fresh: bool,
    ) -> Result<(Self, Vec<JournalEntry<T>>), CheckpointError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CheckpointError::CreateDirError(e, dir.to_path_buf()))?;
        let keys_path = dir.join(format!("{stage}.checkpoint"));
        let journal_path = dir.join(format!("{stage}.journal.jsonl"));

        if fresh && keys_path.exists() {
            info!("Discarding {stage} checkpoint {}", keys_path.display());
            std::fs::remove_file(&keys_path)
                .map_err(|e| CheckpointError::WriteError(e, keys_path.clone()))?;
        }

        let (completed, journal, entries) = if keys_path.exists() {
            let completed = read_keys(&keys_path)?;
            let (journal, entries) = Journal::open(journal_path)?;
            (completed, journal, entries)
        } else {
            let mut header = File::create(&keys_path)
                .map_err(|e| CheckpointError::WriteError(e, keys_path.clone()))?;
            writeln!(header, "# parcelmap {stage} checkpoint: one completed key per line")
                .map_err(|e| CheckpointError::WriteError(e, keys_path.clone()))?;
            (HashSet::new(), Journal::create(journal_path)?, Vec::new())
        };

        let keys_file = OpenOptions::new()
            .append(true)
            .open(&keys_path)
            .map_err(|e| CheckpointError::WriteError(e, keys_path.clone()))?;

        if !completed.is_empty() {
            info!(
                "Resuming {stage}: {} keys already completed, {} journal entries in {}",
                completed.len(),
                entries.len(),
                journal.path().display()
            );
        }

        let store = Self {
            stage,
            dir: dir.to_path_buf(),
            keys_path,
            keys_file,
            completed,
            unflushed: Vec::new(),
            journal,
            policy,
            last_flush: Instant::now(),
        };
        Ok((store, entries))
    }

    /// Records a completed key and its result, flushing if the policy says so.
    ///
    /// Returns `true` if this call flushed.
    pub fn complete(&mut self, key: String, value: &T) -> Result<bool, CheckpointError> {
        self.journal.push(&key, value)?;
        if self.completed.insert(key.clone()) {
            self.unflushed.push(key);
        }
        if self.unflushed.len() >= self.policy.every.max(1)
            || self.last_flush.elapsed() >= self.policy.interval
        {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Results of every completed key that reached the disk, in the order they were
    /// recorded. A key completed more than once appears more than once.
    pub fn journal_entries(&self) -> Result<Vec<JournalEntry<T>>, CheckpointError> {
        self.journal.entries()
    }

    /// Syncs the journal, then appends and syncs the buffered keys.
    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.journal.flush()?;
        if !self.unflushed.is_empty() {
            let mut buf = String::new();
            for key in &self.unflushed {
                buf.push_str(key);
                buf.push('\n');
            }
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            buf.push_str(&format!("# flushed {} keys at unix time {now}\n", self.unflushed.len()));
            self.keys_file
                .write_all(buf.as_bytes())
                .and_then(|()| self.keys_file.sync_data())
                .map_err(|e| CheckpointError::WriteError(e, self.keys_path.clone()))?;
            debug!("Flushed {} {} keys", self.unflushed.len(), self.stage);
            self.unflushed.clear();
        }
        self.last_flush = Instant::now();
        Ok(())
    }
}

impl<T> CheckpointStore<T> {
    /// The stage this checkpoint belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether `key` was completed by this or a previous run.
    #[must_use]
    pub fn is_completed(&self, key: &str) -> bool {
        self.completed.contains(key)
    }

    /// Number of completed keys.
    #[must_use]
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Path of the checkpoint file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.keys_path
    }

    /// Path of the file listing the keys skipped by the last run.
    #[must_use]
    pub fn skipped_path(&self) -> PathBuf {
        self.dir.join(format!("{}.skipped.txt", self.stage))
    }

    /// Replaces the list of skipped keys. An empty list removes the file.
    pub fn record_skipped(&self, keys: &[String]) -> Result<(), CheckpointError> {
        let path = self.skipped_path();
        if keys.is_empty() {
            return match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(CheckpointError::WriteError(e, path))
                }
                _ => Ok(()),
            };
        }
        warn!(
            "{} {} keys were skipped, see {}",
            keys.len(),
            self.stage,
            path.display()
        );
        let mut content = keys.join("\n");
        content.push('\n');
        std::fs::write(&path, content).map_err(|e| CheckpointError::WriteError(e, path))
    }
}

fn read_keys(path: &Path) -> Result<HashSet<String>, CheckpointError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| CheckpointError::ReadError(e, path.to_path_buf()))?;
    let complete_len = complete_lines_len(&content);
    if complete_len < content.len() {
        warn!("Ignoring a partially written key at the end of {}", path.display());
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| CheckpointError::WriteError(e, path.to_path_buf()))?;
        file.set_len(complete_len as u64)
            .map_err(|e| CheckpointError::WriteError(e, path.to_path_buf()))?;
    }
    Ok(content[..complete_len]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}
