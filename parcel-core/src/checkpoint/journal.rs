use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CheckpointError;

/// The result recorded for one completed key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry<T> {
    /// The completed key.
    pub key: String,
    /// What processing the key produced.
    pub value: T,
}

#[derive(Serialize)]
struct EntryRef<'a, T> {
    key: &'a str,
    value: &'a T,
}

/// JSON-lines file of per-key results, appended in batches.
#[derive(Debug)]
pub(super) struct Journal<T> {
    path: PathBuf,
    file: File,
    pending: String,
    pending_entries: usize,
    _value: PhantomData<fn(T)>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// Starts an empty journal, discarding any previous content.
    pub(super) fn create(path: PathBuf) -> Result<Self, CheckpointError> {
        let file = File::create(&path).map_err(|e| CheckpointError::WriteError(e, path.clone()))?;
        Ok(Self::with_file(path, file))
    }

    /// Opens an existing journal for appending and returns its entries.
    ///
    /// A partially written last line is dropped from the file.
    pub(super) fn open(path: PathBuf) -> Result<(Self, Vec<JournalEntry<T>>), CheckpointError> {
        let (entries, complete_len, torn) = read_entries(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CheckpointError::WriteError(e, path.clone()))?;
        if torn {
            warn!(
                "Ignoring a partially written line at the end of {}",
                path.display()
            );
            file.set_len(complete_len as u64)
                .map_err(|e| CheckpointError::WriteError(e, path.clone()))?;
        }
        Ok((Self::with_file(path, file), entries))
    }

    /// Entries written to disk so far.
    pub(super) fn entries(&self) -> Result<Vec<JournalEntry<T>>, CheckpointError> {
        read_entries(&self.path).map(|(entries, _, _)| entries)
    }

    fn with_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file,
            pending: String::new(),
            pending_entries: 0,
            _value: PhantomData,
        }
    }

    pub(super) fn push(&mut self, key: &str, value: &T) -> Result<(), CheckpointError> {
        let line = serde_json::to_string(&EntryRef { key, value })
            .map_err(|e| CheckpointError::SerializeError(e, key.to_string()))?;
        self.pending.push_str(&line);
        self.pending.push('\n');
        self.pending_entries += 1;
        Ok(())
    }

    /// Writes and syncs buffered entries.
    pub(super) fn flush(&mut self) -> Result<(), CheckpointError> {
        if self.pending_entries == 0 {
            return Ok(());
        }
        self.file
            .write_all(self.pending.as_bytes())
            .and_then(|()| self.file.sync_data())
            .map_err(|e| CheckpointError::WriteError(e, self.path.clone()))?;
        self.pending.clear();
        self.pending_entries = 0;
        Ok(())
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }
}

/// Parses the complete lines of a journal. Also returns their total length and whether an
/// incomplete line follows them.
fn read_entries<T: DeserializeOwned>(
    path: &Path,
) -> Result<(Vec<JournalEntry<T>>, usize, bool), CheckpointError> {
    let content = match std::fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(CheckpointError::ReadError(e, path.to_path_buf())),
    };
    let complete_len = complete_lines_len(&content);
    let mut entries = Vec::new();
    for (idx, line) in content[..complete_len].lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line)
            .map_err(|e| CheckpointError::CorruptJournal(e, path.to_path_buf(), idx + 1))?;
        entries.push(entry);
    }
    Ok((entries, complete_len, complete_len < content.len()))
}

/// Length of the prefix of `content` made of newline-terminated lines.
pub(super) fn complete_lines_len(content: &str) -> usize {
    content.rfind('\n').map_or(0, |pos| pos + 1)
}
