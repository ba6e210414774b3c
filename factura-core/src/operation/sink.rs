use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use thiserror::Error;

use super::Transition;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transition sink lock poisoned")]
    Poisoned,
}

/// Persistence contract: record a state transition keyed by operation id.
pub trait TransitionSink: Send + Sync + 'static {
    fn record(&self, operation_id: &str, transition: &Transition) -> Result<(), SinkError>;
}

/// A transition tagged with the operation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub operation_id: String,
    #[serde(flatten)]
    pub transition: Transition,
}

/// Keeps transitions in memory, in recording order.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded entries; a lock poisoned by a panicking writer still yields
    /// everything recorded before the panic.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn for_operation(&self, operation_id: &str) -> Vec<Transition> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.operation_id == operation_id)
            .map(|entry| entry.transition)
            .collect()
    }
}

impl TransitionSink for MemorySink {
    fn record(&self, operation_id: &str, transition: &Transition) -> Result<(), SinkError> {
        let mut entries = self.entries.lock().map_err(|_| SinkError::Poisoned)?;
        entries.push(JournalEntry {
            operation_id: operation_id.to_string(),
            transition: transition.clone(),
        });
        Ok(())
    }
}

/// Appends one JSON object per transition to a file.
#[derive(Debug)]
pub struct JournalSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalSink {
    /// Opens `path` for appending, creating it when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every entry of a journal file; blank lines are skipped.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>, SinkError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl TransitionSink for JournalSink {
    fn record(&self, operation_id: &str, transition: &Transition) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(&JournalEntry {
            operation_id: operation_id.to_string(),
            transition: transition.clone(),
        })?;
        line.push('\n');

        let mut file = self.file.lock().map_err(|_| SinkError::Poisoned)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
