//! Append-only error-history log ("few-shot memory as a file"). Shared
//! across runs; must tolerate concurrent
//! writers, so every record is appended with `O_APPEND` rather than a
//! read-modify-write cycle.

use std::fs::OpenOptions;
use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::failure::BugType;

/// One past fix, consulted as a few-shot example for future prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub bug_type: BugType,
    pub file: String,
    pub summary: String,
}

/// Handle to the on-disk error-history log.
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one entry. Uses a single `O_APPEND` write so that concurrent
    /// runs sharing this path never interleave partial lines or clobber
    /// each other's entries.
    pub fn append(&self, entry: &HistoryEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Read all entries currently on disk. Used to build the few-shot
    /// context for a prompt; the caller filters/truncates to K<=5 matching
    /// entries.
    pub fn read_all(&self) -> std::io::Result<Vec<HistoryEntry>> {
        if !Path::new(&self.path).exists() {
            return Ok(vec![]);
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<HistoryEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("healer-history-test-{}", std::process::id()));
        let path = dir.join("history.jsonl");
        let log = HistoryLog::new(&path);

        log.append(&HistoryEntry {
            bug_type: BugType::Logic,
            file: "app.py".to_string(),
            summary: "fixed off-by-one".to_string(),
        })
        .unwrap();
        log.append(&HistoryEntry {
            bug_type: BugType::Syntax,
            file: "other.py".to_string(),
            summary: "closed paren".to_string(),
        })
        .unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file, "app.py");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let path = std::env::temp_dir().join("healer-history-nonexistent.jsonl");
        let log = HistoryLog::new(&path);
        assert!(log.read_all().unwrap().is_empty());
    }
}
