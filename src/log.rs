//! JSONL transfer journal: one entry per completed or failed operation

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Rejected,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub session_id: String,
    pub username: String,
    pub operation: String,
    pub file: Option<String>,
    pub status: TransferStatus,
    pub ack_code: Option<u8>,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(session_id: &str, username: &str, operation: impl ToString) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            username: username.to_string(),
            operation: operation.to_string(),
            file: None,
            status: TransferStatus::Completed,
            ack_code: None,
            bytes_transferred: 0,
            error: None,
        }
    }
}

/// Appends are serialized across connection threads.
pub struct TransferLog {
    log_file_path: PathBuf,
    lock: Mutex<()>,
}

impl TransferLog {
    pub fn new(data_root: &Path) -> Self {
        Self::at(data_root.join(".cloudvault_transfers.jsonl"))
    }

    pub fn at(log_file_path: PathBuf) -> Self {
        TransferLog {
            log_file_path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entries_append_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let log = TransferLog::new(tmp.path());
        assert!(log.read_log().unwrap().is_empty());

        let mut e = TransferLogEntry::new("s1", "alice", "upload");
        e.file = Some("a.txt".into());
        e.bytes_transferred = 5;
        log.add_entry(&e).unwrap();

        let mut e = TransferLogEntry::new("s1", "alice", "download");
        e.status = TransferStatus::Rejected;
        e.ack_code = Some(1);
        log.add_entry(&e).unwrap();

        let entries = log.read_log().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "upload");
        assert_eq!(entries[0].bytes_transferred, 5);
        assert_eq!(entries[1].status, TransferStatus::Rejected);
        assert_eq!(entries[1].ack_code, Some(1));
    }
}
