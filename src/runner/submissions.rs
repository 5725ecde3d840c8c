//! Append-only, fsync'd submission log.
//!
//! Every terminal outcome is written here before its task releases its
//! concurrency slot, so the file is the record of truth after a crash. Lines
//! are never rewritten; readers resolve duplicates by keeping the last value
//! for each task id.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::result::{SubmissionRecord, TaskOutcome};
use crate::error::SubmissionLogError;

/// Writer for one run's submission log.
#[derive(Debug)]
pub struct SubmissionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SubmissionLog {
    /// Creates a writer. Nothing is opened until the first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and forces it to stable storage before returning.
    ///
    /// Appends from concurrent tasks are serialized so lines never interleave.
    pub async fn append(&self, record: &SubmissionRecord) -> Result<(), SubmissionLogError> {
        let line = record.to_json_line()?;
        let path = self.path.clone();

        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| SubmissionLogError::Join(e.to_string()))??;

        debug!(task_id = %record.task_id, path = %self.path.display(), "Recorded submission");
        Ok(())
    }

    /// Reads a submission log back into its final state.
    ///
    /// Later lines win over earlier ones for the same task id. A torn write
    /// (a record cut short by a crash, or any malformed final line) is
    /// skipped with a warning; other malformed lines are an error. A
    /// missing file is empty.
    pub fn load(path: &Path) -> Result<BTreeMap<String, TaskOutcome>, SubmissionLogError> {
        let mut outcomes = BTreeMap::new();
        if !path.exists() {
            return Ok(outcomes);
        }

        let reader = BufReader::new(fs::File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last_line = lines.len();

        for (index, line) in lines.iter().enumerate() {
            let line_number = index + 1;
            if line.trim().is_empty() {
                continue;
            }
            match SubmissionRecord::parse_line(line) {
                Ok(records) => {
                    for record in records {
                        outcomes.insert(record.task_id, record.outcome);
                    }
                }
                Err(reason) if line_number == last_line || is_truncated(line) => {
                    warn!(
                        path = %path.display(),
                        line = line_number,
                        error = %reason,
                        "Ignoring torn line in submission log"
                    );
                }
                Err(reason) => {
                    return Err(SubmissionLogError::InvalidLine {
                        path: path.to_path_buf(),
                        line: line_number,
                        reason,
                    });
                }
            }
        }

        Ok(outcomes)
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), SubmissionLogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let mut buf = Vec::with_capacity(line.len() + 2);
    if ends_mid_line(&mut file)? {
        // A crash left a torn line; end it so the new record starts clean.
        warn!(path = %path.display(), "Terminating torn final line before append");
        buf.push(b'\n');
    }
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// A record cut short mid-write parses as JSON that ended too early.
fn is_truncated(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .err()
        .is_some_and(|e| e.is_eof())
}

fn ends_mid_line(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
