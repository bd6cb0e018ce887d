//! Per-run session logs
//!
//! Each run writes its log records to `session_<id>.jsonl`, one JSON object
//! per line. The id is the local start time followed by the process id, so
//! ids sort chronologically and two runs started in the same second do not
//! share a file.

use crate::core::error::{FlashError, Precondition, Result};
use chrono::Local;
use log::{debug, Log, Metadata, Record};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SESSION_PREFIX: &str = "session_";
pub const SESSION_SUFFIX: &str = ".jsonl";

/// One line of a session file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// RFC 3339 local time
    pub time: String,
    pub level: String,
    pub message: String,
}

/// A session file on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Open session file, appended to as records arrive
#[derive(Debug)]
pub struct SessionLog {
    id: String,
    path: PathBuf,
    file: File,
}

impl SessionLog {
    /// Create a new session file under `dir`
    pub fn start(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let id = format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            std::process::id()
        );
        let path = session_path(dir, &id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Session log: {}", path.display());
        Ok(Self { id, path, file })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it
    pub fn record(&mut self, level: &str, message: &str) -> Result<()> {
        let entry = SessionEntry {
            time: Local::now().to_rfc3339(),
            level: level.to_lowercase(),
            message: message.to_string(),
        };
        let line = serde_json::to_string(&entry).map_err(|e| FlashError::Io(e.to_string()))?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// `log` backend that forwards to `inner` and copies every enabled record
/// into the session file
pub struct SessionLogger<L> {
    inner: L,
    session: Mutex<SessionLog>,
}

impl<L: Log> SessionLogger<L> {
    pub fn new(inner: L, session: SessionLog) -> Self {
        Self {
            inner,
            session: Mutex::new(session),
        }
    }
}

impl<L: Log> Log for SessionLogger<L> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        self.inner.log(record);
        if let Ok(mut session) = self.session.lock() {
            // A full disk must not take the console log down with it
            let _ = session.record(record.level().as_str(), &record.args().to_string());
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

pub fn session_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}{}{}", SESSION_PREFIX, id, SESSION_SUFFIX))
}

fn session_id(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(SESSION_PREFIX)?
        .strip_suffix(SESSION_SUFFIX)
}

/// Session files under `dir`, newest first. A missing directory has none.
pub fn list_sessions(dir: &Path) -> Result<Vec<SessionInfo>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = session_id(&name) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        sessions.push(SessionInfo {
            id: id.to_string(),
            path: entry.path(),
            size,
        });
    }
    sessions.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(sessions)
}

/// Parse a session file, skipping lines that are not entries
pub fn read_entries(path: &Path) -> Result<Vec<SessionEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => debug!("{}:{}: skipped: {}", path.display(), index + 1, e),
        }
    }
    Ok(entries)
}

/// Last `lines` entries of the newest session
pub fn tail(dir: &Path, lines: usize) -> Result<Option<(SessionInfo, Vec<SessionEntry>)>> {
    let Some(latest) = list_sessions(dir)?.into_iter().next() else {
        return Ok(None);
    };
    let mut entries = read_entries(&latest.path)?;
    let skip = entries.len().saturating_sub(lines);
    entries.drain(..skip);
    Ok(Some((latest, entries)))
}

/// Every entry of the session `id`
pub fn show(dir: &Path, id: &str) -> Result<Vec<SessionEntry>> {
    let path = session_path(dir, id);
    if !path.is_file() {
        return Err(FlashError::precondition(Precondition::SourceMissing(path)));
    }
    read_entries(&path)
}

/// Delete every session file under `dir`. Returns how many went.
pub fn clear(dir: &Path) -> Result<usize> {
    let sessions = list_sessions(dir)?;
    for session in &sessions {
        fs::remove_file(&session.path)?;
    }
    Ok(sessions.len())
}
