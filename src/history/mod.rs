//! Durable per-project message history.
//!
//! Every message that crosses a project — client prompts, agent replies,
//! server-side events — is appended to a newline-delimited JSON log under
//! the project's `logs/` directory. Files rotate when they exceed a message
//! count, a byte ceiling, or cross a calendar-day boundary; filenames encode
//! creation time so ranged scans can skip whole files without opening them.
//! A `latest` pointer (symlink on unix, plain pointer file elsewhere) always
//! names the currently-open file.
//!
//! Appends are serialized by the log's lock, so records within a single
//! file are monotonically non-decreasing in timestamp. Readers do not take
//! the lock; a torn trailing line reads as corrupt and is skipped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Message-count ceiling per log file.
pub const MAX_MESSAGES_PER_FILE: usize = 10_000;
/// Size ceiling per log file.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

const FILE_PREFIX: &str = "messages_";
const FILE_SUFFIX: &str = ".jsonl";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const TIMESTAMP_LEN: usize = 19;
const LATEST: &str = "latest";

/// Who produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Client,
    Agent,
    Server,
}

/// One durable log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: Value,
    pub direction: Direction,
}

impl LogRecord {
    pub fn new(message: Value, direction: Direction) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
            direction,
        }
    }
}

/// Aggregate view of a log, cheap enough to compute per `project_list`.
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_messages: usize,
    max_bytes: u64,
}

#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    created: DateTime<Utc>,
    count: usize,
    bytes: u64,
}

impl ActiveFile {
    fn should_rotate(&self, now: DateTime<Utc>, limits: Limits) -> bool {
        self.count >= limits.max_messages
            || self.bytes >= limits.max_bytes
            || self.created.date_naive() != now.date_naive()
    }
}

/// Append-only message log for one project.
#[derive(Debug)]
pub struct MessageLog {
    dir: PathBuf,
    limits: Limits,
    active: Mutex<Option<ActiveFile>>,
}

impl MessageLog {
    /// Open (or create) the log rooted at `dir`, reattaching to the file the
    /// `latest` pointer names if one exists.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_limits(dir, MAX_MESSAGES_PER_FILE, MAX_FILE_BYTES)
    }

    /// Like [`MessageLog::open`] with custom rotation ceilings.
    pub fn with_limits(
        dir: impl Into<PathBuf>,
        max_messages: usize,
        max_bytes: u64,
    ) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let active = match read_latest_pointer(&dir) {
            Some(path) => Some(reattach(&path)?),
            None => None,
        };

        Ok(Self {
            dir,
            limits: Limits {
                max_messages,
                max_bytes,
            },
            active: Mutex::new(active),
        })
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveFile>> {
        // A poisoned lock means a writer panicked mid-append; the counters
        // are still coherent enough to keep appending.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one record, rotating the active file first if needed.
    ///
    /// The timestamp is assigned under the append lock — that, not caller
    /// discipline, is what keeps records within a file monotonically
    /// non-decreasing. Returns the record as stored.
    pub fn append(&self, message: Value, direction: Direction) -> io::Result<LogRecord> {
        let mut guard = self.lock_active();
        let record = LogRecord::new(message, direction);
        let line = serde_json::to_string(&record).map_err(io::Error::other)?;

        let needs_new = match guard.as_ref() {
            None => true,
            Some(file) => file.should_rotate(record.timestamp, self.limits),
        };
        if needs_new {
            *guard = Some(self.create_file(record.timestamp)?);
        }
        if let Some(file) = guard.as_mut() {
            let mut fh = OpenOptions::new().append(true).open(&file.path)?;
            fh.write_all(line.as_bytes())?;
            fh.write_all(b"\n")?;
            file.count += 1;
            file.bytes += line.len() as u64 + 1;
        }
        Ok(record)
    }

    /// All records with `timestamp > since`, in on-disk order.
    ///
    /// Files whose creation time plus the one-day rotation window still
    /// precedes the cutoff are skipped without being opened. Corrupt lines
    /// are skipped with a warning.
    pub fn messages_since(&self, since: DateTime<Utc>) -> io::Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        for (created, path) in self.list_files()? {
            if created + chrono::Duration::days(1) < since {
                continue;
            }
            for record in read_records(&path)? {
                if record.timestamp > since {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Earliest record, latest record, and total count across all files.
    pub fn stats(&self) -> io::Result<LogStats> {
        let mut stats = LogStats::default();
        for (_, path) in self.list_files()? {
            for record in read_records(&path)? {
                if stats.first_time.is_none_or(|t| record.timestamp < t) {
                    stats.first_time = Some(record.timestamp);
                }
                if stats.last_time.is_none_or(|t| record.timestamp > t) {
                    stats.last_time = Some(record.timestamp);
                }
                stats.count += 1;
            }
        }
        Ok(stats)
    }

    /// The file the `latest` pointer currently resolves to.
    pub fn latest_file(&self) -> Option<PathBuf> {
        read_latest_pointer(&self.dir)
    }

    /// Log files sorted by encoded creation time.
    fn list_files(&self) -> io::Result<Vec<(DateTime<Utc>, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(created) = parse_file_timestamp(name) else {
                continue;
            };
            files.push((created, name.to_string(), entry.path()));
        }
        files.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        Ok(files
            .into_iter()
            .map(|(created, _, path)| (created, path))
            .collect())
    }

    fn create_file(&self, now: DateTime<Utc>) -> io::Result<ActiveFile> {
        let base = now.format(TIMESTAMP_FORMAT).to_string();
        let mut filename = format!("{FILE_PREFIX}{base}{FILE_SUFFIX}");
        let mut n = 1;
        while self.dir.join(&filename).exists() {
            filename = format!("{FILE_PREFIX}{base}_{n}{FILE_SUFFIX}");
            n += 1;
        }
        let path = self.dir.join(&filename);
        File::create(&path)?;
        point_latest(&self.dir, &filename)?;
        Ok(ActiveFile {
            path,
            created: now,
            count: 0,
            bytes: 0,
        })
    }
}

/// Parse the creation timestamp encoded in a log filename.
fn parse_file_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let middle = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    if middle.len() < TIMESTAMP_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(&middle[..TIMESTAMP_LEN], TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn read_records(path: &Path) -> io::Result<Vec<LogRecord>> {
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping corrupt log line");
            }
        }
    }
    Ok(records)
}

/// Reattach to an existing log file: byte size from metadata, message count
/// by counting lines (corrupt lines still occupy a slot toward rotation).
fn reattach(path: &Path) -> io::Result<ActiveFile> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let created = parse_file_timestamp(name).unwrap_or_else(Utc::now);
    let bytes = fs::metadata(path)?.len();
    let content = fs::read_to_string(path)?;
    let count = content.lines().filter(|l| !l.trim().is_empty()).count();
    Ok(ActiveFile {
        path: path.to_path_buf(),
        created,
        count,
        bytes,
    })
}

fn read_latest_pointer(dir: &Path) -> Option<PathBuf> {
    let pointer = dir.join(LATEST);
    #[cfg(unix)]
    if let Ok(target) = fs::read_link(&pointer) {
        let path = dir.join(target);
        return path.exists().then_some(path);
    }
    let name = fs::read_to_string(&pointer).ok()?;
    let path = dir.join(name.trim());
    path.exists().then_some(path)
}

#[cfg(unix)]
fn point_latest(dir: &Path, filename: &str) -> io::Result<()> {
    let pointer = dir.join(LATEST);
    if fs::symlink_metadata(&pointer).is_ok() {
        fs::remove_file(&pointer)?;
    }
    std::os::unix::fs::symlink(filename, pointer)
}

#[cfg(not(unix))]
fn point_latest(dir: &Path, filename: &str) -> io::Result<()> {
    fs::write(dir.join(LATEST), filename)
}
