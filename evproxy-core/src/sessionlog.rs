//! Durable session accounting store.
//!
//! Append-oriented JSON-lines log with replay-on-open recovery. Every
//! mutation is flushed and fsynced before the caller sees success, so a
//! session that was opened or closed survives a process restart. The store
//! has exactly one writer; readers get cloned records.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// CSV header; column order is part of the public contract.
pub const CSV_HEADER: &str =
    "session_id,backend_id,start_ts,stop_ts,start_meter_wh,stop_meter_wh,energy_wh,reason";

#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unknown session {0}")]
    UnknownSession(u64),
}

/// One charging session, open while `stop_ts` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: u64,
    pub backend_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub start_ts: DateTime<Utc>,
    pub stop_ts: Option<DateTime<Utc>>,
    pub start_meter_wh: f64,
    pub stop_meter_wh: Option<f64>,
    pub reason: Option<String>,
}

impl SessionRecord {
    pub fn energy_wh(&self) -> Option<f64> {
        self.stop_meter_wh.map(|stop| stop - self.start_meter_wh)
    }

    pub fn is_open(&self) -> bool {
        self.stop_ts.is_none()
    }
}

/// Query filter for listings and exports. Sessions match on their start
/// timestamp and owning backend.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub backend_id: Option<String>,
}

impl SessionFilter {
    fn matches(&self, record: &SessionRecord) -> bool {
        if let Some(from) = self.from {
            if record.start_ts < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.start_ts > to {
                return false;
            }
        }
        if let Some(backend) = &self.backend_id {
            if &record.backend_id != backend {
                return false;
            }
        }
        true
    }
}

/// Log entries on disk, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum LogEntry {
    #[serde(rename = "OPEN")]
    Open {
        session_id: u64,
        backend_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
        start_ts: DateTime<Utc>,
        start_meter_wh: f64,
    },
    #[serde(rename = "CLOSE")]
    Close {
        session_id: u64,
        stop_ts: DateTime<Utc>,
        stop_meter_wh: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

pub struct SessionLog {
    path: PathBuf,
    writer: BufWriter<File>,
    sessions: BTreeMap<u64, SessionRecord>,
    open: Option<u64>,
    next_id: u64,
}

impl SessionLog {
    /// Open the store, replaying any existing log to rebuild the index.
    /// Unparseable lines are skipped with a warning rather than refusing to
    /// start; accounting degrades, operation continues.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut sessions = BTreeMap::new();
        let mut open = None;
        let mut next_id = 1;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut line_num = 0usize;
            for line in reader.lines() {
                line_num += 1;
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(entry) => {
                        Self::apply(&mut sessions, &mut open, &mut next_id, entry);
                    }
                    Err(e) => {
                        warn!(line = line_num, error = %e, "skipping corrupt session log line");
                    }
                }
            }
            info!(
                sessions = sessions.len(),
                path = %path.display(),
                "session log replayed"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            sessions,
            open,
            next_id,
        })
    }

    fn apply(
        sessions: &mut BTreeMap<u64, SessionRecord>,
        open: &mut Option<u64>,
        next_id: &mut u64,
        entry: LogEntry,
    ) {
        match entry {
            LogEntry::Open {
                session_id,
                backend_id,
                transaction_id,
                start_ts,
                start_meter_wh,
            } => {
                sessions.insert(
                    session_id,
                    SessionRecord {
                        session_id,
                        backend_id,
                        transaction_id,
                        start_ts,
                        stop_ts: None,
                        start_meter_wh,
                        stop_meter_wh: None,
                        reason: None,
                    },
                );
                *open = Some(session_id);
                *next_id = (*next_id).max(session_id + 1);
            }
            LogEntry::Close {
                session_id,
                stop_ts,
                stop_meter_wh,
                reason,
            } => {
                if let Some(record) = sessions.get_mut(&session_id) {
                    record.stop_ts = Some(stop_ts);
                    record.stop_meter_wh = Some(stop_meter_wh);
                    record.reason = reason;
                }
                if *open == Some(session_id) {
                    *open = None;
                }
            }
        }
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), SessionLogError> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Record a new open session and return its id. At most one session is
    /// open at a time; a dangling open session is closed first with a zero
    /// energy delta, since its real end was never observed.
    pub fn open_session(
        &mut self,
        backend_id: &str,
        transaction_id: Option<&str>,
        start_meter_wh: f64,
        start_ts: DateTime<Utc>,
    ) -> Result<u64, SessionLogError> {
        if let Some(dangling) = self.open {
            let start_meter = self
                .sessions
                .get(&dangling)
                .map(|r| r.start_meter_wh)
                .unwrap_or(0.0);
            warn!(session = dangling, "closing dangling session before opening a new one");
            self.close_session(dangling, start_meter, start_ts, Some("Interrupted".into()))?;
        }

        let session_id = self.next_id;
        self.next_id += 1;
        let entry = LogEntry::Open {
            session_id,
            backend_id: backend_id.to_string(),
            transaction_id: transaction_id.map(str::to_string),
            start_ts,
            start_meter_wh,
        };
        self.append(&entry)?;
        Self::apply(&mut self.sessions, &mut self.open, &mut self.next_id, entry);
        debug!(session = session_id, backend = backend_id, "session opened");
        Ok(session_id)
    }

    pub fn close_session(
        &mut self,
        session_id: u64,
        stop_meter_wh: f64,
        stop_ts: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), SessionLogError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(SessionLogError::UnknownSession(session_id));
        }
        let entry = LogEntry::Close {
            session_id,
            stop_ts,
            stop_meter_wh,
            reason,
        };
        self.append(&entry)?;
        Self::apply(&mut self.sessions, &mut self.open, &mut self.next_id, entry);
        debug!(session = session_id, "session closed");
        Ok(())
    }

    pub fn current_open(&self) -> Option<&SessionRecord> {
        self.open.and_then(|id| self.sessions.get(&id))
    }

    pub fn get(&self, session_id: u64) -> Option<&SessionRecord> {
        self.sessions.get(&session_id)
    }

    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionRecord> {
        self.sessions
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// CSV export with the stable column order of [`CSV_HEADER`].
    /// Timestamps are ISO-8601 UTC with seconds precision.
    pub fn export_csv(&self, filter: &SessionFilter) -> String {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        for record in self.sessions.values().filter(|r| filter.matches(r)) {
            let row = [
                record.session_id.to_string(),
                csv_field(&record.backend_id),
                format_ts(record.start_ts),
                record.stop_ts.map(format_ts).unwrap_or_default(),
                format_wh(record.start_meter_wh),
                record.stop_meter_wh.map(format_wh).unwrap_or_default(),
                record.energy_wh().map(format_wh).unwrap_or_default(),
                record
                    .reason
                    .as_deref()
                    .map(csv_field)
                    .unwrap_or_default(),
            ];
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_wh(wh: f64) -> String {
    if wh.fract() == 0.0 {
        format!("{}", wh as i64)
    } else {
        format!("{wh}")
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn open_close_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");

        let mut log = SessionLog::open(&path).unwrap();
        let id = log
            .open_session("A", Some("1"), 1000.0, ts("2026-03-01T10:00:00Z"))
            .unwrap();
        assert_eq!(id, 1);
        assert!(log.current_open().is_some());

        log.close_session(id, 4500.0, ts("2026-03-01T11:00:00Z"), Some("Remote".into()))
            .unwrap();
        assert!(log.current_open().is_none());

        let record = log.get(id).unwrap();
        assert_eq!(record.energy_wh(), Some(3500.0));
    }

    #[test]
    fn recovers_exactly_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");

        let before = {
            let mut log = SessionLog::open(&path).unwrap();
            let id = log
                .open_session("A", Some("1"), 1000.0, ts("2026-03-01T10:00:00Z"))
                .unwrap();
            log.close_session(id, 4500.0, ts("2026-03-01T11:00:00Z"), Some("Remote".into()))
                .unwrap();
            log.open_session("B", Some("2"), 4500.0, ts("2026-03-01T12:00:00Z"))
                .unwrap();
            log.list(&SessionFilter::default())
        };

        let log = SessionLog::open(&path).unwrap();
        let after = log.list(&SessionFilter::default());
        assert_eq!(after, before);
        // The open session is still the open session.
        assert_eq!(log.current_open().map(|r| r.session_id), Some(2));
    }

    #[test]
    fn new_ids_continue_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");

        {
            let mut log = SessionLog::open(&path).unwrap();
            let id = log
                .open_session("A", None, 0.0, ts("2026-03-01T10:00:00Z"))
                .unwrap();
            log.close_session(id, 10.0, ts("2026-03-01T10:30:00Z"), None)
                .unwrap();
        }

        let mut log = SessionLog::open(&path).unwrap();
        let id = log
            .open_session("B", None, 10.0, ts("2026-03-01T11:00:00Z"))
            .unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn second_open_closes_the_dangling_one() {
        let dir = tempdir().unwrap();
        let mut log = SessionLog::open(dir.path().join("s.jsonl")).unwrap();

        let first = log
            .open_session("A", Some("1"), 1000.0, ts("2026-03-01T10:00:00Z"))
            .unwrap();
        let second = log
            .open_session("B", Some("2"), 2000.0, ts("2026-03-01T11:00:00Z"))
            .unwrap();

        let dangling = log.get(first).unwrap();
        assert!(!dangling.is_open());
        assert_eq!(dangling.reason.as_deref(), Some("Interrupted"));
        assert_eq!(log.current_open().map(|r| r.session_id), Some(second));
    }

    #[test]
    fn close_unknown_session_fails() {
        let dir = tempdir().unwrap();
        let mut log = SessionLog::open(dir.path().join("s.jsonl")).unwrap();
        assert!(matches!(
            log.close_session(7, 0.0, ts("2026-03-01T10:00:00Z"), None),
            Err(SessionLogError::UnknownSession(7))
        ));
    }

    #[test]
    fn csv_export_columns_and_filter() {
        let dir = tempdir().unwrap();
        let mut log = SessionLog::open(dir.path().join("s.jsonl")).unwrap();

        let a = log
            .open_session("A", Some("1"), 1000.0, ts("2026-03-01T10:00:00Z"))
            .unwrap();
        log.close_session(a, 4500.0, ts("2026-03-01T11:00:00Z"), Some("Remote".into()))
            .unwrap();
        let b = log
            .open_session("B", Some("2"), 4500.0, ts("2026-03-01T12:00:00Z"))
            .unwrap();
        log.close_session(b, 5000.0, ts("2026-03-01T13:00:00Z"), None)
            .unwrap();

        let csv = log.export_csv(&SessionFilter {
            backend_id: Some("A".into()),
            ..Default::default()
        });
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some("1,A,2026-03-01T10:00:00Z,2026-03-01T11:00:00Z,1000,4500,3500,Remote")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn time_filter_uses_start_timestamp() {
        let dir = tempdir().unwrap();
        let mut log = SessionLog::open(dir.path().join("s.jsonl")).unwrap();

        let a = log
            .open_session("A", None, 0.0, ts("2026-03-01T10:00:00Z"))
            .unwrap();
        log.close_session(a, 1.0, ts("2026-03-01T10:30:00Z"), None)
            .unwrap();
        let b = log
            .open_session("A", None, 1.0, ts("2026-03-02T10:00:00Z"))
            .unwrap();
        log.close_session(b, 2.0, ts("2026-03-02T10:30:00Z"), None)
            .unwrap();

        let filtered = log.list(&SessionFilter {
            from: Some(ts("2026-03-02T00:00:00Z")),
            ..Default::default()
        });
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].session_id, b);
    }
}
