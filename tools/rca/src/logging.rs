use crate::errors::RcaError;
use crate::types::format_utc_seconds;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

static RUN_LOG: OnceLock<Mutex<JsonlLogger>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts: String,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), RcaError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| RcaError::Io(e.to_string()))?;
        }
        let line = serde_json::to_string(&LogEvent {
            ts: event.ts.clone(),
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
        })
        .map_err(|e| RcaError::Encode(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| RcaError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| RcaError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            enforce_total_budget(parent, self.budget_bytes, &self.path)?;
        }
        Ok(())
    }
}

/// Installs the process-wide run log. Later calls are ignored.
pub fn init_run_log(logger: JsonlLogger) -> bool {
    RUN_LOG.set(Mutex::new(logger)).is_ok()
}

/// Appends to the run log; a no-op until [`init_run_log`] has been called.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Some(logger) = RUN_LOG.get() else {
        return;
    };
    let Ok(logger) = logger.lock() else {
        return;
    };
    let event = LogEvent {
        ts: format_utc_seconds(&Utc::now()),
        level,
        event_type,
        payload,
    };
    if let Err(err) = logger.append(&event) {
        eprintln!(
            "{}",
            structured_fallback_line(level, event_type, &err.to_string())
        );
    }
}

pub fn structured_fallback_line(level: &str, event_type: &str, message: &str) -> String {
    format!(
        "level={level} event_type={event_type} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

/// Deletes the oldest files in `dir` until it fits `budget_bytes`; the active
/// log file is never removed.
fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    active: &Path,
) -> Result<Vec<PathBuf>, RcaError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| RcaError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path != active)
        .collect::<Vec<_>>();
    files.sort_by_key(|path| fs::metadata(path).and_then(|m| m.modified()).ok());

    let mut total = fs::read_dir(dir)
        .map_err(|e| RcaError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum::<u64>();

    let mut deleted = Vec::new();
    for path in files {
        if total <= budget_bytes {
            break;
        }
        let len = fs::metadata(&path)
            .map_err(|e| RcaError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| RcaError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::{enforce_total_budget, structured_fallback_line, JsonlLogger, LogEvent};
    use serde_json::json;
    use std::fs;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rca.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent {
                ts: "2024-01-01T00:00:00Z".to_string(),
                level: "info",
                event_type: "runner.run.finished",
                payload: json!({"stdout": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"runner.run.finished\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn budget_prunes_oldest_files_but_keeps_active_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let active = dir.path().join("rca.jsonl");
        fs::write(dir.path().join("old.jsonl"), vec![0u8; 40]).expect("old");
        std::thread::sleep(std::time::Duration::from_millis(5));
        fs::write(&active, vec![0u8; 40]).expect("active");

        let deleted = enforce_total_budget(dir.path(), 50, &active).expect("pruned");
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].ends_with("old.jsonl"));
        assert!(active.exists());
    }

    #[test]
    fn fallback_line_is_deterministic() {
        let line = structured_fallback_line("warn", "rca.chain.fault", "a\nb");
        assert_eq!(line, "level=warn event_type=rca.chain.fault message=a\\nb ");
    }
}
