use crate::chain::AnalysisChain;
use crate::config::AnalysisConfig;
use crate::file_reader::FileReader;
use crate::logging::append_run_log;
use crate::types::{derive_event_id, truncate_to_seconds, AnalysisResult, Event};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Inbound RCA request. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RcaRequest {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default, alias = "screenshot_b64")]
    pub screenshot_data: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Reads `path` when given, otherwise uses the inline log.
pub fn build_event(
    request: &RcaRequest,
    reader: &dyn FileReader,
    settings: &AnalysisConfig,
    now: DateTime<Utc>,
) -> Event {
    let mut log = request.log.clone().unwrap_or_default();
    let mut note = None;
    let path = request
        .path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    if let Some(path) = path {
        match reader.read(path, settings.max_read_bytes, settings.notebook_mode) {
            Ok(contents) => {
                log = contents.text;
                note = contents.note;
            }
            Err(err) => {
                note = Some(format!("Failed to read path {path}: {err}"));
            }
        }
    }

    let id = request
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| derive_event_id(&log));
    let repo = request
        .repo
        .clone()
        .filter(|repo| !repo.trim().is_empty())
        .unwrap_or_else(|| ".".to_string());

    Event {
        id,
        repo,
        log,
        path: path.map(str::to_string),
        screenshot_data: request.screenshot_data.clone(),
        created_at: truncate_to_seconds(now),
        note,
    }
}

/// Never fails; analysis faults are rendered into the returned `rca`.
pub fn rca_entry(
    request: &RcaRequest,
    chain: &AnalysisChain,
    reader: &dyn FileReader,
    settings: &AnalysisConfig,
    now: DateTime<Utc>,
) -> AnalysisResult {
    let event = build_event(request, reader, settings, now);
    append_run_log(
        "info",
        "rca.request.received",
        json!({
            "event_id": event.id,
            "repo": event.repo,
            "path": event.path,
            "log_chars": event.log.chars().count(),
            "note": event.note,
        }),
    );
    chain.run(&event)
}

#[cfg(test)]
mod tests {
    use super::{build_event, rca_entry, RcaRequest};
    use crate::chain::AnalysisChain;
    use crate::config::AppConfig;
    use crate::file_reader::FsFileReader;
    use crate::runtime::FakeFileSystem;
    use crate::types::derive_event_id;
    use chrono::{TimeZone, Utc};

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("ts")
    }

    #[test]
    fn request_accepts_legacy_screenshot_alias() {
        let request: RcaRequest =
            serde_json::from_str(r#"{"log":"x","screenshot_b64":"aGk="}"#).expect("json");
        assert_eq!(request.screenshot_data.as_deref(), Some("aGk="));
    }

    #[test]
    fn path_contents_replace_inline_log() {
        let fs = FakeFileSystem::with_file("/srv/app.log", "KeyError: 'id'");
        let reader = FsFileReader::new(&fs, "/srv").with_home(None);
        let request = RcaRequest {
            path: Some("app.log".to_string()),
            log: Some("ignored".to_string()),
            ..RcaRequest::default()
        };
        let event = build_event(&request, &reader, &AppConfig::default().analysis, now());
        assert_eq!(event.log, "KeyError: 'id'");
        assert_eq!(event.id, derive_event_id("KeyError: 'id'"));
        assert_eq!(event.repo, ".");
        assert_eq!(event.note, None);
    }

    #[test]
    fn unreadable_path_becomes_a_note() {
        let fs = FakeFileSystem::default();
        let reader = FsFileReader::new(&fs, "/").with_home(None);
        let request = RcaRequest {
            path: Some("/missing.log".to_string()),
            log: Some("inline".to_string()),
            id: Some("fixed".to_string()),
            ..RcaRequest::default()
        };
        let event = build_event(&request, &reader, &AppConfig::default().analysis, now());
        assert_eq!(event.log, "inline");
        assert_eq!(event.id, "fixed");
        assert!(event
            .note
            .as_deref()
            .expect("note")
            .starts_with("Failed to read path /missing.log: "));
    }

    #[test]
    fn entry_point_never_returns_blank_rca() {
        let fs = FakeFileSystem::default();
        let reader = FsFileReader::new(&fs, "/").with_home(None);
        let mut cfg = AppConfig::default();
        cfg.analysis.strategy = crate::types::StrategyKind::Stub;
        let chain = AnalysisChain::from_config(
            &cfg,
            std::sync::Arc::new(crate::runtime::FakeClock::default()),
        );
        let result = rca_entry(
            &RcaRequest::default(),
            &chain,
            &reader,
            &cfg.analysis,
            now(),
        );
        assert!(result.rca.contains("(no log provided)"));
    }
}
