use chrono::{TimeZone, Utc};
use rca::chain::{
    AnalysisChain, AnalysisStrategy, Graph, GraphStrategy, LlmBackend, LlmClient, LlmStrategy,
    StrategyOutcome,
};
use rca::config::AppConfig;
use rca::errors::{Fault, RcaError};
use rca::file_reader::FsFileReader;
use rca::intake::{rca_entry, RcaRequest};
use rca::runtime::{FakeClock, FakeFileSystem};
use rca::types::{Event, StrategyKind};
use std::sync::Arc;

const TRACEBACK: &str = "Traceback (most recent call last):\n  \
File \"app/handlers.py\", line 27, in create\n    \
user_id = payload['id']\n\
KeyError: 'id'";

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0)
        .single()
        .expect("timestamp")
}

struct Faulting;

impl AnalysisStrategy for Faulting {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Handler
    }

    fn analyze(&self, _event: &Event) -> StrategyOutcome {
        StrategyOutcome::Faulted(Fault::new("ValueError", "bad payload"))
    }
}

struct Panicking;

impl AnalysisStrategy for Panicking {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Graph
    }

    fn analyze(&self, _event: &Event) -> StrategyOutcome {
        panic!("graph exploded")
    }
}

struct Declining;

impl AnalysisStrategy for Declining {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Handler
    }

    fn analyze(&self, _event: &Event) -> StrategyOutcome {
        StrategyOutcome::Declined
    }
}

struct Offline;

impl LlmClient for Offline {
    fn complete(&self, _prompt: &str, _model: &str) -> Result<String, RcaError> {
        Err(RcaError::Llm("connection refused".to_string()))
    }
}

#[test]
fn graph_chain_produces_suggestions_for_a_python_traceback() {
    let chain = AnalysisChain::from_config(&AppConfig::default(), Arc::new(FakeClock::default()));
    assert_eq!(chain.kinds(), vec![StrategyKind::Graph, StrategyKind::Stub]);

    let result = chain.run(&Event::new(TRACEBACK, now()));
    assert!(result
        .rca
        .starts_with("Initial RCA based on provided logs:\n- Suspected exception: KeyError: 'id'"));
    assert_eq!(result.exception.as_deref(), Some("KeyError: 'id'"));
    assert_eq!(result.file_location.as_deref(), Some("app/handlers.py:27"));
    let patch = result.patch.expect("patch");
    assert!(patch.contains("+# Guard missing dict key"));
    let test = result.test.expect("test");
    assert!(test.contains("def test_rca_smoke_"));
    assert!(test.contains("assert True"));
    assert!(!result.context.expect("context").is_empty());
}

#[test]
fn fault_is_rendered_with_its_raise_site() {
    let chain = AnalysisChain::new(vec![Box::new(Faulting)]);
    let result = chain.run(&Event::new(TRACEBACK, now()));
    assert!(result.rca.starts_with("• Exception: ValueError: bad payload\n• Location: "));
    assert!(result.rca.contains("analysis_chain.rs:"));
    assert_eq!(result.patch, None);
    assert_eq!(result.context, None);
}

#[test]
fn panicking_strategy_does_not_escape_the_chain() {
    let chain = AnalysisChain::new(vec![Box::new(Panicking)]);
    let result = chain.run(&Event::new("boom", now()));
    assert_eq!(result.rca, "• Exception: Panic: graph exploded");
}

#[test]
fn declined_output_falls_through_to_the_stub() {
    let chain = AnalysisChain::new(vec![Box::new(Declining)]);
    assert_eq!(chain.kinds(), vec![StrategyKind::Handler, StrategyKind::Stub]);
    let result = chain.run(&Event::new("line one\nline two", now()));
    assert_eq!(
        result.rca,
        "Initial RCA based on provided logs:\nline one\nline two"
    );
}

#[test]
fn stub_only_chain_marks_missing_logs() {
    let chain = AnalysisChain::new(Vec::new());
    let result = chain.run(&Event::new("", now()));
    assert_eq!(
        result.rca,
        "Initial RCA based on provided logs:\n(no log provided)"
    );
}

#[test]
fn llm_transport_failure_degrades_to_heuristic_summary() {
    let strategy = LlmStrategy::with_client(
        LlmBackend::OpenAi,
        "gpt-4o-mini",
        Box::new(Offline),
    );
    let chain = AnalysisChain::new(vec![Box::new(strategy)]);
    let result = chain.run(&Event::new(TRACEBACK, now()));
    assert!(result.rca.starts_with("LLM error (openai): "));
    assert!(result.rca.contains("connection refused"));
    assert!(result.rca.contains("KeyError: 'id'"));
    assert!(!result.context.expect("context").is_empty());
}

#[test]
fn entry_reads_path_and_carries_its_note() {
    let fs = FakeFileSystem::with_file("/srv/logs/api.log", TRACEBACK);
    let reader = FsFileReader::new(&fs, "/srv").with_home(None);
    let mut settings = AppConfig::default().analysis;
    settings.max_read_bytes = 40;
    let chain = AnalysisChain::new(vec![Box::new(GraphStrategy::new(Graph::standard()))]);

    let request = RcaRequest {
        path: Some("logs/api.log".to_string()),
        log: Some("ignored inline log".to_string()),
        ..RcaRequest::default()
    };
    let result = rca_entry(&request, &chain, &reader, &settings, now());
    assert_eq!(
        result.note.as_deref(),
        Some("Truncated large input for performance")
    );
    assert!(!result.rca.contains("ignored inline log"));
}

#[test]
fn entry_with_unreadable_path_still_answers() {
    let fs = FakeFileSystem::default();
    let reader = FsFileReader::new(&fs, "/srv").with_home(None);
    let settings = AppConfig::default().analysis;
    let chain = AnalysisChain::from_config(&AppConfig::default(), Arc::new(FakeClock::default()));

    let request = RcaRequest {
        path: Some("missing.log".to_string()),
        log: Some("TypeError: x is undefined".to_string()),
        ..RcaRequest::default()
    };
    let result = rca_entry(&request, &chain, &reader, &settings, now());
    let note = result.note.expect("note");
    assert!(note.starts_with("Failed to read path missing.log: "));
    assert_eq!(result.exception.as_deref(), Some("TypeError: x is undefined"));
}
