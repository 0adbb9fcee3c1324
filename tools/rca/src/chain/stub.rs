use super::{AnalysisStrategy, StrategyOutcome, TAIL_CHARS};
use crate::types::{AnalysisResult, Event, StrategyKind};

pub const NO_LOG_MARKER: &str = "(no log provided)";

/// Terminal fallback; always produces.
pub struct StubStrategy;

impl AnalysisStrategy for StubStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Stub
    }

    fn analyze(&self, event: &Event) -> StrategyOutcome {
        StrategyOutcome::Produced(stub_result(event))
    }
}

pub fn stub_rca(event: &Event) -> String {
    let tail = event.log_tail(TAIL_CHARS);
    let body = if tail.is_empty() { NO_LOG_MARKER } else { tail };
    format!("Initial RCA based on provided logs:\n{body}")
}

pub fn stub_result(event: &Event) -> AnalysisResult {
    AnalysisResult {
        note: event.note.clone(),
        ..AnalysisResult::from_rca(stub_rca(event))
    }
}
