pub mod graph;
pub mod handler;
pub mod llm;
pub mod stub;

use crate::config::AppConfig;
use crate::errors::Fault;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::{tail_chars, AnalysisResult, Event, StrategyKind};
use serde_json::{json, Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub use graph::{Graph, GraphState, GraphStrategy};
pub use handler::{DefaultNormalizer, EventNormalizer, HandlerStrategy};
pub use llm::{LlmBackend, LlmClient, LlmStrategy};
pub use stub::StubStrategy;

/// Characters of raw log kept by tail-based fallbacks.
pub const TAIL_CHARS: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Produced(AnalysisResult),
    /// Rendered into the RCA text; the chain stops here.
    Faulted(Fault),
    /// Output was not usable; the next strategy runs.
    Declined,
}

pub trait AnalysisStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    fn analyze(&self, event: &Event) -> StrategyOutcome;
}

pub struct AnalysisChain {
    strategies: Vec<Box<dyn AnalysisStrategy>>,
}

impl AnalysisChain {
    /// The stub is always appended as the terminal fallback.
    pub fn new(strategies: Vec<Box<dyn AnalysisStrategy>>) -> Self {
        let mut strategies = strategies;
        if strategies
            .last()
            .is_none_or(|last| last.kind() != StrategyKind::Stub)
        {
            strategies.push(Box::new(StubStrategy));
        }
        Self { strategies }
    }

    pub fn from_config(cfg: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let primary: Option<Box<dyn AnalysisStrategy>> = match cfg.analysis.strategy {
            StrategyKind::Handler => Some(Box::new(HandlerStrategy::new(Box::new(
                DefaultNormalizer::new(clock),
            )))),
            StrategyKind::Graph => Some(Box::new(GraphStrategy::new(Graph::standard()))),
            StrategyKind::Llm => Some(Box::new(LlmStrategy::from_config(&cfg.llm))),
            StrategyKind::Stub => None,
        };
        Self::new(primary.into_iter().collect())
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Never fails: every fault is rendered into `rca`.
    pub fn run(&self, event: &Event) -> AnalysisResult {
        for strategy in &self.strategies {
            let kind = strategy.kind();
            append_run_log(
                "debug",
                "rca.chain.strategy.started",
                json!({"event_id": event.id, "strategy": kind.as_str()}),
            );
            let outcome = catch_unwind(AssertUnwindSafe(|| strategy.analyze(event)))
                .unwrap_or_else(|payload| StrategyOutcome::Faulted(Fault::from_panic(&*payload)));

            match outcome {
                StrategyOutcome::Produced(mut result) => {
                    if result.rca.trim().is_empty() {
                        result.rca = stub::stub_rca(event);
                    }
                    if result.note.is_none() {
                        result.note = event.note.clone();
                    }
                    append_run_log(
                        "info",
                        "rca.chain.strategy.produced",
                        json!({
                            "event_id": event.id,
                            "strategy": kind.as_str(),
                            "has_patch": result.patch.is_some(),
                            "has_test": result.test.is_some(),
                        }),
                    );
                    return result;
                }
                StrategyOutcome::Faulted(fault) => {
                    append_run_log(
                        "warn",
                        "rca.chain.fault",
                        json!({
                            "event_id": event.id,
                            "strategy": kind.as_str(),
                            "fault": fault.headline(),
                        }),
                    );
                    return AnalysisResult::from_rca(fault.render_rca());
                }
                StrategyOutcome::Declined => {
                    append_run_log(
                        "info",
                        "rca.chain.strategy.declined",
                        json!({"event_id": event.id, "strategy": kind.as_str()}),
                    );
                }
            }
        }
        stub::stub_result(event)
    }
}

/// Loosely-typed strategy output, coerced into an [`AnalysisResult`] at the
/// strategy boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LooseResult {
    pub rca: Option<String>,
    pub patch: Option<String>,
    pub test: Option<String>,
    pub exception: Option<String>,
    pub file: Option<String>,
    pub context: Option<Value>,
    pub note: Option<String>,
}

impl LooseResult {
    pub fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            rca: text_field(object, "rca"),
            patch: text_field(object, "patch"),
            test: text_field(object, "test"),
            exception: text_field(object, "exception"),
            file: text_field(object, "file"),
            context: object.get("context").cloned(),
            note: text_field(object, "note").or_else(|| text_field(object, "_note")),
        }
    }

    pub fn into_result(self, event: &Event, default_rca: &str) -> AnalysisResult {
        let rca = self
            .rca
            .filter(|rca| !rca.trim().is_empty())
            .unwrap_or_else(|| default_rca.to_string());
        AnalysisResult {
            rca,
            patch: self.patch,
            test: self.test,
            exception: self.exception,
            file_location: self.file.or_else(|| event.path.clone()),
            context: coerce_context(self.context.as_ref(), &event.log),
            note: self.note,
        }
    }
}

/// Strings pass through; other non-null values are rendered as pretty JSON.
pub fn text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => serde_json::to_string_pretty(other).ok(),
    }
}

/// Sequences keep their non-blank items, strings become one element, and
/// anything else falls back to the log tail.
pub fn coerce_context(value: Option<&Value>, log: &str) -> Option<Vec<String>> {
    let tail_fallback = || {
        let tail = tail_chars(log, TAIL_CHARS);
        (!tail.is_empty()).then(|| vec![tail.to_string()])
    };
    match value {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Null => None,
                    Value::String(text) => Some(text.clone()),
                    other => Some(other.to_string()),
                })
                .filter(|item| !item.trim().is_empty())
                .collect(),
        ),
        Some(Value::String(text)) if !text.trim().is_empty() => Some(vec![text.trim().to_string()]),
        _ => tail_fallback(),
    }
}
