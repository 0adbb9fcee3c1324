use super::{AnalysisStrategy, LooseResult, StrategyOutcome};
use crate::analysis::{analyze, synthesize_patch, synthesize_test};
use crate::errors::Fault;
use crate::logging::append_run_log;
use crate::types::{Event, StrategyKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_RCA: &str = "RCA pipeline executed";

/// State threaded through the graph steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphState {
    pub incident: String,
    pub log: Option<String>,
    pub rca: Option<String>,
    pub patch: Option<String>,
    pub test: Option<String>,
    pub exception: Option<String>,
    pub file: Option<String>,
    pub context: Option<Vec<String>>,
    pub note: Option<String>,
}

impl GraphState {
    pub fn seeded(event: &Event) -> Self {
        Self {
            incident: event.repo.clone(),
            log: Some(event.log.clone()),
            ..Self::default()
        }
    }
}

impl From<GraphState> for LooseResult {
    fn from(state: GraphState) -> Self {
        Self {
            rca: state.rca,
            patch: state.patch,
            test: state.test,
            exception: state.exception,
            file: state.file,
            context: state
                .context
                .map(|lines| Value::Array(lines.into_iter().map(Value::String).collect())),
            note: state.note,
        }
    }
}

pub type Step = fn(GraphState) -> Result<GraphState, Fault>;

/// Fixed sequence of named steps run in order.
pub struct Graph {
    steps: Vec<(&'static str, Step)>,
}

impl Graph {
    /// analyze -> generate_patch -> verify
    pub fn standard() -> Self {
        Self::with_steps(vec![
            ("analyze", analyze_step as Step),
            ("generate_patch", generate_patch_step as Step),
            ("verify", verify_step as Step),
        ])
    }

    pub fn with_steps(steps: Vec<(&'static str, Step)>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(name, _)| *name).collect()
    }

    pub fn invoke(&self, state: GraphState) -> Result<GraphState, Fault> {
        let mut state = state;
        for (name, step) in &self.steps {
            state = step(state)?;
            append_run_log("debug", "rca.graph.step.completed", json!({"step": name}));
        }
        Ok(state)
    }
}

pub fn analyze_step(state: GraphState) -> Result<GraphState, Fault> {
    let mut state = state;
    let log = state.log.clone().unwrap_or_default();
    if log.trim().is_empty() {
        let incident = if state.incident.is_empty() {
            "<unknown>"
        } else {
            state.incident.as_str()
        };
        state.rca = Some(format!("Initial RCA: analyzed incident '{incident}'."));
        if state.context.is_none() {
            state.context = Some(Vec::new());
        }
        return Ok(state);
    }

    let findings = analyze(&log);
    let mut tips = Vec::new();
    if findings.exception.is_some() {
        tips.push("- Consider adding guards/validation where the exception originates.".to_string());
    }
    if let Some(file) = &findings.file_location {
        tips.push(format!("- Inspect the code around {file}."));
    }
    let mut summary = findings.summary;
    if !tips.is_empty() {
        summary.push('\n');
        summary.push_str(&tips.join("\n"));
    }
    state.rca = Some(format!("Initial RCA based on provided logs:\n{summary}"));
    state.exception = findings.exception;
    state.file = findings.file_location;
    state.context = Some(findings.context);
    Ok(state)
}

/// Fills only the suggestion fields that are still unset.
pub fn generate_patch_step(state: GraphState) -> Result<GraphState, Fault> {
    let mut state = state;
    if state.patch.is_some() && state.test.is_some() {
        return Ok(state);
    }
    let context = state.context.clone().unwrap_or_default();
    let file = state.file.as_deref();
    let exception = state.exception.as_deref();
    if state.patch.is_none() {
        state.patch = synthesize_patch(file, exception, &context);
    }
    if state.test.is_none() {
        state.test = Some(synthesize_test(file, exception, &context));
    }
    Ok(state)
}

pub fn verify_step(state: GraphState) -> Result<GraphState, Fault> {
    Ok(state)
}

pub struct GraphStrategy {
    graph: Graph,
}

impl GraphStrategy {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }
}

impl AnalysisStrategy for GraphStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Graph
    }

    fn analyze(&self, event: &Event) -> StrategyOutcome {
        match self.graph.invoke(GraphState::seeded(event)) {
            Ok(state) => StrategyOutcome::Produced(
                LooseResult::from(state).into_result(event, DEFAULT_RCA),
            ),
            Err(fault) => StrategyOutcome::Faulted(fault),
        }
    }
}
