pub mod container;
pub mod local;
pub mod summary;

use crate::config::{absolutize_path, normalize_lexically, RunnerConfig};
use crate::errors::RcaError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, ProcessOutput, ProcessRequest, ProcessRunner, ProductionRuntime};
use crate::types::{RunBackend, RunResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use container::ContainerBackend;
pub use local::LocalBackend;
pub use summary::parse_summary;

pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;
pub const TIMEOUT_MARKER: &str = "[runner] timeout exceeded";

/// One test-suite invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub repo: PathBuf,
    pub targets: Vec<String>,
    pub extra: Vec<String>,
    pub k: Option<String>,
    pub quiet: bool,
    /// Overrides the configured sandbox choice when set.
    pub use_container: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Line(String),
    List(Vec<String>),
}

/// Inbound test-run request as accepted over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRequest {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub path: Option<TargetSpec>,
    #[serde(default)]
    pub extra: Option<String>,
    #[serde(default)]
    pub quiet: Option<bool>,
    #[serde(default, alias = "useDocker")]
    pub use_container: Option<bool>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub k: Option<String>,
}

impl TestRunRequest {
    pub fn into_run_request(self) -> RunRequest {
        let targets = match self.path {
            Some(TargetSpec::Line(line)) => line.split_whitespace().map(str::to_string).collect(),
            Some(TargetSpec::List(items)) => items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => Vec::new(),
        };
        let extra = self
            .extra
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        RunRequest {
            repo: PathBuf::from(
                self.repo
                    .filter(|repo| !repo.trim().is_empty())
                    .unwrap_or_else(|| ".".to_string()),
            ),
            targets,
            extra,
            k: self.k.filter(|k| !k.trim().is_empty()),
            quiet: self.quiet.unwrap_or(false),
            use_container: self.use_container,
            timeout_secs: self.timeout_sec,
            env: BTreeMap::new(),
        }
    }
}

/// Resolved inputs handed to an execution backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub repo: PathBuf,
    pub targets: Vec<String>,
    /// Arguments passed to the test program.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

/// How a captured process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEnd {
    /// Never spawned; nothing to clean up.
    NotStarted,
    Exited,
    /// Timed out or lost while waiting; the child was killed.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub command: Vec<String>,
    pub output: ProcessOutput,
    pub duration_ms: u64,
    pub end: ProcessEnd,
}

pub trait ExecutionBackend {
    fn kind(&self) -> RunBackend;
    fn command(&self, plan: &RunPlan) -> Vec<String>;
    fn execute(&self, plan: &RunPlan) -> Execution;
}

/// Runs `command` and folds launch failures and timeouts into the output.
pub(crate) fn run_captured(
    runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    command: &[String],
    cwd: &Path,
    env: BTreeMap<String, String>,
    timeout: Duration,
) -> Execution {
    let started = clock.now();
    let Some((program, args)) = command.split_first() else {
        return Execution {
            command: Vec::new(),
            output: ProcessOutput {
                exit_code: LAUNCH_FAILURE_EXIT_CODE,
                stderr: "[runner] empty command".to_string(),
                ..ProcessOutput::default()
            },
            duration_ms: 0,
            end: ProcessEnd::NotStarted,
        };
    };
    let request = ProcessRequest {
        program: program.clone(),
        args: args.to_vec(),
        cwd: Some(cwd.to_path_buf()),
        env,
        timeout: Some(timeout),
    };

    let (mut output, end) = match runner.spawn(request) {
        Ok(handle) => match runner.wait(handle) {
            Ok(output) if output.timed_out => (output, ProcessEnd::Interrupted),
            Ok(output) => (output, ProcessEnd::Exited),
            Err(err) => {
                let _ = runner.kill(handle);
                let output = ProcessOutput {
                    exit_code: 1,
                    stderr: format!("[runner] failed while waiting: {err}"),
                    ..ProcessOutput::default()
                };
                (output, ProcessEnd::Interrupted)
            }
        },
        Err(err) => {
            let output = ProcessOutput {
                exit_code: LAUNCH_FAILURE_EXIT_CODE,
                stderr: format!("[runner] failed to launch: {err}"),
                ..ProcessOutput::default()
            };
            (output, ProcessEnd::NotStarted)
        }
    };
    if output.timed_out {
        output.exit_code = TIMEOUT_EXIT_CODE;
        output.stderr.push('\n');
        output.stderr.push_str(TIMEOUT_MARKER);
    }

    let duration_ms = clock
        .now()
        .duration_since(started)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    Execution {
        command: command.to_vec(),
        output,
        duration_ms,
        end,
    }
}

/// `[-q] extra... targets... [-k expr]`
pub fn test_args(request: &RunRequest) -> Vec<String> {
    let mut args = Vec::new();
    if request.quiet && !request.extra.iter().any(|arg| arg == "-q") {
        args.push("-q".to_string());
    }
    args.extend(request.extra.iter().cloned());
    args.extend(request.targets.iter().cloned());
    if let Some(k) = &request.k {
        args.push("-k".to_string());
        args.push(k.clone());
    }
    args
}

pub struct TestRunner<'a> {
    settings: &'a RunnerConfig,
    runtime: &'a ProductionRuntime,
}

impl<'a> TestRunner<'a> {
    pub fn new(settings: &'a RunnerConfig, runtime: &'a ProductionRuntime) -> Self {
        Self { settings, runtime }
    }

    /// Absolute, normalized repository path; missing paths are fatal.
    pub fn resolve_repo(&self, cwd: &Path, repo: &Path) -> Result<PathBuf, RcaError> {
        let resolved = normalize_lexically(&absolutize_path(cwd, repo));
        if !self.runtime.file_system.exists(&resolved) {
            return Err(RcaError::RepoNotFound(resolved));
        }
        Ok(resolved)
    }

    /// Falls back to local when the container engine is not installed.
    pub fn select_backend(&self, explicit: Option<bool>) -> RunBackend {
        if !self.settings.wants_container(explicit) {
            return RunBackend::Local;
        }
        if self
            .runtime
            .locator
            .locate(&self.settings.container_engine)
            .is_some()
        {
            return RunBackend::Container;
        }
        append_run_log(
            "warn",
            "runner.container.engine_missing",
            json!({"engine": self.settings.container_engine}),
        );
        RunBackend::Local
    }

    pub fn run_tests(&self, request: &RunRequest, cwd: &Path) -> Result<RunResult, RcaError> {
        let repo = self.resolve_repo(cwd, &request.repo)?;
        let plan = RunPlan {
            repo: repo.clone(),
            targets: request.targets.clone(),
            args: test_args(request),
            timeout: Duration::from_secs(request.timeout_secs.unwrap_or(self.settings.timeout_secs)),
            env: request.env.clone(),
        };

        let (backend, execution) = match self.select_backend(request.use_container) {
            RunBackend::Container => self.execute(
                &ContainerBackend::new(
                    self.settings,
                    self.runtime.process_runner.as_ref(),
                    self.runtime.file_system.as_ref(),
                    self.runtime.clock.as_ref(),
                ),
                &plan,
            ),
            RunBackend::Local => self.execute(
                &LocalBackend::new(
                    &self.settings.test_program,
                    self.runtime.process_runner.as_ref(),
                    self.runtime.clock.as_ref(),
                ),
                &plan,
            ),
        };

        let combined = format!("{}\n{}", execution.output.stdout, execution.output.stderr);
        let summary = parse_summary(&combined);
        let ok = RunResult::is_ok(execution.output.exit_code, &summary);
        append_run_log(
            if ok { "info" } else { "warn" },
            "runner.run.finished",
            json!({
                "backend": backend.as_str(),
                "repo": repo.display().to_string(),
                "exit_code": execution.output.exit_code,
                "timed_out": execution.output.timed_out,
                "duration_ms": execution.duration_ms,
                "passed": summary.passed,
                "failed": summary.failed,
                "errors": summary.errors,
            }),
        );
        Ok(RunResult {
            backend,
            command: execution.command,
            cwd: repo,
            exit_code: execution.output.exit_code,
            stdout: execution.output.stdout,
            stderr: execution.output.stderr,
            duration_ms: execution.duration_ms,
            summary,
            ok,
        })
    }

    fn execute(&self, backend: &dyn ExecutionBackend, plan: &RunPlan) -> (RunBackend, Execution) {
        append_run_log(
            "info",
            "runner.run.started",
            json!({
                "backend": backend.kind().as_str(),
                "command": backend.command(plan),
                "timeout_secs": plan.timeout.as_secs(),
            }),
        );
        (backend.kind(), backend.execute(plan))
    }
}
