use super::{run_captured, Execution, ExecutionBackend, ProcessEnd, RunPlan};
use crate::config::RunnerConfig;
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem, ProcessRequest, ProcessRunner};
use crate::types::RunBackend;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CPU_LIMIT: &str = "1";
const MEMORY_LIMIT: &str = "1g";
const PIDS_LIMIT: &str = "512";
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the suite inside a throwaway container with resource caps.
pub struct ContainerBackend<'a> {
    settings: &'a RunnerConfig,
    runner: &'a dyn ProcessRunner,
    fs: &'a dyn FileSystem,
    clock: &'a dyn Clock,
    name: String,
}

impl<'a> ContainerBackend<'a> {
    pub fn new(
        settings: &'a RunnerConfig,
        runner: &'a dyn ProcessRunner,
        fs: &'a dyn FileSystem,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            settings,
            runner,
            fs,
            clock,
            name: format!("rca-run-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn remove_container(&self) {
        let request = ProcessRequest {
            program: self.settings.container_engine.clone(),
            args: vec!["rm".to_string(), "-f".to_string(), self.name.clone()],
            timeout: Some(CLEANUP_TIMEOUT),
            ..ProcessRequest::default()
        };
        let outcome = self.runner.run(request);
        append_run_log(
            if outcome.is_ok() { "info" } else { "warn" },
            "runner.container.removed",
            json!({
                "name": self.name,
                "error": outcome.err().map(|e| e.to_string()),
            }),
        );
    }
}

/// Mounts the parent when the repo is the source root and targets are
/// written relative to the project root.
pub fn mount_root(repo: &Path, targets: &[String], source_root: &str) -> PathBuf {
    let prefix = format!("{source_root}/");
    let is_source_dir = repo
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == source_root);
    if is_source_dir && targets.iter().any(|target| target.starts_with(&prefix)) {
        if let Some(parent) = repo.parent() {
            return parent.to_path_buf();
        }
    }
    repo.to_path_buf()
}

/// Explicit setting wins; otherwise network only when bootstrapping.
/// `default` leaves the engine's own choice in place.
pub fn resolve_network(settings: &RunnerConfig) -> Option<String> {
    let network = settings.network.clone().unwrap_or_else(|| {
        if settings.bootstrap {
            "bridge".to_string()
        } else {
            "none".to_string()
        }
    });
    (network != "default").then_some(network)
}

/// Requirements file relative to the mount root, if one exists there.
pub fn find_requirements(
    fs: &dyn FileSystem,
    mount_root: &Path,
    settings: &RunnerConfig,
) -> Option<String> {
    let candidates = match settings.requirements.as_deref().map(str::trim) {
        Some(explicit) if !explicit.is_empty() => vec![explicit.to_string()],
        _ => vec![
            format!("{}/requirements.txt", settings.source_root),
            "requirements.txt".to_string(),
        ],
    };
    candidates.into_iter().find_map(|candidate| {
        let absolute = mount_root.join(&candidate);
        if !fs.exists(&absolute) {
            return None;
        }
        let relative = absolute.strip_prefix(mount_root).ok()?;
        Some(relative.to_string_lossy().replace('\\', "/"))
    })
}

/// Best-effort bootstrap steps followed by the test command.
pub fn container_script(
    settings: &RunnerConfig,
    requirements: Option<&str>,
    test_command: &[String],
) -> String {
    let mut steps = Vec::new();
    if settings.bootstrap {
        steps.push("python -m pip install -q --upgrade pip || true".to_string());
        if let Some(requirements) = requirements {
            steps.push(format!(
                "pip install -q -r {} || true",
                shell_quote(requirements)
            ));
        }
        steps.push("pip install -q pytest || true".to_string());
    }
    let command = test_command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    steps.push(format!(
        "export PYTHONPATH=\"{}/{}:$PYTHONPATH\"; {command}",
        settings.container_workdir, settings.source_root
    ));
    steps.join("; ")
}

/// POSIX single-quoting for arguments that need it.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

impl ExecutionBackend for ContainerBackend<'_> {
    fn kind(&self) -> RunBackend {
        RunBackend::Container
    }

    fn command(&self, plan: &RunPlan) -> Vec<String> {
        let root = mount_root(&plan.repo, &plan.targets, &self.settings.source_root);
        let requirements = find_requirements(self.fs, &root, self.settings);
        let test_command = std::iter::once(self.settings.test_program.clone())
            .chain(plan.args.iter().cloned())
            .collect::<Vec<_>>();
        let workdir = &self.settings.container_workdir;

        let mut command = vec![
            self.settings.container_engine.clone(),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-v".to_string(),
            format!("{}:{workdir}", root.display()),
            "-w".to_string(),
            workdir.clone(),
        ];
        if let Some(network) = resolve_network(self.settings) {
            command.push("--network".to_string());
            command.push(network);
        }
        command.extend(
            [
                "--cpus",
                CPU_LIMIT,
                "--memory",
                MEMORY_LIMIT,
                "--pids-limit",
                PIDS_LIMIT,
            ]
            .map(str::to_string),
        );
        for (key, value) in &plan.env {
            command.push("-e".to_string());
            command.push(format!("{key}={value}"));
        }
        command.push(self.settings.image.clone());
        command.push("sh".to_string());
        command.push("-c".to_string());
        command.push(container_script(
            self.settings,
            requirements.as_deref(),
            &test_command,
        ));
        command
    }

    fn execute(&self, plan: &RunPlan) -> Execution {
        let execution = run_captured(
            self.runner,
            self.clock,
            &self.command(plan),
            &plan.repo,
            BTreeMap::new(),
            plan.timeout,
        );
        // A killed client does not stop the container it started.
        if execution.end == ProcessEnd::Interrupted {
            self.remove_container();
        }
        execution
    }
}
