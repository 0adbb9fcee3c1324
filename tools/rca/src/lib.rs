pub mod analysis;
pub mod chain;
pub mod config;
pub mod errors;
pub mod file_reader;
pub mod intake;
pub mod logging;
pub mod runner;
pub mod runtime;
pub mod types;

use chain::AnalysisChain;
use chrono::{DateTime, Utc};
use clap::{error::ErrorKind, Parser, Subcommand};
use config::{
    absolutize_path, load_config, resolve_working_dir, AppConfig, CliOverrides, EnvMap,
};
use errors::RcaError;
use file_reader::FsFileReader;
use intake::{rca_entry, RcaRequest};
use logging::{append_run_log, init_run_log, JsonlLogger};
use runner::{RunRequest, TestRunner};
use runtime::ProductionRuntime;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use types::StrategyKind;

#[derive(Debug, Clone, Parser)]
#[command(name = "rca")]
#[command(about = "Incident root-cause analysis and sandboxed test runs")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub working_dir: Option<PathBuf>,
    /// JSONL run log destination; overrides config and RCA_LOG_PATH.
    #[arg(long)]
    pub log_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Analyze a failure log and print the RCA as JSON.
    Analyze {
        #[arg(long)]
        log: Option<String>,
        /// Read the log from this file instead of --log.
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<StrategyKind>,
    },
    /// Run the test suite and print the run result as JSON.
    Test {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        targets: Vec<String>,
        #[arg(long, allow_hyphen_values = true)]
        extra: Vec<String>,
        #[arg(short = 'k')]
        k: Option<String>,
        #[arg(long, default_value_t = false)]
        quiet: bool,
        #[arg(long, conflicts_with = "local")]
        container: bool,
        #[arg(long)]
        local: bool,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the resolved settings.
    Env,
}

fn parse_strategy(value: &str) -> Result<StrategyKind, String> {
    StrategyKind::parse(value)
        .ok_or_else(|| format!("unknown strategy `{value}` (handler|graph|llm|stub)"))
}

pub fn run() -> Result<i32, RcaError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| RcaError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, RcaError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(RcaError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        working_dir: cli.working_dir.clone(),
        strategy: match &cli.command {
            Command::Analyze { strategy, .. } => *strategy,
            _ => None,
        },
        timeout_secs: match &cli.command {
            Command::Test { timeout_secs, .. } => *timeout_secs,
            _ => None,
        },
        log_path: cli.log_path.clone(),
    };
    let cfg = load_config(&overrides, &env_map, cwd, runtime.file_system.as_ref())?;
    let working_dir = resolve_working_dir(cwd, &overrides);
    init_logging(&cfg, &working_dir);

    match cli.command {
        Command::Analyze {
            log,
            path,
            repo,
            id,
            strategy: _,
        } => {
            let request = RcaRequest {
                repo,
                path,
                log,
                screenshot_data: None,
                id,
            };
            let chain = AnalysisChain::from_config(&cfg, runtime.clock.clone());
            let reader = FsFileReader::new(runtime.file_system.as_ref(), &working_dir);
            let now = DateTime::<Utc>::from(runtime.clock.now());
            let result = rca_entry(&request, &chain, &reader, &cfg.analysis, now);
            print_json(runtime, &result)?;
            Ok(0)
        }
        Command::Test {
            repo,
            targets,
            extra,
            k,
            quiet,
            container,
            local,
            timeout_secs: _,
        } => {
            let request = RunRequest {
                repo,
                targets,
                extra,
                k,
                quiet,
                use_container: match (container, local) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                timeout_secs: None,
                env: Default::default(),
            };
            let result = TestRunner::new(&cfg.runner, runtime).run_tests(&request, &working_dir)?;
            print_json(runtime, &result)?;
            Ok(if result.ok { 0 } else { 1 })
        }
        Command::Env => {
            let runner = TestRunner::new(&cfg.runner, runtime);
            let engine_found = runtime
                .locator
                .locate(&cfg.runner.container_engine)
                .is_some();
            print_json(
                runtime,
                &json!({
                    "workingDir": working_dir,
                    "backend": runner.select_backend(None).as_str(),
                    "containerEngineFound": engine_found,
                    "analysis": cfg.analysis,
                    "runner": cfg.runner,
                    "llm": cfg.llm,
                }),
            )?;
            Ok(0)
        }
    }
}

fn init_logging(cfg: &AppConfig, working_dir: &Path) {
    let Some(path) = &cfg.logging.path else {
        return;
    };
    let logger = JsonlLogger {
        path: absolutize_path(working_dir, path),
        max_payload_bytes: cfg.logging.max_payload_bytes,
        budget_bytes: cfg.logging.budget_bytes,
    };
    if init_run_log(logger) {
        append_run_log(
            "info",
            "rca.startup",
            json!({
                "working_dir": working_dir.display().to_string(),
                "strategy": cfg.analysis.strategy.as_str(),
                "llm_backend": cfg.llm.backend,
            }),
        );
    }
}

fn print_json<T: Serialize>(runtime: &ProductionRuntime, value: &T) -> Result<(), RcaError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| RcaError::Encode(e.to_string()))?;
    runtime.terminal.write_line(&rendered)
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}
