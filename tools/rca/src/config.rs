use crate::errors::RcaError;
use crate::runtime::FileSystem;
use crate::types::StrategyKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub strategy: Option<StrategyKind>,
    pub timeout_secs: Option<u64>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub analysis: AnalysisConfig,
    pub runner: RunnerConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisConfig {
    pub strategy: StrategyKind,
    pub max_read_bytes: usize,
    pub notebook_mode: NotebookMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotebookMode {
    Cells,
    Raw,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Local,
    Container,
}

impl SandboxMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Some(Self::Container),
            "local" | "venv" => Some(Self::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    pub sandbox_mode: Option<SandboxMode>,
    pub use_container: bool,
    pub test_program: String,
    pub container_engine: String,
    pub image: String,
    /// `None` lets bootstrap decide between bridge and none.
    pub network: Option<String>,
    pub bootstrap: bool,
    pub requirements: Option<String>,
    pub timeout_secs: u64,
    pub container_workdir: String,
    pub source_root: String,
}

impl RunnerConfig {
    /// Explicit choice, then sandbox mode, then the generic flag.
    pub fn wants_container(&self, explicit: Option<bool>) -> bool {
        if let Some(choice) = explicit {
            return choice;
        }
        match self.sandbox_mode {
            Some(SandboxMode::Container) => true,
            Some(SandboxMode::Local) => false,
            None => self.use_container,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmConfig {
    pub backend: String,
    pub openai_base_url: String,
    pub openai_model: String,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub gemini_base_url: String,
    pub gemini_model: String,
    #[serde(skip_serializing)]
    pub google_api_key: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig {
                strategy: StrategyKind::Graph,
                max_read_bytes: crate::file_reader::DEFAULT_MAX_READ_BYTES,
                notebook_mode: NotebookMode::Cells,
            },
            runner: RunnerConfig {
                sandbox_mode: None,
                use_container: false,
                test_program: "pytest".to_string(),
                container_engine: "docker".to_string(),
                image: "python:3.11".to_string(),
                network: None,
                bootstrap: true,
                requirements: None,
                timeout_secs: 600,
                container_workdir: "/workspace".to_string(),
                source_root: "backend".to_string(),
            },
            llm: LlmConfig {
                backend: "none".to_string(),
                openai_base_url: "https://api.openai.com/v1".to_string(),
                openai_model: "gpt-4o-mini".to_string(),
                openai_api_key: None,
                gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                gemini_model: "gemini-1.5-flash".to_string(),
                google_api_key: None,
                request_timeout_secs: 60,
            },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: crate::logging::DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    analysis: Option<PartialAnalysisConfig>,
    runner: Option<PartialRunnerConfig>,
    llm: Option<PartialLlmConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAnalysisConfig {
    strategy: Option<StrategyKind>,
    max_read_bytes: Option<usize>,
    notebook_mode: Option<NotebookMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRunnerConfig {
    sandbox_mode: Option<SandboxMode>,
    use_container: Option<bool>,
    test_program: Option<String>,
    container_engine: Option<String>,
    image: Option<String>,
    network: Option<String>,
    bootstrap: Option<bool>,
    requirements: Option<String>,
    timeout_secs: Option<u64>,
    container_workdir: Option<String>,
    source_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLlmConfig {
    backend: Option<String>,
    openai_base_url: Option<String>,
    openai_model: Option<String>,
    openai_api_key: Option<String>,
    gemini_base_url: Option<String>,
    gemini_model: Option<String>,
    google_api_key: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

/// Resolves the configuration once: defaults, file, environment, CLI.
pub fn load_config(
    overrides: &CliOverrides,
    env: &EnvMap,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, RcaError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let path = absolutize_path(process_cwd, path);
        let file_contents = fs.read_to_string(&path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| RcaError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_env_overrides(&mut cfg, env);
    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(analysis) = partial.analysis {
        if let Some(value) = analysis.strategy {
            cfg.analysis.strategy = value;
        }
        if let Some(value) = analysis.max_read_bytes {
            cfg.analysis.max_read_bytes = value;
        }
        if let Some(value) = analysis.notebook_mode {
            cfg.analysis.notebook_mode = value;
        }
    }

    if let Some(runner) = partial.runner {
        if runner.sandbox_mode.is_some() {
            cfg.runner.sandbox_mode = runner.sandbox_mode;
        }
        if let Some(value) = runner.use_container {
            cfg.runner.use_container = value;
        }
        if let Some(value) = runner.test_program {
            cfg.runner.test_program = value;
        }
        if let Some(value) = runner.container_engine {
            cfg.runner.container_engine = value;
        }
        if let Some(value) = runner.image {
            cfg.runner.image = value;
        }
        if runner.network.is_some() {
            cfg.runner.network = runner.network;
        }
        if let Some(value) = runner.bootstrap {
            cfg.runner.bootstrap = value;
        }
        if runner.requirements.is_some() {
            cfg.runner.requirements = runner.requirements;
        }
        if let Some(value) = runner.timeout_secs {
            cfg.runner.timeout_secs = value;
        }
        if let Some(value) = runner.container_workdir {
            cfg.runner.container_workdir = value;
        }
        if let Some(value) = runner.source_root {
            cfg.runner.source_root = value;
        }
    }

    if let Some(llm) = partial.llm {
        if let Some(value) = llm.backend {
            cfg.llm.backend = value;
        }
        if let Some(value) = llm.openai_base_url {
            cfg.llm.openai_base_url = value;
        }
        if let Some(value) = llm.openai_model {
            cfg.llm.openai_model = value;
        }
        if llm.openai_api_key.is_some() {
            cfg.llm.openai_api_key = llm.openai_api_key;
        }
        if let Some(value) = llm.gemini_base_url {
            cfg.llm.gemini_base_url = value;
        }
        if let Some(value) = llm.gemini_model {
            cfg.llm.gemini_model = value;
        }
        if llm.google_api_key.is_some() {
            cfg.llm.google_api_key = llm.google_api_key;
        }
        if let Some(value) = llm.request_timeout_secs {
            cfg.llm.request_timeout_secs = value;
        }
    }

    if let Some(logging) = partial.logging {
        if logging.path.is_some() {
            cfg.logging.path = logging.path;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn non_blank(env: &EnvMap, key: &str) -> Option<String> {
    env.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn apply_env_overrides(cfg: &mut AppConfig, env: &EnvMap) {
    // Unrecognized values leave the file or default setting alone.
    if let Some(mode) = non_blank(env, "SANDBOX_MODE").and_then(|m| SandboxMode::parse(&m)) {
        cfg.runner.sandbox_mode = Some(mode);
    }
    if let Some(flag) =
        non_blank(env, "RUNNER_USE_CONTAINER").or_else(|| non_blank(env, "RUNNER_USE_DOCKER"))
    {
        cfg.runner.use_container = is_truthy(&flag);
    }
    if let Some(image) = non_blank(env, "DOCKER_IMAGE") {
        cfg.runner.image = image;
    }
    if let Some(network) = non_blank(env, "RUNNER_NETWORK") {
        cfg.runner.network = Some(network);
    }
    if let Some(flag) = non_blank(env, "RUNNER_BOOTSTRAP_PYTEST") {
        cfg.runner.bootstrap = is_truthy(&flag);
    }
    if let Some(requirements) = non_blank(env, "RUNNER_REQUIREMENTS") {
        cfg.runner.requirements = Some(requirements);
    }
    if let Some(strategy) = non_blank(env, "RCA_STRATEGY").and_then(|s| StrategyKind::parse(&s)) {
        cfg.analysis.strategy = strategy;
    }
    if let Some(backend) = non_blank(env, "LLM_BACKEND") {
        cfg.llm.backend = backend.to_ascii_lowercase();
    }
    if let Some(key) = non_blank(env, "OPENAI_API_KEY") {
        cfg.llm.openai_api_key = Some(key);
    }
    if let Some(model) = non_blank(env, "OPENAI_MODEL") {
        cfg.llm.openai_model = model;
    }
    if let Some(key) = non_blank(env, "GOOGLE_API_KEY") {
        cfg.llm.google_api_key = Some(key);
    }
    if let Some(model) = non_blank(env, "GEMINI_MODEL") {
        cfg.llm.gemini_model = model;
    }
    if let Some(path) = non_blank(env, "RCA_LOG_PATH") {
        cfg.logging.path = Some(PathBuf::from(path));
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(strategy) = overrides.strategy {
        cfg.analysis.strategy = strategy;
    }
    if let Some(timeout) = overrides.timeout_secs {
        cfg.runner.timeout_secs = timeout;
    }
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
}

pub fn resolve_working_dir(process_cwd: &Path, overrides: &CliOverrides) -> PathBuf {
    match &overrides.working_dir {
        Some(path) => absolutize_path(process_cwd, path),
        None => process_cwd.to_path_buf(),
    }
}

pub fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn validate_config(cfg: &AppConfig) -> Result<(), RcaError> {
    if cfg.runner.timeout_secs == 0 {
        return Err(RcaError::InvalidConfig(
            "runner.timeout_secs must be greater than zero".to_string(),
        ));
    }
    if cfg.analysis.max_read_bytes == 0 {
        return Err(RcaError::InvalidConfig(
            "analysis.max_read_bytes must be greater than zero".to_string(),
        ));
    }
    if cfg.runner.test_program.trim().is_empty() {
        return Err(RcaError::InvalidConfig(
            "runner.test_program must not be empty".to_string(),
        ));
    }
    if cfg.runner.image.trim().is_empty() {
        return Err(RcaError::InvalidConfig(
            "runner.image must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        load_config, normalize_lexically, resolve_working_dir, CliOverrides, EnvMap, SandboxMode,
    };
    use crate::runtime::FakeFileSystem;
    use crate::types::StrategyKind;
    use std::path::{Path, PathBuf};

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_graph_and_local() {
        let fs = FakeFileSystem::default();
        let cfg = load_config(&CliOverrides::default(), &EnvMap::new(), Path::new("/"), &fs)
            .expect("config");
        assert_eq!(cfg.analysis.strategy, StrategyKind::Graph);
        assert!(!cfg.runner.wants_container(None));
        assert!(cfg.runner.bootstrap);
        assert_eq!(cfg.llm.backend, "none");
    }

    #[test]
    fn container_choice_follows_precedence() {
        let fs = FakeFileSystem::default();
        let cfg = load_config(
            &CliOverrides::default(),
            &env(&[("SANDBOX_MODE", "local"), ("RUNNER_USE_DOCKER", "1")]),
            Path::new("/"),
            &fs,
        )
        .expect("config");
        assert_eq!(cfg.runner.sandbox_mode, Some(SandboxMode::Local));
        assert!(!cfg.runner.wants_container(None));
        assert!(cfg.runner.wants_container(Some(true)));

        let cfg = load_config(
            &CliOverrides::default(),
            &env(&[("RUNNER_USE_DOCKER", "yes")]),
            Path::new("/"),
            &fs,
        )
        .expect("config");
        assert!(cfg.runner.wants_container(None));
        assert!(!cfg.runner.wants_container(Some(false)));

        let cfg = load_config(
            &CliOverrides::default(),
            &env(&[("SANDBOX_MODE", "docker")]),
            Path::new("/"),
            &fs,
        )
        .expect("config");
        assert!(cfg.runner.wants_container(None));
    }

    #[test]
    fn unknown_env_sandbox_mode_keeps_file_setting() {
        let fs = FakeFileSystem::with_file("/rca.toml", "[runner]\nsandbox_mode = \"container\"\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/rca.toml")),
            ..CliOverrides::default()
        };
        let cfg = load_config(
            &overrides,
            &env(&[("SANDBOX_MODE", "bogus")]),
            Path::new("/"),
            &fs,
        )
        .expect("config");
        assert_eq!(cfg.runner.sandbox_mode, Some(SandboxMode::Container));
        assert!(cfg.runner.wants_container(None));
    }

    #[test]
    fn file_then_env_then_cli_layering() {
        let fs = FakeFileSystem::with_file(
            "/cfg/rca.toml",
            "[runner]\nimage = \"python:3.12\"\ntimeout_secs = 30\n[analysis]\nstrategy = \"llm\"\n[llm]\nbackend = \"openai\"\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("rca.toml")),
            timeout_secs: Some(90),
            ..CliOverrides::default()
        };
        let cfg = load_config(
            &overrides,
            &env(&[("DOCKER_IMAGE", "python:3.13"), ("OPENAI_API_KEY", "sk-test")]),
            Path::new("/cfg"),
            &fs,
        )
        .expect("config");
        assert_eq!(cfg.runner.image, "python:3.13");
        assert_eq!(cfg.runner.timeout_secs, 90);
        assert_eq!(cfg.analysis.strategy, StrategyKind::Llm);
        assert_eq!(cfg.llm.backend, "openai");
        assert_eq!(cfg.llm.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn invalid_toml_and_zero_timeout_are_rejected() {
        let fs = FakeFileSystem::with_file("/rca.toml", "[runner\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/rca.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &EnvMap::new(), Path::new("/"), &fs)
            .expect_err("parse error");
        assert!(format!("{err}").contains("config parse error"));

        let overrides = CliOverrides {
            timeout_secs: Some(0),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &EnvMap::new(), Path::new("/"), &fs)
            .expect_err("invalid");
        assert!(format!("{err}").contains("timeout_secs"));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let fs = FakeFileSystem::default();
        let cfg = load_config(
            &CliOverrides::default(),
            &env(&[("GOOGLE_API_KEY", "secret-value")]),
            Path::new("/"),
            &fs,
        )
        .expect("config");
        let rendered = serde_json::to_string(&cfg.llm).expect("json");
        assert!(!rendered.contains("secret-value"));
    }

    #[test]
    fn working_dir_is_resolved_and_normalized() {
        let overrides = CliOverrides {
            working_dir: Some(PathBuf::from("svc/../api")),
            ..CliOverrides::default()
        };
        let dir = resolve_working_dir(Path::new("/srv"), &overrides);
        assert_eq!(normalize_lexically(&dir), PathBuf::from("/srv/api"));
        assert_eq!(
            resolve_working_dir(Path::new("/srv"), &CliOverrides::default()),
            PathBuf::from("/srv")
        );
    }
}
