use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Normalized analysis request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub repo: String,
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_data: Option<String>,
    #[serde(serialize_with = "serialize_utc_seconds")]
    pub created_at: DateTime<Utc>,
    /// Note from reading `path`, carried into the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Event {
    pub fn new(log: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let log = log.into();
        Self {
            id: derive_event_id(&log),
            repo: ".".to_string(),
            log,
            path: None,
            screenshot_data: None,
            created_at: truncate_to_seconds(created_at),
            note: None,
        }
    }

    /// Last `max_chars` characters of the log.
    pub fn log_tail(&self, max_chars: usize) -> &str {
        tail_chars(&self.log, max_chars)
    }
}

/// First 10 hex chars of the SHA-1 of `log`.
pub fn derive_event_id(log: &str) -> String {
    let digest = Sha1::digest(log.as_bytes());
    let hex = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    hex[..10].to_string()
}

pub fn truncate_to_seconds(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(value.timestamp(), 0).unwrap_or(value)
}

pub fn format_utc_seconds(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn serialize_utc_seconds<S: Serializer>(
    value: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_utc_seconds(value))
}

pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Findings {
    pub exception: Option<String>,
    pub file_location: Option<String>,
    pub context: Vec<String>,
    pub summary: String,
    /// True when the context window was centred on a keyword match.
    pub anchored: bool,
}

/// Uniform response of every analysis strategy. `rca` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub rca: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(rename = "file", default, skip_serializing_if = "Option::is_none")]
    pub file_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl AnalysisResult {
    pub fn from_rca(rca: impl Into<String>) -> Self {
        Self {
            rca: rca.into(),
            patch: None,
            test: None,
            exception: None,
            file_location: None,
            context: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Handler,
    Graph,
    Llm,
    Stub,
}

impl StrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "handler" => Some(Self::Handler),
            "graph" => Some(Self::Graph),
            "llm" => Some(Self::Llm),
            "stub" | "none" => Some(Self::Stub),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Graph => "graph",
            Self::Llm => "llm",
            Self::Stub => "stub",
        }
    }
}

/// Closed classification of exception families used for patch suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFamily {
    MissingKey,
    NoneDereference,
    MissingArgument,
    MissingModule,
    MissingFile,
    InvalidValue,
    Unknown,
}

impl ErrorFamily {
    pub fn classify(exception: &str) -> Self {
        let lowered = exception.to_ascii_lowercase();
        if exception.contains("KeyError") {
            Self::MissingKey
        } else if (exception.contains("AttributeError") && exception.contains("NoneType"))
            || (exception.contains("TypeError")
                && (lowered.contains("of undefined") || lowered.contains("of null")))
        {
            Self::NoneDereference
        } else if exception.contains("TypeError") && lowered.contains("missing") {
            Self::MissingArgument
        } else if exception.contains("ModuleNotFoundError")
            || exception.contains("ImportError")
            || lowered.contains("cannot find module")
        {
            Self::MissingModule
        } else if exception.contains("FileNotFoundError") || exception.contains("ENOENT") {
            Self::MissingFile
        } else if exception.contains("ValueError") {
            Self::InvalidValue
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
}

impl Language {
    /// Python is the default for unknown or missing extensions.
    pub fn from_path(path: Option<&str>) -> Self {
        let Some(path) = path else {
            return Self::Python;
        };
        let file = strip_line_suffix(path).to_ascii_lowercase();
        if file.ends_with(".ts") || file.ends_with(".tsx") {
            Self::TypeScript
        } else if [".js", ".mjs", ".cjs", ".jsx"]
            .iter()
            .any(|ext| file.ends_with(ext))
        {
            Self::JavaScript
        } else {
            Self::Python
        }
    }
}

/// Drops trailing `:line` and `:line:col` parts, leaving drive letters intact.
pub fn strip_line_suffix(path: &str) -> &str {
    let mut file = path;
    while let Some((head, tail)) = file.rsplit_once(':') {
        if head.is_empty() || tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
            break;
        }
        file = head;
    }
    file
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunBackend {
    Local,
    Container,
}

impl RunBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
    pub warnings: u32,
    pub xfailed: u32,
    pub xpassed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_sec: Option<f64>,
}

/// Outcome of one test-suite execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub backend: RunBackend,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub summary: RunSummary,
    pub ok: bool,
}

impl RunResult {
    pub fn is_ok(exit_code: i32, summary: &RunSummary) -> bool {
        exit_code == 0 && summary.failed == 0 && summary.errors == 0
    }
}
