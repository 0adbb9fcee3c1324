use std::fmt;
use std::panic::Location;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RcaError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("llm error: {0}")]
    Llm(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("repo not found: {}", .0.display())]
    RepoNotFound(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A failure reported by an analysis collaborator (handler, graph step, LLM).
///
/// Faults never escape the analysis chain; they are rendered into RCA text by
/// [`Fault::render_rca`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: String,
    pub message: Option<String>,
    pub location: Option<SourceLocation>,
}

impl Fault {
    /// Records the caller as the innermost frame of the fault.
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let caller = Location::caller();
        let message = message.into();
        Self {
            kind: kind.into(),
            message: (!message.is_empty()).then_some(message),
            location: Some(SourceLocation {
                file: caller.file().to_string(),
                line: caller.line(),
            }),
        }
    }

    pub fn unlocated(kind: impl Into<String>, message: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.filter(|m| !m.is_empty()),
            location: None,
        }
    }

    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        Self::unlocated("Panic", message)
    }

    pub fn headline(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {message}", self.kind),
            None => self.kind.clone(),
        }
    }

    pub fn render_rca(&self) -> String {
        let mut out = format!("• Exception: {}", self.headline());
        if let Some(location) = &self.location {
            out.push_str(&format!("\n• Location: {location}"));
        }
        out
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.headline())
    }
}

impl std::error::Error for Fault {}

impl From<RcaError> for Fault {
    #[track_caller]
    fn from(value: RcaError) -> Self {
        let kind = match &value {
            RcaError::Io(_) => "IoError",
            RcaError::ConfigParse(_) => "ConfigParseError",
            RcaError::InvalidConfig(_) => "InvalidConfigError",
            RcaError::Cli(_) => "CliError",
            RcaError::Process(_) => "ProcessError",
            RcaError::Llm(_) => "LlmError",
            RcaError::Encode(_) => "EncodeError",
            RcaError::RepoNotFound(_) => "RepoNotFoundError",
        };
        Fault::new(kind, value.to_string())
    }
}
