use super::{text_field, AnalysisStrategy, StrategyOutcome};
use crate::config::LlmConfig;
use crate::errors::RcaError;
use crate::logging::append_run_log;
use crate::types::{AnalysisResult, Event, StrategyKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::LazyLock;
use std::time::Duration;

const LOG_PROMPT_LIMIT: usize = 8000;
const CONTEXT_LINES: usize = 12;
const NO_CONTEXT: &str = "(no context)";

#[allow(clippy::expect_used)]
static TRAILING_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[\s\S]*\}$").expect("valid regex"));

#[allow(clippy::expect_used)]
static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(error|exception|keyerror|valueerror|typeerror|assertionerror)[: ]")
        .expect("valid regex")
});

pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str, model: &str) -> Result<String, RcaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmBackend {
    Disabled,
    OpenAi,
    Gemini,
    Unsupported(String),
}

impl LlmBackend {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "false" => Self::Disabled,
            "openai" => Self::OpenAi,
            "gemini" => Self::Gemini,
            other => Self::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Disabled => "none",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Unsupported(name) => name,
        }
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client, RcaError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RcaError::Llm(e.to_string()))
}

pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self, RcaError> {
        let api_key = cfg
            .openai_api_key
            .clone()
            .ok_or_else(|| RcaError::Llm("Missing OPENAI_API_KEY".to_string()))?;
        Ok(Self {
            http: http_client(cfg.request_timeout_secs)?,
            base_url: cfg.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, prompt: &str, model: &str) -> Result<String, RcaError> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You return JSON only.",
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| RcaError::Llm(format!("OpenAI call failed: {e}")))?;
        let parsed: ChatResponse = response
            .json()
            .map_err(|e| RcaError::Llm(format!("OpenAI call failed: {e}")))?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

pub struct GeminiClient {
    http: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<GenerateContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GenerateContent<'a> {
    parts: Vec<GeneratePart<'a>>,
}

#[derive(Serialize)]
struct GeneratePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self, RcaError> {
        let api_key = cfg
            .google_api_key
            .clone()
            .ok_or_else(|| RcaError::Llm("Missing GOOGLE_API_KEY".to_string()))?;
        Ok(Self {
            http: http_client(cfg.request_timeout_secs)?,
            base_url: cfg.gemini_base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl LlmClient for GeminiClient {
    fn complete(&self, prompt: &str, model: &str) -> Result<String, RcaError> {
        let body = GenerateRequest {
            contents: vec![GenerateContent {
                parts: vec![GeneratePart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                response_mime_type: "application/json",
            },
        };
        let response = self
            .http
            .post(format!("{}/models/{model}:generateContent", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| RcaError::Llm(format!("Gemini call failed: {e}")))?;
        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| RcaError::Llm(format!("Gemini call failed: {e}")))?;
        Ok(parsed
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

pub struct LlmStrategy {
    backend: LlmBackend,
    model: String,
    client: Result<Box<dyn LlmClient>, RcaError>,
}

impl LlmStrategy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        let backend = LlmBackend::parse(&cfg.backend);
        let (model, client) = match &backend {
            LlmBackend::OpenAi => (
                cfg.openai_model.clone(),
                OpenAiClient::new(cfg).map(|c| Box::new(c) as Box<dyn LlmClient>),
            ),
            LlmBackend::Gemini => (
                cfg.gemini_model.clone(),
                GeminiClient::new(cfg).map(|c| Box::new(c) as Box<dyn LlmClient>),
            ),
            LlmBackend::Disabled | LlmBackend::Unsupported(_) => (
                String::new(),
                Err(RcaError::Llm(format!("backend {} has no client", backend.as_str()))),
            ),
        };
        Self {
            backend,
            model,
            client,
        }
    }

    pub fn with_client(
        backend: LlmBackend,
        model: impl Into<String>,
        client: Box<dyn LlmClient>,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            client: Ok(client),
        }
    }

    fn heuristic(&self, event: &Event, rca: String) -> AnalysisResult {
        let exception = last_error_line(&event.log);
        AnalysisResult {
            rca,
            patch: None,
            test: None,
            exception: (!exception.is_empty()).then_some(exception),
            file_location: event.path.clone(),
            context: Some(last_lines(&event.log, CONTEXT_LINES)),
            note: None,
        }
    }
}

impl AnalysisStrategy for LlmStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Llm
    }

    fn analyze(&self, event: &Event) -> StrategyOutcome {
        match &self.backend {
            LlmBackend::Disabled => {
                let exception = last_error_line(&event.log);
                let around = if exception.is_empty() {
                    "(unknown)"
                } else {
                    exception.as_str()
                };
                let rca = format!(
                    "LLM disabled. Heuristic summary:\nLikely failure around: {around}\n\
                     Check the last stack frame and ensure required keys/files exist."
                );
                return StrategyOutcome::Produced(self.heuristic(event, rca));
            }
            LlmBackend::Unsupported(_) => {
                let rca = "Unsupported LLM_BACKEND; using heuristic summary.".to_string();
                return StrategyOutcome::Produced(self.heuristic(event, rca));
            }
            LlmBackend::OpenAi | LlmBackend::Gemini => {}
        }

        let prompt = build_prompt(&event.log, &event.repo, event.path.as_deref());
        let reply = self
            .client
            .as_ref()
            .map_err(error_detail)
            .and_then(|client| client.complete(&prompt, &self.model).map_err(|e| error_detail(&e)));

        match reply {
            Ok(text) => {
                append_run_log(
                    "info",
                    "rca.llm.reply",
                    json!({"backend": self.backend.as_str(), "model": self.model, "chars": text.len()}),
                );
                StrategyOutcome::Produced(result_from_reply(&text, event))
            }
            Err(detail) => {
                append_run_log(
                    "warn",
                    "rca.llm.error",
                    json!({"backend": self.backend.as_str(), "error": detail}),
                );
                let rca = format!(
                    "LLM error ({}): {detail}.\nHeuristic summary: likely failure around: {}",
                    self.backend.as_str(),
                    last_error_line(&event.log)
                );
                StrategyOutcome::Produced(self.heuristic(event, rca))
            }
        }
    }
}

fn error_detail(err: &RcaError) -> String {
    match err {
        RcaError::Llm(message) => message.clone(),
        other => other.to_string(),
    }
}

pub fn build_prompt(log: &str, repo: &str, file_hint: Option<&str>) -> String {
    let repo = if repo.trim().is_empty() { "." } else { repo };
    let mut prompt = String::from(
        "You are a senior debugging assistant. Read the log and produce a compact RCA.\n\
         Return STRICT JSON with keys: rca (string), patch (string or null), test (string or null), context (array of strings).\n\
         Do not include markdown fences.\n\n",
    );
    prompt.push_str(&format!("REPO_HINT: {repo}\n"));
    if let Some(file) = file_hint.map(str::trim).filter(|f| !f.is_empty()) {
        prompt.push_str(&format!("FILE_HINT: {file}\n"));
    }
    prompt.push_str(&format!("LOG:\n{}\n", shorten(log, LOG_PROMPT_LIMIT)));
    prompt.push_str("JSON ONLY:");
    prompt
}

/// Keeps the head and tail halves of an over-long text.
pub fn shorten(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let half = limit / 2;
    let head = text.chars().take(half).collect::<String>();
    let tail = text.chars().skip(count - half).collect::<String>();
    format!("{head}\n…\n{tail}")
}

/// Direct JSON, then a trailing `{...}` block, then the raw text as `rca`.
pub fn parse_reply(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if let Some(block) = TRAILING_OBJECT_RE.find(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block.as_str()) {
            return value;
        }
    }
    json!({"rca": trimmed})
}

fn result_from_reply(text: &str, event: &Event) -> AnalysisResult {
    let parsed = parse_reply(text);
    let object = match parsed {
        Value::Object(object) => object,
        _ => serde_json::Map::new(),
    };

    let rca = text_field(&object, "rca")
        .or_else(|| text_field(&object, "summary"))
        .map(|rca| rca.trim().to_string())
        .filter(|rca| !rca.is_empty())
        .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| {
            format!(
                "Heuristic: likely failure around: {}",
                last_error_line(&event.log)
            )
        });

    let mut context = match object.get("context") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(other) => vec![other.to_string()],
    };
    context.retain(|line| !line.trim().is_empty());
    if context.is_empty() {
        context = last_lines(&event.log, CONTEXT_LINES);
    }

    let exception = last_error_line(&event.log);
    AnalysisResult {
        rca,
        patch: text_field(&object, "patch"),
        test: text_field(&object, "test"),
        exception: (!exception.is_empty()).then_some(exception),
        file_location: event.path.clone(),
        context: Some(context),
        note: None,
    }
}

/// Last error-looking line, else the last non-blank line.
pub fn last_error_line(log: &str) -> String {
    let lines = log
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    lines
        .iter()
        .rev()
        .find(|line| {
            let lowered = line.to_lowercase();
            lowered.starts_with("error:")
                || lowered.starts_with("exception:")
                || lowered.contains("traceback")
                || ERROR_LINE_RE.is_match(line)
        })
        .or_else(|| lines.last())
        .map(|line| line.to_string())
        .unwrap_or_default()
}

fn last_lines(log: &str, count: usize) -> Vec<String> {
    let lines = log.lines().map(str::to_string).collect::<Vec<_>>();
    let tail = lines[lines.len().saturating_sub(count)..].to_vec();
    if tail.is_empty() {
        vec![NO_CONTEXT.to_string()]
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_prompt, last_error_line, parse_reply, shorten, LlmBackend, LlmClient, LlmStrategy,
    };
    use crate::chain::{AnalysisStrategy, StrategyOutcome};
    use crate::config::AppConfig;
    use crate::errors::RcaError;
    use crate::types::{AnalysisResult, Event};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct ScriptedClient {
        reply: Option<String>,
        prompts: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl LlmClient for ScriptedClient {
        fn complete(&self, prompt: &str, model: &str) -> Result<String, RcaError> {
            self.prompts
                .lock()
                .expect("prompts")
                .push((prompt.to_string(), model.to_string()));
            self.reply
                .clone()
                .ok_or_else(|| RcaError::Llm("OpenAI call failed: connection refused".to_string()))
        }
    }

    fn produced(strategy: &LlmStrategy, event: &Event) -> AnalysisResult {
        match strategy.analyze(event) {
            StrategyOutcome::Produced(result) => result,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn event(log: &str) -> Event {
        Event::new(log, Utc::now())
    }

    #[test]
    fn reply_parsing_is_permissive() {
        assert_eq!(parse_reply("{\"rca\":\"x\"}"), json!({"rca": "x"}));
        assert_eq!(
            parse_reply("Here you go: {\"rca\":\"y\"}"),
            json!({"rca": "y"})
        );
        assert_eq!(parse_reply("plain words"), json!({"rca": "plain words"}));
    }

    #[test]
    fn shorten_keeps_head_and_tail() {
        assert_eq!(shorten("abcdef", 10), "abcdef");
        assert_eq!(shorten("abcdefghij", 4), "ab\n…\nij");
    }

    #[test]
    fn prompt_carries_hints() {
        let prompt = build_prompt("boom", "", Some(" app.py "));
        assert!(prompt.contains("REPO_HINT: .\nFILE_HINT: app.py\nLOG:\nboom\nJSON ONLY:"));
        assert!(!build_prompt("boom", "svc", None).contains("FILE_HINT"));
    }

    #[test]
    fn error_line_heuristic() {
        assert_eq!(
            last_error_line("start\nTypeError: x is undefined\ndone"),
            "TypeError: x is undefined"
        );
        assert_eq!(last_error_line("all good\nbye\n\n"), "bye");
        assert_eq!(last_error_line(""), "");
    }

    #[test]
    fn disabled_backend_returns_heuristic() {
        let strategy = LlmStrategy::from_config(&AppConfig::default().llm);
        let result = produced(&strategy, &event("ok\nKeyError: 'id'"));
        assert!(result.rca.starts_with("LLM disabled. Heuristic summary:\nLikely failure around: KeyError: 'id'"));
        assert_eq!(result.context, Some(vec!["ok".to_string(), "KeyError: 'id'".to_string()]));
    }

    #[test]
    fn unsupported_backend_is_named() {
        let mut cfg = AppConfig::default().llm;
        cfg.backend = "claude".to_string();
        let result = produced(&LlmStrategy::from_config(&cfg), &event(""));
        assert_eq!(result.rca, "Unsupported LLM_BACKEND; using heuristic summary.");
        assert_eq!(result.context, Some(vec!["(no context)".to_string()]));
    }

    #[test]
    fn missing_key_degrades_to_error_summary() {
        let mut cfg = AppConfig::default().llm;
        cfg.backend = "openai".to_string();
        let result = produced(&LlmStrategy::from_config(&cfg), &event("ValueError: nope"));
        assert_eq!(
            result.rca,
            "LLM error (openai): Missing OPENAI_API_KEY.\nHeuristic summary: likely failure around: ValueError: nope"
        );
    }

    #[test]
    fn json_reply_is_normalized() {
        let client = ScriptedClient {
            reply: Some(
                json!({"rca": " root cause ", "patch": {"file": "a.py"}, "test": null, "context": ["", "line"]})
                    .to_string(),
            ),
            ..ScriptedClient::default()
        };
        let prompts = client.prompts.clone();
        let strategy = LlmStrategy::with_client(LlmBackend::OpenAi, "gpt-test", Box::new(client));
        let mut ev = event("Traceback\nKeyError: 'id'");
        ev.path = Some("app.py".to_string());
        let result = produced(&strategy, &ev);

        assert_eq!(result.rca, "root cause");
        assert_eq!(result.patch.as_deref(), Some("{\n  \"file\": \"a.py\"\n}"));
        assert_eq!(result.test, None);
        assert_eq!(result.context, Some(vec!["line".to_string()]));
        assert_eq!(result.file_location.as_deref(), Some("app.py"));
        assert_eq!(result.exception.as_deref(), Some("KeyError: 'id'"));
        let recorded = prompts.lock().expect("prompts");
        assert_eq!(recorded[0].1, "gpt-test");
    }

    #[test]
    fn transport_error_is_absorbed() {
        let strategy = LlmStrategy::with_client(
            LlmBackend::Gemini,
            "gemini-test",
            Box::new(ScriptedClient::default()),
        );
        let result = produced(&strategy, &event("fatal"));
        assert!(result
            .rca
            .starts_with("LLM error (gemini): OpenAI call failed: connection refused."));
    }

    #[test]
    fn plain_text_reply_becomes_rca() {
        let client = ScriptedClient {
            reply: Some("The config file is missing.".to_string()),
            ..ScriptedClient::default()
        };
        let strategy = LlmStrategy::with_client(LlmBackend::Gemini, "g", Box::new(client));
        let result = produced(&strategy, &event("a\nb"));
        assert_eq!(result.rca, "The config file is missing.");
        assert_eq!(result.context, Some(vec!["a".to_string(), "b".to_string()]));
    }
}
