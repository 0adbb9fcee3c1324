use super::{AnalysisStrategy, LooseResult, StrategyOutcome};
use crate::errors::Fault;
use crate::runtime::Clock;
use crate::types::{format_utc_seconds, Event, StrategyKind};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const TAIL_LINES: usize = 80;
const DEFAULT_RCA: &str = "Initial RCA produced";

/// Normalizes an inbound event object so downstream consumers can rely on its
/// keys.
pub trait EventNormalizer: Send + Sync {
    fn normalize(&self, raw: Value) -> Result<Value, Fault>;
}

/// Guarantees `id`, `text`, `created_at` and `tail`; copies `source` when a
/// path alias is present.
pub struct DefaultNormalizer {
    clock: Arc<dyn Clock>,
}

impl DefaultNormalizer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl EventNormalizer for DefaultNormalizer {
    fn normalize(&self, raw: Value) -> Result<Value, Fault> {
        let mut event = match raw {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Fault::new(
                    "TypeError",
                    format!("event must be an object, got {}", json_type(&other)),
                ))
            }
        };

        let has_id = event.get("id").is_some_and(|id| !id.is_null());
        if !has_id {
            event.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        }

        let text = ["text", "body", "content", "log"]
            .iter()
            .filter_map(|key| event.get(*key))
            .find_map(|value| match value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Null | Value::String(_) => None,
                Value::Bool(false) => None,
                other => Some(other.to_string()),
            })
            .unwrap_or_default();

        let source = ["path", "file", "source"]
            .iter()
            .filter_map(|key| event.get(*key))
            .find(|value| match value {
                Value::String(s) => !s.is_empty(),
                Value::Null => false,
                _ => true,
            })
            .cloned();
        if let Some(source) = source {
            event.insert("source".to_string(), source);
        }

        if !event.contains_key("created_at") {
            let now: DateTime<Utc> = self.clock.now().into();
            event.insert("created_at".to_string(), json!(format_utc_seconds(&now)));
        }
        event.insert("tail".to_string(), json!(tail_lines(&text, TAIL_LINES)));
        event.insert("text".to_string(), json!(text));
        Ok(Value::Object(event))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn tail_lines(text: &str, count: usize) -> String {
    let lines = text.lines().collect::<Vec<_>>();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

pub struct HandlerStrategy {
    normalizer: Box<dyn EventNormalizer>,
}

impl HandlerStrategy {
    pub fn new(normalizer: Box<dyn EventNormalizer>) -> Self {
        Self { normalizer }
    }
}

impl AnalysisStrategy for HandlerStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Handler
    }

    fn analyze(&self, event: &Event) -> StrategyOutcome {
        let raw = json!({
            "id": event.id,
            "repo": event.repo,
            "log": event.log,
            "path": event.path,
            "screenshot_b64": event.screenshot_data,
        });
        match self.normalizer.normalize(raw) {
            Ok(Value::Object(object)) => StrategyOutcome::Produced(
                LooseResult::from_object(&object).into_result(event, DEFAULT_RCA),
            ),
            Ok(_) => StrategyOutcome::Declined,
            Err(fault) => StrategyOutcome::Faulted(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{tail_lines, DefaultNormalizer, EventNormalizer, HandlerStrategy};
    use crate::chain::{AnalysisStrategy, StrategyOutcome};
    use crate::errors::Fault;
    use crate::runtime::FakeClock;
    use crate::types::Event;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn normalizer() -> DefaultNormalizer {
        let clock = FakeClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        DefaultNormalizer::new(Arc::new(clock))
    }

    #[test]
    fn normalizer_fills_required_keys() {
        let out = normalizer()
            .normalize(json!({"body": "a\nb", "file": "x.py"}))
            .expect("normalized");
        assert_eq!(out["text"], "a\nb");
        assert_eq!(out["source"], "x.py");
        assert_eq!(out["tail"], "a\nb");
        assert_eq!(out["created_at"], "2023-11-14T22:13:20Z");
        let id = out["id"].as_str().expect("id");
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn normalizer_keeps_explicit_id_and_limits_tail() {
        let text = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let out = normalizer()
            .normalize(json!({"id": "abc", "text": text}))
            .expect("normalized");
        assert_eq!(out["id"], "abc");
        assert_eq!(out["tail"].as_str().expect("tail").lines().count(), 80);
        assert!(out["tail"].as_str().expect("tail").starts_with("20\n"));
    }

    #[test]
    fn normalizer_rejects_non_objects() {
        let err = normalizer().normalize(json!([1, 2])).expect_err("fault");
        assert_eq!(err.kind, "TypeError");
    }

    #[test]
    fn tail_lines_handles_short_text() {
        assert_eq!(tail_lines("", 80), "");
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
    }

    struct Failing;

    impl EventNormalizer for Failing {
        fn normalize(&self, _raw: Value) -> Result<Value, Fault> {
            Err(Fault::new("KeyError", "id"))
        }
    }

    struct Scalar;

    impl EventNormalizer for Scalar {
        fn normalize(&self, _raw: Value) -> Result<Value, Fault> {
            Ok(json!("done"))
        }
    }

    #[test]
    fn handler_maps_object_and_faults() {
        let mut event = Event::new("boom", Utc::now());
        event.path = Some("logs/app.log".to_string());

        let produced = HandlerStrategy::new(Box::new(normalizer())).analyze(&event);
        let StrategyOutcome::Produced(result) = produced else {
            panic!("expected a result");
        };
        assert_eq!(result.rca, "Initial RCA produced");
        assert_eq!(result.file_location.as_deref(), Some("logs/app.log"));
        assert_eq!(result.context, Some(vec!["boom".to_string()]));

        let faulted = HandlerStrategy::new(Box::new(Failing)).analyze(&event);
        assert!(matches!(faulted, StrategyOutcome::Faulted(ref f) if f.kind == "KeyError"));

        let declined = HandlerStrategy::new(Box::new(Scalar)).analyze(&event);
        assert_eq!(declined, StrategyOutcome::Declined);
    }
}
