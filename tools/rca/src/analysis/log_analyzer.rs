use crate::types::Findings;
use regex::Regex;
use std::sync::LazyLock;

const ANCHOR_KEYWORDS: [&str; 5] = ["traceback", "error", "exception", "fatal", "failed"];
const CONTEXT_RADIUS: usize = 3;
pub const EMPTY_LOG_SUMMARY: &str = "No log content provided.";

#[allow(clippy::expect_used)]
static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<err>[A-Za-z_][\w.]*(?:Error|Exception)|Exception)(?::\s*(?P<msg>.*))?$")
        .expect("valid regex")
});

#[allow(clippy::expect_used)]
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File\s+"([^"]+)",\s+line\s+(\d+)"#).expect("valid regex")
});

#[allow(clippy::expect_used)]
static SOURCE_LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z]:)?[^\s:]+\.(?:js|ts|py|tsx|jsx|mjs|cjs):\d+(?::\d+)?")
        .expect("valid regex")
});

/// Heuristic scan of raw log text. Pure; never fails.
pub fn analyze(log: &str) -> Findings {
    let lines = log.lines().collect::<Vec<_>>();
    if lines.is_empty() {
        return Findings {
            exception: None,
            file_location: None,
            context: Vec::new(),
            summary: EMPTY_LOG_SUMMARY.to_string(),
            anchored: false,
        };
    }

    let anchor = find_anchor(&lines);
    let exception = extract_exception(&lines);
    let file_location = extract_location(&lines);

    let center = anchor.unwrap_or(lines.len() - 1);
    let start = center.saturating_sub(CONTEXT_RADIUS);
    let end = (center + CONTEXT_RADIUS).min(lines.len());
    let context = lines[start..end]
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>();

    let summary = render_summary(
        exception.as_deref(),
        file_location.as_deref(),
        anchor.is_some(),
        &context,
    );

    Findings {
        exception,
        file_location,
        context,
        summary,
        anchored: anchor.is_some(),
    }
}

fn find_anchor(lines: &[&str]) -> Option<usize> {
    lines.iter().rposition(|line| {
        let lowered = line.to_lowercase();
        ANCHOR_KEYWORDS.iter().any(|kw| lowered.contains(kw))
    })
}

fn extract_exception(lines: &[&str]) -> Option<String> {
    lines.iter().rev().find_map(|line| {
        let caps = EXCEPTION_RE.captures(line)?;
        let err = caps.name("err")?.as_str();
        let msg = caps.name("msg").map(|m| m.as_str().trim()).unwrap_or("");
        Some(if msg.is_empty() {
            err.to_string()
        } else {
            format!("{err}: {msg}")
        })
    })
}

fn extract_location(lines: &[&str]) -> Option<String> {
    let frame = lines.iter().rev().find_map(|line| {
        let caps = FRAME_RE.captures(line)?;
        Some(format!("{}:{}", caps.get(1)?.as_str(), caps.get(2)?.as_str()))
    });
    frame.or_else(|| {
        lines
            .iter()
            .rev()
            .find_map(|line| SOURCE_LOCATION_RE.find(line).map(|m| m.as_str().to_string()))
    })
}

fn render_summary(
    exception: Option<&str>,
    file_location: Option<&str>,
    anchored: bool,
    context: &[String],
) -> String {
    let mut parts = Vec::with_capacity(context.len() + 3);
    if let Some(exception) = exception {
        parts.push(format!("- Suspected exception: {exception}"));
    }
    if let Some(location) = file_location {
        parts.push(format!("- Likely location: {location}"));
    }
    parts.push(if anchored {
        "- Context around last error:".to_string()
    } else {
        "- Tail of log:".to_string()
    });
    parts.extend(context.iter().map(|line| format!("    {line}")));
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{analyze, EMPTY_LOG_SUMMARY};

    #[test]
    fn empty_log_yields_placeholder_summary() {
        let findings = analyze("");
        assert_eq!(findings.summary, EMPTY_LOG_SUMMARY);
        assert!(findings.exception.is_none());
        assert!(findings.file_location.is_none());
        assert!(findings.context.is_empty());
    }

    #[test]
    fn key_error_is_extracted_with_context() {
        let findings = analyze("Traceback (most recent call last):\nKeyError: 'id'");
        assert_eq!(findings.exception.as_deref(), Some("KeyError: 'id'"));
        assert!(findings.context.iter().any(|line| line == "KeyError: 'id'"));
        assert!(findings.anchored);
        assert!(findings.summary.contains("- Context around last error:"));
    }

    #[test]
    fn python_frame_resolves_location() {
        let findings = analyze("File \"app.py\", line 42, in foo\nValueError: bad input");
        assert_eq!(findings.file_location.as_deref(), Some("app.py:42"));
        assert_eq!(findings.exception.as_deref(), Some("ValueError: bad input"));
        assert!(findings
            .summary
            .starts_with("- Suspected exception: ValueError: bad input\n- Likely location: app.py:42"));
    }

    #[test]
    fn last_frame_wins_over_earlier_frames() {
        let log = "File \"a.py\", line 1, in x\nFile \"b.py\", line 9, in y\nKeyError: 'k'";
        assert_eq!(analyze(log).file_location.as_deref(), Some("b.py:9"));
    }

    #[test]
    fn js_stack_location_is_a_fallback() {
        let log = "TypeError: Cannot read properties of undefined\n    at src/server.ts:17:5";
        let findings = analyze(log);
        assert_eq!(findings.file_location.as_deref(), Some("src/server.ts:17:5"));
        assert_eq!(
            findings.exception.as_deref(),
            Some("TypeError: Cannot read properties of undefined")
        );
    }

    #[test]
    fn bare_exception_type_and_dotted_names() {
        let findings = analyze("raise requests.exceptions.ConnectionError");
        assert_eq!(
            findings.exception.as_deref(),
            Some("requests.exceptions.ConnectionError")
        );
    }

    #[test]
    fn without_keywords_the_tail_is_shown() {
        let log = (1..=10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let findings = analyze(&log);
        assert!(!findings.anchored);
        assert!(findings.summary.starts_with("- Tail of log:"));
        assert_eq!(findings.context, vec!["line 7", "line 8", "line 9", "line 10"]);
        assert!(!findings.summary.contains("Suspected exception"));
    }

    #[test]
    fn context_window_is_clamped_around_the_anchor() {
        let log = "a\nb\nc\nd\nfatal: boom\ne\nf\ng\nh";
        let findings = analyze(log);
        assert_eq!(findings.context, vec!["b", "c", "d", "fatal: boom", "e", "f"]);
        assert!(findings.summary.contains("\n    fatal: boom"));
    }

    #[test]
    fn qualified_exception_names_are_kept_whole() {
        let findings = analyze("Caused by\njava.lang.NullPointerException: x is null");
        assert_eq!(
            findings.exception.as_deref(),
            Some("java.lang.NullPointerException: x is null")
        );
        assert!(findings
            .summary
            .starts_with("- Suspected exception: java.lang.NullPointerException: x is null"));

        let findings = analyze("charge failed\napp.errors.PaymentException: declined");
        assert_eq!(
            findings.exception.as_deref(),
            Some("app.errors.PaymentException: declined")
        );
        assert_eq!(analyze("Exception").exception.as_deref(), Some("Exception"));
    }
}
