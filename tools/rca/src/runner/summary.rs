use crate::types::RunSummary;
use regex::Regex;
use std::sync::LazyLock;

struct CountPatterns {
    passed: Regex,
    failed: Regex,
    skipped: Regex,
    errors: Regex,
    warnings: Regex,
    xfailed: Regex,
    xpassed: Regex,
    duration: Regex,
    collected: Regex,
}

#[allow(clippy::expect_used)]
static PATTERNS: LazyLock<CountPatterns> = LazyLock::new(|| {
    let count = |label: &str| Regex::new(&format!(r"(\d+)\s+{label}\b")).expect("valid regex");
    CountPatterns {
        passed: count("passed"),
        failed: count("failed"),
        skipped: count("skipped"),
        // pytest prints "1 error" / "1 warning" in the singular.
        errors: count("errors?"),
        warnings: count("warnings?"),
        xfailed: count("xfailed"),
        xpassed: count("xpassed"),
        duration: Regex::new(r"\bin\s+([0-9]+(?:\.[0-9]+)?)\s*s\b").expect("valid regex"),
        collected: Regex::new(r"collected\s+(\d+)\s+items?").expect("valid regex"),
    }
});

fn first_number(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Captures are all digits, so a failed parse can only mean overflow.
fn first_count(pattern: &Regex, text: &str) -> Option<u32> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().parse().unwrap_or(u32::MAX))
}

/// Counts from a pytest-style summary in combined stdout and stderr.
pub fn parse_summary(text: &str) -> RunSummary {
    let lowered = text.to_lowercase();
    let patterns = &*PATTERNS;
    let count = |pattern: &Regex| first_count(pattern, &lowered).unwrap_or(0);
    RunSummary {
        passed: count(&patterns.passed),
        failed: count(&patterns.failed),
        skipped: count(&patterns.skipped),
        errors: count(&patterns.errors),
        warnings: count(&patterns.warnings),
        xfailed: count(&patterns.xfailed),
        xpassed: count(&patterns.xpassed),
        collected: first_count(&patterns.collected, &lowered),
        time_sec: first_number(&patterns.duration, &lowered),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_summary;
    use crate::types::RunResult;

    #[test]
    fn counts_and_duration_are_parsed() {
        let summary = parse_summary("===== 3 passed, 1 failed in 2.50s =====");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.time_sec, Some(2.5));
        assert!(!RunResult::is_ok(0, &summary));
    }

    #[test]
    fn x_variants_do_not_leak_into_plain_counts() {
        let summary = parse_summary("2 xfailed, 1 xpassed, 4 skipped, 2 warnings in 0.1s");
        assert_eq!(summary.xfailed, 2);
        assert_eq!(summary.xpassed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.passed, 0);
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.warnings, 2);
        assert!(RunResult::is_ok(0, &summary));
    }

    #[test]
    fn collected_and_singular_error() {
        let summary = parse_summary("collected 5 items\n\n1 ERROR in 0.30s");
        assert_eq!(summary.collected, Some(5));
        assert_eq!(summary.errors, 1);
        assert!(!RunResult::is_ok(0, &summary));
    }

    #[test]
    fn unrelated_text_yields_zeroes() {
        let summary = parse_summary("no tests ran");
        assert_eq!(summary.passed, 0);
        assert_eq!(summary.collected, None);
        assert_eq!(summary.time_sec, None);
    }

    #[test]
    fn oversized_counts_saturate_instead_of_vanishing() {
        let summary = parse_summary("collected 99999999999 items\n\n99999999999 failed in 1.00s");
        assert_eq!(summary.failed, u32::MAX);
        assert_eq!(summary.collected, Some(u32::MAX));
        assert!(!RunResult::is_ok(0, &summary));
    }
}
