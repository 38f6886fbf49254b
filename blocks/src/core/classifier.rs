//! Deterministic classification of failed executions.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Diagnosis, ExecutionResult, FailureKind};

/// Remediation table: `(pattern, hint)` rows matched against the failure
/// message, first match wins. The table is data, not control flow; new rows
/// extend coverage without touching the iteration loop.
const RULES: &[(&str, &str)] = &[
    (
        r"(?i)ModuleNotFoundError|ImportError|is not allowed",
        "Use only the allow-listed packages (requests, httpx, bs4, pandas, numpy, \
         dateutil, jmespath). Rewrite the fetch logic without the missing module.",
    ),
    (
        r"(?i)\b403\b|forbidden|access denied|captcha|cloudflare",
        "The source rejects scripted clients. Switch to an official API or a public \
         feed for this data instead of scraping the page.",
    ),
    (
        r"(?i)\b404\b|not found|no such element|selector|'NoneType' object",
        "The expected element or endpoint was not found. Try alternate selectors, or \
         prefer an official API or feed over scraping markup.",
    ),
    (
        r"(?i)\b429\b|rate limit",
        "The source is rate limiting. Make fewer requests or use an alternate source.",
    ),
    (
        r"(?i)timed? ?out|connection (error|refused|reset)|unreachable|name resolution",
        "The request did not complete. Send a User-Agent header, set an explicit \
         request timeout, or fetch the data from an alternate source.",
    ),
    (
        r"(?i)JSONDecodeError|Expecting value|invalid json",
        "The response was not valid JSON. Check the endpoint URL, or parse the actual \
         response format before building the payload.",
    ),
    (
        r"(?i)KeyError|IndexError",
        "The response shape did not match expectations. Inspect the real response and \
         read fields defensively with defaults.",
    ),
];

const GENERIC_HINT: &str = "Re-check the fetch logic end to end: verify the source URL \
    responds, print exactly one JSON document on stdout, and report recognized failures \
    through the error field.";

static COMPILED: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|(pattern, hint)| {
            (
                Regex::new(pattern).expect("remediation pattern should be valid"),
                *hint,
            )
        })
        .collect()
});

/// Classify a failed execution into a diagnosis.
///
/// Successful results are not meaningful input; they classify as a logical
/// error with an empty message rather than panicking.
pub fn classify(result: &ExecutionResult) -> Diagnosis {
    let kind = result.failure_kind().unwrap_or(FailureKind::LogicalError);
    classify_message(kind, result.failure_message())
}

/// Classify a failure by kind and raw message. Deterministic table lookup,
/// verifiable independent of the loop.
pub fn classify_message(kind: FailureKind, message: &str) -> Diagnosis {
    let hint = COMPILED
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, hint)| *hint)
        .unwrap_or(GENERIC_HINT);

    Diagnosis {
        kind,
        summary: summarize(kind, message),
        remediation_hint: hint.to_string(),
    }
}

/// One-line, user-facing summary. Raw stderr stays in the execution log; the
/// last non-empty line (the error line of a traceback), bounded, surfaces here.
fn summarize(kind: FailureKind, message: &str) -> String {
    let last_line = message
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    let mut line = last_line.trim().to_string();
    const MAX: usize = 200;
    if line.len() > MAX {
        let mut cut = MAX;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
        line.push_str("...");
    }
    if line.is_empty() {
        kind.as_str().to_string()
    } else {
        format!("{}: {}", kind.as_str(), line)
    }
}
