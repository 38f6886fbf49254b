//! Per-attempt generator context assembly.
//!
//! Each attempt's prompt is built from the original task plus the ordered
//! failure history of the cycle so far (oldest first). Assembly is pure; the
//! prompt layer renders it.

use crate::core::types::{Diagnosis, FailureKind};

/// Context the caller seeds a cycle with, before any attempt has run.
#[derive(Debug, Clone, Default)]
pub struct SeedContext {
    /// Fetch source of the version being edited or healed, if any.
    pub previous_fetch_source: Option<String>,
    /// Most recent runtime failure message, when healing.
    pub runtime_failure: Option<String>,
}

/// One failed attempt, summarized for the next attempt's prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNote {
    pub attempt: u32,
    pub kind: FailureKind,
    pub summary: String,
    pub remediation_hint: String,
}

impl FailureNote {
    pub fn from_diagnosis(attempt: u32, diagnosis: &Diagnosis) -> Self {
        Self {
            attempt,
            kind: diagnosis.kind,
            summary: diagnosis.summary.clone(),
            remediation_hint: diagnosis.remediation_hint.clone(),
        }
    }
}

/// Accumulated context across a cycle's attempts.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub task: String,
    pub seed: SeedContext,
    failures: Vec<FailureNote>,
}

impl CycleContext {
    pub fn new(task: impl Into<String>, seed: SeedContext) -> Self {
        Self {
            task: task.into(),
            seed,
            failures: Vec::new(),
        }
    }

    /// Append a failure note. Notes stay in insertion order, oldest first.
    pub fn push_failure(&mut self, note: FailureNote) {
        self.failures.push(note);
    }

    pub fn failures(&self) -> &[FailureNote] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_oldest_first() {
        let mut context = CycleContext::new("show the weather", SeedContext::default());
        context.push_failure(FailureNote {
            attempt: 1,
            kind: FailureKind::ExecutionError,
            summary: "first".to_string(),
            remediation_hint: "hint".to_string(),
        });
        context.push_failure(FailureNote {
            attempt: 2,
            kind: FailureKind::Timeout,
            summary: "second".to_string(),
            remediation_hint: "hint".to_string(),
        });

        let attempts: Vec<u32> = context.failures().iter().map(|f| f.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }
}
