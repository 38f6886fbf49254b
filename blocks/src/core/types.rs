//! Shared deterministic types for the block engine core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Active,
    Error,
    Disabled,
}

/// Lifecycle status of a generated version.
///
/// At most one version per block is `Active`. Superseded versions become
/// `Deprecated`; the terminal version of an exhausted generation cycle is
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Active,
    Deprecated,
    Failed,
}

/// What kind of execution produced an audit log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Fetch,
    Process,
    Heal,
}

/// Failure taxonomy shared by the sandbox, classifier, and controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Generator returned output that does not parse as a candidate.
    GenerationError,
    /// Candidate imported a capability outside the allow-list.
    ImportError,
    /// Candidate process exited non-zero.
    ExecutionError,
    /// Candidate exceeded the wall-clock budget and was killed.
    Timeout,
    /// Candidate exited zero but stdout was not structured data.
    OutputFormatError,
    /// Candidate self-reported a failure in its payload.
    LogicalError,
    /// Persistence failure. Fatal to the cycle, never retried.
    StorageError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::GenerationError => "generation_error",
            FailureKind::ImportError => "import_error",
            FailureKind::ExecutionError => "execution_error",
            FailureKind::Timeout => "timeout",
            FailureKind::OutputFormatError => "output_format_error",
            FailureKind::LogicalError => "logical_error",
            FailureKind::StorageError => "storage_error",
        }
    }
}

/// Outcome payload of a sandbox execution.
///
/// Consumers match on the variant instead of probing a decoded blob for an
/// `"error"` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum Payload {
    Success { value: serde_json::Value },
    Failure { kind: FailureKind, message: String },
}

impl Payload {
    pub fn is_success(&self) -> bool {
        matches!(self, Payload::Success { .. })
    }

    /// The failure kind and message, if this is a failure payload.
    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match self {
            Payload::Success { .. } => None,
            Payload::Failure { kind, message } => Some((*kind, message)),
        }
    }
}

/// Structured result of one sandbox execution.
///
/// Every invocation of the sandbox yields exactly one of these, within the
/// configured timeout plus bounded overhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub payload: Payload,
}

impl ExecutionResult {
    /// The failure kind, or `None` on success.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.payload.failure().map(|(kind, _)| kind)
    }

    /// The failure message, or an empty string on success.
    pub fn failure_message(&self) -> &str {
        self.payload.failure().map(|(_, msg)| msg).unwrap_or("")
    }
}

/// Classifier output: what went wrong and what the next attempt should try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub kind: FailureKind,
    pub summary: String,
    pub remediation_hint: String,
}

/// Candidate implementation returned by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub fetch_source: String,
    pub render_source: String,
    pub explanation: String,
}

/// Terminal status of a generation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Succeeded,
    Exhausted,
}

/// Ordered progress events emitted by the iteration controller.
///
/// Emission order within a cycle is deterministic: one `AttemptStarted` per
/// attempt, `AttemptFailed` for each failed attempt, then exactly one of
/// `Succeeded` or `Exhausted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    AttemptStarted { block_id: i64, attempt: u32 },
    AttemptFailed {
        block_id: i64,
        attempt: u32,
        kind: FailureKind,
        summary: String,
    },
    Succeeded { block_id: i64, version: u32 },
    Exhausted { block_id: i64, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_serializes_to_taxonomy_names() {
        let json = serde_json::to_string(&FailureKind::OutputFormatError).expect("serialize");
        assert_eq!(json, "\"output_format_error\"");
        assert_eq!(FailureKind::ImportError.as_str(), "import_error");
    }

    #[test]
    fn payload_variants_tag_the_outcome() {
        let success = Payload::Success {
            value: serde_json::json!({"value": 42}),
        };
        let json = serde_json::to_value(&success).expect("serialize");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["value"]["value"], 42);

        let failure = Payload::Failure {
            kind: FailureKind::Timeout,
            message: "killed".to_string(),
        };
        assert_eq!(failure.failure(), Some((FailureKind::Timeout, "killed")));
        assert!(!failure.is_success());
    }
}
