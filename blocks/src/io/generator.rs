//! Generator abstraction for candidate production.
//!
//! The [`Generator`] trait decouples the iteration controller from the model
//! backend. The real backend spawns a configured command, feeds the rendered
//! prompt on stdin, and reads candidate JSON from stdout. Tests use scripted
//! generators that return predetermined responses without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Candidate;
use crate::io::process::run_command_with_timeout;

const CANDIDATE_SCHEMA: &str = include_str!("../../schemas/candidate.schema.json");

/// Parameters for a generator invocation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Rendered prompt text to feed to the model backend.
    pub prompt: String,
    /// Maximum time to wait for the backend to respond.
    pub timeout: Duration,
    /// Truncate backend output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over candidate generation backends.
pub trait Generator {
    /// Produce the raw response text for the given prompt. Backend failures
    /// are `Err`; the controller folds them into `generation_error`.
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

/// Generator that spawns a configured external command.
pub struct CommandGenerator {
    command: Vec<String>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        info!(command = %self.command[0], "invoking generator");

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run generator command")?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "generator timed out");
            return Err(anyhow!(
                "generator timed out after {:?}",
                request.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        debug!(bytes = output.stdout.len(), "generator responded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse and validate a raw generator response into a candidate.
///
/// Validation failures are ordinary errors; the controller classifies them as
/// `generation_error` without invoking the sandbox.
pub fn parse_candidate(raw: &str) -> Result<Candidate> {
    let value: Value =
        serde_json::from_str(raw.trim()).context("candidate response is not valid JSON")?;
    validate_candidate_schema(&value)?;
    let candidate: Candidate =
        serde_json::from_value(value).context("deserialize candidate")?;
    Ok(candidate)
}

fn validate_candidate_schema(value: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(CANDIDATE_SCHEMA).context("parse candidate schema")?;
    let compiled =
        validator_for(&schema).map_err(|err| anyhow!("invalid candidate schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "candidate schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
