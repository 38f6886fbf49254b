//! The generate → execute → diagnose → regenerate loop.
//!
//! One cycle drives bounded sequential attempts for a single block. Each
//! attempt assembles the accumulated context, asks the generator for a
//! candidate, executes it in the sandbox, and classifies the outcome. The
//! first success promotes the candidate; exhaustion persists the terminal
//! candidate as failed and transitions the block to `error`.
//!
//! Attempts are strictly sequential: each prompt depends on the previous
//! attempt's diagnosis, so speculative parallelism would reorder context.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::classifier::{classify, classify_message};
use crate::core::context::{CycleContext, FailureNote, SeedContext};
use crate::core::types::{
    Candidate, CycleEvent, Diagnosis, ExecutionKind, FailureKind, FinalStatus,
};
use crate::io::config::EngineConfig;
use crate::io::exec_log::{ExecutionLogRow, append_row};
use crate::io::generator::{GenerateRequest, Generator, parse_candidate};
use crate::io::prompt::PromptEngine;
use crate::io::sandbox::{ExecRequest, Sandbox};
use crate::io::store::{BlockStore, VersionRecord};

/// Parameters for one cycle invocation.
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub block_id: i64,
    /// Task description driving generation.
    pub task: String,
    /// Context the caller seeds the cycle with (edit/heal source, runtime
    /// failure).
    pub seed: SeedContext,
    /// Retry budget, >= 1.
    pub max_iterations: u32,
    /// Execution type stamped on audit rows (`fetch` for create/edit cycles,
    /// `heal` for heal cycles).
    pub execution_kind: ExecutionKind,
}

/// One attempt's outcome, kept for the user-facing explanation.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub version: u32,
    /// `None` on the successful attempt.
    pub diagnosis: Option<Diagnosis>,
}

/// Terminal result of a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub final_status: FinalStatus,
    /// The promoted version on success; the terminal failed version on
    /// exhaustion.
    pub version: VersionRecord,
    /// Full attempt history, oldest first.
    pub attempts: Vec<AttemptRecord>,
}

/// Drive one bounded generation cycle for a block.
///
/// Side effects per attempt: exactly one version and one execution log row.
/// Progress is reported through `emit` in deterministic order. Storage
/// failures abort the cycle immediately and propagate unchanged.
#[instrument(skip_all, fields(block_id = request.block_id, max_iterations = request.max_iterations))]
pub fn run_cycle<G: Generator, S: Sandbox>(
    store: &BlockStore,
    generator: &G,
    sandbox: &S,
    config: &EngineConfig,
    request: &CycleRequest,
    mut emit: impl FnMut(&CycleEvent),
) -> Result<CycleOutcome> {
    if request.max_iterations == 0 {
        return Err(anyhow!("max_iterations must be >= 1"));
    }
    let prompts = PromptEngine::new();
    let mut context = CycleContext::new(request.task.clone(), request.seed.clone());
    let mut attempts = Vec::new();

    for attempt in 1..=request.max_iterations {
        emit(&CycleEvent::AttemptStarted {
            block_id: request.block_id,
            attempt,
        });
        let started = Instant::now();

        let produced = produce_candidate(generator, config, &prompts, &context);
        let (candidate, failure) = match produced {
            Produced::Candidate(candidate) => {
                match execute_candidate(store, sandbox, config, request, &candidate)? {
                    Executed::Success { payload_duration_ms } => {
                        let version = store.promote(request.block_id, &candidate)?;
                        log_attempt(
                            store,
                            request,
                            version.version,
                            true,
                            None,
                            payload_duration_ms,
                        )?;
                        store.cleanup_old_versions(request.block_id, config.keep_versions)?;
                        attempts.push(AttemptRecord {
                            attempt,
                            version: version.version,
                            diagnosis: None,
                        });
                        emit(&CycleEvent::Succeeded {
                            block_id: request.block_id,
                            version: version.version,
                        });
                        info!(attempt, version = version.version, "cycle succeeded");
                        return Ok(CycleOutcome {
                            final_status: FinalStatus::Succeeded,
                            version,
                            attempts,
                        });
                    }
                    Executed::Failure {
                        diagnosis,
                        raw_detail,
                        duration_ms,
                    } => (
                        candidate,
                        AttemptFailure {
                            diagnosis,
                            raw_detail,
                            duration_ms,
                        },
                    ),
                }
            }
            Produced::GenerationFailure { candidate, diagnosis } => {
                let duration_ms = started.elapsed().as_millis() as u64;
                (
                    candidate,
                    AttemptFailure {
                        raw_detail: diagnosis.summary.clone(),
                        diagnosis,
                        duration_ms,
                    },
                )
            }
        };

        let terminal = attempt == request.max_iterations;
        let version = if terminal {
            store.record_failed(request.block_id, &candidate, &failure.diagnosis)?
        } else {
            store.record_deprecated(request.block_id, &candidate, &failure.diagnosis)?
        };
        log_attempt(
            store,
            request,
            version.version,
            false,
            Some(failure.raw_detail.clone()),
            failure.duration_ms,
        )?;

        warn!(
            attempt,
            kind = failure.diagnosis.kind.as_str(),
            "attempt failed"
        );
        emit(&CycleEvent::AttemptFailed {
            block_id: request.block_id,
            attempt,
            kind: failure.diagnosis.kind,
            summary: failure.diagnosis.summary.clone(),
        });
        context.push_failure(FailureNote::from_diagnosis(attempt, &failure.diagnosis));
        attempts.push(AttemptRecord {
            attempt,
            version: version.version,
            diagnosis: Some(failure.diagnosis),
        });

        if terminal {
            emit(&CycleEvent::Exhausted {
                block_id: request.block_id,
                attempts: attempt,
            });
            info!(attempts = attempt, "cycle exhausted");
            return Ok(CycleOutcome {
                final_status: FinalStatus::Exhausted,
                version,
                attempts,
            });
        }
    }

    // The loop returns on success or on the terminal attempt.
    Err(anyhow!("cycle ended without a terminal attempt"))
}

struct AttemptFailure {
    diagnosis: Diagnosis,
    /// Raw detail for the audit log; user surfaces only see the diagnosis.
    raw_detail: String,
    duration_ms: u64,
}

enum Produced {
    Candidate(Candidate),
    GenerationFailure {
        candidate: Candidate,
        diagnosis: Diagnosis,
    },
}

/// Call the generator and parse its response. Backend failures and malformed
/// output both classify as `generation_error` without touching the sandbox;
/// the raw response is retained as the version's fetch source for inspection.
fn produce_candidate<G: Generator>(
    generator: &G,
    config: &EngineConfig,
    prompts: &PromptEngine,
    context: &CycleContext,
) -> Produced {
    let prompt = match prompts.render(context) {
        Ok(prompt) => prompt,
        Err(err) => {
            return generation_failure(String::new(), &format!("prompt rendering failed: {err:#}"));
        }
    };

    let raw = match generator.generate(&GenerateRequest {
        prompt,
        timeout: Duration::from_secs(config.generator.timeout_secs),
        output_limit_bytes: config.generator.output_limit_bytes,
    }) {
        Ok(raw) => raw,
        Err(err) => {
            return generation_failure(String::new(), &format!("generator failed: {err:#}"));
        }
    };

    match parse_candidate(&raw) {
        Ok(candidate) => Produced::Candidate(candidate),
        Err(err) => generation_failure(raw, &format!("malformed candidate: {err:#}")),
    }
}

fn generation_failure(raw: String, message: &str) -> Produced {
    let diagnosis = classify_message(FailureKind::GenerationError, message);
    Produced::GenerationFailure {
        candidate: Candidate {
            fetch_source: raw,
            render_source: String::new(),
            explanation: diagnosis.summary.clone(),
        },
        diagnosis,
    }
}

enum Executed {
    Success { payload_duration_ms: u64 },
    Failure {
        diagnosis: Diagnosis,
        raw_detail: String,
        duration_ms: u64,
    },
}

fn execute_candidate<S: Sandbox>(
    store: &BlockStore,
    sandbox: &S,
    config: &EngineConfig,
    request: &CycleRequest,
    candidate: &Candidate,
) -> Result<Executed> {
    // Single-flight per block means this number is still free when the
    // version is written after execution.
    let version = store.next_version(request.block_id)?;
    let exec_request = ExecRequest {
        workdir: store.sandbox_dir(request.block_id, version),
        fetch_source: candidate.fetch_source.clone(),
        timeout: Duration::from_secs(config.sandbox.timeout_secs),
        output_limit_bytes: config.sandbox.output_limit_bytes,
    };
    let result = sandbox.execute(&exec_request)?;

    if result.success {
        if let crate::core::types::Payload::Success { value } = &result.payload {
            store.write_payload_cache(request.block_id, value)?;
        }
        return Ok(Executed::Success {
            payload_duration_ms: result.duration_ms,
        });
    }

    let diagnosis = classify(&result);
    // Raw stderr (or the raw failure message) goes to the audit log only.
    let raw_detail = if result.stderr.trim().is_empty() {
        result.failure_message().to_string()
    } else {
        result.stderr.clone()
    };
    Ok(Executed::Failure {
        diagnosis,
        raw_detail,
        duration_ms: result.duration_ms,
    })
}

fn log_attempt(
    store: &BlockStore,
    request: &CycleRequest,
    version: u32,
    success: bool,
    error_message: Option<String>,
    duration_ms: u64,
) -> Result<()> {
    append_row(
        &store.exec_log_path(request.block_id),
        &ExecutionLogRow {
            block_id: request.block_id,
            version,
            execution_type: request.execution_kind,
            success,
            error_message,
            duration_ms,
            created_at: chrono::Utc::now(),
        },
    )
}
