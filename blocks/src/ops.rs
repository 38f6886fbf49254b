//! Block operations: create, edit, heal, refresh.
//!
//! These orchestrate the store, the generation cycle, and the sandbox into
//! the caller-facing surface. Every operation takes the per-block
//! single-flight guard before touching the block's version lineage; a second
//! request for an in-flight block fails with `BlockBusyError`.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::context::SeedContext;
use crate::core::types::{
    BlockStatus, CycleEvent, ExecutionKind, ExecutionResult, FinalStatus,
};
use crate::cycle::{CycleOutcome, CycleRequest, run_cycle};
use crate::io::config::EngineConfig;
use crate::io::exec_log::{ExecutionLogRow, append_row, last_failure, read_rows};
use crate::io::generator::Generator;
use crate::io::sandbox::{ExecRequest, Sandbox};
use crate::io::store::{BlockLocks, BlockRecord, BlockStore};

/// Window within which a second refresh failure suppresses auto-healing.
fn auto_heal_window() -> ChronoDuration {
    ChronoDuration::hours(1)
}

/// Parameters for [`create_block`].
#[derive(Debug, Clone)]
pub struct CreateBlockRequest {
    pub prompt: String,
    /// Optional title; derived from the prompt when absent.
    pub title: Option<String>,
    /// Optional refresh interval; config default when absent.
    pub refresh_interval_secs: Option<u64>,
}

/// Outcome of a refresh, including whether a heal cycle was triggered.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub result: ExecutionResult,
    pub healed: bool,
}

/// Create a block and run its first generation cycle.
#[instrument(skip_all, fields(prompt_len = request.prompt.len()))]
pub fn create_block<G: Generator, S: Sandbox>(
    store: &BlockStore,
    generator: &G,
    sandbox: &S,
    config: &EngineConfig,
    locks: &BlockLocks,
    request: &CreateBlockRequest,
    mut emit: impl FnMut(&CycleEvent),
) -> Result<(BlockRecord, CycleOutcome)> {
    let title = request
        .title
        .clone()
        .unwrap_or_else(|| derive_title(&request.prompt));
    let refresh_interval = request
        .refresh_interval_secs
        .unwrap_or(config.default_refresh_interval_secs);
    let block = store.create_block(
        &request.prompt,
        &title,
        refresh_interval,
        json!({"x": 0, "y": 0, "w": 6, "h": 4}),
    )?;
    let _guard = locks.try_acquire(block.id)?;
    info!(block_id = block.id, title = %title, "creating block");

    let outcome = run_cycle(
        store,
        generator,
        sandbox,
        config,
        &CycleRequest {
            block_id: block.id,
            task: request.prompt.clone(),
            seed: SeedContext::default(),
            max_iterations: config.max_iterations,
            execution_kind: ExecutionKind::Fetch,
        },
        &mut emit,
    )?;

    let block = store.load_block(block.id)?;
    Ok((block, outcome))
}

/// Re-run the loop for an edited prompt, seeded with the active version's
/// fetch source as context.
#[instrument(skip_all, fields(block_id))]
pub fn edit_block<G: Generator, S: Sandbox>(
    store: &BlockStore,
    generator: &G,
    sandbox: &S,
    config: &EngineConfig,
    locks: &BlockLocks,
    block_id: i64,
    new_prompt: &str,
    mut emit: impl FnMut(&CycleEvent),
) -> Result<(BlockRecord, CycleOutcome)> {
    let _guard = locks.try_acquire(block_id)?;
    let previous_source = store
        .get_active(block_id)?
        .map(|active| active.fetch_source);
    store.append_prompt(block_id, new_prompt)?;

    let outcome = run_cycle(
        store,
        generator,
        sandbox,
        config,
        &CycleRequest {
            block_id,
            task: new_prompt.to_string(),
            seed: SeedContext {
                previous_fetch_source: previous_source,
                runtime_failure: None,
            },
            max_iterations: config.max_iterations,
            execution_kind: ExecutionKind::Fetch,
        },
        &mut emit,
    )?;

    let block = store.load_block(block_id)?;
    Ok((block, outcome))
}

/// Re-run the loop to repair a block, seeded with its most recent runtime
/// failure and the failing fetch source.
#[instrument(skip_all, fields(block_id))]
pub fn heal_block<G: Generator, S: Sandbox>(
    store: &BlockStore,
    generator: &G,
    sandbox: &S,
    config: &EngineConfig,
    locks: &BlockLocks,
    block_id: i64,
    mut emit: impl FnMut(&CycleEvent),
) -> Result<(BlockRecord, CycleOutcome)> {
    let _guard = locks.try_acquire(block_id)?;
    heal_block_locked(store, generator, sandbox, config, block_id, &mut emit)
}

fn heal_block_locked<G: Generator, S: Sandbox>(
    store: &BlockStore,
    generator: &G,
    sandbox: &S,
    config: &EngineConfig,
    block_id: i64,
    emit: &mut impl FnMut(&CycleEvent),
) -> Result<(BlockRecord, CycleOutcome)> {
    let block = store.load_block(block_id)?;
    let failing_source = current_fetch_source(store, &block)?;
    let failure = last_failure(&store.exec_log_path(block_id))?;
    if failing_source.is_none() && failure.is_none() {
        return Err(anyhow!(
            "cannot heal block {block_id}: no version or failure recorded"
        ));
    }
    let runtime_failure = failure
        .and_then(|row| row.error_message)
        .unwrap_or_else(|| "unknown runtime failure".to_string());
    info!(block_id, "healing block");

    let outcome = run_cycle(
        store,
        generator,
        sandbox,
        config,
        &CycleRequest {
            block_id,
            task: block.prompt.clone(),
            seed: SeedContext {
                previous_fetch_source: failing_source,
                runtime_failure: Some(runtime_failure),
            },
            max_iterations: config.max_iterations,
            execution_kind: ExecutionKind::Heal,
        },
        emit,
    )?;

    let block = store.load_block(block_id)?;
    Ok((block, outcome))
}

/// Run the active version through the sandbox without generation.
///
/// On success the payload cache is refreshed. On failure the block
/// transitions to `error`; if this is the first failure within the auto-heal
/// window, one heal cycle runs followed by one refresh retry.
#[instrument(skip_all, fields(block_id))]
pub fn refresh_block<G: Generator, S: Sandbox>(
    store: &BlockStore,
    generator: &G,
    sandbox: &S,
    config: &EngineConfig,
    locks: &BlockLocks,
    block_id: i64,
    mut emit: impl FnMut(&CycleEvent),
) -> Result<RefreshOutcome> {
    let _guard = locks.try_acquire(block_id)?;
    let result = refresh_block_locked(store, sandbox, config, block_id)?;
    if result.success {
        return Ok(RefreshOutcome {
            result,
            healed: false,
        });
    }

    if !should_auto_heal(store, block_id)? {
        return Ok(RefreshOutcome {
            result,
            healed: false,
        });
    }

    warn!(block_id, "refresh failed, attempting auto-heal");
    let (_, outcome) = heal_block_locked(store, generator, sandbox, config, block_id, &mut emit)?;
    if outcome.final_status != FinalStatus::Succeeded {
        return Ok(RefreshOutcome {
            result,
            healed: false,
        });
    }

    let retried = refresh_block_locked(store, sandbox, config, block_id)?;
    Ok(RefreshOutcome {
        result: retried,
        healed: true,
    })
}

/// Execute the active version once and log the run. Caller holds the guard.
fn refresh_block_locked<S: Sandbox>(
    store: &BlockStore,
    sandbox: &S,
    config: &EngineConfig,
    block_id: i64,
) -> Result<ExecutionResult> {
    let active = store
        .get_active(block_id)?
        .with_context(|| format!("block {block_id} has no active version"))?;
    let version = active.record.version;

    let result = sandbox.execute(&ExecRequest {
        workdir: store.sandbox_dir(block_id, version),
        fetch_source: active.fetch_source,
        timeout: Duration::from_secs(config.sandbox.timeout_secs),
        output_limit_bytes: config.sandbox.output_limit_bytes,
    })?;

    append_row(
        &store.exec_log_path(block_id),
        &ExecutionLogRow {
            block_id,
            version,
            execution_type: ExecutionKind::Fetch,
            success: result.success,
            error_message: (!result.success).then(|| raw_detail(&result)),
            duration_ms: result.duration_ms,
            created_at: Utc::now(),
        },
    )?;

    if result.success {
        if let crate::core::types::Payload::Success { value } = &result.payload {
            store.write_payload_cache(block_id, value)?;
        }
    } else {
        warn!(block_id, version, "refresh failed");
        store.set_status(block_id, BlockStatus::Error)?;
    }
    Ok(result)
}

/// Auto-heal only on the first failure inside the window; repeated failures
/// mean healing already ran (or the source is persistently down) and the
/// block stays in `error` for a manual heal.
fn should_auto_heal(store: &BlockStore, block_id: i64) -> Result<bool> {
    let rows = read_rows(&store.exec_log_path(block_id))?;
    let cutoff = Utc::now() - auto_heal_window();
    let recent_failures = rows
        .iter()
        .filter(|row| !row.success && row.created_at > cutoff)
        .count();
    Ok(recent_failures <= 1)
}

fn current_fetch_source(store: &BlockStore, block: &BlockRecord) -> Result<Option<String>> {
    match block.current_version {
        Some(version) => Ok(Some(store.read_fetch_source(block.id, version)?)),
        None => Ok(None),
    }
}

fn raw_detail(result: &ExecutionResult) -> String {
    if result.stderr.trim().is_empty() {
        result.failure_message().to_string()
    } else {
        result.stderr.clone()
    }
}

/// Derive a block title from the first words of the prompt.
fn derive_title(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .take(4)
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use crate::io::store::BlockBusyError;
    use crate::test_support::{
        ScriptedGenerator, ScriptedSandbox, candidate_json, failing, succeeding, test_store,
    };
    use serde_json::json;

    #[test]
    fn create_derives_a_title_and_promotes_on_success() {
        let (_temp, store) = test_store();
        let config = EngineConfig::default();
        let locks = BlockLocks::new();
        let generator = ScriptedGenerator::always(candidate_json("first"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 42})));

        let (block, outcome) = create_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            &CreateBlockRequest {
                prompt: "bitcoin price in usd right now".to_string(),
                title: None,
                refresh_interval_secs: None,
            },
            |_| {},
        )
        .expect("create");

        assert_eq!(block.title, "Bitcoin Price In Usd");
        assert_eq!(block.status, BlockStatus::Active);
        assert_eq!(block.current_version, Some(1));
        assert_eq!(outcome.final_status, FinalStatus::Succeeded);
        assert_eq!(block.refresh_interval_secs, 3600);
    }

    #[test]
    fn edit_seeds_the_cycle_with_the_active_source() {
        let (_temp, store) = test_store();
        let config = EngineConfig::default();
        let locks = BlockLocks::new();
        let generator = ScriptedGenerator::always(candidate_json("v1"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 1})));

        let (block, _) = create_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            &CreateBlockRequest {
                prompt: "weather in tokyo".to_string(),
                title: None,
                refresh_interval_secs: None,
            },
            |_| {},
        )
        .expect("create");

        let generator = ScriptedGenerator::always(candidate_json("v2"));
        let (edited, outcome) = edit_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            block.id,
            "weather in tokyo with humidity",
            |_| {},
        )
        .expect("edit");

        assert_eq!(edited.current_version, Some(2));
        assert_eq!(edited.prompt, "weather in tokyo with humidity");
        assert_eq!(edited.prompt_history, vec!["weather in tokyo".to_string()]);
        assert_eq!(outcome.final_status, FinalStatus::Succeeded);

        let prompt = generator.prompts().pop().expect("prompt");
        assert!(prompt.contains("Current implementation"));
        assert!(prompt.contains("# v1"));
    }

    #[test]
    fn heal_uses_the_last_runtime_failure_as_context() {
        let (_temp, store) = test_store();
        let config = EngineConfig::default();
        let locks = BlockLocks::new();
        let generator = ScriptedGenerator::always(candidate_json("v1"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 1})));

        let (block, _) = create_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            &CreateBlockRequest {
                prompt: "hn front page".to_string(),
                title: None,
                refresh_interval_secs: None,
            },
            |_| {},
        )
        .expect("create");

        // Runtime failure: the active version starts failing on refresh, and
        // the automatic heal cycle keeps failing the same way.
        let sandbox = ScriptedSandbox::always(failing(
            FailureKind::ExecutionError,
            "requests.exceptions.HTTPError: 403 Forbidden",
        ));
        let refreshed = refresh_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            block.id,
            |_| {},
        )
        .expect("refresh");
        assert!(!refreshed.result.success);
        assert!(!refreshed.healed);

        let generator = ScriptedGenerator::always(candidate_json("healed"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 2})));
        let (healed, outcome) = heal_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            block.id,
            |_| {},
        )
        .expect("heal");

        assert_eq!(healed.status, BlockStatus::Active);
        assert_eq!(outcome.final_status, FinalStatus::Succeeded);
        let prompt = generator.prompts().pop().expect("prompt");
        assert!(prompt.contains("Block Healer Contract"));
        assert!(prompt.contains("403 Forbidden"));
    }

    #[test]
    fn refresh_runs_the_active_version_without_generation() {
        let (_temp, store) = test_store();
        let config = EngineConfig::default();
        let locks = BlockLocks::new();
        let generator = ScriptedGenerator::always(candidate_json("v1"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 1})));

        let (block, _) = create_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            &CreateBlockRequest {
                prompt: "iss position".to_string(),
                title: None,
                refresh_interval_secs: None,
            },
            |_| {},
        )
        .expect("create");

        let refresh_generator = ScriptedGenerator::new(Vec::new());
        let refresh_sandbox = ScriptedSandbox::always(succeeding(json!({"value": 2})));
        let outcome = refresh_block(
            &store,
            &refresh_generator,
            &refresh_sandbox,
            &config,
            &locks,
            block.id,
            |_| {},
        )
        .expect("refresh");

        assert!(outcome.result.success);
        assert!(!outcome.healed);
        assert_eq!(refresh_generator.calls(), 0, "refresh never generates");
        let cached = store
            .read_payload_cache(block.id)
            .expect("read")
            .expect("cached");
        assert_eq!(cached.value, json!({"value": 2}));
    }

    #[test]
    fn first_refresh_failure_triggers_one_auto_heal() {
        let (_temp, store) = test_store();
        let config = EngineConfig::default();
        let locks = BlockLocks::new();
        let generator = ScriptedGenerator::always(candidate_json("v1"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 1})));

        let (block, _) = create_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            &CreateBlockRequest {
                prompt: "btc price".to_string(),
                title: None,
                refresh_interval_secs: None,
            },
            |_| {},
        )
        .expect("create");

        // refresh fails -> heal candidate executes and succeeds -> retry succeeds
        let heal_generator = ScriptedGenerator::always(candidate_json("healed"));
        let sandbox = ScriptedSandbox::new(vec![
            failing(FailureKind::ExecutionError, "403 Forbidden"),
            succeeding(json!({"value": 2})),
            succeeding(json!({"value": 3})),
        ]);

        let outcome = refresh_block(
            &store,
            &heal_generator,
            &sandbox,
            &config,
            &locks,
            block.id,
            |_| {},
        )
        .expect("refresh");

        assert!(outcome.healed);
        assert!(outcome.result.success);
        let reloaded = store.load_block(block.id).expect("load");
        assert_eq!(reloaded.status, BlockStatus::Active);
        assert_eq!(reloaded.current_version, Some(2));
    }

    #[test]
    fn operations_respect_the_single_flight_guard() {
        let (_temp, store) = test_store();
        let config = EngineConfig::default();
        let locks = BlockLocks::new();
        let generator = ScriptedGenerator::always(candidate_json("v1"));
        let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 1})));

        let (block, _) = create_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            &CreateBlockRequest {
                prompt: "btc price".to_string(),
                title: None,
                refresh_interval_secs: None,
            },
            |_| {},
        )
        .expect("create");

        let _held = locks.try_acquire(block.id).expect("hold");
        let err = refresh_block(
            &store,
            &generator,
            &sandbox,
            &config,
            &locks,
            block.id,
            |_| {},
        )
        .unwrap_err();
        assert!(err.downcast_ref::<BlockBusyError>().is_some());
    }

    #[test]
    fn title_derivation_takes_the_first_four_words() {
        assert_eq!(derive_title("show me the latest hacker news"), "Show Me The Latest");
        assert_eq!(derive_title("btc"), "Btc");
    }
}
