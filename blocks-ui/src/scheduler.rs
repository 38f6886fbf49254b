//! Background refresh scheduler.
//!
//! Periodically sweeps all blocks and refreshes those whose cached payload is
//! older than their refresh interval. Disabled blocks are skipped; a block
//! with a cycle already in flight is left for the next sweep.

use std::time::Duration;

use anyhow::Result;
use blocks::core::types::BlockStatus;
use blocks::io::generator::CommandGenerator;
use blocks::io::sandbox::ProcessSandbox;
use blocks::io::store::{BlockBusyError, BlockRecord, BlockStore};
use blocks::ops;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::state::{AppState, ServerEvent};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Start the scheduler in a background task.
pub fn start_scheduler(state: AppState) {
    tokio::spawn(async move {
        info!(interval_secs = SWEEP_INTERVAL.as_secs(), "refresh scheduler running");
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let sweep_state = state.clone();
            let result = spawn_blocking(move || sweep(&sweep_state)).await;
            match result {
                Ok(Ok(refreshed)) if refreshed > 0 => {
                    debug!(refreshed, "scheduled refresh sweep complete");
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %format!("{err:#}"), "refresh sweep failed"),
                Err(err) => warn!(error = %err, "refresh sweep panicked"),
            }
        }
    });
}

/// Refresh every due block once. Returns the number of refreshes performed.
fn sweep(state: &AppState) -> Result<usize> {
    let mut refreshed = 0;
    for block in state.store.list_blocks()? {
        if block.status == BlockStatus::Disabled {
            continue;
        }
        if !is_due(&state.store, &block)? {
            continue;
        }

        let generator = CommandGenerator::new(state.config.generator.command.clone());
        let sandbox = ProcessSandbox::new(state.config.sandbox.command.clone());
        let events = state.clone();
        let outcome = ops::refresh_block(
            &state.store,
            &generator,
            &sandbox,
            &state.config,
            &state.locks,
            block.id,
            |event| events.emit(ServerEvent::Cycle(event.clone())),
        );
        match outcome {
            Ok(outcome) => {
                refreshed += 1;
                state.emit(ServerEvent::RefreshCompleted {
                    block_id: block.id,
                    success: outcome.result.success,
                    healed: outcome.healed,
                });
            }
            Err(err) if err.downcast_ref::<BlockBusyError>().is_some() => {
                debug!(block_id = block.id, "block busy, skipping scheduled refresh");
            }
            Err(err) => {
                warn!(block_id = block.id, error = %format!("{err:#}"), "scheduled refresh failed");
            }
        }
    }
    Ok(refreshed)
}

/// A block is due when it has no cached payload yet or the cache is older
/// than its refresh interval. Blocks without an active version are never due.
fn is_due(store: &BlockStore, block: &BlockRecord) -> Result<bool> {
    if store.get_active(block.id)?.is_none() {
        return Ok(false);
    }
    let Some(cached) = store.read_payload_cache(block.id)? else {
        return Ok(true);
    };
    let age_limit = ChronoDuration::seconds(block.refresh_interval_secs as i64);
    Ok(cached.fetched_at + age_limit <= Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocks::core::types::Candidate;
    use serde_json::json;

    fn seeded_store() -> (tempfile::TempDir, BlockStore, i64) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = BlockStore::new(temp.path());
        store.init().expect("init");
        let block = store
            .create_block("btc price", "Btc Price", 60, json!({}))
            .expect("create");
        store
            .promote(
                block.id,
                &Candidate {
                    fetch_source: "class BlockExecutor:\n    pass\n".to_string(),
                    render_source: String::new(),
                    explanation: "test".to_string(),
                },
            )
            .expect("promote");
        (temp, store, block.id)
    }

    #[test]
    fn block_without_cache_is_due() {
        let (_temp, store, id) = seeded_store();
        let block = store.load_block(id).expect("load");
        assert!(is_due(&store, &block).expect("due"));
    }

    #[test]
    fn freshly_cached_block_is_not_due() {
        let (_temp, store, id) = seeded_store();
        store
            .write_payload_cache(id, &json!({"value": 1}))
            .expect("cache");
        let block = store.load_block(id).expect("load");
        assert!(!is_due(&store, &block).expect("due"));
    }

    #[test]
    fn block_without_active_version_is_never_due() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = BlockStore::new(temp.path());
        store.init().expect("init");
        let block = store
            .create_block("btc price", "Btc Price", 60, json!({}))
            .expect("create");
        let record = store.load_block(block.id).expect("load");
        assert!(!is_due(&store, &record).expect("due"));
    }
}
