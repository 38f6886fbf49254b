//! Shared application state for the block API server.

use std::path::PathBuf;
use std::sync::Arc;

use blocks::core::types::CycleEvent;
use blocks::io::config::EngineConfig;
use blocks::io::store::{BlockLocks, BlockStore};
use tokio::sync::broadcast;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Progress event from an in-flight generation cycle.
    Cycle(CycleEvent),
    /// A refresh finished (manual or scheduled).
    RefreshCompleted {
        block_id: i64,
        success: bool,
        healed: bool,
    },
    /// A block was disabled.
    BlockDisabled { block_id: i64 },
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: BlockStore,
    pub config: EngineConfig,
    /// Single-flight registry: one in-flight cycle or refresh per block.
    pub locks: BlockLocks,
    /// Broadcast sender for server events.
    pub event_tx: Arc<broadcast::Sender<ServerEvent>>,
}

impl AppState {
    pub fn new(data_dir: PathBuf, config: EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            store: BlockStore::new(data_dir),
            config,
            locks: BlockLocks::new(),
            event_tx: Arc::new(event_tx),
        }
    }

    /// Emit a server event. Send failures just mean no subscriber is listening.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}
