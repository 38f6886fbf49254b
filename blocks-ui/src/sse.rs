//! Server-Sent Events stream of engine activity.
//!
//! Cycle progress, refresh outcomes, and block lifecycle changes are emitted
//! in-process onto a broadcast channel; each SSE client reads its own
//! subscription.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::{AppState, ServerEvent};

fn payload(event: &ServerEvent) -> serde_json::Value {
    match event {
        // Cycle events carry their own `type` tag.
        ServerEvent::Cycle(cycle_event) => {
            serde_json::to_value(cycle_event).unwrap_or_else(|_| json!({"type": "cycle"}))
        }
        ServerEvent::RefreshCompleted {
            block_id,
            success,
            healed,
        } => json!({
            "type": "refresh_completed",
            "block_id": block_id,
            "success": success,
            "healed": healed,
        }),
        ServerEvent::BlockDisabled { block_id } => json!({
            "type": "block_disabled",
            "block_id": block_id,
        }),
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        // Send initial connected event
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(server_event) => {
                    if let Ok(json) = serde_json::to_string(&payload(&server_event)) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocks::core::types::{CycleEvent, FailureKind};

    #[test]
    fn cycle_events_keep_their_own_type_tag() {
        let event = ServerEvent::Cycle(CycleEvent::AttemptFailed {
            block_id: 3,
            attempt: 2,
            kind: FailureKind::Timeout,
            summary: "timed out".to_string(),
        });
        let value = payload(&event);
        assert_eq!(value["type"], "attempt_failed");
        assert_eq!(value["block_id"], 3);
        assert_eq!(value["kind"], "timeout");
    }

    #[test]
    fn refresh_events_serialize_flat() {
        let event = ServerEvent::RefreshCompleted {
            block_id: 9,
            success: false,
            healed: true,
        };
        let value = payload(&event);
        assert_eq!(value["type"], "refresh_completed");
        assert_eq!(value["success"], false);
        assert_eq!(value["healed"], true);
    }
}
