//! HTTP route handlers for the block API.
//!
//! Cycle-running handlers execute the synchronous engine on the blocking
//! thread pool and bridge its progress events onto the broadcast channel.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, patch, post};
use blocks::core::types::{BlockStatus, Payload};
use blocks::io::generator::CommandGenerator;
use blocks::io::sandbox::ProcessSandbox;
use blocks::io::store::{BlockBusyError, BlockNotFoundError, StorageError};
use blocks::ops::{self, CreateBlockRequest};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::state::{AppState, ServerEvent};

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/blocks", get(list_blocks).post(create_block))
        .route(
            "/blocks/{id}",
            get(get_block).put(edit_block).delete(disable_block),
        )
        .route("/blocks/{id}/layout", patch(update_layout))
        .route("/blocks/{id}/heal", post(heal_block))
        .route("/blocks/{id}/refresh", post(refresh_block))
        .route("/blocks/{id}/data", get(get_block_data))
        .route("/blocks/{id}/versions", get(list_versions))
        .route(
            "/blocks/{id}/versions/{version}/render",
            get(get_render_source),
        )
}

#[derive(Deserialize)]
struct CreateBlockBody {
    prompt: String,
    title: Option<String>,
    refresh_interval_secs: Option<u64>,
}

#[derive(Deserialize)]
struct EditBlockBody {
    prompt: String,
}

#[derive(Deserialize)]
struct LayoutBody {
    layout: Value,
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/blocks - all block records.
async fn list_blocks(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let blocks = state.store.list_blocks()?;
        Ok(json!({ "blocks": blocks }))
    })
    .await?;
    Ok(Json(value))
}

/// GET /api/blocks/:id - one block record.
async fn get_block(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let block = state.store.load_block(id)?;
        Ok(serde_json::to_value(block)?)
    })
    .await?;
    Ok(Json(value))
}

/// POST /api/blocks - create a block and run its first generation cycle.
async fn create_block(
    State(state): State<AppState>,
    Json(body): Json<CreateBlockBody>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let generator = CommandGenerator::new(state.config.generator.command.clone());
        let sandbox = ProcessSandbox::new(state.config.sandbox.command.clone());
        let events = state.clone();
        let (block, outcome) = ops::create_block(
            &state.store,
            &generator,
            &sandbox,
            &state.config,
            &state.locks,
            &CreateBlockRequest {
                prompt: body.prompt,
                title: body.title,
                refresh_interval_secs: body.refresh_interval_secs,
            },
            |event| events.emit(ServerEvent::Cycle(event.clone())),
        )?;
        Ok(json!({ "block": block, "outcome": outcome }))
    })
    .await?;
    Ok(Json(value))
}

/// PUT /api/blocks/:id - replace the prompt and regenerate.
async fn edit_block(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<EditBlockBody>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let generator = CommandGenerator::new(state.config.generator.command.clone());
        let sandbox = ProcessSandbox::new(state.config.sandbox.command.clone());
        let events = state.clone();
        let (block, outcome) = ops::edit_block(
            &state.store,
            &generator,
            &sandbox,
            &state.config,
            &state.locks,
            id,
            &body.prompt,
            |event| events.emit(ServerEvent::Cycle(event.clone())),
        )?;
        Ok(json!({ "block": block, "outcome": outcome }))
    })
    .await?;
    Ok(Json(value))
}

/// POST /api/blocks/:id/heal - regenerate from the latest runtime failure.
async fn heal_block(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let generator = CommandGenerator::new(state.config.generator.command.clone());
        let sandbox = ProcessSandbox::new(state.config.sandbox.command.clone());
        let events = state.clone();
        let (block, outcome) = ops::heal_block(
            &state.store,
            &generator,
            &sandbox,
            &state.config,
            &state.locks,
            id,
            |event| events.emit(ServerEvent::Cycle(event.clone())),
        )?;
        Ok(json!({ "block": block, "outcome": outcome }))
    })
    .await?;
    Ok(Json(value))
}

/// POST /api/blocks/:id/refresh - run the active version, no generation.
async fn refresh_block(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let generator = CommandGenerator::new(state.config.generator.command.clone());
        let sandbox = ProcessSandbox::new(state.config.sandbox.command.clone());
        let events = state.clone();
        let outcome = ops::refresh_block(
            &state.store,
            &generator,
            &sandbox,
            &state.config,
            &state.locks,
            id,
            |event| events.emit(ServerEvent::Cycle(event.clone())),
        )?;
        state.emit(ServerEvent::RefreshCompleted {
            block_id: id,
            success: outcome.result.success,
            healed: outcome.healed,
        });
        let body = match &outcome.result.payload {
            Payload::Success { value } => json!({
                "success": true,
                "healed": outcome.healed,
                "payload": value,
            }),
            Payload::Failure { kind, message } => json!({
                "success": false,
                "healed": outcome.healed,
                "error": { "kind": kind, "message": message },
            }),
        };
        Ok(body)
    })
    .await?;
    Ok(Json(value))
}

/// GET /api/blocks/:id/data - last cached payload.
async fn get_block_data(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        // 404s for unknown blocks before consulting the cache.
        state.store.load_block(id)?;
        Ok(state.store.read_payload_cache(id)?)
    })
    .await?;
    match value {
        Some(cached) => Ok(Json(json!({
            "value": cached.value,
            "fetched_at": cached.fetched_at,
        }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /api/blocks/:id/versions - version lineage.
async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        state.store.load_block(id)?;
        let versions = state.store.list_versions(id)?;
        Ok(json!({ "versions": versions }))
    })
    .await?;
    Ok(Json(value))
}

/// GET /api/blocks/:id/versions/:version/render - render source for the
/// dashboard frontend.
async fn get_render_source(
    State(state): State<AppState>,
    Path((id, version)): Path<(i64, u32)>,
) -> Result<String, StatusCode> {
    run_engine(move || {
        state.store.load_block(id)?;
        Ok(state.store.read_render_source(id, version)?)
    })
    .await
}

/// PATCH /api/blocks/:id/layout - replace opaque layout metadata.
async fn update_layout(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<LayoutBody>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let block = state.store.update_layout(id, body.layout)?;
        Ok(serde_json::to_value(block)?)
    })
    .await?;
    Ok(Json(value))
}

/// DELETE /api/blocks/:id - disable the block (terminal until re-enabled).
async fn disable_block(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let value = run_engine(move || {
        let block = state.store.set_status(id, BlockStatus::Disabled)?;
        state.emit(ServerEvent::BlockDisabled { block_id: id });
        Ok(serde_json::to_value(block)?)
    })
    .await?;
    Ok(Json(value))
}

/// Run a synchronous engine operation on the blocking pool and map failures
/// onto HTTP statuses.
async fn run_engine<T, F>(f: F) -> Result<T, StatusCode>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            warn!(error = %format!("{err:#}"), "engine operation failed");
            Err(error_status(&err))
        }
        Err(err) => {
            warn!(error = %err, "engine task panicked");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn error_status(err: &anyhow::Error) -> StatusCode {
    if err.downcast_ref::<BlockNotFoundError>().is_some() {
        StatusCode::NOT_FOUND
    } else if err.downcast_ref::<BlockBusyError>().is_some() {
        StatusCode::CONFLICT
    } else if err.downcast_ref::<StorageError>().is_some() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    }
}
