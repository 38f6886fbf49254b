//! Block API server - serves the dashboard frontend and drives the engine.

mod routes;
mod scheduler;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::get;
use blocks::io::config::load_config;
use blocks::io::store::BlockStore;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "blocks-ui")]
#[command(about = "HTTP API and event stream for the block engine")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Engine data directory
    #[arg(long, default_value = ".blocks")]
    data_dir: PathBuf,

    /// Directory containing dashboard static files (defaults to ./ui/dist)
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blocks_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let data_dir = args.data_dir.canonicalize().unwrap_or(args.data_dir);
    info!(data_dir = %data_dir.display(), "starting blocks-ui");

    let store = BlockStore::new(&data_dir);
    store.init()?;
    let config = load_config(&store.config_path())?;

    let state = AppState::new(data_dir.clone(), config);

    // Start the background refresh scheduler
    scheduler::start_scheduler(state.clone());

    // Build router
    let api_router = routes::api_router();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", api_router)
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    // Serve static dashboard files if available
    let ui_dir = args
        .ui_dir
        .unwrap_or_else(|| data_dir.join("ui").join("dist"));

    if ui_dir.exists() {
        info!(ui_dir = %ui_dir.display(), "serving static dashboard files");
        app = app.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
    } else {
        info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
