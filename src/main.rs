//! colloquy - supervised multi-participant conversation server
//!
//! A Rust backend coordinating long-lived conversations among a roster of
//! automated and human-proxy participants, with supervisor interrupts,
//! branching rewinds, and concurrent WebSocket viewers per session.

mod api;
mod config;
mod conversation;
mod input;
mod intent;
mod llm;
mod roster;
mod runloop;
mod scheduler;
mod session;

use api::{create_router, AppState};
use config::Config;
use llm::LlmConfig;
use roster::{Participant, Roster, TransitionGraph};
use session::{SessionRegistry, SessionSpec};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colloquy=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    let llm = LlmConfig::from_env().build();
    if let Some(service) = &llm {
        tracing::info!(model = %service.model_id(), "LLM service configured");
    } else {
        tracing::warn!(
            "No LLM API key configured. Set ANTHROPIC_API_KEY; automated \
             participants and model-backed delegates are disabled."
        );
    }

    let registry = Arc::new(SessionRegistry::new(config.clone(), llm));

    // Sessions created on first connection all share this roster until a
    // supervisor rewrites the rules.
    let roster = Roster::new(vec![
        Participant::automated("assistant", "general reasoning and drafting"),
        Participant::automated("researcher", "digging up facts and references"),
        Participant::human_proxy("operator", "the human supervisor"),
    ]);
    let graph = TransitionGraph::fully_connected(&roster);
    let default_spec = SessionSpec { roster, graph };

    // Periodic idle-session sweep
    let sweeper_shutdown = CancellationToken::new();
    tokio::spawn(registry.clone().run_sweeper(sweeper_shutdown.clone()));

    let state = AppState::new(registry, default_spec);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("colloquy server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    sweeper_shutdown.cancel();
    Ok(())
}
