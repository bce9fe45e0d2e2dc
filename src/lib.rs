use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod collaborators;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod handlers;
pub mod metrics;
pub mod rate_limit;
pub mod readings;
pub mod state;

use collaborators::openai::OpenAiGenerator;
use collaborators::supabase::Supabase;
use config::Args;
use entitlement::EntitlementResolver;
use handlers::{health_handler, metrics_handler, reading_handler};
use rate_limit::{RateLimiter, cleanup_task};
pub use state::AppState;

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/reading", post(reading_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(args: Args) -> std::io::Result<()> {
    let client = reqwest::Client::new();

    let supabase = Arc::new(Supabase::new(
        client.clone(),
        &args.supabase_url,
        &args.supabase_key,
    ));
    let resolver = EntitlementResolver::new(
        supabase.clone(),
        supabase.clone(),
        supabase,
        args.policy(),
    );
    let generator = Arc::new(OpenAiGenerator::new(
        client,
        &args.openai_url,
        args.openai_api_key.clone(),
        &args.openai_model,
        args.max_tokens,
        args.temperature,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(args.rate_limit, args.rate_window()));
    tokio::spawn(cleanup_task(rate_limiter.clone(), args.cleanup_interval()));

    let state = AppState::new(rate_limiter, resolver, generator, args.generation_timeout());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Reading gateway running on http://localhost:{}", args.port);
    info!(
        "Rate limit: {} requests per {} seconds",
        args.rate_limit, args.rate_window
    );
    info!(
        "Free readings: {}, generation timeout: {} seconds",
        args.free_readings_limit, args.generation_timeout
    );

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                tracing::warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
