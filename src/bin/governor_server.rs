//! governor-server: 受治理的 AI 问答 HTTP 服务
//!
//! Usage:
//!   governor-server [PORT]        Serve on PORT (default from config, 9443)
//!   governor-server --help        Show usage

use ai_governor::admission::AdmissionController;
use ai_governor::answer::{AnswerService, GovernedAnswerer, HttpAnswerService};
use ai_governor::cache::SharedCache;
use ai_governor::config::GovernorConfig;
use ai_governor::server::{router, AppState};
use ai_governor::tracker::ClientActivityTracker;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!(
        r#"governor-server: governed AI answering service

USAGE:
    governor-server [PORT]

ENVIRONMENT:
    AI_GOVERNOR_CONFIG          YAML config file
    AI_GOVERNOR_REDIS_SERVER    Shared store host (required)
    AI_GOVERNOR_UPSTREAM_URL    Downstream answering service (required)
    AI_GOVERNOR_LOG             Log filter when RUST_LOG is unset (default: info)"#
    );
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let fallback = std::env::var("AI_GOVERNOR_LOG").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(fallback)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "could not listen for SIGTERM");
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
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("help" | "--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some("version" | "--version" | "-V") => {
            println!("governor-server {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    init_tracing();

    let config = GovernorConfig::load()
        .and_then(|c| c.with_port_arg(args.get(1).map(String::as_str)))
        .context("loading configuration")?;
    config.validate_server().context("invalid configuration")?;

    let cache = Arc::new(SharedCache::new(
        Arc::new(config.connector()?),
        config.shared_cache_config(),
    ));
    if !cache.connect().await {
        warn!("starting without the shared store; admission runs on local counts");
    }

    let tracker = Arc::new(ClientActivityTracker::new(config.tracker_config()));
    let admission = Arc::new(AdmissionController::new(
        cache.clone(),
        tracker,
        config.quotas.clone(),
    ));

    let downstream: Arc<dyn AnswerService> =
        Arc::new(HttpAnswerService::new(config.http_answer_config()?)?);
    let gate = Arc::new(config.gate()?);
    info!(
        max_concurrent = gate.snapshot().max,
        pacing_ms = gate.pacing_interval().as_millis() as u64,
        "concurrency gate ready"
    );
    let answerer: Arc<dyn AnswerService> = Arc::new(
        GovernedAnswerer::new(cache.clone(), gate.clone(), downstream)
            .with_keys(config.answer_keys()),
    );

    let state = AppState::new(cache, admission, answerer)
        .with_model(config.upstream.model.clone())
        .with_api_key(config.api_key.clone());
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "governor-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving http")?;

    gate.close();
    info!("governor-server stopped");
    Ok(())
}
