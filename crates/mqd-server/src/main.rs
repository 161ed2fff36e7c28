mod daemon;
mod logging;
mod pidfile;
mod poller;
mod routes;
mod scheduler;
mod steps;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use mqd_core::config::Config;
use mqd_core::db::Store;
use mqd_review::{GerritClient, ReviewClient};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// State shared between the Daemon Loop and the Inspection API: both hold
/// the same `Store` and `Config`, so a merge the daemon just recorded is
/// visible to the API on the very next request.
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
}

#[derive(Parser, Debug)]
#[command(name = "mqd-server", about = "Merge-queue scheduler and verifier daemon")]
struct Args {
    /// Path to the TOML config file. Falls back to `MQD_CONFIG`, then `./mqd.toml`.
    #[arg(long)]
    config: Option<String>,

    /// Emit JSON-formatted log lines instead of plain text.
    #[arg(long)]
    json_logs: bool,
}

fn resolve_config_path(args: &Args) -> String {
    args.config
        .clone()
        .or_else(|| std::env::var("MQD_CONFIG").ok())
        .unwrap_or_else(|| "mqd.toml".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = resolve_config_path(&args);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    let _log_guard = logging::init(&config.daemon.log_path, args.json_logs)?;

    std::fs::create_dir_all(&config.daemon.workspace_root)
        .with_context(|| format!("failed to create workspace root {:?}", config.daemon.workspace_root))?;

    let db_path = format!("{}/mqd.db", config.daemon.workspace_root);
    let store = Arc::new(Store::open(&db_path)?);

    let review: Arc<dyn ReviewClient> = Arc::new(GerritClient::new(
        &config.review.url,
        &config.review.username,
        &config.review.password,
        config.review.disable_tls_verify,
    )?);

    let config = Arc::new(config);

    {
        let config = Arc::clone(&config);
        let config_path = config_path.clone();
        let store = Arc::clone(&store);
        let review = Arc::clone(&review);
        tokio::spawn(async move {
            if let Err(e) = daemon::run(config, config_path, store, review).await {
                tracing::error!(error = %e, "daemon loop exited with error");
            }
        });
    }

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
    });

    let app = Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/gmq/get_queue", get(routes::get_queue))
        .route("/gmq/get_history", get(routes::get_history))
        .route("/gmq/get_merge_status", get(routes::get_merge_status))
        .route(
            "/gmq/get_active_merge_status",
            get(routes::get_active_merge_status),
        )
        .route("/gmq/cancel_merge", get(routes::cancel_merge))
        .route("/gmq/get_daemon_status", get(routes::get_daemon_status))
        .route("/gmq/set_daemon_pause", get(routes::set_daemon_pause))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.listen.host, config.listen.port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
