//! The Daemon Loop (C7): poll, schedule, repeat. Grounded in the donor's
//! own pipeline tick loop (`main.rs`'s "inner spawn catches panics" pattern)
//! and `gerrit_mq/functions.py`'s top-level `poll_and_merge` loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use mqd_core::config::Config;
use mqd_core::db::Store;
use mqd_review::ReviewClient;
use tracing::{error, info, warn};

use crate::pidfile;
use crate::poller::poll_once;
use crate::scheduler::Scheduler;

const SENTINEL_POLL: Duration = Duration::from_secs(1);

/// Run the daemon loop until `SIGINT`/`SIGTERM`. Acquires the PID file on
/// entry and releases it on every exit path, including self-restart.
pub async fn run(config: Arc<Config>, config_path: String, store: Arc<Store>, review: Arc<dyn ReviewClient>) -> Result<()> {
    {
        let store = Arc::clone(&store);
        let cancelled = tokio::task::spawn_blocking(move || store.mark_stale_in_progress()).await??;
        if cancelled > 0 {
            warn!(cancelled, "startup crash recovery: stale IN_PROGRESS rows canceled");
        }
    }

    pidfile::acquire(&config.daemon.pidfile_path)?;

    let exe = std::env::current_exe().ok().map(|p| p.to_string_lossy().into_owned());
    let mut watched_paths = vec![config_path];
    if let Some(exe) = exe {
        watched_paths.push(exe);
    }
    let manifest = pidfile::watch_manifest(&watched_paths);

    let scheduler = Arc::new(Scheduler::new());
    let poll_period = Duration::from_secs(config.daemon.poll_period_s.max(1));

    let outcome = tokio::select! {
        r = tick_loop(config, store, review, scheduler, manifest, poll_period) => r,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    pidfile::release(&config.daemon.pidfile_path);
    outcome
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    Ok(())
}

async fn tick_loop(
    config: Arc<Config>,
    store: Arc<Store>,
    review: Arc<dyn ReviewClient>,
    scheduler: Arc<Scheduler>,
    manifest: Vec<pidfile::WatchEntry>,
    poll_period: Duration,
) -> Result<()> {
    loop {
        if pidfile::has_changed(&manifest) {
            info!("executable or config file changed; self-restarting");
            pidfile::release(&config.daemon.pidfile_path);
            return pidfile::reexec();
        }

        if pidfile::sentinel_present(&config.daemon.offline_sentinel_path) {
            tokio::time::sleep(SENTINEL_POLL).await;
            continue;
        }

        let tick_started = Instant::now();

        let config2 = Arc::clone(&config);
        let store2 = Arc::clone(&store);
        let review2 = Arc::clone(&review);
        let scheduler2 = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { run_tick(&config2, &store2, &review2, &scheduler2).await });
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "daemon tick failed"),
            Err(join_err) => error!(error = %join_err, "daemon tick panicked"),
        }

        if let Some(remaining) = poll_period.checked_sub(tick_started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
    }
}

async fn run_tick(
    config: &Arc<Config>,
    store: &Arc<Store>,
    review: &Arc<dyn ReviewClient>,
    scheduler: &Arc<Scheduler>,
) -> Result<()> {
    let count = poll_once(store, review).await?;
    info!(count, "poll complete");
    let ran = scheduler.run_once(config, store, review).await?;
    if ran {
        info!("verification completed this tick");
    }
    Ok(())
}
