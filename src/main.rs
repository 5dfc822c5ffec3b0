use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use lodestone::routes;
use lodestone::{server, state, AppConfig};

/// Terminal output stays human-readable; the rotated daily file gets JSON
/// lines so log shippers can ingest it without a format parser. The returned
/// guard must live as long as the process or buffered file output is lost.
fn init_tracing(log_dir: &str) -> WorkerGuard {
    std::fs::create_dir_all(log_dir).ok();
    let (file_writer, guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(log_dir, "lodestone.log"),
    );

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lodestone=info,tower_http=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    guard
}

/// Routes panic reports through tracing before the default hook takes over,
/// so crashes show up in the rotated logs and not just on a lost stderr.
fn hook_panics() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_owned());
        match info.location() {
            Some(location) => {
                tracing::error!(%payload, %location, "thread panicked");
            }
            None => tracing::error!(%payload, "thread panicked"),
        }
        previous(info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    let _log_guard = init_tracing(&config.log_dir);
    hook_panics();
    routes::health::init_start_time();

    let addr: SocketAddr = config.listen_addr.parse()?;
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        log_dir = %config.log_dir,
        default_mode = config.default_mode.as_str(),
        default_model = %config.default_model,
        max_file_size = config.content.max_file_size,
        memory_threshold_mb = config.resources.memory_threshold_mb,
        "lodestone starting"
    );

    let app_state = state::AppState::new(config)?;
    routes::health::init_shutdown_notify();

    // Periodic maintenance: release idle models when the process sits over
    // its memory budget.
    if app_state.config.resources.auto_cleanup {
        let resources = app_state.engine.resources().clone();
        let interval_ms = app_state.config.resources.cleanup_interval_ms;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(5000)));
            loop {
                ticker.tick().await;
                if resources.is_shut_down() {
                    break;
                }
                if resources.over_threshold() {
                    let released = resources.evict_idle();
                    if released > 0 {
                        info!(released, "periodic cleanup released idle resources");
                    }
                }
            }
        });
    }

    let engine = app_state.engine.clone();
    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("lodestone listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Coordinated cleanup: cancel outstanding work, flush the index,
    // release models. Idempotent if the HTTP shutdown route already ran it.
    engine.shutdown();
    info!("lodestone shutdown complete");
    Ok(())
}

/// Resolves when any shutdown path fires: ctrl-c, SIGTERM where the platform
/// has it, or the HTTP /shutdown route (for supervisors that cannot deliver
/// signals).
async fn shutdown_signal() {
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler available; the HTTP route remains.
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("interrupt received, shutting down"),
        _ = terminate => info!("terminate signal received, shutting down"),
        _ = routes::health::wait_for_shutdown() => info!("shutdown requested over HTTP"),
    }
}
