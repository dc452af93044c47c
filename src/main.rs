use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_relay::api::{self, control_routes};
use mail_relay::channels::{SmtpSink, create_source};
use mail_relay::config::RelayConfig;
use mail_relay::pipeline::{CycleRunner, ForwardDispatcher, RelayMetrics};
use mail_relay::store::{LibSqlBackend, RelayStore};
use mail_relay::worker::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_tracing(&config);

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    eprintln!("📬 Mail Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Source: {}", config.source_name());
    eprintln!("   SMTP: {}:{}", config.smtp.host, config.smtp.port);
    eprintln!(
        "   Interval: every {}s (lookback {}h)",
        config.scheduler.interval.as_secs(),
        config.scheduler.lookback.as_secs() / 3600
    );
    eprintln!("   Control API: http://0.0.0.0:{}/api/scheduler/status", config.server.port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn RelayStore> = Arc::new(
        LibSqlBackend::new_local(&config.database.path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", config.database.path.display())
            })?,
    );
    eprintln!("   Database: {}", config.database.path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let source = create_source(&config.source);
    let sink = Arc::new(SmtpSink::new(&config.smtp).context("Invalid SMTP configuration")?);
    let lookback = chrono::Duration::from_std(config.scheduler.lookback)
        .context("Lookback window out of range")?;

    let runner = Arc::new(CycleRunner::new(
        Arc::clone(&store),
        Arc::clone(&source),
        ForwardDispatcher::new(sink),
        Arc::new(RelayMetrics::new()),
        lookback,
    ));

    let scheduler = Arc::new(Scheduler::new(
        runner,
        config.scheduler.interval,
        config.scheduler.stop_grace,
    )?);

    if config.scheduler.autostart {
        scheduler.start()?;
        eprintln!("   Scheduler: started");
    } else {
        eprintln!("   Scheduler: stopped (POST /api/scheduler/start to arm)");
    }
    eprintln!();

    // ── Control API ──────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind control API port {}", config.server.port))?;
    let app = control_routes(Arc::clone(&scheduler), Arc::clone(&store));

    if let Err(e) = api::serve(listener, app, shutdown_signal()).await {
        error!(error = %e, "Control API server error");
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    info!("Shutting down");
    scheduler.stop().await;
    if let Err(e) = source.close().await {
        warn!(error = %e, "Failed to close message source");
    }
    info!("Shutdown complete");

    Ok(())
}

/// Stdout logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when a log directory is configured.
fn init_tracing(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
