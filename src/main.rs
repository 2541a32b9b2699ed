//! Zwap Settlement Operator
//!
//! Accepts settlement intents over HTTP, pays out the ZEC equivalent from
//! the operator's shielded address via zcashd, and reconciles in-flight
//! sends on startup and on a fixed interval.

use std::sync::Arc;

use tracing::{error, info};

use zwap_operator::api::{self, AppState};
use zwap_operator::config::Config;
use zwap_operator::db::{self, PgStore};
use zwap_operator::metrics;
use zwap_operator::settlement::SettlementEngine;
use zwap_operator::shutdown::StopHandle;
use zwap_operator::zcash::ZcashClient;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting Zwap settlement operator");

    let config = Config::load()?;
    info!(
        rpc_url = %config.zcash.rpc_url,
        from_address = %config.zcash.from_address,
        min_confirmations = config.zcash.min_confirmations,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    info!("Database connected");

    db::run_migrations(&pool).await?;
    info!("Database migrations complete");

    let rpc = Arc::new(ZcashClient::new(&config.zcash)?);
    let (handle, stop) = StopHandle::new();

    let engine = Arc::new(SettlementEngine::new(
        Arc::new(PgStore::new(pool)),
        rpc,
        Arc::new(config.oracle()),
        config.engine_settings(),
        config.poller_settings(),
        stop.clone(),
    ));

    // Resolve anything left in flight by a previous run before taking traffic
    match engine.reconcile().await {
        Ok(report) => info!(
            examined = report.examined,
            sent = report.sent,
            failed = report.failed,
            unresolved = report.unresolved,
            errors = report.errors,
            "Startup reconciliation complete"
        ),
        Err(e) => error!(error = %e, "Startup reconciliation failed"),
    }

    let reconciler = tokio::spawn(Arc::clone(&engine).run_reconciler());

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        handle.stop();
    });

    metrics::UP.set(1.0);
    let served = api::start_server(
        &config.api.bind_address,
        config.api.port,
        AppState::new(engine),
        stop,
    )
    .await;
    metrics::UP.set(0.0);

    if let Err(e) = reconciler.await {
        error!(error = %e, "Reconciler task panicked");
    }
    served?;

    info!("Zwap settlement operator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,zwap_operator=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
