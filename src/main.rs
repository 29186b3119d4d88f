use std::{sync::Arc, time::Duration};

use kinlink::{
    calls::push,
    clock::{SharedClock, SystemClock},
    config::Config,
    db::Db,
    router, AppState,
};
use tokio::{net::TcpListener, signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(dotenv::var("KINLINK_CONFIG").ok())?;
    tracing::info!(
        port = config.server.port,
        code_ttl = config.pairing.code_ttl_seconds,
        ring_timeout = config.calls.ring_timeout_seconds,
        "starting kinlink"
    );

    let db = Db::connect(&config.database.url, config.database.max_connections).await?;
    let clock: SharedClock = Arc::new(SystemClock);
    let notifier = push::from_config(&config.push)?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let sweep_every = Duration::from_secs(config.pairing.sweep_interval_seconds.max(1));

    let state = AppState::build(config, db, clock, notifier).await?;

    let ledger = state.ledger.clone();
    tokio::spawn(async move { ledger.run_sweeper(sweep_every).await });

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {bind_addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for ctrl-c");
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
                tracing::error!(error = %e, "could not listen for SIGTERM");
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
