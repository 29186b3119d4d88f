pub mod appresult;
pub mod calls;
pub mod clock;
pub mod config;
pub mod db;
pub mod elders;
pub mod error;
pub mod gateway;
pub mod pairing;
pub mod presence;
pub mod relay;
pub mod testing;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use calls::push::PushNotifier;
use clock::SharedClock;
use config::Config;
use db::Db;
use error::SignalResult;
use gateway::Gateway;
use pairing::PairingLedger;

pub use appresult::{AppError, AppResult};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: Db,
    pub ledger: Arc<PairingLedger>,
    pub gateway: Gateway,
    pub config: Arc<Config>,
    pub clock: SharedClock,
}

impl AppState {
    pub async fn build(
        config: Config,
        db: Db,
        clock: SharedClock,
        notifier: Arc<dyn PushNotifier>,
    ) -> SignalResult<Self> {
        let ledger = PairingLedger::load(db.clone(), clock.clone(), &config.pairing).await?;
        let gateway = Gateway::new(db.clone(), notifier, clock.clone(), &config);

        Ok(Self {
            db,
            ledger: Arc::new(ledger),
            gateway,
            config: Arc::new(config),
            clock,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(gateway::ws::signal_ws))
        .route("/elders_for/{user_id}", get(elders::elders_for))
        .nest("/pairing", pairing::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}
