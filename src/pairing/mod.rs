mod confirm;
mod ledger;
mod request;
mod status;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub use ledger::{Claim, ClaimStatus, IssuedCode, Issuer, PairingCode, PairingLedger};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/request_code", post(request::request_code))
        .route("/generate", post(request::generate_code))
        .route("/check_status/{code}", get(status::check_status))
        .route("/confirm", post(confirm::confirm))
        .route("/verify", post(confirm::verify))
}
