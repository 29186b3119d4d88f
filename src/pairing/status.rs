use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, Json};
use serde::Serialize;

use crate::{db::Db, AppResult, AppState};

use super::{ClaimStatus, PairingLedger};

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum StatusResponse {
    Waiting,
    Paired {
        elder_id: i64,
        elder_name: Option<String>,
    },
}

#[debug_handler(state = AppState)]
pub(crate) async fn check_status(
    Path(code): Path<String>,
    State(ledger): State<Arc<PairingLedger>>,
    State(db): State<Db>,
) -> AppResult<Json<StatusResponse>> {
    let response = match ledger.poll_claim(&code).await? {
        ClaimStatus::Waiting => StatusResponse::Waiting,
        ClaimStatus::ClaimedBy { elder_id } => StatusResponse::Paired {
            elder_id,
            elder_name: db.find_user(elder_id).await?.map(|u| u.username),
        },
    };
    Ok(Json(response))
}
