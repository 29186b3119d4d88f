use std::sync::Arc;

use axum::{debug_handler, extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{error::SignalError, AppResult, AppState};

use super::{IssuedCode, Issuer, PairingLedger};

#[derive(Debug, Serialize)]
pub(crate) struct CodeResponse {
    pairing_code: String,
    expires_in_seconds: u64,
}

impl From<IssuedCode> for CodeResponse {
    fn from(IssuedCode { code, ttl_seconds }: IssuedCode) -> Self {
        Self {
            pairing_code: code,
            expires_in_seconds: ttl_seconds,
        }
    }
}

/// Elder device asks for a code to display; nobody is authenticated yet.
#[debug_handler(state = AppState)]
pub(crate) async fn request_code(
    State(ledger): State<Arc<PairingLedger>>,
) -> AppResult<Json<CodeResponse>> {
    let issued = ledger.issue_code(Issuer::Elder).await?;
    Ok(Json(issued.into()))
}

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateQuery {
    family_id: Option<i64>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn generate_code(
    State(ledger): State<Arc<PairingLedger>>,
    Json(GenerateQuery { family_id }): Json<GenerateQuery>,
) -> AppResult<Json<CodeResponse>> {
    let family_id = family_id.ok_or_else(|| SignalError::missing("family_id"))?;
    let issued = ledger.issue_code(Issuer::Family(family_id)).await?;
    Ok(Json(issued.into()))
}
