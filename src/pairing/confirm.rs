use std::sync::Arc;

use axum::{debug_handler, extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{db::ElderProfile, error::SignalError, AppResult, AppState};

use super::{Claim, PairingLedger};

#[derive(Debug, Deserialize)]
pub(crate) struct ConfirmQuery {
    family_id: Option<i64>,
    code: Option<String>,
    elder_name: Option<String>,
    gender: Option<String>,
    age: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConfirmResponse {
    elder_id: i64,
}

/// Family member types in the code shown on the elder's device.
#[debug_handler(state = AppState)]
pub(crate) async fn confirm(
    State(ledger): State<Arc<PairingLedger>>,
    Json(ConfirmQuery { family_id, code, elder_name, gender, age }): Json<ConfirmQuery>,
) -> AppResult<Json<ConfirmResponse>> {
    let family_id = family_id.ok_or_else(|| SignalError::missing("family_id"))?;
    let code = code.ok_or_else(|| SignalError::missing("code"))?;
    let name = elder_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| SignalError::missing("elder_name"))?;

    let claim = Claim::Family {
        family_id,
        elder: ElderProfile { name, gender, age },
    };
    let relationship = ledger.consume_code(&code, claim).await?;

    Ok(Json(ConfirmResponse { elder_id: relationship.elder_id }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct VerifyQuery {
    elder_id: Option<i64>,
    code: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct VerifyResponse {
    message: &'static str,
    family_id: i64,
}

/// Elder device types in the code a family member generated.
#[debug_handler(state = AppState)]
pub(crate) async fn verify(
    State(ledger): State<Arc<PairingLedger>>,
    Json(VerifyQuery { elder_id, code }): Json<VerifyQuery>,
) -> AppResult<Json<VerifyResponse>> {
    let (Some(elder_id), Some(code)) = (elder_id, code) else {
        return Err(SignalError::Validation("missing elder_id or code".into()))?;
    };

    let relationship = ledger.consume_code(&code, Claim::Elder { elder_id }).await?;

    Ok(Json(VerifyResponse {
        message: "Successfully paired!",
        family_id: relationship.family_id,
    }))
}
