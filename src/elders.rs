use std::sync::Arc;

use axum::{debug_handler, extract::{Path, State}, Json};
use serde::Serialize;

use crate::{
    clock::SharedClock,
    config::Config,
    db::{AccountRole, Db},
    error::SignalError,
    AppResult, AppState,
};

#[derive(Debug, Serialize)]
pub(crate) struct ElderItem {
    id: i64,
    name: String,
    is_online: bool,
    /// Unix seconds.
    last_seen: Option<i64>,
}

fn is_online(last_seen: Option<i64>, now: i64, window: u64) -> bool {
    last_seen.is_some_and(|seen| now.saturating_sub(seen) <= window as i64)
}

#[debug_handler(state = AppState)]
pub(crate) async fn elders_for(
    Path(user_id): Path<i64>,
    State(db): State<Db>,
    State(config): State<Arc<Config>>,
    State(clock): State<SharedClock>,
) -> AppResult<Json<Vec<ElderItem>>> {
    let Some(user) = db.find_user(user_id).await? else {
        return Err(SignalError::NotFound("user".into()))?;
    };
    if user.role != Some(AccountRole::Family) {
        return Err(SignalError::Unauthorized("only family accounts have elders".into()))?;
    }

    let now = clock.now().unix_timestamp();
    let window = config.presence.online_window_seconds;
    let elders = db
        .elders_for(user_id)
        .await?
        .into_iter()
        .map(|(id, name, last_seen)| ElderItem {
            id,
            name,
            is_online: is_online(last_seen, now, window),
            last_seen,
        })
        .collect();

    Ok(Json(elders))
}
