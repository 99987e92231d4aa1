use axum::{
    Extension,
    extract::{Path, State},
};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ApiError, ApiResult, Body, ok};
use crate::{
    auth::AuthUser,
    state::AppState,
    store::{SettingKey, Settings},
};

fn visible(settings: &Settings) -> Map<String, Value> {
    SettingKey::ALL
        .into_iter()
        .filter(|k| !k.is_secret())
        .map(|k| (k.as_str().to_string(), settings.get(k)))
        .collect()
}

fn writable_key(raw: &str) -> Result<SettingKey, ApiError> {
    let key = SettingKey::parse(raw)
        .ok_or_else(|| ApiError::not_found(format!("unknown setting {raw:?}")))?;
    if key.is_secret() {
        return Err(ApiError::forbidden(format!("{} cannot be accessed", key.as_str())));
    }
    Ok(key)
}

pub(super) async fn get_all(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Map<String, Value>> {
    user.require_admin()?;
    ok(visible(&state.config.settings().await))
}

/// Applies several keys at once. Either all of them are stored or none.
pub(super) async fn put_all(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Body(changes): Body<Map<String, Value>>,
) -> ApiResult<Map<String, Value>> {
    user.require_admin()?;
    let mut next = state.config.settings().await;
    for (raw, value) in changes {
        let key = writable_key(&raw).map_err(|e| ApiError::bad_request(e.message))?;
        next = next.with(key, value).map_err(ApiError::bad_request)?;
    }
    state
        .config
        .write_settings(next.clone())
        .await?
        .map_err(ApiError::bad_request)?;
    tracing::info!(user = %user.username, "settings updated");
    ok(visible(&next))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
) -> ApiResult<Value> {
    user.require_admin()?;
    let key = writable_key(&key)?;
    ok(state.config.setting(key).await)
}

#[derive(Debug, Deserialize)]
pub(super) struct SettingValue {
    value: Value,
}

pub(super) async fn put_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(key): Path<String>,
    Body(input): Body<SettingValue>,
) -> ApiResult<Value> {
    user.require_admin()?;
    let key = writable_key(&key)?;
    state
        .config
        .set_setting(key, input.value)
        .await?
        .map_err(ApiError::bad_request)?;
    tracing::info!(user = %user.username, key = key.as_str(), "setting updated");
    ok(state.config.setting(key).await)
}
