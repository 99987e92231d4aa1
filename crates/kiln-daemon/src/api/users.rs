use axum::{
    Extension,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, Body, ok};
use crate::{
    auth::{self, AuthUser, IdentityView},
    state::AppState,
    store::{Identity, Role},
};

const SCOPE_KINDS: [&str; 2] = ["instance:", "tunnel:"];

fn check_scopes(scopes: &[String]) -> Result<(), ApiError> {
    for scope in scopes {
        let valid = SCOPE_KINDS.iter().any(|kind| {
            scope
                .strip_prefix(kind)
                .is_some_and(|rest| rest == "*" || rest.parse::<u32>().is_ok())
        });
        if !valid {
            return Err(ApiError::bad_request(format!("invalid scope {scope:?}")));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateUser {
    username: String,
    password: String,
    #[serde(default)]
    role: Role,
    #[serde(default)]
    scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateUser {
    password: Option<String>,
    role: Option<Role>,
    scopes: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub(super) struct IssuedKey {
    api_key: String,
}

pub(super) async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Vec<IdentityView>> {
    user.require_admin()?;
    ok(state.identities.list().await.iter().map(IdentityView::from).collect())
}

pub(super) async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Body(input): Body<CreateUser>,
) -> ApiResult<IdentityView> {
    user.require_admin()?;
    let username = input.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::bad_request("username must be non-empty"));
    }
    if input.password.is_empty() {
        return Err(ApiError::bad_request("password must be non-empty"));
    }
    check_scopes(&input.scopes)?;

    let identity = Identity {
        id: 0,
        username: username.clone(),
        password_hash: auth::hash_password(&input.password)?,
        role: input.role,
        api_key: None,
        scopes: input.scopes,
        last_login: None,
        external: Vec::new(),
    };
    let created = state
        .identities
        .create(identity)
        .await?
        .ok_or_else(|| ApiError::conflict(format!("username {username:?} is taken")))?;
    tracing::info!(by = %user.username, username = %created.username, "user created");
    ok(IdentityView::from(&created))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<IdentityView> {
    if user.id != id {
        user.require_admin()?;
    }
    let identity = state
        .identities
        .by_id(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("user {id} not found")))?;
    ok(IdentityView::from(&identity))
}

/// Admins may change anything; users may only change their own password.
pub(super) async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
    Body(input): Body<UpdateUser>,
) -> ApiResult<IdentityView> {
    if user.id != id || input.role.is_some() || input.scopes.is_some() {
        user.require_admin()?;
    }
    if let Some(scopes) = &input.scopes {
        check_scopes(scopes)?;
    }
    let password_hash = match input.password.as_deref() {
        Some("") => return Err(ApiError::bad_request("password must be non-empty")),
        Some(p) => Some(auth::hash_password(p)?),
        None => None,
    };

    let updated = state
        .identities
        .modify(id, |u| {
            if let Some(hash) = password_hash {
                u.password_hash = hash;
            }
            if let Some(role) = input.role {
                u.role = role;
            }
            if let Some(scopes) = input.scopes {
                u.scopes = scopes;
            }
            IdentityView::from(&*u)
        })
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {id} not found")))?;
    ok(updated)
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<bool> {
    user.require_admin()?;
    if user.id == id {
        return Err(ApiError::bad_request("cannot delete yourself"));
    }
    if !state.identities.delete(id).await? {
        return Err(ApiError::not_found(format!("user {id} not found")));
    }
    tracing::info!(by = %user.username, user = id, "user deleted");
    ok(true)
}

/// Issues a fresh personal API key, replacing any previous one. Shown only once.
pub(super) async fn rotate_own_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<IssuedKey> {
    if user.id == 0 {
        return Err(ApiError::bad_request("the global API key cannot be rotated here"));
    }
    let api_key = auth::random_token(32);
    let key = api_key.clone();
    state
        .identities
        .modify(user.id, move |u| u.api_key = Some(key))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {} not found", user.id)))?;
    tracing::info!(username = %user.username, "api key rotated");
    ok(IssuedKey { api_key })
}
