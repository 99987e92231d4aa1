use axum::{
    Extension,
    extract::{Path, State},
};
use kiln_process::{TunnelId, TunnelStatus};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, Body, ok};
use crate::{
    auth::AuthUser,
    broadcast::tunnel_group,
    state::AppState,
    store::{ConfigFormat, Tunnel},
};

#[derive(Debug, Serialize)]
pub(super) struct TunnelView {
    #[serde(flatten)]
    tunnel: Tunnel,
    status: TunnelStatus,
}

#[derive(Debug, Deserialize)]
pub(super) struct TunnelInput {
    name: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    config_format: ConfigFormat,
    config: String,
    #[serde(default)]
    run_on_startup: bool,
}

impl TunnelInput {
    fn into_tunnel(self, id: TunnelId) -> Tunnel {
        Tunnel {
            id,
            name: self.name.trim().to_string(),
            provider: self.provider.unwrap_or_else(|| "frp".to_string()),
            config_format: self.config_format,
            config: self.config,
            run_on_startup: self.run_on_startup,
        }
    }
}

fn view(state: &AppState, tunnel: Tunnel) -> TunnelView {
    TunnelView {
        status: state.tunnels.status(tunnel.id),
        tunnel,
    }
}

async fn find(state: &AppState, user: &AuthUser, id: u32) -> Result<Tunnel, ApiError> {
    let id = TunnelId(id);
    user.require(&tunnel_group(id))?;
    state
        .tunnel_defs
        .get(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("tunnel {id} not found")))
}

pub(super) async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Vec<TunnelView>> {
    let tunnels = state
        .tunnel_defs
        .list()
        .await
        .into_iter()
        .filter(|t| user.can_access(&tunnel_group(t.id)))
        .map(|t| view(&state, t))
        .collect();
    ok(tunnels)
}

pub(super) async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Body(input): Body<TunnelInput>,
) -> ApiResult<TunnelView> {
    user.require_admin()?;
    let tunnel = input.into_tunnel(TunnelId(0));
    tunnel.validate().map_err(ApiError::bad_request)?;
    let tunnel = state.tunnel_defs.create(tunnel).await?;
    tracing::info!(tunnel = %tunnel.id, name = %tunnel.name, "tunnel created");
    ok(view(&state, tunnel))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<TunnelView> {
    let tunnel = find(&state, &user, id).await?;
    ok(view(&state, tunnel))
}

/// Full replace. A running client keeps its old config until restarted.
pub(super) async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
    Body(input): Body<TunnelInput>,
) -> ApiResult<TunnelView> {
    user.require_admin()?;
    let existing = find(&state, &user, id).await?;
    let tunnel = input.into_tunnel(existing.id);
    tunnel.validate().map_err(ApiError::bad_request)?;
    if !state.tunnel_defs.update(tunnel.clone()).await? {
        return Err(ApiError::not_found(format!("tunnel {id} not found")));
    }
    ok(view(&state, tunnel))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<bool> {
    user.require_admin()?;
    let id = find(&state, &user, id).await?.id;
    state.tunnels.remove(id).await?;
    if !state.tunnel_defs.delete(id).await? {
        return Err(ApiError::not_found(format!("tunnel {id} not found")));
    }
    tracing::info!(tunnel = %id, "tunnel deleted");
    ok(true)
}

pub(super) async fn start(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<TunnelStatus> {
    let id = find(&state, &user, id).await?.id;
    let sup = state.tunnels.clone();
    ok(tokio::spawn(async move { sup.start(id).await }).await??)
}

pub(super) async fn stop(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<TunnelStatus> {
    let id = find(&state, &user, id).await?.id;
    let sup = state.tunnels.clone();
    ok(tokio::spawn(async move { sup.stop(id).await }).await??)
}

pub(super) async fn logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<Vec<String>> {
    let id = find(&state, &user, id).await?.id;
    ok(state.tunnels.logs(id))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::api::test_support::app;

    #[tokio::test]
    async fn crud_round_trip() {
        let app = app().await;
        let (status, body) = app
            .admin(
                Method::POST,
                "/api/tunnels",
                Some(json!({"name": "mc", "config": "serverAddr = \"frp.example.com\"\nserverPort = 7000\n"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["id"], 1);
        assert_eq!(body["data"]["provider"], "frp");
        assert_eq!(body["data"]["status"]["state"], "stopped");

        let (status, _) = app
            .admin(
                Method::PUT,
                "/api/tunnels/1",
                Some(json!({"name": "mc2", "config_format": "json", "config": "{\"serverPort\": 7000}"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = app.admin(Method::GET, "/api/tunnels/1", None).await;
        assert_eq!(body["data"]["name"], "mc2");
        assert_eq!(body["data"]["config_format"], "json");

        let (status, _) = app.admin(Method::DELETE, "/api/tunnels/1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.admin(Method::GET, "/api/tunnels/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_config_is_rejected() {
        let app = app().await;
        let (status, body) = app
            .admin(
                Method::POST,
                "/api/tunnels",
                Some(json!({"name": "mc", "config_format": "json", "config": "{not json"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().starts_with("config:"));
        assert!(app.state.tunnel_defs.list().await.is_empty());
    }
}
