//! HTTP surface. Every response uses the `{code, message, data}` envelope.

mod instances;
mod jobs;
mod settings;
mod tasks;
mod tunnels;
mod users;

use axum::{
    Json, Router,
    extract::{FromRequest, Request},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Serialize, de::DeserializeOwned};
use tower_http::trace::TraceLayer;

use crate::{auth, security, state::AppState, supervisor::SupervisorError, ws};

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            message: "ok".to_string(),
            data,
        }
    }
}

pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope::ok(data)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope {
            code: self.status.as_u16(),
            message: self.message,
            data: serde_json::Value::Null,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match &err {
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::AlreadyRunning(_) | SupervisorError::NotRunning(_) => {
                StatusCode::CONFLICT
            }
            SupervisorError::Spawn(..) | SupervisorError::Io(_) => {
                tracing::error!(error = %err, "supervisor failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from(anyhow::anyhow!("background action failed: {err}"))
    }
}

/// JSON request body whose rejections use the envelope with status 400.
pub struct Body<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for Body<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(v)) => Ok(Body(v)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> ApiResult<Health> {
    ok(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        .route("/settings", get(settings::get_all).put(settings::put_all))
        .route("/settings/:key", get(settings::get_one).put(settings::put_one))
        .route("/instances", get(instances::list).post(instances::create))
        .route(
            "/instances/:id",
            get(instances::get_one)
                .put(instances::update)
                .delete(instances::delete),
        )
        .route("/instances/:id/start", post(instances::start))
        .route("/instances/:id/stop", post(instances::stop))
        .route("/instances/:id/restart", post(instances::restart))
        .route("/instances/:id/command", post(instances::command))
        .route("/instances/:id/logs", get(instances::logs))
        .route("/tunnels", get(tunnels::list).post(tunnels::create))
        .route(
            "/tunnels/:id",
            get(tunnels::get_one).put(tunnels::update).delete(tunnels::delete),
        )
        .route("/tunnels/:id/start", post(tunnels::start))
        .route("/tunnels/:id/stop", post(tunnels::stop))
        .route("/tunnels/:id/logs", get(tunnels::logs))
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route(
            "/tasks/:id",
            get(tasks::get_one).put(tasks::update).delete(tasks::delete),
        )
        .route("/users", get(users::list).post(users::create))
        .route("/users/me/api-key", post(users::rotate_own_key))
        .route(
            "/users/:id",
            get(users::get_one).put(users::update).delete(users::delete),
        )
        .route("/jobs/:id", get(jobs::get_one))
        .route("/ws", get(ws::upgrade));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(state.clone(), security::auth_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}


#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::test_support::app;
    use super::*;

    #[tokio::test]
    async fn health_is_public_and_enveloped() {
        let app = app().await;
        let (status, body) = app.send(Method::GET, "/api/health", None, None, "203.0.113.1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 200);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected_but_not_counted() {
        let app = app().await;
        for _ in 0..10 {
            let (status, body) = app.send(Method::GET, "/api/instances", None, None, "203.0.113.2").await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["message"], "missing credentials");
        }
        assert!(!app.state.guard.is_banned("203.0.113.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn repeated_bad_tokens_ban_the_peer() {
        let app = app().await;
        let threshold = app.state.config.settings().await.ban_threshold;
        for _ in 0..threshold {
            let (status, _) = app
                .send(Method::GET, "/api/instances", Some("forged"), None, "203.0.113.3")
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        let (status, body) = app
            .send(Method::GET, "/api/instances", Some(&app.token.clone()), None, "203.0.113.3")
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "banned");

        let (status, _) = app
            .send(Method::GET, "/api/instances", Some(&app.token.clone()), None, "203.0.113.4")
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn expired_signed_tokens_are_rejected_but_not_counted() {
        let app = app().await;
        let admin = app.state.identities.by_username("admin").await.unwrap();
        let settings = app.state.config.settings().await;
        let expired = crate::auth::expired_token(&admin, &settings.jwt_secret);

        for _ in 0..=settings.ban_threshold {
            let (status, body) = app
                .send(Method::GET, "/api/instances", Some(&expired), None, "203.0.113.5")
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["message"], "token expired (trusted)");
        }
        assert!(!app.state.guard.is_banned("203.0.113.5".parse().unwrap()));

        let (status, _) = app
            .send(Method::GET, "/api/instances", Some(&app.token.clone()), None, "203.0.113.5")
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn loopback_block_refuses_local_peers() {
        let app = app().await;
        app.state
            .config
            .set_setting(crate::store::SettingKey::BlockLoopback, serde_json::json!(true))
            .await
            .unwrap()
            .unwrap();
        let (status, _) = app.send(Method::GET, "/api/health", None, None, "127.0.0.1").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = app.send(Method::GET, "/api/health", None, None, "203.0.113.5").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn global_api_key_acts_as_admin() {
        let app = app().await;
        app.state
            .config
            .set_setting(crate::store::SettingKey::ApiKey, serde_json::json!("k-123"))
            .await
            .unwrap()
            .unwrap();

        let req = axum::http::Request::builder()
            .uri("/api/auth/me")
            .header("x-api-key", "k-123")
            .body(axum::body::Body::empty())
            .unwrap();
        let resp = tower::ServiceExt::oneshot(app.router.clone(), req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_issues_a_usable_token() {
        let app = app().await;
        let (status, body) = app
            .send(
                Method::POST,
                "/api/auth/login",
                None,
                Some(serde_json::json!({"username": "admin", "password": "pw"})),
                "203.0.113.6",
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, me) = app.send(Method::GET, "/api/auth/me", Some(&token), None, "203.0.113.6").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["data"]["username"], "admin");

        let (status, body) = app
            .send(
                Method::POST,
                "/api/auth/login",
                None,
                Some(serde_json::json!({"username": "admin", "password": "nope"})),
                "203.0.113.6",
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "invalid credentials");
    }
}
