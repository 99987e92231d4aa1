use axum::{Extension, Json, extract::State};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{
    api::{ApiError, ApiResult, Envelope},
    config,
    security::{AuthFailure, BanPolicy, PeerIp},
    state::AppState,
    store::{Identity, IdentityStore, Role},
};

pub const ACCESS_COOKIE_NAME: &str = "access";
const ISSUER: &str = "kiln";
const AUDIENCE: &str = "kiln-panel";

pub fn random_token(n: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    argon2::Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    argon2::Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: Role,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
    pub aud: String,
}

/// Issues an HS256 access token. Returns it with its expiry (unix seconds).
pub fn make_token(
    identity: &Identity,
    secret: &str,
    ttl_minutes: u64,
) -> anyhow::Result<(String, i64)> {
    let now = time::OffsetDateTime::now_utc();
    let exp = (now + time::Duration::minutes(ttl_minutes as i64)).unix_timestamp();
    let claims = Claims {
        sub: identity.id.to_string(),
        username: identity.username.clone(),
        role: identity.role,
        exp: exp as usize,
        iat: now.unix_timestamp() as usize,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, exp))
}

/// A correctly signed token that expired an hour ago.
#[cfg(test)]
pub(crate) fn expired_token(identity: &Identity, secret: &str) -> String {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let claims = Claims {
        sub: identity.id.to_string(),
        username: identity.username.clone(),
        role: identity.role,
        exp: (now - 3600) as usize,
        iat: (now - 7200) as usize,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// Checks signature, issuer, audience and expiry. A token that is correctly signed but
/// expired is reported as [`AuthFailure::TrustedExpired`].
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthFailure> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);
    validation.leeway = 0;

    match jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Ok(data.claims),
        Err(err) if matches!(err.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
            Err(AuthFailure::TrustedExpired)
        }
        Err(_) => Err(AuthFailure::Invalid),
    }
}

/// Creates the bootstrap administrator when no identity exists yet.
pub async fn ensure_admin(identities: &IdentityStore) -> anyhow::Result<()> {
    if !identities.is_empty().await {
        return Ok(());
    }
    let (username, password) = config::bootstrap_admin();
    let generated = password.is_none();
    let password = password.unwrap_or_else(|| random_token(12));

    let admin = Identity {
        id: 0,
        username: username.clone(),
        password_hash: hash_password(&password)?,
        role: Role::Admin,
        api_key: None,
        scopes: Vec::new(),
        last_login: None,
        external: Vec::new(),
    };
    if identities.create(admin).await?.is_some() {
        if generated {
            tracing::warn!(%username, %password, "created administrator with a generated password");
        } else {
            tracing::info!(%username, "created administrator");
        }
    }
    Ok(())
}

/// The authenticated caller, as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    /// `0` for the global API key.
    pub id: u32,
    pub username: String,
    pub role: Role,
    pub scopes: Vec<String>,
}

impl AuthUser {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            username: identity.username.clone(),
            role: identity.role,
            scopes: identity.scopes.clone(),
        }
    }

    pub fn global_admin() -> Self {
        Self {
            id: 0,
            username: "api-key".to_string(),
            role: Role::Admin,
            scopes: Vec::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// `resource` is a group key such as `instance:3`. Scopes match exactly or by a
    /// `kind:*` wildcard.
    pub fn can_access(&self, resource: &str) -> bool {
        self.is_admin()
            || self.scopes.iter().any(|s| match s.strip_suffix('*') {
                Some(prefix) => prefix.ends_with(':') && resource.starts_with(prefix),
                None => s == resource,
            })
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("administrator role required"))
        }
    }

    pub fn require(&self, resource: &str) -> Result<(), ApiError> {
        if self.can_access(resource) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("no access to {resource}")))
        }
    }
}

/// Identity without secrets.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityView {
    pub id: u32,
    pub username: String,
    pub role: Role,
    pub scopes: Vec<String>,
    pub has_api_key: bool,
    pub last_login: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Identity> for IdentityView {
    fn from(i: &Identity) -> Self {
        Self {
            id: i.id,
            username: i.username.clone(),
            role: i.role,
            scopes: i.scopes.clone(),
            has_api_key: i.api_key.is_some(),
            last_login: i.last_login,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
    pub user: IdentityView,
}

fn build_access_cookie(token: String) -> Cookie<'static> {
    let mut c = Cookie::new(ACCESS_COOKIE_NAME, token);
    c.set_http_only(true);
    c.set_same_site(SameSite::Lax);
    c.set_path("/");
    c
}

pub async fn login(
    State(state): State<AppState>,
    Extension(PeerIp(ip)): Extension<PeerIp>,
    jar: CookieJar,
    Json(input): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Envelope<LoginResponse>>), ApiError> {
    let settings = state.config.settings().await;
    let user = state
        .identities
        .by_username(input.username.trim())
        .await
        .filter(|u| verify_password(&u.password_hash, &input.password));
    let Some(user) = user else {
        state.guard.record_failure(ip, &BanPolicy::from(&settings));
        tracing::info!(%ip, username = %input.username, "login failed");
        return Err(ApiError::unauthorized("invalid credentials"));
    };

    let now = chrono::Utc::now();
    state
        .identities
        .modify(user.id, |u| u.last_login = Some(now))
        .await?;
    let (token, expires_at) = make_token(&user, &settings.jwt_secret, settings.token_ttl_minutes)?;
    tracing::info!(%ip, username = %user.username, "login succeeded");

    let mut view = IdentityView::from(&user);
    view.last_login = Some(now);
    Ok((
        jar.add(build_access_cookie(token.clone())),
        Json(Envelope::ok(LoginResponse {
            token,
            expires_at,
            user: view,
        })),
    ))
}

pub async fn me(Extension(user): Extension<AuthUser>) -> ApiResult<AuthUser> {
    crate::api::ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: u32, role: Role) -> Identity {
        Identity {
            id,
            username: format!("user{id}"),
            password_hash: String::new(),
            role,
            api_key: None,
            scopes: Vec::new(),
            last_login: None,
            external: Vec::new(),
        }
    }

    #[test]
    fn valid_token_round_trips_claims() {
        let (token, _) = make_token(&identity(4, Role::User), "secret", 5).unwrap();
        let claims = validate_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "4");
        assert_eq!(claims.role, Role::User);
    }

    #[test]
    fn wrong_secret_is_invalid_not_expired() {
        let (token, _) = make_token(&identity(1, Role::Admin), "secret", 5).unwrap();
        assert_eq!(validate_token(&token, "other").unwrap_err(), AuthFailure::Invalid);
        assert_eq!(validate_token("garbage", "secret").unwrap_err(), AuthFailure::Invalid);
    }

    #[test]
    fn expired_but_signed_token_is_trusted_expired() {
        let token = expired_token(&identity(1, Role::Admin), "secret");
        assert_eq!(validate_token(&token, "secret").unwrap_err(), AuthFailure::TrustedExpired);
        assert_eq!(validate_token(&token, "forged").unwrap_err(), AuthFailure::Invalid);
    }

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password(&hash, "hunter2"));
        assert!(!verify_password(&hash, "hunter3"));
        assert!(!verify_password("not-a-hash", "hunter2"));
    }

    #[test]
    fn scopes_match_exactly_or_by_kind() {
        let mut user = AuthUser::from_identity(&identity(2, Role::User));
        user.scopes = vec!["instance:3".to_string(), "tunnel:*".to_string()];
        assert!(user.can_access("instance:3"));
        assert!(!user.can_access("instance:30"));
        assert!(user.can_access("tunnel:9"));
        assert!(!user.can_access("job:1"));
        assert!(AuthUser::global_admin().can_access("instance:30"));
    }

    #[tokio::test]
    async fn bootstrap_admin_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::open(dir.path()).await.unwrap();
        ensure_admin(&store).await.unwrap();
        ensure_admin(&store).await.unwrap();
        let users = store.list().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, Role::Admin);
    }
}
