use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;

use crate::{
    api::ApiError,
    auth::{self, ACCESS_COOKIE_NAME, AuthUser},
    cache::ExpiringCache,
    state::AppState,
    store::Settings,
};

const API_KEY_HEADER: &str = "x-api-key";
const ACCESS_TOKEN_HEADER: &str = "x-access-token";
const ACCESS_TOKEN_QUERY: &str = "access_token";
const PUBLIC_PATHS: [&str; 2] = ["/api/health", "/api/auth/login"];

/// Why a request was turned away before reaching a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("token expired (trusted)")]
    TrustedExpired,
    #[error("banned")]
    Banned,
    #[error("loopback access blocked")]
    LoopbackBlocked,
}

impl AuthFailure {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Missing | Self::Invalid | Self::TrustedExpired => StatusCode::UNAUTHORIZED,
            Self::Banned | Self::LoopbackBlocked => StatusCode::FORBIDDEN,
        }
    }

    /// Only presenting bad credentials counts toward a ban.
    pub fn counted(self) -> bool {
        self == Self::Invalid
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        ApiError::new(self.status(), self.to_string()).into_response()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BanPolicy {
    pub threshold: usize,
    pub window: Duration,
    pub duration: Duration,
    pub exempt_loopback: bool,
}

impl From<&Settings> for BanPolicy {
    fn from(s: &Settings) -> Self {
        Self {
            threshold: s.ban_threshold.max(1) as usize,
            window: Duration::from_secs(s.ban_window_secs),
            duration: Duration::from_secs(s.ban_duration_secs),
            exempt_loopback: s.ban_exempt_loopback,
        }
    }
}

/// Per-IP sliding window of failed authentications and the resulting bans.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: ExpiringCache<IpAddr, VecDeque<Instant>>,
    bans: ExpiringCache<IpAddr, ()>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.bans.contains(&ip)
    }

    /// Counts one failure. Returns `true` when this failure triggered a ban.
    pub fn record_failure(&self, ip: IpAddr, policy: &BanPolicy) -> bool {
        if policy.exempt_loopback && ip.is_loopback() {
            return false;
        }
        let now = Instant::now();
        let hits = self.failures.upsert(ip, policy.window, |q| {
            while q
                .front()
                .is_some_and(|t| now.duration_since(*t) > policy.window)
            {
                q.pop_front();
            }
            q.push_back(now);
            q.len()
        });
        if hits < policy.threshold {
            return false;
        }
        self.failures.remove(&ip);
        self.bans.insert(ip, (), policy.duration);
        tracing::warn!(
            %ip,
            failures = hits,
            ban_secs = policy.duration.as_secs(),
            "address banned"
        );
        true
    }
}

/// Address of the connected peer, inserted by [`auth_gate`] for handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIp(pub IpAddr);

fn peer_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

enum Credential {
    ApiKey(String),
    Token(String),
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn credential(headers: &HeaderMap, uri: &Uri) -> Option<Credential> {
    if let Some(key) = header_str(headers, API_KEY_HEADER) {
        return Some(Credential::ApiKey(key.to_string()));
    }
    if let Some(bearer) = header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(Credential::Token(bearer.to_string()));
    }
    if let Some(token) = header_str(headers, ACCESS_TOKEN_HEADER) {
        return Some(Credential::Token(token.to_string()));
    }
    if let Some(cookie) = CookieJar::from_headers(headers).get(ACCESS_COOKIE_NAME)
        && !cookie.value().is_empty()
    {
        return Some(Credential::Token(cookie.value().to_string()));
    }
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .ok()
        .and_then(|Query(mut q)| q.remove(ACCESS_TOKEN_QUERY))
        .filter(|t| !t.is_empty())
        .map(Credential::Token)
}

/// Resolves the caller behind the request's credentials.
pub async fn authenticate(
    state: &AppState,
    settings: &Settings,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<AuthUser, AuthFailure> {
    match credential(headers, uri).ok_or(AuthFailure::Missing)? {
        Credential::ApiKey(key) => {
            if !settings.api_key.is_empty() && key == settings.api_key {
                return Ok(AuthUser::global_admin());
            }
            state
                .identities
                .by_api_key(&key)
                .await
                .map(|i| AuthUser::from_identity(&i))
                .ok_or(AuthFailure::Invalid)
        }
        Credential::Token(token) => {
            let claims = auth::validate_token(&token, &settings.jwt_secret)?;
            let id: u32 = claims.sub.parse().map_err(|_| AuthFailure::Invalid)?;
            state
                .identities
                .by_id(id)
                .await
                .map(|i| AuthUser::from_identity(&i))
                .ok_or(AuthFailure::Invalid)
        }
    }
}

/// Wraps every route: loopback block, ban check, then authentication for everything but
/// the public paths. Inserts [`PeerIp`] and, when authenticated, [`AuthUser`].
pub async fn auth_gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let ip = peer_ip(&req);
    let settings = state.config.settings().await;

    if settings.block_loopback && ip.is_loopback() {
        return AuthFailure::LoopbackBlocked.into_response();
    }
    if state.guard.is_banned(ip) {
        return AuthFailure::Banned.into_response();
    }
    req.extensions_mut().insert(PeerIp(ip));

    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    match authenticate(&state, &settings, req.headers(), req.uri()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(failure) => {
            if failure.counted() {
                state.guard.record_failure(ip, &BanPolicy::from(&settings));
            }
            tracing::debug!(%ip, path = %req.uri().path(), %failure, "request rejected");
            failure.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: usize, exempt_loopback: bool) -> BanPolicy {
        BanPolicy {
            threshold,
            window: Duration::from_secs(60),
            duration: Duration::from_secs(60),
            exempt_loopback,
        }
    }

    #[test]
    fn threshold_failures_ban_the_address() {
        let tracker = FailureTracker::new();
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let p = policy(3, true);

        assert!(!tracker.record_failure(ip, &p));
        assert!(!tracker.record_failure(ip, &p));
        assert!(!tracker.is_banned(ip));
        assert!(tracker.record_failure(ip, &p));
        assert!(tracker.is_banned(ip));
        assert!(!tracker.is_banned("203.0.113.8".parse().unwrap()));
    }

    #[test]
    fn failures_outside_the_window_do_not_accumulate() {
        let tracker = FailureTracker::new();
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        let p = BanPolicy {
            window: Duration::from_millis(20),
            ..policy(2, false)
        };

        assert!(!tracker.record_failure(ip, &p));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!tracker.record_failure(ip, &p));
        assert!(!tracker.is_banned(ip));
    }

    #[test]
    fn loopback_exemption_is_honoured() {
        let tracker = FailureTracker::new();
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..5 {
            tracker.record_failure(lo, &policy(1, true));
        }
        assert!(!tracker.is_banned(lo));
        assert!(tracker.record_failure(lo, &policy(1, false)));
    }

    #[test]
    fn credentials_are_found_in_every_carrier() {
        let uri: Uri = "/api/ws?access_token=q-token".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert!(matches!(credential(&headers, &uri), Some(Credential::Token(t)) if t == "q-token"));

        headers.insert("cookie", "access=c-token".parse().unwrap());
        assert!(matches!(credential(&headers, &uri), Some(Credential::Token(t)) if t == "c-token"));

        headers.insert(ACCESS_TOKEN_HEADER, "h-token".parse().unwrap());
        assert!(matches!(credential(&headers, &uri), Some(Credential::Token(t)) if t == "h-token"));

        headers.insert("authorization", "Bearer b-token".parse().unwrap());
        assert!(matches!(credential(&headers, &uri), Some(Credential::Token(t)) if t == "b-token"));

        headers.insert(API_KEY_HEADER, "key".parse().unwrap());
        assert!(matches!(credential(&headers, &uri), Some(Credential::ApiKey(k)) if k == "key"));

        assert!(credential(&HeaderMap::new(), &"/api/instances".parse().unwrap()).is_none());
    }
}
