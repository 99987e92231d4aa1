//! Bootstrap configuration read from the environment.
//!
//! Everything that can change at runtime lives in the settings document
//! (see [`crate::store::settings`]); only what is needed before the stores
//! are open is read here.

use std::{net::SocketAddr, path::PathBuf};

const DEFAULT_LISTEN: &str = "0.0.0.0:25700";

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

pub fn data_root() -> PathBuf {
    env_string("KILN_DATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./data"))
}

pub fn listen_addr() -> anyhow::Result<SocketAddr> {
    let raw = env_string("KILN_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    raw.parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid KILN_LISTEN {raw:?}: {e}"))
}

/// Credentials for the administrator created on first boot.
///
/// When `KILN_ADMIN_PASS` is unset a random password is generated and logged once.
pub fn bootstrap_admin() -> (String, Option<String>) {
    let user = env_string("KILN_ADMIN_USER").unwrap_or_else(|| "admin".to_string());
    (user, env_string("KILN_ADMIN_PASS"))
}

/// Skip auto-starting instances and tunnels flagged `run_on_startup`.
pub fn skip_autostart() -> bool {
    env_bool("KILN_NO_AUTOSTART").unwrap_or(false)
}
