use serde::{Deserialize, Serialize};

/// Daemon-wide runtime settings (`settings.json`).
///
/// Missing keys are filled from [`Default`] on load; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Global administrative API key. Empty disables it.
    pub api_key: String,
    pub jwt_secret: String,
    pub token_ttl_minutes: u64,

    /// Refuse every request coming from a loopback address.
    pub block_loopback: bool,
    pub ban_threshold: u32,
    pub ban_window_secs: u64,
    pub ban_duration_secs: u64,
    pub ban_exempt_loopback: bool,

    pub stop_timeout_secs: u64,
    pub restart_max_retries: u32,
    pub restart_backoff_ms: u64,
    pub restart_backoff_max_ms: u64,
    /// A run that lasts this long resets the restart attempt counter.
    pub restart_stable_secs: u64,
    pub log_max_lines: usize,

    pub job_queue_capacity: usize,
    pub job_workers: usize,

    pub frpc_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            jwt_secret: String::new(),
            token_ttl_minutes: 24 * 60,
            block_loopback: false,
            ban_threshold: 5,
            ban_window_secs: 300,
            ban_duration_secs: 1800,
            ban_exempt_loopback: true,
            stop_timeout_secs: 30,
            restart_max_retries: 5,
            restart_backoff_ms: 5_000,
            restart_backoff_max_ms: 60_000,
            restart_stable_secs: 120,
            log_max_lines: 1000,
            job_queue_capacity: 16,
            job_workers: 2,
            frpc_path: "frpc".to_string(),
        }
    }
}

impl Settings {
    /// Returns the first violated constraint, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_ttl_minutes == 0 {
            return Err("token_ttl_minutes must be positive".to_string());
        }
        if self.ban_threshold == 0 {
            return Err("ban_threshold must be positive".to_string());
        }
        if self.ban_window_secs == 0 || self.ban_duration_secs == 0 {
            return Err("ban windows must be positive".to_string());
        }
        if !(1..=3600).contains(&self.stop_timeout_secs) {
            return Err("stop_timeout_secs must be within 1..=3600".to_string());
        }
        if self.restart_backoff_ms < 100 {
            return Err("restart_backoff_ms must be at least 100".to_string());
        }
        if self.restart_backoff_max_ms < self.restart_backoff_ms {
            return Err("restart_backoff_max_ms must be >= restart_backoff_ms".to_string());
        }
        if !(10..=100_000).contains(&self.log_max_lines) {
            return Err("log_max_lines must be within 10..=100000".to_string());
        }
        if !(1..=1024).contains(&self.job_queue_capacity) {
            return Err("job_queue_capacity must be within 1..=1024".to_string());
        }
        if !(1..=16).contains(&self.job_workers) {
            return Err("job_workers must be within 1..=16".to_string());
        }
        if self.frpc_path.trim().is_empty() {
            return Err("frpc_path must be non-empty".to_string());
        }
        Ok(())
    }
}

/// The recognised settings keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    ApiKey,
    JwtSecret,
    TokenTtlMinutes,
    BlockLoopback,
    BanThreshold,
    BanWindowSecs,
    BanDurationSecs,
    BanExemptLoopback,
    StopTimeoutSecs,
    RestartMaxRetries,
    RestartBackoffMs,
    RestartBackoffMaxMs,
    RestartStableSecs,
    LogMaxLines,
    JobQueueCapacity,
    JobWorkers,
    FrpcPath,
}

impl SettingKey {
    pub const ALL: [SettingKey; 17] = [
        Self::ApiKey,
        Self::JwtSecret,
        Self::TokenTtlMinutes,
        Self::BlockLoopback,
        Self::BanThreshold,
        Self::BanWindowSecs,
        Self::BanDurationSecs,
        Self::BanExemptLoopback,
        Self::StopTimeoutSecs,
        Self::RestartMaxRetries,
        Self::RestartBackoffMs,
        Self::RestartBackoffMaxMs,
        Self::RestartStableSecs,
        Self::LogMaxLines,
        Self::JobQueueCapacity,
        Self::JobWorkers,
        Self::FrpcPath,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::JwtSecret => "jwt_secret",
            Self::TokenTtlMinutes => "token_ttl_minutes",
            Self::BlockLoopback => "block_loopback",
            Self::BanThreshold => "ban_threshold",
            Self::BanWindowSecs => "ban_window_secs",
            Self::BanDurationSecs => "ban_duration_secs",
            Self::BanExemptLoopback => "ban_exempt_loopback",
            Self::StopTimeoutSecs => "stop_timeout_secs",
            Self::RestartMaxRetries => "restart_max_retries",
            Self::RestartBackoffMs => "restart_backoff_ms",
            Self::RestartBackoffMaxMs => "restart_backoff_max_ms",
            Self::RestartStableSecs => "restart_stable_secs",
            Self::LogMaxLines => "log_max_lines",
            Self::JobQueueCapacity => "job_queue_capacity",
            Self::JobWorkers => "job_workers",
            Self::FrpcPath => "frpc_path",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }

    /// Secrets are never returned by the HTTP surface.
    pub fn is_secret(self) -> bool {
        matches!(self, Self::JwtSecret)
    }
}

impl Settings {
    pub fn get(&self, key: SettingKey) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get(key.as_str()).cloned())
            .unwrap_or(serde_json::Value::Null)
    }

    /// Returns a copy with `key` replaced, type-checked through the typed struct.
    pub fn with(&self, key: SettingKey, value: serde_json::Value) -> Result<Settings, String> {
        let mut raw = serde_json::to_value(self).map_err(|e| e.to_string())?;
        let Some(map) = raw.as_object_mut() else {
            return Err("settings are not an object".to_string());
        };
        map.insert(key.as_str().to_string(), value);
        let next: Settings = serde_json::from_value(raw)
            .map_err(|e| format!("invalid value for {}: {e}", key.as_str()))?;
        next.validate()?;
        Ok(next)
    }
}
