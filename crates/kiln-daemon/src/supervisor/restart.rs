use std::time::Duration;

use crate::store::{Instance, Settings};

use super::child::ExitReport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RestartConfig {
    pub(crate) auto: bool,
    pub(crate) force: bool,
    pub(crate) max_retries: u32,
    pub(crate) backoff_ms: u64,
    pub(crate) backoff_max_ms: u64,
    pub(crate) stable_after: Duration,
}

impl RestartConfig {
    pub(crate) fn new(instance: &Instance, settings: &Settings) -> Self {
        Self {
            auto: instance.auto_restart,
            force: instance.force_auto_restart,
            max_retries: settings.restart_max_retries,
            backoff_ms: settings.restart_backoff_ms,
            backoff_max_ms: settings.restart_backoff_max_ms.max(settings.restart_backoff_ms),
            stable_after: Duration::from_secs(settings.restart_stable_secs),
        }
    }
}

/// How the process went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExitCause {
    /// `stop`, `restart` or daemon shutdown asked for it.
    Requested,
    /// Exit code 0 without a stop request, e.g. `stop` typed into the console.
    Clean,
    /// Non-zero code, killed by a signal, or the wait itself failed.
    Failure,
}

impl ExitCause {
    pub(crate) fn classify(report: &ExitReport, stop_requested: bool) -> Self {
        if stop_requested {
            Self::Requested
        } else if report.success {
            Self::Clean
        } else {
            Self::Failure
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    Stay,
    Restart { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Decides what follows an exit. `attempts` counts consecutive policy restarts so far.
///
/// Requested exits never restart. Clean exits restart only with `force`. Failures
/// restart with either flag. A run that lived `stable_after` resets the count.
pub(crate) fn decide(
    cfg: RestartConfig,
    cause: ExitCause,
    runtime: Duration,
    attempts: u32,
) -> RestartDecision {
    let wanted = match cause {
        ExitCause::Requested => false,
        ExitCause::Clean => cfg.force,
        ExitCause::Failure => cfg.auto || cfg.force,
    };
    if !wanted {
        return RestartDecision::Stay;
    }

    let attempts = if runtime >= cfg.stable_after { 0 } else { attempts };
    if attempts >= cfg.max_retries {
        return RestartDecision::GiveUp { attempts };
    }

    let attempt = attempts + 1;
    RestartDecision::Restart {
        attempt,
        delay: Duration::from_millis(compute_backoff_ms(cfg, attempt)),
    }
}

pub(crate) fn compute_backoff_ms(cfg: RestartConfig, attempt: u32) -> u64 {
    // attempt is 1-based.
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
    cfg.backoff_ms.saturating_mul(mult).min(cfg.backoff_max_ms)
}
