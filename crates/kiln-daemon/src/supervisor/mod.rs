pub mod child;
pub mod instance;
pub mod launch;
pub mod logs;
pub(crate) mod restart;
pub mod tunnel;

pub use instance::InstanceSupervisor;
pub use tunnel::TunnelSupervisor;

/// Outcomes of supervisor operations other than success.
///
/// The first three are expected conditions and carry no side effects; `Spawn` and `Io`
/// wrap unexpected faults.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("failed to start {0}: {1:#}")]
    Spawn(String, anyhow::Error),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
