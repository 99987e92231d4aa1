pub mod config;
pub mod document;
pub mod identities;
pub mod settings;
pub mod tasks;
pub mod tunnels;

pub use config::{ConfigStore, Instance};
pub use identities::{Identity, IdentityStore, Role};
pub use settings::{SettingKey, Settings};
pub use tasks::{ScheduleTask, TaskAction, TaskStore};
pub use tunnels::{ConfigFormat, Tunnel, TunnelStore};
