use std::path::Path;

use kiln_process::TunnelId;
use serde::{Deserialize, Serialize};

use super::document::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Toml,
    Ini,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Toml => "toml",
            Self::Ini => "ini",
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

fn default_provider() -> String {
    "frp".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub config_format: ConfigFormat,
    /// Client configuration, written to disk verbatim before launch.
    pub config: String,
    #[serde(default)]
    pub run_on_startup: bool,
}

impl Tunnel {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must be non-empty".to_string());
        }
        if self.config.trim().is_empty() {
            return Err("config must be non-empty".to_string());
        }
        crate::supervisor::tunnel::check_config(self.config_format, &self.config)
            .map_err(|e| format!("config: {e}"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelList {
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

/// Persisted tunnel definitions (`tunnels.json`).
#[derive(Debug)]
pub struct TunnelStore {
    doc: Document<TunnelList>,
}

impl TunnelStore {
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            doc: Document::open(root.join("tunnels.json")).await?,
        })
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        self.doc.read_with(|l| l.tunnels.clone()).await
    }

    pub async fn get(&self, id: TunnelId) -> Option<Tunnel> {
        self.doc
            .read_with(|l| l.tunnels.iter().find(|t| t.id == id).cloned())
            .await
    }

    /// Assigns the next free ID and stores the tunnel.
    pub async fn create(&self, mut tunnel: Tunnel) -> anyhow::Result<Tunnel> {
        self.doc
            .write(|l| {
                let next = l.tunnels.iter().map(|t| t.id.0).max().unwrap_or(0) + 1;
                tunnel.id = TunnelId(next);
                l.tunnels.push(tunnel.clone());
                tunnel
            })
            .await
    }

    pub async fn update(&self, tunnel: Tunnel) -> anyhow::Result<bool> {
        let updated = self
            .doc
            .update(|l| {
                let slot = l.tunnels.iter_mut().find(|t| t.id == tunnel.id)?;
                *slot = tunnel;
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn delete(&self, id: TunnelId) -> anyhow::Result<bool> {
        let deleted = self
            .doc
            .update(|l| {
                let pos = l.tunnels.iter().position(|t| t.id == id)?;
                l.tunnels.remove(pos);
                Some(())
            })
            .await?;
        Ok(deleted.is_some())
    }
}
