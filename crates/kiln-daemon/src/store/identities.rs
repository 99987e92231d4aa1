use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::document::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub provider: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: u32,
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub api_key: Option<String>,
    /// `instance:*`, `instance:<id>`, `tunnel:*`, `tunnel:<id>`.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external: Vec<ExternalLink>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityList {
    #[serde(default)]
    pub users: Vec<Identity>,
}

/// Persisted user records (`users.json`).
#[derive(Debug)]
pub struct IdentityStore {
    doc: Document<IdentityList>,
}

impl IdentityStore {
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            doc: Document::open(root.join("users.json")).await?,
        })
    }

    pub async fn list(&self) -> Vec<Identity> {
        self.doc.read_with(|l| l.users.clone()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.doc.read_with(|l| l.users.is_empty()).await
    }

    pub async fn by_id(&self, id: u32) -> Option<Identity> {
        self.find(|u| u.id == id).await
    }

    pub async fn by_username(&self, username: &str) -> Option<Identity> {
        let username = username.trim();
        self.find(|u| u.username.eq_ignore_ascii_case(username)).await
    }

    pub async fn by_api_key(&self, key: &str) -> Option<Identity> {
        if key.is_empty() {
            return None;
        }
        self.find(|u| u.api_key.as_deref() == Some(key)).await
    }

    pub async fn by_external(&self, provider: &str, subject: &str) -> Option<Identity> {
        self.find(|u| {
            u.external
                .iter()
                .any(|l| l.provider == provider && l.subject == subject)
        })
        .await
    }

    async fn find(&self, pred: impl Fn(&Identity) -> bool) -> Option<Identity> {
        self.doc
            .read_with(|l| l.users.iter().find(|u| pred(u)).cloned())
            .await
    }

    /// Stores a new identity under the next free ID. `None` when the username is taken.
    pub async fn create(&self, mut user: Identity) -> anyhow::Result<Option<Identity>> {
        self.doc
            .update(|l| {
                if l
                    .users
                    .iter()
                    .any(|u| u.username.eq_ignore_ascii_case(&user.username))
                {
                    return None;
                }
                user.id = l.users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
                l.users.push(user.clone());
                Some(user)
            })
            .await
    }

    /// Applies `f` to the identity with `id`. `None` when absent.
    pub async fn modify<R>(
        &self,
        id: u32,
        f: impl FnOnce(&mut Identity) -> R,
    ) -> anyhow::Result<Option<R>> {
        self.doc
            .update(|l| {
                let user = l.users.iter_mut().find(|u| u.id == id)?;
                Some(f(user))
            })
            .await
    }

    pub async fn delete(&self, id: u32) -> anyhow::Result<bool> {
        let deleted = self
            .doc
            .update(|l| {
                let pos = l.users.iter().position(|u| u.id == id)?;
                l.users.remove(pos);
                Some(())
            })
            .await?;
        Ok(deleted.is_some())
    }
}
