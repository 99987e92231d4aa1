use std::path::{Path, PathBuf};

use base64::Engine;
use kiln_process::InstanceId;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::document::Document;
use super::settings::{SettingKey, Settings};

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_stop_command() -> String {
    "stop".to_string()
}

fn default_java() -> String {
    "java".to_string()
}

/// Persisted configuration of one managed server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub id: InstanceId,
    pub name: String,
    pub base_path: PathBuf,
    /// Interpreter used to launch `core`. Empty or `none` runs `core` directly.
    #[serde(default = "default_java")]
    pub java: String,
    /// Jar file name, `@argfile`, or executable relative to `base_path`.
    pub core: String,
    #[serde(default)]
    pub min_memory_mb: u32,
    #[serde(default)]
    pub max_memory_mb: u32,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_encoding")]
    pub input_encoding: String,
    #[serde(default = "default_encoding")]
    pub output_encoding: String,
    #[serde(default = "default_encoding")]
    pub file_encoding: String,
    #[serde(default)]
    pub backup_max_count: u32,
    #[serde(default)]
    pub backup_delay_secs: u64,
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub force_auto_restart: bool,
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Instance {
    /// Returns the first violated constraint, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must be non-empty".to_string());
        }
        if self.base_path.as_os_str().is_empty() {
            return Err("base_path must be non-empty".to_string());
        }
        if self.core.trim().is_empty() {
            return Err("core must be non-empty".to_string());
        }
        if self.max_memory_mb != 0 && self.min_memory_mb > self.max_memory_mb {
            return Err("min_memory_mb must not exceed max_memory_mb".to_string());
        }
        for (field, label) in [
            ("input_encoding", &self.input_encoding),
            ("output_encoding", &self.output_encoding),
            ("file_encoding", &self.file_encoding),
        ] {
            if encoding_rs::Encoding::for_label(label.trim().as_bytes()).is_none() {
                return Err(format!("{field}: unknown encoding {label:?}"));
            }
        }
        if self.stop_command.contains('\n') {
            return Err("stop_command must be a single line".to_string());
        }
        Ok(())
    }
}

/// On-disk instance list. `last_id` is the high-water mark of every ID ever handed out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceList {
    #[serde(default)]
    pub last_id: u32,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl InstanceList {
    fn high_water(&self) -> u32 {
        self.instances
            .iter()
            .map(|i| i.id.0)
            .max()
            .unwrap_or(0)
            .max(self.last_id)
    }
}

/// Cache over `settings.json` and `instances.json`, each behind its own lock.
#[derive(Debug)]
pub struct ConfigStore {
    settings: Document<Settings>,
    instances: Document<InstanceList>,
}

impl ConfigStore {
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        let settings = Document::<Settings>::open(root.join("settings.json")).await?;
        let instances = Document::<InstanceList>::open(root.join("instances.json")).await?;

        let loaded = settings.read().await;
        if let Err(e) = loaded.validate() {
            anyhow::bail!("invalid settings in {}: {e}", settings.path().display());
        }
        if loaded.jwt_secret.is_empty() {
            let secret = random_secret();
            settings.write(|s| s.jwt_secret = secret).await?;
            tracing::info!("generated jwt secret");
        }

        Ok(Self {
            settings,
            instances,
        })
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await
    }

    pub async fn setting(&self, key: SettingKey) -> serde_json::Value {
        self.settings.read_with(|s| s.get(key)).await
    }

    /// Replaces the whole settings document. Returns the first violation on invalid input.
    pub async fn write_settings(&self, next: Settings) -> anyhow::Result<Result<(), String>> {
        if let Err(e) = next.validate() {
            return Ok(Err(e));
        }
        self.settings.write(|s| *s = next).await?;
        Ok(Ok(()))
    }

    pub async fn set_setting(
        &self,
        key: SettingKey,
        value: serde_json::Value,
    ) -> anyhow::Result<Result<(), String>> {
        let mut rejected = None;
        self.settings
            .update(|s| match s.with(key, value) {
                Ok(next) => {
                    *s = next;
                    Some(())
                }
                Err(e) => {
                    rejected = Some(e);
                    None
                }
            })
            .await?;
        Ok(match rejected {
            Some(e) => Err(e),
            None => Ok(()),
        })
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        self.instances.read_with(|l| l.instances.clone()).await
    }

    pub async fn instance(&self, id: InstanceId) -> Option<Instance> {
        self.instances
            .read_with(|l| l.instances.iter().find(|i| i.id == id).cloned())
            .await
    }

    /// Inserts a new instance. `false` when the ID is already taken.
    pub async fn create_instance(&self, instance: Instance) -> anyhow::Result<bool> {
        let created = self
            .instances
            .update(|l| {
                if l.instances.iter().any(|i| i.id == instance.id) {
                    return None;
                }
                l.last_id = l.last_id.max(instance.id.0);
                l.instances.push(instance);
                Some(())
            })
            .await?;
        Ok(created.is_some())
    }

    /// Full replace. `false` when no instance has this ID.
    pub async fn update_instance(&self, instance: Instance) -> anyhow::Result<bool> {
        let updated = self
            .instances
            .update(|l| {
                let slot = l.instances.iter_mut().find(|i| i.id == instance.id)?;
                *slot = instance;
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn delete_instance(&self, id: InstanceId) -> anyhow::Result<bool> {
        let deleted = self
            .instances
            .update(|l| {
                let pos = l.instances.iter().position(|i| i.id == id)?;
                l.instances.remove(pos);
                Some(())
            })
            .await?;
        Ok(deleted.is_some())
    }

    /// Hands out `max(existing, last_id) + 1` and records it, so the ID is never handed
    /// out again, even after the instance that ends up using it is deleted.
    pub async fn generate_next_id(&self) -> anyhow::Result<InstanceId> {
        self.instances
            .write(|l| {
                let next = l.high_water().saturating_add(1);
                l.last_id = next;
                InstanceId(next)
            })
            .await
    }
}

fn random_secret() -> String {
    let mut buf = [0u8; 48];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
pub(crate) fn test_instance(id: u32, base: &Path) -> Instance {
    Instance {
        id: InstanceId(id),
        name: format!("server-{id}"),
        base_path: base.to_path_buf(),
        java: "java".to_string(),
        core: "server.jar".to_string(),
        min_memory_mb: 512,
        max_memory_mb: 1024,
        args: Vec::new(),
        input_encoding: default_encoding(),
        output_encoding: default_encoding(),
        file_encoding: default_encoding(),
        backup_max_count: 0,
        backup_delay_secs: 0,
        backup_path: None,
        auto_restart: false,
        force_auto_restart: false,
        run_on_startup: false,
        stop_command: default_stop_command(),
        created_at: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    async fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn first_id_is_one() {
        let (_dir, store) = store().await;
        assert_eq!(store.generate_next_id().await.unwrap(), InstanceId(1));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let (dir, store) = store().await;
        assert!(store.create_instance(test_instance(1, dir.path())).await.unwrap());
        assert!(!store.create_instance(test_instance(1, dir.path())).await.unwrap());
        assert_eq!(store.list_instances().await.len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_require_existing_id() {
        let (dir, store) = store().await;
        assert!(!store.update_instance(test_instance(4, dir.path())).await.unwrap());
        assert!(!store.delete_instance(InstanceId(4)).await.unwrap());

        store.create_instance(test_instance(4, dir.path())).await.unwrap();
        let mut changed = test_instance(4, dir.path());
        changed.name = "renamed".to_string();
        assert!(store.update_instance(changed).await.unwrap());
        assert_eq!(store.instance(InstanceId(4)).await.unwrap().name, "renamed");
        assert!(store.delete_instance(InstanceId(4)).await.unwrap());
        assert!(store.instance(InstanceId(4)).await.is_none());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_deleting_the_highest() {
        let (dir, store) = store().await;
        let a = store.generate_next_id().await.unwrap();
        store.create_instance(test_instance(a.0, dir.path())).await.unwrap();
        let b = store.generate_next_id().await.unwrap();
        store.create_instance(test_instance(b.0, dir.path())).await.unwrap();
        store.delete_instance(b).await.unwrap();

        let c = store.generate_next_id().await.unwrap();
        assert!(c > b);
    }

    #[tokio::test]
    async fn mixed_mutations_never_produce_duplicate_ids() {
        let (dir, store) = store().await;
        for round in 0..20u32 {
            let id = store.generate_next_id().await.unwrap();
            assert!(store.instance(id).await.is_none());
            store.create_instance(test_instance(id.0, dir.path())).await.unwrap();
            if round % 3 == 0 {
                store.delete_instance(id).await.unwrap();
            }
            if round % 5 == 0 {
                // Explicit ID that collides with an existing one must be refused.
                let list = store.list_instances().await;
                if let Some(existing) = list.first() {
                    let dup = test_instance(existing.id.0, dir.path());
                    assert!(!store.create_instance(dup).await.unwrap());
                }
            }
            let ids: Vec<_> = store.list_instances().await.iter().map(|i| i.id).collect();
            let unique: HashSet<_> = ids.iter().collect();
            assert_eq!(ids.len(), unique.len());
        }
    }

    #[tokio::test]
    async fn concurrent_id_generation_hands_out_distinct_ids() {
        let (_dir, store) = store().await;
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.generate_next_id().await.unwrap() }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
    }

    #[tokio::test]
    async fn jwt_secret_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = ConfigStore::open(dir.path()).await.unwrap().settings().await;
        assert!(!first.jwt_secret.is_empty());
        let second = ConfigStore::open(dir.path()).await.unwrap().settings().await;
        assert_eq!(first.jwt_secret, second.jwt_secret);
    }

    #[tokio::test]
    async fn single_key_write_persists_and_validates() {
        let (dir, store) = store().await;
        store
            .set_setting(SettingKey::BanThreshold, serde_json::json!(3))
            .await
            .unwrap()
            .unwrap();
        assert!(
            store
                .set_setting(SettingKey::BanThreshold, serde_json::json!(-1))
                .await
                .unwrap()
                .is_err()
        );

        let reopened = ConfigStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.setting(SettingKey::BanThreshold).await,
            serde_json::json!(3)
        );
    }

    #[test]
    fn validate_reports_unknown_encoding() {
        let mut inst = test_instance(1, Path::new("/srv/mc"));
        inst.output_encoding = "klingon".to_string();
        assert!(inst.validate().unwrap_err().contains("output_encoding"));
        inst.output_encoding = "gbk".to_string();
        assert!(inst.validate().is_ok());
    }
}
