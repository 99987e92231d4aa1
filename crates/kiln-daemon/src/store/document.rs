use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{io::AsyncWriteExt, sync::RwLock};

/// A JSON document on disk with an in-memory cache guarded by its own reader/writer lock.
///
/// Reads hand out clones. Writes apply the mutation to a copy, persist the copy and only
/// then swap it into the cache, all while holding the write lock: the cache never runs
/// ahead of the disk, and a failed write leaves both untouched.
#[derive(Debug)]
pub struct Document<T> {
    path: PathBuf,
    cache: RwLock<T>,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync,
{
    /// Loads the document, creating it with defaults when missing.
    ///
    /// A document that exists but does not parse is an error; callers treat it as fatal.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let value = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<T>(&raw)
                .with_context(|| format!("malformed document {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let value = T::default();
                persist(&path, &value).await?;
                value
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read document {}", path.display()));
            }
        };

        Ok(Self {
            path,
            cache: RwLock::new(value),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> T {
        self.cache.read().await.clone()
    }

    /// Runs `f` against the cached value under the read lock.
    pub async fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.cache.read().await;
        f(&guard)
    }

    /// Applies `f` and persists unconditionally.
    pub async fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> anyhow::Result<R> {
        let mut guard = self.cache.write().await;
        let mut next = guard.clone();
        let out = f(&mut next);
        persist(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }

    /// Applies `f`; persists only when it returns `Some`.
    ///
    /// `Ok(None)` means the mutation was rejected and nothing changed.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut T) -> Option<R>,
    ) -> anyhow::Result<Option<R>> {
        let mut guard = self.cache.write().await;
        let mut next = guard.clone();
        let Some(out) = f(&mut next) else {
            return Ok(None);
        };
        persist(&self.path, &next).await?;
        *guard = next;
        Ok(Some(out))
    }
}

async fn persist<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let data = serde_json::to_vec_pretty(value).context("serialize document")?;
    let tmp = path.with_extension("json.tmp");
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.sync_all()
        .await
        .with_context(|| format!("fsync {}", tmp.display()))?;
    drop(f);

    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Doc {
        items: Vec<u32>,
    }

    #[tokio::test]
    async fn open_creates_missing_document_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        let doc = Document::<Doc>::open(&path).await.unwrap();
        assert_eq!(doc.read().await, Doc::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Document::<Doc>::open(&path).await.unwrap();
        doc.write(|d| d.items.push(3)).await.unwrap();
        drop(doc);

        let doc = Document::<Doc>::open(&path).await.unwrap();
        assert_eq!(doc.read().await.items, vec![3]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn malformed_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = Document::<Doc>::open(&path).await.unwrap_err();
        assert!(err.to_string().contains("malformed document"));
    }

    #[tokio::test]
    async fn rejected_update_leaves_cache_and_disk_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Document::<Doc>::open(&path).await.unwrap();
        doc.write(|d| d.items.push(1)).await.unwrap();

        let out = doc
            .update(|d| {
                d.items.push(2);
                None::<()>
            })
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(doc.read().await.items, vec![1]);

        let on_disk: Doc = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.items, vec![1]);
    }

    #[tokio::test]
    async fn failed_persist_leaves_cache_and_disk_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Document::<Doc>::open(&path).await.unwrap();
        doc.write(|d| d.items.push(1)).await.unwrap();

        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let err = doc.write(|d| d.items.push(2)).await.unwrap_err();
        assert!(err.to_string().starts_with("create "), "{err:#}");
        assert_eq!(doc.read().await.items, vec![1]);

        let on_disk: Doc = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.items, vec![1]);
    }

    #[tokio::test]
    async fn reads_are_isolated_copies() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::<Doc>::open(dir.path().join("doc.json"))
            .await
            .unwrap();
        let mut copy = doc.read().await;
        copy.items.push(42);
        assert!(doc.read().await.items.is_empty());
    }
}
