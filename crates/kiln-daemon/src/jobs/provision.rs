use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{Job, JobRunner, Reporter, download};
use crate::store::{ConfigStore, Instance};

/// Body of `POST /api/instances`: the instance record plus how to obtain its core.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(flatten)]
    pub instance: Instance,
    /// Download the core from here into `base_path/core`.
    #[serde(default)]
    pub core_url: Option<String>,
    #[serde(default)]
    pub core_sha1: Option<String>,
    /// Copy the core from a local file instead.
    #[serde(default)]
    pub core_source: Option<PathBuf>,
    #[serde(default)]
    pub accept_eula: bool,
}

impl CreateInstanceRequest {
    /// First problem with the request, checked before anything is queued.
    pub fn validate(&self) -> Result<(), String> {
        self.instance.validate()?;
        if self.core_url.is_some() && self.core_source.is_some() {
            return Err("core_url and core_source are mutually exclusive".to_string());
        }
        let fetched = self.core_url.is_some() || self.core_source.is_some();
        if fetched && !plain_file_name(&self.instance.core) {
            return Err(
                "core must be a plain file name when it is downloaded or copied".to_string(),
            );
        }
        if let Some(url) = &self.core_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err("core_url must be an http(s) URL".to_string());
        }
        Ok(())
    }
}

fn plain_file_name(core: &str) -> bool {
    !core.starts_with('@') && !core.contains(['/', '\\']) && core != ".." && core != "."
}

fn ensure_live(cancel: &CancellationToken) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!("cancelled: daemon is shutting down");
    }
    Ok(())
}

/// Creates instances: directory, core, eula, record.
pub struct Provisioner {
    config: Arc<ConfigStore>,
    http: reqwest::Client,
}

impl Provisioner {
    pub fn new(config: Arc<ConfigStore>) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            http: download::http_client()?,
        })
    }

    async fn obtain_core(
        &self,
        req: &CreateInstanceRequest,
        instance: &Instance,
        reporter: &Reporter,
    ) -> anyhow::Result<()> {
        let target = instance.base_path.join(instance.core.trim());

        if let Some(url) = &req.core_url {
            reporter.progress(20, format!("downloading {url}"));
            let bytes = download::download_to(
                &self.http,
                url,
                &target,
                req.core_sha1.as_deref(),
                |done, total| {
                    if total > 0 {
                        let pct = 20 + (done.min(total) * 60 / total) as u8;
                        reporter.progress(pct, format!("downloading core ({done}/{total} bytes)"));
                    }
                },
            )
            .await?;
            reporter.progress(80, format!("downloaded core ({bytes} bytes)"));
            return Ok(());
        }

        if let Some(source) = &req.core_source {
            reporter.progress(20, format!("copying {}", source.display()));
            tokio::fs::copy(source, &target)
                .await
                .with_context(|| format!("copy {} -> {}", source.display(), target.display()))?;
            reporter.progress(80, "copied core");
            return Ok(());
        }

        let core = instance.core.trim();
        let expected = match core.strip_prefix('@') {
            Some(argfile) => instance.base_path.join(argfile),
            None => instance.base_path.join(core),
        };
        if !tokio::fs::try_exists(&expected).await.unwrap_or(false) {
            anyhow::bail!("core {} does not exist", expected.display());
        }
        reporter.progress(80, "core present");
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobRunner for Provisioner {
    async fn run(
        &self,
        job: Job,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let req = job.request;
        let mut instance = req.instance.clone();
        instance.id = job.id;

        reporter.progress(5, "validating");
        req.validate().map_err(|e| anyhow::anyhow!("invalid request: {e}"))?;
        if self.config.instance(job.id).await.is_some() {
            anyhow::bail!("instance {} already exists", job.id);
        }
        ensure_live(cancel)?;

        tokio::fs::create_dir_all(&instance.base_path)
            .await
            .with_context(|| format!("create {}", instance.base_path.display()))?;
        reporter.progress(15, "created base directory");
        ensure_live(cancel)?;

        self.obtain_core(&req, &instance, reporter).await?;
        ensure_live(cancel)?;

        if req.accept_eula {
            let eula = instance.base_path.join("eula.txt");
            tokio::fs::write(&eula, "eula=true\n")
                .await
                .with_context(|| format!("write {}", eula.display()))?;
            reporter.progress(85, "accepted eula");
        }
        ensure_live(cancel)?;

        instance.created_at = Some(chrono::Utc::now());
        if !self.config.create_instance(instance).await? {
            anyhow::bail!("instance {} already exists", job.id);
        }
        reporter.progress(95, "saved instance");

        Ok(format!("instance {} created", job.id))
    }
}
