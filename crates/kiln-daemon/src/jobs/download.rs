use std::{path::Path, time::Duration};

use anyhow::Context;
use futures_util::StreamExt;
use sha1::Digest;
use tokio::io::AsyncWriteExt;

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("kiln-daemon/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30 * 60))
        .build()
        .context("build http client")
}

/// Streams `url` into `dest` (via a temp file and rename), verifying `expected_sha1` when
/// given. `on_progress(downloaded, total)` is called at most every 300ms; `total` is 0 when
/// the server sends no length. Returns the number of bytes written.
pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    expected_sha1: Option<&str>,
    mut on_progress: impl FnMut(u64, u64),
) -> anyhow::Result<u64> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("download {url}"))?
        .error_for_status()
        .with_context(|| format!("download {url} (status)"))?;
    let total = resp.content_length().unwrap_or(0);

    let tmp = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    let mut hasher = sha1::Sha1::new();
    let mut downloaded = 0u64;
    let mut last_emit = tokio::time::Instant::now();
    let mut stream = resp.bytes_stream();

    let res: anyhow::Result<()> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("read body of {url}"))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", tmp.display()))?;
            downloaded = downloaded.saturating_add(chunk.len() as u64);

            if last_emit.elapsed() >= Duration::from_millis(300) {
                on_progress(downloaded, total.max(downloaded));
                last_emit = tokio::time::Instant::now();
            }
        }
        file.sync_all().await?;
        Ok(())
    }
    .await;
    drop(file);
    if let Err(err) = res {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    if let Some(expected) = expected_sha1.map(str::trim).filter(|s| !s.is_empty()) {
        let got = hex::encode(hasher.finalize());
        if !got.eq_ignore_ascii_case(expected) {
            let _ = tokio::fs::remove_file(&tmp).await;
            anyhow::bail!("sha1 mismatch for {url}: expected {expected}, got {got}");
        }
    }

    tokio::fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
    on_progress(downloaded, total.max(downloaded));
    Ok(downloaded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serves `body` at `/core.jar` on an ephemeral port.
    pub(crate) async fn serve(body: &'static [u8]) -> String {
        let app = axum::Router::new().route("/core.jar", axum::routing::get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/core.jar")
    }

    #[tokio::test]
    async fn downloads_and_verifies_checksum() {
        let url = serve(b"hello world").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        let mut last = (0, 0);

        let n = download_to(
            &http_client().unwrap(),
            &url,
            &dest,
            Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"),
            |done, total| last = (done, total),
        )
        .await
        .unwrap();

        assert_eq!(n, 11);
        assert_eq!(last, (11, 11));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let url = serve(b"tampered").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");

        let err = download_to(&http_client().unwrap(), &url, &dest, Some("00"), |_, _| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sha1 mismatch"));
        assert!(!dest.exists());
        assert!(!dest.with_extension("part").exists());
    }
}
