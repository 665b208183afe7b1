//! VOD materialization engine: maps an asset identity to a local, seekable
//! file on disk, fetching it with a ranged download when the probe
//! classifies the source as a direct file, or remuxing it from HLS to MP4
//! with an external stream-copy process.
//!
//! Single-flight: concurrent callers for the same asset id share one
//! in-flight pipeline and observe the same outcome. The owner's pipeline runs
//! in a detached task so a waiter's own cancellation never cancels the
//! in-flight work for the others.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use parking_lot::Mutex;
use reqwest::header;
use tokio::{
    fs,
    io::AsyncWriteExt as _,
    process::Command,
    sync::watch,
};
use url::Url;

use crate::{
    error::{HttpStatusError, MaterializeError, NotReadyError, RemuxError},
    http_client,
    probe::{self, StreamType},
    url_safety,
};

/// Chunk size used for ranged downloads into the on-disk cache.
const CACHE_CHUNK_BYTES: u64 = 1024 * 1024;
/// Chunk size used for ranged downloads when the operator selects
/// `RANGE_DOWNLOAD`.
const OPERATOR_RANGE_CHUNK_BYTES: u64 = 16 * 1024 * 1024;

/// Directory (under the cache root) holding materialized VOD assets.
const VOD_SUBDIR: &str = "vod";

/// Sanitizes an asset id for use as a filesystem path component: `/`, `\`,
/// and NUL are replaced with `_`; an empty id becomes `"unknown"`.
#[must_use]
pub fn sanitize(asset_id: &str) -> String {
    let cleaned: String = asset_id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

struct Inner {
    cache_dir: PathBuf,
    range_download: bool,
    remuxer_bin: PathBuf,
    inflight: Mutex<HashMap<String, watch::Receiver<bool>>>,
    last_err: Mutex<HashMap<String, String>>,
}

/// Cloneable handle to the materialization cache. Cheap to clone (shares one
/// `Arc`-ed inner state), matching the [`crate::catalog::Store`] pattern.
#[derive(Clone)]
pub struct Materializer(Arc<Inner>);

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("cache_dir", &self.0.cache_dir)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    /// Creates a new materializer rooted at `cache_dir` (which need not yet
    /// exist). `remuxer_bin` is the external stream-copy remuxer binary
    /// (`ffmpeg` in the common case) used for the HLS pipeline.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>, range_download: bool, remuxer_bin: impl Into<PathBuf>) -> Self {
        Self(Arc::new(Inner {
            cache_dir: cache_dir.into(),
            range_download,
            remuxer_bin: remuxer_bin.into(),
            inflight: Mutex::new(HashMap::new()),
            last_err: Mutex::new(HashMap::new()),
        }))
    }

    fn vod_dir(&self) -> PathBuf {
        self.0.cache_dir.join(VOD_SUBDIR)
    }

    /// Final, fully-materialized path for `asset_id`.
    #[must_use]
    pub fn final_path(&self, asset_id: &str) -> PathBuf {
        self.vod_dir().join(format!("{}.mp4", sanitize(asset_id)))
    }

    /// In-flight, possibly-incomplete path for `asset_id`.
    #[must_use]
    pub fn partial_path(&self, asset_id: &str) -> PathBuf {
        self.vod_dir().join(format!("{}.partial", sanitize(asset_id)))
    }

    /// Materializes `asset_id` from `stream_url`, returning the local path of
    /// the finished `.mp4` on success.
    ///
    /// # Errors
    ///
    /// See [`MaterializeError`] for the full set of outcomes.
    pub async fn materialize(
        &self,
        asset_id: &str,
        stream_url: &str,
    ) -> Result<PathBuf, MaterializeError> {
        if stream_url.is_empty() {
            return Err(NotReadyError {
                asset_id: asset_id.to_string(),
            }
            .into());
        }

        let url = url_safety::parse_and_check(stream_url)?;

        let final_path = self.final_path(asset_id);
        if is_nonempty_file(&final_path).await {
            return Ok(final_path);
        }

        enum Role {
            Owner(tokio::task::JoinHandle<Result<PathBuf, MaterializeError>>),
            Waiter(watch::Receiver<bool>),
        }

        let role = {
            let mut guard = self.0.inflight.lock();
            if let Some(rx) = guard.get(asset_id) {
                Role::Waiter(rx.clone())
            } else {
                let (tx, rx) = watch::channel(false);
                guard.insert(asset_id.to_string(), rx);
                drop(guard);

                let me = self.clone();
                let owned_id = asset_id.to_string();
                let owned_url = url.clone();
                let handle = tokio::spawn(async move {
                    let result = me.run_pipeline(&owned_id, &owned_url).await;
                    match &result {
                        Ok(_) => {
                            me.0.last_err.lock().remove(&owned_id);
                        }
                        Err(e) => {
                            me.0.last_err.lock().insert(owned_id.clone(), e.to_string());
                        }
                    }
                    me.0.inflight.lock().remove(&owned_id);
                    let _ = tx.send(true);
                    result
                });

                Role::Owner(handle)
            }
        };

        match role {
            // The owner awaits its own pipeline directly, so a real
            // HTTP-status/probe/remux failure reaches the caller with its
            // actual kind instead of being flattened into a generic
            // not-ready error.
            Role::Owner(handle) => match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("materialization task panicked: {join_err}"),
                )
                .into()),
            },
            Role::Waiter(mut rx) => {
                // `watch` stores the latest value, so this never misses a
                // notification regardless of timing.
                let _ = rx.changed().await;

                if is_nonempty_file(&final_path).await {
                    return Ok(final_path);
                }

                if let Some(msg) = self.0.last_err.lock().get(asset_id).cloned() {
                    return Err(NotReadyError {
                        asset_id: format!("{asset_id}: {msg}"),
                    }
                    .into());
                }

                Err(NotReadyError {
                    asset_id: asset_id.to_string(),
                }
                .into())
            }
        }
    }

    /// Runs the actual download/remux pipeline for `asset_id`, writing to
    /// `.partial` and renaming to the final `.mp4` on success. Only ever
    /// called by the owning task installed in [`Self::materialize`].
    async fn run_pipeline(&self, asset_id: &str, url: &Url) -> Result<PathBuf, MaterializeError> {
        fs::create_dir_all(self.vod_dir()).await?;

        let partial_path = self.partial_path(asset_id);
        let final_path = self.final_path(asset_id);

        let stream_type = probe::probe(url).await?;

        let result = match stream_type {
            StreamType::DirectMp4 => self.download_direct(url, &partial_path).await,
            StreamType::Hls => self.remux_hls(url, &partial_path).await,
            StreamType::Ts | StreamType::Unknown => Err(NotReadyError {
                asset_id: asset_id.to_string(),
            }
            .into()),
        };

        match result {
            Ok(()) => {
                fs::rename(&partial_path, &final_path).await?;
                Ok(final_path)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial_path).await;
                Err(e)
            }
        }
    }

    /// Downloads `url` to `dest`, preferring a ranged, chunked download when
    /// the server advertises `Accept-Ranges: bytes` and a known positive
    /// `Content-Length`; otherwise falls back to a single streamed GET.
    async fn download_direct(&self, url: &Url, dest: &Path) -> Result<(), MaterializeError> {
        let content_length = probe::content_length(url).await?;
        let ranged = content_length > 0 && probe::supports_range(url).await?;

        if ranged {
            self.download_ranged(url, dest, content_length as u64).await
        } else {
            self.download_single(url, dest).await
        }
    }

    async fn download_ranged(
        &self,
        url: &Url,
        dest: &Path,
        total_len: u64,
    ) -> Result<(), MaterializeError> {
        let client = http_client::no_timeout();
        let chunk = if self.0.range_download {
            OPERATOR_RANGE_CHUNK_BYTES
        } else {
            CACHE_CHUNK_BYTES
        };

        let mut file = fs::File::create(dest).await?;
        let mut offset = 0u64;

        while offset < total_len {
            let end = (offset + chunk - 1).min(total_len - 1);
            let resp = client
                .get(url.clone())
                .header(header::RANGE, format!("bytes={offset}-{end}"))
                .send()
                .await
                .map_err(|e| RemuxError {
                    reason: format!("ranged GET failed: {e}"),
                })?;

            if !probe::is_ranged_success(resp.status()) {
                return Err(HttpStatusError {
                    code: resp.status().as_u16(),
                }
                .into());
            }

            let bytes = resp.bytes().await.map_err(|e| RemuxError {
                reason: format!("failed reading ranged chunk: {e}"),
            })?;
            file.write_all(&bytes).await?;

            offset = end + 1;
        }

        file.flush().await?;
        Ok(())
    }

    async fn download_single(&self, url: &Url, dest: &Path) -> Result<(), MaterializeError> {
        let client = http_client::no_timeout();
        let resp = client.get(url.clone()).send().await.map_err(|e| RemuxError {
            reason: format!("GET failed: {e}"),
        })?;

        if !resp.status().is_success() {
            return Err(HttpStatusError {
                code: resp.status().as_u16(),
            }
            .into());
        }

        let mut file = fs::File::create(dest).await?;
        let bytes = resp.bytes().await.map_err(|e| RemuxError {
            reason: format!("failed reading response body: {e}"),
        })?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Invokes the external remuxer to stream-copy an HLS source into an MP4
    /// container: all tracks copied, AAC ADTS converted to ASC, `faststart`
    /// set on the output. No re-encoding is performed.
    async fn remux_hls(&self, url: &Url, dest: &Path) -> Result<(), MaterializeError> {
        let mut cmd = Command::new(&self.0.remuxer_bin);
        cmd.args(["-y", "-i", url.as_str()])
            .args(["-c", "copy"])
            .args(["-bsf:a", "aac_adtstoasc"])
            .args(["-movflags", "+faststart"])
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| RemuxError {
            reason: format!("failed to spawn remuxer: {e}"),
        })?;

        if !output.status.success() {
            return Err(RemuxError {
                reason: format!(
                    "remuxer exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the last recorded error for `asset_id`, if any.
    #[must_use]
    pub fn last_error(&self, asset_id: &str) -> Option<String> {
        self.0.last_err.lock().get(asset_id).cloned()
    }
}

async fn is_nonempty_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{method, path as match_path},
        Mock, MockServer, ResponseTemplate,
    };

    #[test]
    fn sanitize_replaces_separators_and_nul() {
        assert_eq!(sanitize("movie/1\\2\09"), "movie_1_2_9");
        assert_eq!(sanitize(""), "unknown");
        assert_eq!(sanitize("plain-id"), "plain-id");
    }

    #[test]
    fn paths_never_escape_the_vod_dir() {
        let m = Materializer::new("/tmp/cache", false, "ffmpeg");
        let final_path = m.final_path("../../etc/passwd");
        assert!(final_path.starts_with(m.vod_dir()));
        assert!(!final_path.to_string_lossy().contains(".."));
    }

    #[tokio::test]
    async fn empty_stream_url_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(dir.path(), false, "ffmpeg");
        let err = m.materialize("a1", "").await.unwrap_err();
        assert!(matches!(err, MaterializeError::NotReady(_)));
    }

    #[tokio::test]
    async fn fast_path_returns_existing_final_file_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(dir.path(), false, "ffmpeg");
        let final_path = m.final_path("a1");
        fs::create_dir_all(final_path.parent().unwrap()).await.unwrap();
        fs::write(&final_path, b"already here").await.unwrap();

        let got = m
            .materialize("a1", "http://unroutable.invalid/should-not-be-hit")
            .await
            .unwrap();
        assert_eq!(got, final_path);
    }

    #[tokio::test]
    async fn single_flight_one_download_many_callers() {
        let server = MockServer::start().await;
        let payload = vec![7u8; 64 * 1024];
        Mock::given(method("HEAD"))
            .and(match_path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "video/mp4"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(match_path("/a.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new(dir.path(), false, "ffmpeg");
        let url = format!("{}/a.mp4", server.uri());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let m = m.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move { m.materialize("m1", &url).await }));
        }

        let mut paths = Vec::new();
        for h in handles {
            paths.push(h.await.unwrap().unwrap());
        }

        let first = &paths[0];
        assert!(paths.iter().all(|p| p == first));
        assert!(!m.partial_path("m1").exists());
        let meta = fs::metadata(first).await.unwrap();
        assert_eq!(meta.len(), payload.len() as u64);
    }
}
