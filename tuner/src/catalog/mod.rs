//! In-memory catalog store with snapshot/replace semantics and atomic
//! persistence.
//!
//! Concurrency: any number of concurrent [`Store::snapshot`] calls may
//! proceed together; [`Store::replace`] and the internal snapshot taken by
//! [`Store::save`] are serialized against each other by a single
//! reader/writer lock, but the lock is released before the (possibly slow)
//! JSON encode and file write happen, so a save never blocks new readers for
//! the duration of the encode.

pub mod model;

use std::{path::Path, sync::Arc};

use parking_lot::RwLock;
use tokio::fs;

pub use model::{Catalog, Episode, LiveChannel, Movie, Season, Series, XmltvChannel};

use crate::error::ConfigError;

/// Thread-safe, cloneable handle to the application's [`Catalog`].
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Catalog>>,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-copies the current `(movies, series, live)` slices under a
    /// shared lock.
    #[must_use]
    pub fn snapshot(&self) -> Catalog {
        self.inner.read().clone()
    }

    /// Returns only the live-channel slice, optionally pruning channels
    /// without a `tvg_id` (the `EPG_PRUNE_UNLINKED` behavior the Indexer
    /// exposes to lineup/guide collaborators).
    #[must_use]
    pub fn live_channels(&self, prune_unlinked: bool) -> Vec<LiveChannel> {
        let guard = self.inner.read();
        if prune_unlinked {
            guard
                .live
                .iter()
                .filter(|c| !c.tvg_id.is_empty())
                .cloned()
                .collect()
        } else {
            guard.live.clone()
        }
    }

    /// Exclusively replaces the entire catalog contents.
    pub fn replace(&self, movies: Vec<Movie>, series: Vec<Series>, live: Vec<LiveChannel>) {
        let mut guard = self.inner.write();
        guard.movies = movies;
        guard.series = series;
        guard.live = live;
    }

    /// Snapshots the catalog (under the lock) then encodes and writes it to
    /// `path` outside the lock, via a temp-file-then-rename so concurrent
    /// readers never observe a partially written file.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if encoding or writing fails.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let snapshot = self.snapshot();
        let path = path.as_ref();

        let encoded = serde_json::to_vec_pretty(&snapshot).map_err(|e| ConfigError {
            reason: format!("failed to encode catalog: {e}"),
        })?;

        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            fs::create_dir_all(dir).await.map_err(|e| ConfigError {
                reason: format!("failed to create catalog directory: {e}"),
            })?;
        }

        let tmp_path = tmp_path_for(path);
        fs::write(&tmp_path, &encoded).await.map_err(|e| ConfigError {
            reason: format!("failed to write catalog temp file: {e}"),
        })?;
        fs::rename(&tmp_path, path).await.map_err(|e| ConfigError {
            reason: format!("failed to rename catalog temp file: {e}"),
        })?;

        Ok(())
    }

    /// Loads `path` (if it exists) and replaces the store's contents in
    /// place. A missing file is treated as "nothing to load" (not an
    /// error); a present-but-malformed file is an error. Tolerates a legacy
    /// `live_channels` field and the absence of `stream_urls` on individual
    /// channels (both handled by `#[serde]` defaults on [`model::Catalog`]
    /// and [`model::LiveChannel`]).
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the file exists but fails to parse.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ConfigError {
                    reason: format!("failed to read catalog file: {e}"),
                })
            }
        };

        if contents.is_empty() {
            return Ok(());
        }

        let mut catalog: Catalog = serde_json::from_slice(&contents).map_err(|e| ConfigError {
            reason: format!("failed to parse catalog file: {e}"),
        })?;

        for ch in &mut catalog.live {
            ch.normalize_stream_urls();
        }

        let mut guard = self.inner.write();
        *guard = catalog;
        Ok(())
    }
}

/// Builds the sibling temp-file path used for the write-then-rename in
/// [`Store::save`]: `<path>.tmp-<pid>`, same directory so the rename is
/// guaranteed to be on one filesystem.
fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog.json".to_string());
    path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Catalog, LiveChannel};

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let store = Store::new();
        store.replace(
            vec![],
            vec![],
            vec![LiveChannel {
                channel_id: "1".into(),
                guide_number: "101".into(),
                guide_name: "News".into(),
                stream_url: "http://a/1".into(),
                stream_urls: vec!["http://a/1".into()],
                epg_linked: false,
                tvg_id: "news.us".into(),
            }],
        );
        store.save(&path).await.unwrap();

        let loaded = Store::new();
        loaded.load(&path).await.unwrap();
        assert_eq!(loaded.snapshot(), store.snapshot());
    }

    #[tokio::test]
    async fn load_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let store = Store::new();
        store.load(&path).await.unwrap();
        assert!(store.snapshot().live.is_empty());
    }

    #[tokio::test]
    async fn load_legacy_live_channels_alias_preserves_stream_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        tokio::fs::write(
            &path,
            r#"{"movies":[],"series":[],"live_channels":[
                {"guide_number":"1","guide_name":"Legacy","channel_id":"1","stream_url":"http://old/1"}
            ]}"#,
        )
        .await
        .unwrap();

        let store = Store::new();
        store.load(&path).await.unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.live.len(), 1);
        assert_eq!(snap.live[0].stream_url, "http://old/1");
        assert!(snap.live[0].stream_urls.is_empty());
    }

    #[test]
    fn live_channels_prunes_unlinked_when_requested() {
        let store = Store::new();
        store.replace(
            vec![],
            vec![],
            vec![
                LiveChannel {
                    channel_id: "1".into(),
                    guide_number: "1".into(),
                    guide_name: "Linked".into(),
                    stream_url: "http://a".into(),
                    stream_urls: vec![],
                    epg_linked: true,
                    tvg_id: "a.us".into(),
                },
                LiveChannel {
                    channel_id: "2".into(),
                    guide_number: "2".into(),
                    guide_name: "Unlinked".into(),
                    stream_url: "http://b".into(),
                    stream_urls: vec![],
                    epg_linked: false,
                    tvg_id: String::new(),
                },
            ],
        );

        assert_eq!(store.live_channels(false).len(), 2);
        assert_eq!(store.live_channels(true).len(), 1);
    }
}
