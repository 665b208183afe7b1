//! Environment-driven, effectively-immutable [`Config`]. Fields not set in
//! the environment take the documented defaults below; once loaded, `Config`
//! is never mutated, so callers share it behind an `Arc`.

use std::{collections::HashMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::{envfile, error::ConfigError};

/// How aggressively the gateway transcodes live output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault, Serialize, Deserialize)]
pub enum StreamTranscode {
    /// Never transcode; always stream-copy.
    #[default]
    Off,
    /// Always transcode.
    On,
    /// Decide per-stream.
    Auto,
    /// Like `Auto`, but only when a materialized cache copy already exists.
    AutoCached,
}

impl std::str::FromStr for StreamTranscode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::On),
            "auto" => Ok(Self::Auto),
            "auto_cached" => Ok(Self::AutoCached),
            other => Err(ConfigError {
                reason: format!("invalid STREAM_TRANSCODE value: {other}"),
            }),
        }
    }
}

/// How many bytes to buffer before flushing a proxied live stream to the
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBufferBytes {
    /// Pick a sensible buffer size automatically.
    Auto,
    /// No buffering at all.
    Zero,
    /// A fixed number of bytes.
    Fixed(usize),
}

impl std::str::FromStr for StreamBufferBytes {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "0" => Ok(Self::Zero),
            other => other
                .parse::<usize>()
                .map(Self::Fixed)
                .map_err(|_| ConfigError {
                    reason: format!("invalid STREAM_BUFFER_BYTES value: {other}"),
                }),
        }
    }
}

impl Default for StreamBufferBytes {
    fn default() -> Self {
        Self::Auto
    }
}

/// Effectively-immutable application configuration, loaded once at startup.
#[derive(Debug, Clone, SmartDefault)]
pub struct Config {
    /// Explicit provider base URL(s) to probe, in order.
    #[default(Vec::new())]
    pub provider_urls: Vec<String>,
    /// Xtream username.
    #[default(String::new())]
    pub provider_user: String,
    /// Xtream password.
    #[default(String::new())]
    pub provider_pass: String,
    /// Explicit full M3U playlist URL, superseding synthesis from
    /// `provider_urls`/credentials.
    #[default(None)]
    pub m3u_url: Option<String>,
    /// Fallback subscription file with `Username:`/`Password:` lines.
    #[default(None)]
    pub subscription_file: Option<PathBuf>,
    /// Path to the catalog JSON file.
    #[default(PathBuf::from("catalog.json"))]
    pub catalog: PathBuf,
    /// Directory for the VOD materialization cache.
    #[default(PathBuf::from("cache"))]
    pub cache: PathBuf,
    /// VODFS mount point, if VODFS is enabled.
    #[default(None)]
    pub mount: Option<PathBuf>,
    /// Skip movie/series parsing entirely.
    #[default(false)]
    pub live_only: bool,
    /// Skip movie/series parsing except where EPG-linked (reserved for
    /// collaborators; the core only acts on `live_only`/`epg_prune_unlinked`).
    #[default(false)]
    pub live_epg_only: bool,
    /// Drop channels without a `tvg_id` from the exported live slice.
    #[default(false)]
    pub epg_prune_unlinked: bool,
    /// Number of tuners to advertise.
    #[default(1)]
    pub tuner_count: u16,
    /// Maximum number of channels exposed in the lineup.
    #[default(None)]
    pub lineup_max_channels: Option<usize>,
    /// HDHomeRun device id to advertise.
    #[default(String::new())]
    pub device_id: String,
    /// Friendly name to advertise.
    #[default(String::from("IPTV Tuner"))]
    pub friendly_name: String,
    /// Externally reachable base URL of this tuner.
    #[default(None)]
    pub base_url: Option<String>,
    /// Live-stream client buffer size policy.
    #[default(StreamBufferBytes::Auto)]
    pub stream_buffer_bytes: StreamBufferBytes,
    /// Live-stream transcode policy.
    #[default(StreamTranscode::Off)]
    pub stream_transcode: StreamTranscode,
    /// Whether to use 16 MiB ranged downloads instead of single-GET for
    /// direct-file materialization.
    #[default(false)]
    pub range_download: bool,
}

impl Config {
    /// Loads `Config` from an optional `.env` file (read first, so its
    /// values are visible to the rest of this function) followed by the
    /// process environment, which always takes precedence over `.env`.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the `.env` file exists but is malformed, if the
    /// subscription file (when used) is malformed, or if a numeric/enum env
    /// var fails to parse.
    pub async fn load(env_file: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut vars: HashMap<String, String> = env::vars().collect();

        if let Some(path) = env_file {
            let pairs = envfile::load_file(path).await?;
            // `.env` values fill gaps only; real process env wins.
            for (k, v) in pairs {
                vars.entry(k).or_insert(v);
            }
        }

        let mut cfg = Self::default();

        if let Some(v) = vars.get("PROVIDER_URL") {
            cfg.provider_urls = vec![v.clone()];
        }
        if let Some(v) = vars.get("PROVIDER_URLS") {
            cfg.provider_urls = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = vars.get("PROVIDER_USER") {
            cfg.provider_user = v.clone();
        }
        if let Some(v) = vars.get("PROVIDER_PASS") {
            cfg.provider_pass = v.clone();
        }
        if let Some(v) = vars.get("M3U_URL") {
            cfg.m3u_url = Some(v.clone());
        }
        if let Some(v) = vars.get("SUBSCRIPTION_FILE") {
            cfg.subscription_file = Some(PathBuf::from(v));
        }
        if let Some(v) = vars.get("CATALOG") {
            cfg.catalog = PathBuf::from(v);
        }
        if let Some(v) = vars.get("CACHE") {
            cfg.cache = PathBuf::from(v);
        }
        if let Some(v) = vars.get("MOUNT") {
            cfg.mount = Some(PathBuf::from(v));
        }
        if let Some(v) = vars.get("LIVE_ONLY") {
            cfg.live_only = parse_bool(v);
        }
        if let Some(v) = vars.get("LIVE_EPG_ONLY") {
            cfg.live_epg_only = parse_bool(v);
        }
        if let Some(v) = vars.get("EPG_PRUNE_UNLINKED") {
            cfg.epg_prune_unlinked = parse_bool(v);
        }
        if let Some(v) = vars.get("TUNER_COUNT") {
            cfg.tuner_count = v.parse().map_err(|_| ConfigError {
                reason: format!("invalid TUNER_COUNT: {v}"),
            })?;
        }
        if let Some(v) = vars.get("LINEUP_MAX_CHANNELS") {
            cfg.lineup_max_channels = Some(v.parse().map_err(|_| ConfigError {
                reason: format!("invalid LINEUP_MAX_CHANNELS: {v}"),
            })?);
        }
        if let Some(v) = vars.get("DEVICE_ID") {
            cfg.device_id = v.clone();
        }
        if let Some(v) = vars.get("FRIENDLY_NAME") {
            cfg.friendly_name = v.clone();
        }
        if let Some(v) = vars.get("BASE_URL") {
            cfg.base_url = Some(v.clone());
        }
        if let Some(v) = vars.get("STREAM_BUFFER_BYTES") {
            cfg.stream_buffer_bytes = v.parse()?;
        }
        if let Some(v) = vars.get("STREAM_TRANSCODE") {
            cfg.stream_transcode = v.parse()?;
        }
        if let Some(v) = vars.get("RANGE_DOWNLOAD") {
            cfg.range_download = parse_bool(v);
        }

        if cfg.provider_user.is_empty() || cfg.provider_pass.is_empty() {
            if let Some(path) = cfg.subscription_file.clone() {
                let (user, pass) = load_subscription_file(&path).await?;
                if cfg.provider_user.is_empty() {
                    cfg.provider_user = user;
                }
                if cfg.provider_pass.is_empty() {
                    cfg.provider_pass = pass;
                }
            }
        }

        Ok(cfg)
    }

    /// Resolves the set of candidate M3U URLs to probe: prefer an explicit
    /// [`Config::m3u_url`], otherwise synthesize
    /// `base/get.php?username=…&password=…&type=m3u_plus&output=ts` for
    /// every configured provider base, with credentials URL-escaped.
    #[must_use]
    pub fn candidate_m3u_urls(&self) -> Vec<String> {
        if let Some(url) = &self.m3u_url {
            return vec![url.clone()];
        }

        self.provider_urls
            .iter()
            .map(|base| {
                format!(
                    "{}/get.php?username={}&password={}&type=m3u_plus&output=ts",
                    base.trim_end_matches('/'),
                    escape(&self.provider_user),
                    escape(&self.provider_pass),
                )
            })
            .collect()
    }
}

fn escape(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parses a subscription file's `Username:`/`Password:` (and, for
/// completeness, optional `Host:`/`URL:`) lines.
async fn load_subscription_file(path: &std::path::Path) -> Result<(String, String), ConfigError> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| ConfigError {
        reason: format!("failed to read subscription file {}: {e}", path.display()),
    })?;

    let mut user = String::new();
    let mut pass = String::new();

    for line in contents.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Username:") {
            user = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("Password:") {
            pass = v.trim().to_string();
        }
    }

    Ok((user, pass))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn candidate_urls_prefer_explicit_m3u() {
        let mut cfg = Config::default();
        cfg.m3u_url = Some("http://x/list.m3u".into());
        cfg.provider_urls = vec!["http://a".into()];
        assert_eq!(cfg.candidate_m3u_urls(), vec!["http://x/list.m3u".to_string()]);
    }

    #[tokio::test]
    async fn candidate_urls_synthesized_with_escaped_credentials() {
        let mut cfg = Config::default();
        cfg.provider_urls = vec!["http://a".into()];
        cfg.provider_user = "us er".into();
        cfg.provider_pass = "p@ss".into();
        let urls = cfg.candidate_m3u_urls();
        assert_eq!(
            urls,
            vec!["http://a/get.php?username=us+er&password=p%40ss&type=m3u_plus&output=ts"
                .to_string()]
        );
    }

    #[tokio::test]
    async fn subscription_file_parses_username_and_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub.txt");
        tokio::fs::write(&path, "Username: bob\nPassword: hunter2\n")
            .await
            .unwrap();

        let (user, pass) = load_subscription_file(&path).await.unwrap();
        assert_eq!(user, "bob");
        assert_eq!(pass, "hunter2");
    }
}
