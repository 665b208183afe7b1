//! Embedded process supervisor: spawns N child tuner instances with restart,
//! env-file injection, structured I/O forwarding, and two-phase graceful
//! termination.
//!
//! Follows the usual [FFmpeg] process-management idiom: a `watch` channel as
//! the stop signal, `kill_on_drop`, and a bounded grace period before a hard
//! kill.
//!
//! [FFmpeg]: https://ffmpeg.org

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    process::{Child, Command},
    sync::watch,
    time,
};
use tuner_log::log;

use crate::{envfile, error::ConfigError};

/// `env` keys scrubbed from the base environment before children are
/// spawned; only explicitly re-exported values (via `env_files` or a
/// per-instance `env` map) reach children.
const SCRUBBED_ENV_KEYS: [&str; 2] = ["PLEX_TUNER_PMS_URL", "PLEX_TUNER_PMS_TOKEN"];
/// `env` key prefixes scrubbed the same way.
const SCRUBBED_ENV_PREFIXES: [&str; 1] = ["PLEX_TUNER_PLEX_SESSION_REAPER"];

/// Grace period between `interrupt` and a forced kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(8);
/// Default delay between a child's exit and its respawn when `restart` is
/// set but `restart_delay` is not given.
const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);
/// Buffer capacity for line-scanning a child's stdout/stderr.
const FORWARD_BUFFER_BYTES: usize = 1024 * 1024;

/// One child instance to spawn and supervise.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Unique name, used in log prefixes and duplicate-name validation.
    pub name: String,
    /// Arguments passed to the child binary. Must be non-empty.
    pub args: Vec<String>,
    /// Extra environment variables, overlaid on the scrubbed base + env
    /// files, last write wins.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process, if not the supervisor's own.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Delay before first spawning this instance.
    #[serde(default, with = "humantime_serde::option")]
    pub start_delay: Option<Duration>,
    /// Skip this instance entirely.
    #[serde(default)]
    pub disabled: bool,
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Instances to spawn.
    pub instances: Vec<InstanceConfig>,
    /// Respawn a child after it exits.
    #[serde(default)]
    pub restart: bool,
    /// Delay before respawning, when `restart` is set.
    #[serde(default, with = "humantime_serde::option")]
    pub restart_delay: Option<Duration>,
    /// On first child failure, cancel all peers and return the error.
    /// Defaults to `!restart` when absent.
    #[serde(default)]
    pub fail_fast: Option<bool>,
    /// Env files read (in order) before any child is spawned.
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
}

/// Loads and validates a supervisor config from `path`.
///
/// # Errors
///
/// [`ConfigError`] if the file cannot be read, contains invalid JSON or
/// unknown fields, or fails [`validate`].
pub async fn load(path: impl AsRef<Path>) -> Result<SupervisorConfig, ConfigError> {
    let path = path.as_ref();
    let contents = tokio::fs::read(path).await.map_err(|e| ConfigError {
        reason: format!("failed to read supervisor config {}: {e}", path.display()),
    })?;
    let cfg: SupervisorConfig = serde_json::from_slice(&contents).map_err(|e| ConfigError {
        reason: format!("failed to parse supervisor config {}: {e}", path.display()),
    })?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Rejects duplicate instance names, empty `args`, an empty instance list,
/// and an all-disabled instance list.
///
/// # Errors
///
/// [`ConfigError`] describing the first violation found.
pub fn validate(cfg: &SupervisorConfig) -> Result<(), ConfigError> {
    if cfg.instances.is_empty() {
        return Err(ConfigError {
            reason: "supervisor config has no instances".to_string(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    let mut any_enabled = false;
    for instance in &cfg.instances {
        if !seen.insert(instance.name.as_str()) {
            return Err(ConfigError {
                reason: format!("duplicate instance name: {}", instance.name),
            });
        }
        if instance.args.is_empty() {
            return Err(ConfigError {
                reason: format!("instance {} has an empty args list", instance.name),
            });
        }
        any_enabled |= !instance.disabled;
    }

    if !any_enabled {
        return Err(ConfigError {
            reason: "every supervisor instance is disabled".to_string(),
        });
    }

    Ok(())
}

/// Runs every enabled instance in `cfg` to completion, spawning `child_bin`
/// for each. Returns once every instance loop has exited: normally when
/// `restart` is unset, or after a cancellation/fail-fast error otherwise.
///
/// # Errors
///
/// [`ConfigError`] if `cfg` fails [`validate`], an `env_files` entry is
/// malformed, a `-catalog=` directory cannot be created, or (under
/// `fail_fast`) the first instance failure, propagated from that instance.
pub async fn run(cfg: &SupervisorConfig, child_bin: &Path) -> Result<(), ConfigError> {
    validate(cfg)?;

    let mut base_env = scrub_env();
    for file in &cfg.env_files {
        let pairs = envfile::load_file(file).await?;
        envfile::apply_to(&pairs, &mut base_env);
    }

    let restart = cfg.restart;
    let fail_fast = cfg.fail_fast.unwrap_or(!restart);
    let restart_delay = cfg.restart_delay.unwrap_or(DEFAULT_RESTART_DELAY);

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for instance in cfg.instances.iter().filter(|i| !i.disabled) {
        ensure_catalog_dirs(instance).await?;

        let instance = instance.clone();
        let child_bin = child_bin.to_path_buf();
        let base_env = base_env.clone();
        let mut cancel_rx = cancel_rx.clone();
        let cancel_tx = cancel_tx.clone();

        handles.push(tokio::spawn(async move {
            run_instance_loop(
                &instance,
                &child_bin,
                &base_env,
                restart,
                restart_delay,
                fail_fast,
                &mut cancel_rx,
                &cancel_tx,
            )
            .await
        }));
    }
    drop(cancel_rx);

    let mut first_err = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(join_err) => {
                first_err.get_or_insert(ConfigError {
                    reason: format!("supervisor instance task panicked: {join_err}"),
                });
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Builds the base environment children inherit: the supervisor's own
/// process environment minus [`SCRUBBED_ENV_KEYS`]/[`SCRUBBED_ENV_PREFIXES`].
fn scrub_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| {
            !SCRUBBED_ENV_KEYS.contains(&k.as_str())
                && !SCRUBBED_ENV_PREFIXES.iter().any(|p| k.starts_with(p))
        })
        .collect()
}

/// Ensures `dirname(path)` exists for any `-catalog=<path>` argument, so
/// nested per-instance data directories are present before spawn.
async fn ensure_catalog_dirs(instance: &InstanceConfig) -> Result<(), ConfigError> {
    for arg in &instance.args {
        if let Some(path) = arg.strip_prefix("-catalog=") {
            if let Some(dir) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await.map_err(|e| ConfigError {
                    reason: format!(
                        "failed to create catalog directory for instance {}: {e}",
                        instance.name
                    ),
                })?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_instance_loop(
    instance: &InstanceConfig,
    child_bin: &Path,
    base_env: &HashMap<String, String>,
    restart: bool,
    restart_delay: Duration,
    fail_fast: bool,
    cancel_rx: &mut watch::Receiver<bool>,
    cancel_tx: &watch::Sender<bool>,
) -> Result<(), ConfigError> {
    if let Some(delay) = instance.start_delay {
        time::sleep(delay).await;
    }

    loop {
        if *cancel_rx.borrow() {
            return Ok(());
        }

        match spawn_and_wait(instance, child_bin, base_env, cancel_rx).await {
            Ok(status) => {
                log::info!("[{}] exited with {status}", instance.name);
            }
            Err(e) => {
                log::error!("[{}] failed: {e}", instance.name);
                if fail_fast {
                    let _ = cancel_tx.send(true);
                    return Err(e);
                }
            }
        }

        if *cancel_rx.borrow() || !restart {
            if !restart && fail_fast {
                let _ = cancel_tx.send(true);
            }
            return Ok(());
        }

        tokio::select! {
            () = time::sleep(restart_delay) => {}
            _ = cancel_rx.changed() => return Ok(()),
        }
    }
}

/// Spawns one run of `instance`'s child process, forwards its stdout/stderr
/// line by line, and waits for it to exit or for `cancel_rx` to flip true
/// (in which case [`terminate`] drives the two-phase shutdown).
async fn spawn_and_wait(
    instance: &InstanceConfig,
    child_bin: &Path,
    base_env: &HashMap<String, String>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<std::process::ExitStatus, ConfigError> {
    let mut cmd = Command::new(child_bin);
    cmd.args(&instance.args);
    cmd.env_clear();
    cmd.envs(base_env.iter());
    cmd.envs(instance.env.iter());
    if let Some(dir) = &instance.work_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ConfigError {
        reason: format!("failed to spawn instance {}: {e}", instance.name),
    })?;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");
    let out_task = tokio::spawn(forward_lines(stdout, instance.name.clone(), "stdout"));
    let err_task = tokio::spawn(forward_lines(stderr, instance.name.clone(), "stderr"));

    let result = tokio::select! {
        status = child.wait() => status.map_err(|e| ConfigError {
            reason: format!("instance {} wait failed: {e}", instance.name),
        }),
        _ = cancel_rx.changed() => terminate(&mut child, &instance.name).await,
    };

    let _ = out_task.await;
    let _ = err_task.await;

    result
}

/// Two-phase termination: SIGTERM, up to [`TERMINATE_GRACE`], then SIGKILL.
async fn terminate(child: &mut Child, name: &str) -> Result<std::process::ExitStatus, ConfigError> {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }

    match time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) => Err(ConfigError {
            reason: format!("instance {name} wait failed during termination: {e}"),
        }),
        Err(_elapsed) => {
            log::warn!("[{name}] did not exit within grace period, sending SIGKILL");
            let _ = child.start_kill();
            child.wait().await.map_err(|e| ConfigError {
                reason: format!("instance {name} wait failed after SIGKILL: {e}"),
            })
        }
    }
}

/// Line-scans `reader` with a [`FORWARD_BUFFER_BYTES`] buffer, logging each
/// line prefixed with `[<name> <stream>]`, until EOF or a read error.
async fn forward_lines<R>(reader: R, name: String, stream: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::with_capacity(FORWARD_BUFFER_BYTES, reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log::info!("[{name} {stream}] {line}"),
            Ok(None) => break,
            Err(e) => {
                log::warn!("[{name} {stream}] read error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, args: &[&str]) -> InstanceConfig {
        InstanceConfig {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            work_dir: None,
            start_delay: None,
            disabled: false,
        }
    }

    fn config(instances: Vec<InstanceConfig>) -> SupervisorConfig {
        SupervisorConfig {
            instances,
            restart: false,
            restart_delay: None,
            fail_fast: None,
            env_files: vec![],
        }
    }

    #[test]
    fn rejects_empty_instance_list() {
        assert!(validate(&config(vec![])).is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let cfg = config(vec![instance("a", &["serve"]), instance("a", &["serve"])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_empty_args() {
        let cfg = config(vec![instance("a", &[])]);
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_all_disabled() {
        let mut inst = instance("a", &["serve"]);
        inst.disabled = true;
        assert!(validate(&config(vec![inst])).is_err());
    }

    #[test]
    fn accepts_one_enabled_among_disabled() {
        let mut disabled = instance("a", &["serve"]);
        disabled.disabled = true;
        let enabled = instance("b", &["serve"]);
        assert!(validate(&config(vec![disabled, enabled])).is_ok());
    }

    #[test]
    fn deny_unknown_fields_rejects_typos() {
        let raw = r#"{"instances":[{"name":"a","args":["serve"]}],"restrt":true}"#;
        assert!(serde_json::from_str::<SupervisorConfig>(raw).is_err());
    }

    #[test]
    fn parses_humantime_durations() {
        let raw = r#"{
            "instances": [{"name":"a","args":["serve"],"start_delay":"500ms"}],
            "restart": true,
            "restart_delay": "3s"
        }"#;
        let cfg: SupervisorConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.restart_delay, Some(Duration::from_secs(3)));
        assert_eq!(cfg.instances[0].start_delay, Some(Duration::from_millis(500)));
    }

    #[test]
    fn scrub_env_removes_reserved_keys() {
        std::env::set_var("PLEX_TUNER_PMS_TOKEN", "secret");
        std::env::set_var("PLEX_TUNER_PLEX_SESSION_REAPER_INTERVAL", "30s");
        std::env::set_var("SOME_OTHER_VAR", "kept");
        let scrubbed = scrub_env();
        assert!(!scrubbed.contains_key("PLEX_TUNER_PMS_TOKEN"));
        assert!(!scrubbed.contains_key("PLEX_TUNER_PLEX_SESSION_REAPER_INTERVAL"));
        assert_eq!(scrubbed.get("SOME_OTHER_VAR"), Some(&"kept".to_string()));
        std::env::remove_var("PLEX_TUNER_PMS_TOKEN");
        std::env::remove_var("PLEX_TUNER_PLEX_SESSION_REAPER_INTERVAL");
        std::env::remove_var("SOME_OTHER_VAR");
    }

    #[tokio::test]
    async fn ensure_catalog_dirs_creates_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/catalog.json");
        let inst = instance("a", &[&format!("-catalog={}", nested.display())]);
        ensure_catalog_dirs(&inst).await.unwrap();
        assert!(nested.parent().unwrap().is_dir());
    }

    #[tokio::test]
    async fn run_spawns_true_and_completes_without_restart() {
        let cfg = config(vec![instance("ok", &["true"])]);
        let result = run(&cfg, Path::new("/usr/bin/env")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_propagates_spawn_failure() {
        let cfg = config(vec![instance("missing", &["x"])]);
        let result = run(&cfg, Path::new("/nonexistent/binary-that-should-not-exist")).await;
        assert!(result.is_err());
    }
}
