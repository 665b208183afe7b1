//! Binary entry point: a thin CLI choosing between the tuner-facing core
//! (`serve`) and the embedded process supervisor (`supervise`), both backed
//! by the `iptv_tuner` library. HDHomeRun discovery/lineup HTTP handlers and
//! their own flag parsing remain external collaborators; this binary only
//! wires the catalog, indexer, materializer, VODFS, and gateway together.

use std::path::PathBuf;

use actix_web::web;
use structopt::StructOpt;
use tuner_log::log;

use iptv_tuner::{
    catalog::Store,
    config::Config,
    gateway::{self, GatewayState},
    indexer,
    materializer::Materializer,
    supervisor, vodfs,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "iptv-tuner", about = "IPTV-to-Plex tuner bridge core")]
enum Opt {
    /// Loads `Config` from the environment, indexes the catalog, and runs
    /// the gateway surface (plus VODFS, when `MOUNT` is set).
    Serve {
        /// Optional `.env` file filling gaps in the process environment.
        #[structopt(long, parse(from_os_str))]
        env_file: Option<PathBuf>,
    },
    /// Runs the embedded supervisor against a JSON config file.
    Supervise {
        /// Path to the supervisor JSON config.
        #[structopt(parse(from_os_str))]
        config: PathBuf,
        /// Executable spawned for each instance; defaults to this binary's
        /// own path.
        #[structopt(long, parse(from_os_str))]
        child_bin: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tuner_log::init(None);

    let opt = Opt::from_args();
    let result = match opt {
        Opt::Serve { env_file } => serve(env_file).await,
        Opt::Supervise { config, child_bin } => run_supervise(&config, child_bin).await,
    };

    if let Err(e) = result {
        log::error!("iptv-tuner exiting with error: {e}");
        std::process::exit(1);
    }
}

async fn serve(env_file: Option<PathBuf>) -> anyhow::Result<()> {
    let cfg = Config::load(env_file.as_deref()).await?;

    let store = Store::new();
    store.load(&cfg.catalog).await?;

    if let Err(e) = indexer::run(&cfg, &store).await {
        log::warn!("initial index failed, serving from any previously saved catalog: {e}");
    }

    let remuxer_bin = std::env::var("REMUXER_BIN").unwrap_or_else(|_| "ffmpeg".to_string());
    let materializer = Materializer::new(cfg.cache.clone(), cfg.range_download, remuxer_bin);

    if let Some(mount) = cfg.mount.clone() {
        mount_vodfs(mount, store.clone(), materializer);
    }

    let bind_host = "0.0.0.0";
    let bind_port = 5004u16;
    log::info!("iptv-tuner gateway listening on {bind_host}:{bind_port}");

    let gateway_state = web::Data::new(GatewayState::new(store));
    actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .app_data(gateway_state.clone())
            .service(gateway::stream)
    })
    .bind((bind_host, bind_port))?
    .run()
    .await?;

    Ok(())
}

/// Spawns VODFS on a dedicated OS thread, since `fuser::mount2` blocks the
/// calling thread until the filesystem is unmounted. The current Tokio
/// `Handle` is entered on that thread so [`vodfs::VodFs::new`] (which needs
/// an ambient runtime for its blocking reads) can find one.
fn mount_vodfs(mount: PathBuf, catalog: Store, materializer: Materializer) {
    let handle = tokio::runtime::Handle::current();
    std::thread::spawn(move || {
        let _guard = handle.enter();
        let fs = vodfs::VodFs::new(catalog, materializer);
        let options = [
            fuser::MountOption::RO,
            fuser::MountOption::FSName("iptv-tuner".to_string()),
        ];
        if let Err(e) = fuser::mount2(fs, &mount, &options) {
            log::error!("VODFS mount at {} failed: {e}", mount.display());
        }
    });
}

async fn run_supervise(
    config_path: &std::path::Path,
    child_bin: Option<PathBuf>,
) -> anyhow::Result<()> {
    let cfg = supervisor::load(config_path).await?;
    let child_bin = match child_bin {
        Some(p) => p,
        None => std::env::current_exe()?,
    };
    supervisor::run(&cfg, &child_bin).await?;
    Ok(())
}
