use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use updater::host::{self, CheckPayload, HostResponse};
use updater::{DownloadProgress, ReleaseInfo, UpdateCheck, Updater, UpdaterConfig};

/// Command-line host for the GCSD Inventory updater
#[derive(Parser, Debug)]
#[clap(version, about = "Check, download, apply and roll back GCSD Inventory updates")]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// JSON configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Installation directory; also used for staging, backups and restart helpers
    #[clap(long)]
    install_dir: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the latest release with the installed version
    Check {
        /// Version to compare against instead of the installed package.json
        #[clap(long)]
        current: Option<String>,
    },
    /// Download the latest release if it is newer
    Download {
        #[clap(long)]
        current: Option<String>,
    },
    /// Apply a previously downloaded archive
    Apply {
        #[clap(long)]
        archive: PathBuf,
        #[clap(long)]
        temp_dir: PathBuf,
    },
    /// Check, download and apply in one go
    Update {
        #[clap(long)]
        current: Option<String>,
        /// Relaunch the application after a successful update
        #[clap(long)]
        restart: bool,
    },
    /// List restorable backups
    Backups,
    /// Restore a backup by name
    Rollback { name: String },
    /// Relaunch the application
    Restart,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "debug,updater=debug"
    } else {
        "info,updater=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => UpdaterConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => UpdaterConfig::default(),
    };
    if let Some(dir) = args.install_dir {
        config.install_dir = dir.clone();
        config.exe_dir = dir;
    }
    let updater = Updater::from_config(config).context("creating updater")?;

    let success = match args.command {
        Command::Check { current } => emit(&host::check_for_updates(&updater, current.as_deref()).await)?,
        Command::Download { current } => match latest_available(&updater, current).await? {
            Some(release) => emit(&download(&updater, &release).await)?,
            None => true,
        },
        Command::Apply { archive, temp_dir } => {
            emit(&host::apply_update(&updater, &archive, &temp_dir).await)?
        }
        Command::Update { current, restart } => {
            let Some(release) = latest_available(&updater, current).await? else {
                return Ok(());
            };
            let downloaded = download(&updater, &release).await;
            let Some(payload) = downloaded.data.as_ref().filter(|_| downloaded.success) else {
                emit(&downloaded)?;
                std::process::exit(1);
            };
            let applied = host::apply_update(&updater, &payload.zip_path, &payload.temp_dir).await;
            if emit(&applied)? && restart {
                relaunch(&updater).await?
            } else {
                applied.success
            }
        }
        Command::Backups => emit(&host::available_backups(&updater).await)?,
        Command::Rollback { name } => emit(&host::rollback_to_backup(&updater, &name).await)?,
        Command::Restart => relaunch(&updater).await?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the check result and return the release when it is newer.
async fn latest_available(updater: &Updater, current: Option<String>) -> Result<Option<ReleaseInfo>> {
    let current = current.unwrap_or_else(|| updater.installed_version());
    let check = match updater.check_for_updates(&current).await {
        Ok(check) => check,
        Err(err) => {
            emit(&HostResponse::<CheckPayload>::failed(&err))?;
            std::process::exit(1);
        }
    };
    emit(&HostResponse::ok(CheckPayload::from_check(&check, &current)))?;

    match check {
        UpdateCheck::Available(release) => Ok(Some(release)),
        _ => {
            info!(current = %current, "no update to install");
            Ok(None)
        }
    }
}

async fn download(updater: &Updater, release: &ReleaseInfo) -> HostResponse<host::DownloadPayload> {
    let (tx, rx) = mpsc::channel(32);
    let reporter = tokio::spawn(report_progress(rx));
    let response = host::download_update(updater, release, Some(tx)).await;
    if let Err(err) = reporter.await {
        warn!(error = %err, "progress reporter stopped");
    }
    response
}

async fn report_progress(mut rx: mpsc::Receiver<DownloadProgress>) {
    let mut last = None;
    while let Some(progress) = rx.recv().await {
        let percent = progress.percent();
        if last != Some(percent) {
            info!(
                percent,
                downloaded = progress.downloaded,
                total = progress.total,
                "download progress"
            );
            last = Some(percent);
        }
    }
}

async fn relaunch(updater: &Updater) -> Result<bool> {
    let response = host::restart_app(updater);
    if !emit(&response)? {
        return Ok(false);
    }
    // Let the helper start before this process goes away.
    tokio::time::sleep(Duration::from_millis(500)).await;
    std::process::exit(0);
}

fn emit<T: Serialize>(response: &HostResponse<T>) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.success)
}
