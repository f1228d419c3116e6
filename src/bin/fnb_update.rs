//! Command-line front end for the updater.
//!
//! When started under the swap executor's name (as the host does at handoff)
//! it runs the executor instead of the CLI.

use clap::{Parser, Subcommand};
use fnb_updater::config::AutoUpdatePreference;
use fnb_updater::executor::{self, backup};
use fnb_updater::{
    FeedClient, ProcessLauncher, UpdateCoordinator, UpdateEvent, UpdateOutcome, UpdaterConfig,
    Version,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Check for and apply updates of the F&B management app.
#[derive(Debug, Parser)]
#[command(name = "fnb-update", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Query the release feed and report whether an update is available.
    Check,

    /// Download the newest release and hand off to the swap executor.
    Apply {
        /// Do not ask for confirmation before downloading.
        #[arg(short, long)]
        yes: bool,

        /// Installation executable to replace and relaunch.
        #[arg(long)]
        installation: PathBuf,
    },

    /// List backups left by earlier swaps.
    Backups {
        /// Installation executable whose backups to list.
        #[arg(long)]
        installation: Option<PathBuf>,
    },

    /// Delete backups of swaps that completed.
    Cleanup {
        /// Installation executable whose backups to clean up.
        #[arg(long)]
        installation: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    if executor::invoked_as_helper() {
        let guard = fnb_updater::logging::init_swap_executor();
        let outcome = executor::run_from_args(std::env::args_os().skip(1));
        tracing::info!(code = outcome.exit_code(), "swap executor finished");
        drop(guard);
        std::process::exit(outcome.exit_code());
    }

    fnb_updater::logging::init_console();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => UpdaterConfig::from_file(path)?,
        None => UpdaterConfig::load_or_default()?,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async move {
        match cli.command {
            Command::Check => check(config).await,
            Command::Apply { yes, installation } => apply(config, yes, installation).await,
            Command::Backups { installation } => list_backups(installation),
            Command::Cleanup { installation } => cleanup(installation),
        }
    });
    // A confirmation prompt may still be blocked on stdin.
    runtime.shutdown_background();
    result
}

async fn check(config: UpdaterConfig) -> anyhow::Result<()> {
    config.feed.validate_repository()?;
    let current = Version::current()?;
    let client = FeedClient::new(config.feed.clone())?;
    let release = client.fetch_latest(&config.feed.repository).await?;

    let eligible = !release.prerelease || config.feed.allow_prerelease;
    if eligible && release.version > current {
        println!("Update available: {current} -> {}", release.version);
        println!("Asset: {}", release.asset_name);
        if !release.notes.is_empty() {
            println!("\n{}", release.notes);
        }
    } else {
        println!("Up to date ({current}; newest release {})", release.version);
    }
    Ok(())
}

async fn apply(
    mut config: UpdaterConfig,
    yes: bool,
    installation: PathBuf,
) -> anyhow::Result<()> {
    if !installation.is_file() {
        anyhow::bail!("installation {} is not a file", installation.display());
    }
    if yes {
        config.schedule.auto_update = AutoUpdatePreference::Always;
    }
    let ask = config.schedule.auto_update == AutoUpdatePreference::Ask;

    let shutdown = CancellationToken::new();
    let coordinator = Arc::new(UpdateCoordinator::new(
        config,
        Version::current()?,
        installation,
        Arc::new(ProcessLauncher::from_current_exe()?),
        shutdown.clone(),
    )?);

    let mut events = coordinator.subscribe();
    let ui = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(UpdateEvent::UpdateAvailable { current, release }) => {
                        println!("Update available: {current} -> {}", release.version);
                        if !release.notes.is_empty() {
                            println!("\n{}\n", release.notes);
                        }
                        if ask {
                            let confirmed = tokio::task::spawn_blocking(prompt_yes_no)
                                .await
                                .unwrap_or(false);
                            if confirmed {
                                coordinator.confirm_download();
                            } else {
                                coordinator.cancel();
                            }
                        }
                    }
                    Ok(UpdateEvent::DownloadProgress(p)) => match p.percent() {
                        Some(pct) => eprint!("\rDownloading... {pct:5.1}%"),
                        None => eprint!("\rDownloading... {} bytes", p.bytes_received),
                    },
                    Ok(UpdateEvent::Finished(_)) => break,
                    Ok(UpdateEvent::PhaseChanged { .. }) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, cancelling update");
                coordinator.cancel();
            }
        });
    }

    let outcome = coordinator.check_now().await;
    ui.abort();
    eprintln!();

    match outcome {
        UpdateOutcome::NoUpdateAvailable => println!("Already up to date."),
        UpdateOutcome::Cancelled => println!("Update cancelled."),
        UpdateOutcome::UpdateApplied(version) => {
            println!("Installing {version}; the application will restart.");
        }
        UpdateOutcome::Failed(e) => return Err(e.into()),
    }
    Ok(())
}

fn prompt_yes_no() -> bool {
    print!("Download and install now? [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn install_dir(installation: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let exe = match installation {
        Some(path) => path,
        None => std::env::current_exe()?,
    };
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", exe.display()))
}

fn list_backups(installation: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = install_dir(installation)?;
    let backups = backup::discover(&dir)?;
    if backups.is_empty() {
        println!("No backups next to {}", dir.display());
        return Ok(());
    }
    for (backup, status) in backups {
        println!(
            "{}  {:<16} {}",
            backup.created_at().format("%Y-%m-%d %H:%M:%S"),
            status.to_string(),
            backup.backup_path().display()
        );
    }
    Ok(())
}

fn cleanup(installation: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = install_dir(installation)?;
    let removed = backup::cleanup_completed(&dir)?;
    println!("Removed {removed} completed backup(s).");
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn apply_requires_installation() {
        assert!(Cli::try_parse_from(["fnb-update", "apply", "--yes"]).is_err());

        let cli =
            Cli::try_parse_from(["fnb-update", "apply", "--installation", "/opt/fnb/fnb-app"])
                .unwrap();
        match cli.command {
            Command::Apply { yes, installation } => {
                assert!(!yes);
                assert_eq!(installation, PathBuf::from("/opt/fnb/fnb-app"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn maintenance_commands_take_optional_installation() {
        let cli = Cli::try_parse_from(["fnb-update", "backups"]).unwrap();
        assert!(matches!(cli.command, Command::Backups { installation: None }));
    }
}
