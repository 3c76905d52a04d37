//! DroppyUpdater helper process

use anyhow::Context;
use clap::Parser;
use droppy_updater::{
    init_logging, InstallProgress, InstallStep, Installer, MacSystem, UpdateJob, UpdaterConfig,
    USAGE,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "DroppyUpdater", version = droppy_updater::VERSION)]
#[command(about = "Install a Droppy update from a disk image", long_about = None)]
struct Cli {
    /// <dmg_path> <app_path> <old_pid>
    #[arg(value_name = "ARGS")]
    args: Vec<String>,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not open the app after installing
    #[arg(long)]
    no_launch: bool,

    /// Exit immediately on failure instead of waiting for Enter
    #[arg(long)]
    no_wait: bool,

    /// Print progress as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    let job = match UpdateJob::from_args(cli.args.as_slice()) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("{}", USAGE);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = UpdaterConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    let mount_point = config.mount_point.clone();

    let mut installer = Installer::new(job, config, Arc::new(MacSystem::new()));
    let mut updates = installer.subscribe();

    // The installer works on its own task; this one only renders progress
    let worker = tokio::spawn(async move {
        let outcome = installer.run().await;
        (installer, outcome)
    });

    while let Some(progress) = updates.recv().await {
        render(&progress, cli.json)?;
        if progress.is_terminal() {
            break;
        }
    }

    let (installer, outcome) = worker.await.context("Installer task failed")?;

    match outcome {
        Ok(()) => {
            if !cli.no_launch {
                if let Err(e) = installer.launch_installed_app().await {
                    warn!("Failed to launch updated app: {}", e);
                }
            }
            info!("Updater exiting");
            Ok(())
        }
        Err(e) => {
            error!(step = ?e.step(), "Update failed: {}", e);
            if !cli.json {
                eprintln!();
                eprintln!(
                    "You can finish manually by dragging the app from {} into Applications.",
                    mount_point.display()
                );
            }
            if !cli.no_wait {
                wait_for_dismissal();
            }
            std::process::exit(1);
        }
    }
}

fn render(progress: &InstallProgress, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(progress)?);
        return Ok(());
    }

    let position = progress.step.index() + 1;
    let total = InstallStep::ALL.len();

    match progress.error {
        Some(ref message) => eprintln!("[{}/{}] Error: {}", position, total, message),
        None => println!("[{}/{}] {}", position, total, progress.step.title()),
    }

    Ok(())
}

fn wait_for_dismissal() {
    eprintln!("Press Enter to close.");
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}
