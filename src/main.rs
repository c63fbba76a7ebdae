use anyhow::{Context, Result};
use app_updater::config::Config;
use app_updater::console::ConsoleReporter;
use app_updater::error::UpdateError;
use app_updater::launch::ProcessLauncher;
use app_updater::ota::{Outcome, UpdateMode, UpdateOrchestrator};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "app-updater", version, about = "Keeps an installed application up to date")]
struct Args {
    /// Installation directory (defaults to the directory holding this executable)
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Override the mode selected by the auto-update flag file
    #[arg(long, value_enum)]
    mode: Option<UpdateMode>,

    /// Answer yes to the update prompt
    #[arg(short, long)]
    yes: bool,

    /// Only report the installed and latest versions
    #[arg(long)]
    check: bool,

    /// Do not start the application afterwards
    #[arg(long)]
    no_launch: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    setup_logging(args.verbose)?;
    info!("Updater starting...");

    let install_dir = match args.install_dir {
        Some(dir) => dir,
        None => default_install_dir()?,
    };
    let config = match Config::load(&install_dir) {
        Ok(config) => config,
        Err(e) => return Ok(failure(UpdateError::from(e))),
    };

    let client = reqwest::Client::builder()
        .user_agent(config.release.user_agent.clone())
        .connect_timeout(Duration::from_secs(config.release.timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let mode = args.mode.unwrap_or_else(|| {
        if config.auto_update_enabled(&install_dir) {
            UpdateMode::AutoUpdate
        } else {
            UpdateMode::Interactive
        }
    });

    let reporter = Arc::new(ConsoleReporter::new(args.yes));
    let mut orchestrator = UpdateOrchestrator::new(
        install_dir,
        config,
        client,
        reporter,
        Box::new(ProcessLauncher),
    );
    if args.no_launch {
        orchestrator = orchestrator.without_launch();
    }

    if args.check {
        return Ok(match orchestrator.check().await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => ExitCode::from(e.exit_code()),
        });
    }

    match orchestrator.run(mode).await {
        Ok(Outcome::Updated { from, to, backup, .. }) => {
            println!("Updated {} -> {} (backup: {})", from, to, backup.display());
            Ok(ExitCode::SUCCESS)
        }
        Ok(Outcome::AlreadyLatest(version)) => {
            println!("{} is the latest version", version);
            Ok(ExitCode::SUCCESS)
        }
        Ok(Outcome::Skipped { .. }) => Ok(ExitCode::SUCCESS),
        Err(e) => Ok(ExitCode::from(e.exit_code())),
    }
}

fn default_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the updater executable")?;
    exe.parent()
        .map(PathBuf::from)
        .context("Updater executable has no parent directory")
}

fn failure(e: UpdateError) -> ExitCode {
    eprintln!("{}", e);
    ExitCode::from(e.exit_code())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")
}
