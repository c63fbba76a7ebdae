use crate::config::Config;
use crate::error::{Stage, UpdateError};
use crate::launch::AppLauncher;
use crate::lock::InstanceLock;
use crate::ota::backup::BackupManager;
use crate::ota::fetch::PackageFetcher;
use crate::ota::transaction::{InstallTransaction, StagingArea, TransactionReport};
use crate::ota::version::{LatestRelease, Version, VersionSource};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum UpdateMode {
    Interactive, // Show versions and wait for the user
    #[value(name = "auto")]
    AutoUpdate, // Update unattended
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    Proceed,
    Skip,
}

/// Presentation-side collaborator; the engine reports through it and never reaches
/// into the shell directly.
pub trait UpdateReporter: Send + Sync {
    fn versions(&self, current: &Version, latest: &Version, changelog: Option<&str>);
    fn network_unavailable(&self, error: &UpdateError);
    fn confirm_update(&self, current: &Version, latest: &Version) -> UserDecision;
    fn stage(&self, stage: Stage);
    /// Expired backups that could not be removed; the update continues regardless.
    fn prune_failed(&self, failures: &[(PathBuf, String)]);
    fn download_progress(&self, downloaded: u64, total: Option<u64>);
    fn failed(&self, error: &UpdateError);
}

#[derive(Debug)]
pub enum Outcome {
    AlreadyLatest(Version),
    Skipped { current: Version, latest: Version },
    Updated {
        from: Version,
        to: Version,
        backup: PathBuf,
        report: TransactionReport,
    },
}

pub struct UpdateOrchestrator {
    install_dir: PathBuf,
    config: Config,
    versions: VersionSource,
    backups: BackupManager,
    fetcher: PackageFetcher,
    reporter: Arc<dyn UpdateReporter>,
    launcher: Box<dyn AppLauncher>,
    launch_after: bool,
}

impl UpdateOrchestrator {
    pub fn new(
        install_dir: PathBuf,
        config: Config,
        client: reqwest::Client,
        reporter: Arc<dyn UpdateReporter>,
        launcher: Box<dyn AppLauncher>,
    ) -> Self {
        let versions = VersionSource::new(client.clone(), &config, &install_dir);
        let backups = BackupManager::new(
            config.data_file_path(&install_dir),
            config.backup_dir_path(&install_dir),
        );
        let fetcher = PackageFetcher::new(client, Duration::from_secs(config.release.timeout_secs));

        Self {
            install_dir,
            config,
            versions,
            backups,
            fetcher,
            reporter,
            launcher,
            launch_after: true,
        }
    }

    /// Leave the main application alone after the run.
    pub fn without_launch(mut self) -> Self {
        self.launch_after = false;
        self
    }

    /// Resolves both versions and reports them. Mutates nothing.
    pub async fn check(&self) -> Result<(Version, LatestRelease), UpdateError> {
        let result = self.resolve().await;
        if let Err(e) = &result {
            self.report_failure(e);
        }
        result
    }

    pub async fn run(&self, mode: UpdateMode) -> Result<Outcome, UpdateError> {
        info!("Starting update check in {:?} mode", mode);
        let result = self.run_inner(mode).await;
        if let Err(e) = &result {
            self.report_failure(e);
        }
        result
    }

    async fn run_inner(&self, mode: UpdateMode) -> Result<Outcome, UpdateError> {
        let (current, latest) = self.resolve().await?;

        if current.is_latest(&latest.version) {
            info!("Already running the latest version {}", current);
            self.launch_app()?;
            return Ok(Outcome::AlreadyLatest(current));
        }
        if current > latest.version {
            warn!(
                "Installed version {} is ahead of the published {}, not downgrading",
                current, latest.version
            );
            self.launch_app()?;
            return Ok(Outcome::AlreadyLatest(current));
        }

        info!("New version available: {} -> {}", current, latest.version);
        if mode == UpdateMode::Interactive
            && self.confirm(&current, &latest.version).await == UserDecision::Skip
        {
            info!("Update to {} skipped by user", latest.version);
            self.launch_app()?;
            return Ok(Outcome::Skipped {
                current,
                latest: latest.version,
            });
        }

        let (backup, report) = self.apply_update(&latest).await?;
        info!("Update successful: {} -> {}", current, latest.version);
        self.launch_app()?;
        Ok(Outcome::Updated {
            from: current,
            to: latest.version,
            backup,
            report,
        })
    }

    async fn resolve(&self) -> Result<(Version, LatestRelease), UpdateError> {
        self.reporter.stage(Stage::VersionCheck);
        let current = self.versions.current_version().await?;
        let latest = self.versions.latest_version(&current).await?;
        self.reporter.versions(
            &current,
            &latest.version,
            latest.changelog_url.as_deref(),
        );
        Ok((current, latest))
    }

    /// Backup, download, extract, then the install transaction. Every step is awaited
    /// before the next begins; nothing touches the installation before the transaction.
    async fn apply_update(
        &self,
        latest: &LatestRelease,
    ) -> Result<(PathBuf, TransactionReport), UpdateError> {
        let _lock = InstanceLock::acquire(&self.install_dir)?;

        self.reporter.stage(Stage::Backup);
        let pruned = self
            .backups
            .prune_old_backups(self.config.backup.retention_days);
        if !pruned.failures.is_empty() {
            self.reporter.prune_failed(&pruned.failures);
        }
        let backup = self.backups.create_backup()?;

        let staging =
            StagingArea::prepare(&self.install_dir).map_err(|e| UpdateError::Download {
                path: self.install_dir.clone(),
                reason: format!("cannot prepare staging area: {e}"),
            })?;

        self.reporter.stage(Stage::Download);
        let archive = staging.archive_path();
        let reporter = &self.reporter;
        let downloaded = self
            .fetcher
            .download(&latest.download_url, &archive, |done, total| {
                reporter.download_progress(done, total)
            })
            .await;
        if let Err(e) = downloaded {
            discard(&staging);
            return Err(e);
        }

        self.reporter.stage(Stage::Extract);
        if let Err(e) = self.fetcher.extract(&archive, &staging.extracted_dir()).await {
            discard(&staging);
            return Err(e);
        }
        if let Err(e) = fs::remove_file(&archive) {
            warn!("Failed to remove downloaded archive {:?}: {}", archive, e);
        }

        self.reporter.stage(Stage::Install);
        let transaction = InstallTransaction::new(
            self.install_dir.clone(),
            staging,
            self.config.persistence_set(&self.install_dir),
        );
        let report = transaction.apply()?;
        Ok((backup, report))
    }

    /// The reporter may block on user input, so it is asked off the async workers.
    async fn confirm(&self, current: &Version, latest: &Version) -> UserDecision {
        let reporter = Arc::clone(&self.reporter);
        let (current, latest) = (current.clone(), latest.clone());
        tokio::task::spawn_blocking(move || reporter.confirm_update(&current, &latest))
            .await
            .unwrap_or_else(|e| {
                warn!("Update prompt failed, skipping update: {}", e);
                UserDecision::Skip
            })
    }

    fn launch_app(&self) -> Result<(), UpdateError> {
        if !self.launch_after {
            return Ok(());
        }
        self.reporter.stage(Stage::Launch);
        self.launcher.launch(
            &self.config.executable_path(&self.install_dir),
            &self.install_dir,
        )
    }

    fn report_failure(&self, e: &UpdateError) {
        error!("Update failed during {}: {}", e.stage(), e);
        if e.is_network() {
            self.reporter.network_unavailable(e);
        }
        self.reporter.failed(e);
    }
}

fn discard(staging: &StagingArea) {
    if let Err(e) = staging.remove() {
        warn!("Failed to remove staging area {:?}: {}", staging.root(), e);
    }
}
