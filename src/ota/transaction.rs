//! Swaps the live installation for a staged package.
//!
//! The transaction walks `Staged -> Diffing -> Displacing -> Installing -> Committed`.
//! Any failure while displacing or installing moves it to `RollingBack`, which puts
//! every quarantined original back and ends in `RolledBack`. Names in the
//! [`PersistenceSet`] are never moved, overwritten or deleted.

use crate::error::UpdateError;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const STAGING_DIR: &str = ".update-staging";
pub const LOCK_FILE: &str = ".updater.lock";

const ARCHIVE_NAME: &str = "package.zip";
const EXTRACTED_DIR: &str = "extracted";
const QUARANTINE_DIR: &str = "quarantine";

/// Top-level names that must survive every update untouched.
///
/// Matching is exact and case-insensitive; there is no pattern matching.
#[derive(Debug, Clone)]
pub struct PersistenceSet {
    names: Vec<String>,
}

impl PersistenceSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|name| name.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn contains(&self, name: impl AsRef<OsStr>) -> bool {
        let name = name.as_ref().to_string_lossy().to_lowercase();
        self.names.iter().any(|persistent| *persistent == name)
    }
}

fn is_internal(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name.eq_ignore_ascii_case(STAGING_DIR) || name.eq_ignore_ascii_case(LOCK_FILE)
}

/// Scratch tree inside the installation directory holding the downloaded archive,
/// its extracted contents and the quarantine for displaced files.
///
/// Living on the same filesystem as the installation keeps displacement a rename.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    /// Clears any leftover staging tree from an earlier attempt and creates a fresh one.
    pub fn prepare(install_dir: &Path) -> io::Result<Self> {
        let staging = Self {
            root: install_dir.join(STAGING_DIR),
        };
        if staging.root.exists() {
            warn!("Removing stale staging area {:?}", staging.root);
            fs::remove_dir_all(&staging.root)?;
        }
        fs::create_dir_all(&staging.root)?;
        Ok(staging)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join(ARCHIVE_NAME)
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.root.join(EXTRACTED_DIR)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Staged,
    Diffing,
    Displacing,
    Installing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Staged => "staged",
            TransactionState::Diffing => "diffing",
            TransactionState::Displacing => "displacing",
            TransactionState::Installing => "installing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling back",
            TransactionState::RolledBack => "rolled back",
        }
    }
}

/// Classification of top-level entries computed while diffing.
#[derive(Debug, Default)]
pub struct DiffPlan {
    /// Old entries left in place.
    pub persistent: Vec<OsString>,
    /// Old entries moved to quarantine.
    pub displaceable: Vec<OsString>,
    /// Package entries copied into the installation.
    pub incoming: Vec<OsString>,
    /// Package entries dropped because the live copy is authoritative.
    pub discarded: Vec<OsString>,
}

#[derive(Debug)]
pub struct TransactionReport {
    pub displaced: usize,
    pub installed: usize,
    pub discarded: Vec<OsString>,
}

pub struct InstallTransaction {
    install_dir: PathBuf,
    staging: StagingArea,
    persistent: PersistenceSet,
    state: TransactionState,
    plan: DiffPlan,
    /// (original path, quarantine path) in the order the moves happened.
    quarantined: Vec<(PathBuf, PathBuf)>,
    installed: Vec<PathBuf>,
}

impl InstallTransaction {
    /// Takes ownership of a staging area whose package is already fully extracted.
    pub fn new(install_dir: PathBuf, staging: StagingArea, persistent: PersistenceSet) -> Self {
        Self {
            install_dir,
            staging,
            persistent,
            state: TransactionState::Staged,
            plan: DiffPlan::default(),
            quarantined: Vec::new(),
            installed: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn plan(&self) -> &DiffPlan {
        &self.plan
    }

    fn expect_state(&self, expected: TransactionState) -> Result<(), UpdateError> {
        if self.state != expected {
            return Err(UpdateError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Runs the whole transaction, rolling back on any displacement or install error.
    pub fn apply(mut self) -> Result<TransactionReport, UpdateError> {
        if let Err(e) = self.diff() {
            self.discard_staging();
            return Err(e);
        }
        if let Err(e) = self.displace() {
            return Err(self.rollback(e));
        }
        if let Err(e) = self.install() {
            return Err(self.rollback(e));
        }
        self.commit()
    }

    pub fn diff(&mut self) -> Result<(), UpdateError> {
        self.expect_state(TransactionState::Staged)?;
        self.state = TransactionState::Diffing;

        let old_entries = list_entries(&self.install_dir)?;
        let new_entries = list_entries(&self.staging.extracted_dir())?;

        let mut plan = DiffPlan::default();
        for name in old_entries.into_iter().filter(|n| !is_internal(n)) {
            if self.persistent.contains(&name) {
                plan.persistent.push(name);
            } else {
                plan.displaceable.push(name);
            }
        }
        for name in new_entries {
            if self.persistent.contains(&name) || is_internal(&name) {
                plan.discarded.push(name);
            } else {
                plan.incoming.push(name);
            }
        }

        info!(
            "Update plan: {} to displace, {} persistent kept, {} to install, {} discarded",
            plan.displaceable.len(),
            plan.persistent.len(),
            plan.incoming.len(),
            plan.discarded.len()
        );
        self.plan = plan;
        Ok(())
    }

    pub fn displace(&mut self) -> Result<(), UpdateError> {
        self.expect_state(TransactionState::Diffing)?;
        self.state = TransactionState::Displacing;

        let quarantine = self.staging.quarantine_dir();
        fs::create_dir_all(&quarantine).map_err(|source| UpdateError::DisplacementFailed {
            path: quarantine.clone(),
            source,
        })?;

        for name in &self.plan.displaceable {
            let original = self.install_dir.join(name);
            let held = quarantine.join(name);
            fs::rename(&original, &held).map_err(|source| UpdateError::DisplacementFailed {
                path: original.clone(),
                source,
            })?;
            debug!("Quarantined {:?}", original);
            self.quarantined.push((original, held));
        }

        info!("Displaced {} old entries", self.quarantined.len());
        Ok(())
    }

    pub fn install(&mut self) -> Result<(), UpdateError> {
        self.expect_state(TransactionState::Displacing)?;
        self.state = TransactionState::Installing;

        let extracted = self.staging.extracted_dir();
        for name in &self.plan.incoming {
            let source_path = extracted.join(name);
            let dest = self.install_dir.join(name);
            self.installed.push(dest.clone());
            copy_entry(&source_path, &dest).map_err(|source| {
                UpdateError::InstallationFailed {
                    path: dest.clone(),
                    source,
                }
            })?;
            debug!("Installed {:?}", dest);
        }

        for name in &self.plan.discarded {
            debug!("Discarded package copy of persistent entry {:?}", name);
        }
        info!("Installed {} new entries", self.installed.len());
        Ok(())
    }

    /// Drops quarantine and staging. The installation is already complete at this
    /// point, so a cleanup failure is only logged.
    pub fn commit(&mut self) -> Result<TransactionReport, UpdateError> {
        self.expect_state(TransactionState::Installing)?;
        self.discard_staging();
        self.state = TransactionState::Committed;

        info!("Update transaction committed");
        Ok(TransactionReport {
            displaced: self.quarantined.len(),
            installed: self.installed.len(),
            discarded: std::mem::take(&mut self.plan.discarded),
        })
    }

    /// Restores the pre-transaction installation after `cause`.
    ///
    /// Entries copied in from the package are removed and every quarantined original is
    /// moved back, originals taking precedence. Returns `cause` when the installation
    /// was fully restored, otherwise [`UpdateError::RollbackFailed`]; in that case the
    /// staging tree is kept so quarantined files are not lost.
    pub fn rollback(&mut self, cause: UpdateError) -> UpdateError {
        if !matches!(
            self.state,
            TransactionState::Displacing | TransactionState::Installing
        ) {
            return UpdateError::InvalidState {
                expected: "displacing or installing",
                actual: self.state.as_str(),
            };
        }
        warn!("Rolling back update transaction: {}", cause);
        self.state = TransactionState::RollingBack;

        let mut failures = Vec::new();
        for dest in self.installed.drain(..).rev() {
            if let Err(e) = remove_entry(&dest) {
                failures.push(format!("{}: {}", dest.display(), e));
            }
        }

        for (original, held) in self.quarantined.drain(..).rev() {
            let restored = remove_entry(&original).and_then(|_| fs::rename(&held, &original));
            match restored {
                Ok(()) => debug!("Restored {:?}", original),
                Err(e) => failures.push(format!("{}: {}", original.display(), e)),
            }
        }

        if !failures.is_empty() {
            error!(
                "Rollback incomplete, quarantined files remain in {:?}",
                self.staging.quarantine_dir()
            );
            return UpdateError::RollbackFailed {
                cause: Box::new(cause),
                failures,
                quarantine: self.staging.quarantine_dir(),
            };
        }

        self.discard_staging();
        self.state = TransactionState::RolledBack;
        info!("Rollback complete, previous installation restored");
        cause
    }

    fn discard_staging(&self) {
        if let Err(e) = self.staging.remove() {
            warn!("Failed to remove staging area {:?}: {}", self.staging.root(), e);
        }
    }
}

fn list_entries(dir: &Path) -> Result<Vec<OsString>, UpdateError> {
    let inspection = |source| UpdateError::Inspection {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = fs::read_dir(dir)
        .map_err(inspection)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(inspection)?;
    names.sort();
    Ok(names)
}

fn copy_entry(source: &Path, dest: &Path) -> io::Result<()> {
    if !fs::symlink_metadata(source)?.is_dir() {
        fs::copy(source, dest)?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
