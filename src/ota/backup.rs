use crate::error::UpdateError;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Outcome of a retention pass. Per-entry failures never stop the scan.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

pub struct BackupManager {
    data_file: PathBuf,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(data_file: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            data_file,
            backup_dir,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copies the user data file to a fresh, uniquely named file in the backup directory.
    ///
    /// The destination is opened with create-new semantics, so an existing backup is
    /// never overwritten.
    pub fn create_backup(&self) -> Result<PathBuf, UpdateError> {
        let backup_file = self.backup_dir.join(self.backup_name());
        info!("Creating backup at: {:?}", backup_file);

        self.copy_new(&backup_file).map_err(|e| {
            UpdateError::BackupFailed(format!(
                "{} -> {}: {e}",
                self.data_file.display(),
                backup_file.display()
            ))
        })?;

        Ok(backup_file)
    }

    fn copy_new(&self, backup_file: &Path) -> io::Result<()> {
        fs::create_dir_all(&self.backup_dir)?;
        let mut source = fs::File::open(&self.data_file)?;
        let mut dest = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(backup_file)?;

        if let Err(e) = io::copy(&mut source, &mut dest).and_then(|_| dest.sync_all()) {
            drop(dest);
            let _ = fs::remove_file(backup_file);
            return Err(e);
        }
        Ok(())
    }

    fn backup_name(&self) -> String {
        let stem = self
            .data_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "bak_{}-{}-{}",
            stem,
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            &suffix[..8]
        );
        match self.data_file.extension() {
            Some(ext) => format!("{}.{}", name, ext.to_string_lossy()),
            None => name,
        }
    }

    pub fn prune_old_backups(&self, max_age_days: u32) -> PruneReport {
        let max_age = Duration::from_secs(u64::from(max_age_days) * SECS_PER_DAY);
        self.prune_older_than(max_age, SystemTime::now())
    }

    /// Deletes every backup file whose last modification is at least `max_age` before `now`.
    pub fn prune_older_than(&self, max_age: Duration, now: SystemTime) -> PruneReport {
        let mut report = PruneReport::default();

        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("Failed to read backup directory {:?}: {}", self.backup_dir, e);
                report.failures.push((self.backup_dir.clone(), e.to_string()));
                return report;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to read backup entry: {}", e);
                    report.failures.push((self.backup_dir.clone(), e.to_string()));
                    continue;
                }
            };
            let path = entry.path();

            match prune_entry(&entry, max_age, now) {
                Ok(true) => {
                    debug!("Removed expired backup {:?}", path);
                    report.removed.push(path);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to remove old backup {:?}: {}", path, e);
                    report.failures.push((path, e.to_string()));
                }
            }
        }

        if !report.removed.is_empty() {
            info!("Pruned {} expired backup(s)", report.removed.len());
        }
        report
    }
}

fn prune_entry(entry: &fs::DirEntry, max_age: Duration, now: SystemTime) -> io::Result<bool> {
    let metadata = entry.metadata()?;
    if !metadata.is_file() {
        return Ok(false);
    }
    let age = now
        .duration_since(metadata.modified()?)
        .unwrap_or(Duration::ZERO);
    if age < max_age {
        return Ok(false);
    }
    fs::remove_file(entry.path())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> BackupManager {
        BackupManager::new(dir.path().join("media.db"), dir.path().join("Backups"))
    }

    fn set_age(path: &Path, age: Duration, now: SystemTime) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(now - age).unwrap();
    }

    #[test]
    fn backup_copies_data_under_unique_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("media.db"), b"library").unwrap();
        let manager = manager(&dir);

        let first = manager.create_backup().unwrap();
        let second = manager.create_backup().unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"library");
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bak_media-"));
        assert!(name.ends_with(".db"));
    }

    #[test]
    fn missing_data_file_fails_closed() {
        let dir = TempDir::new().unwrap();
        let err = manager(&dir).create_backup().unwrap_err();
        assert!(matches!(err, UpdateError::BackupFailed(_)));
        let leftovers = fs::read_dir(dir.path().join("Backups")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn existing_backup_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("media.db"), b"new").unwrap();
        let manager = manager(&dir);
        fs::create_dir_all(manager.backup_dir()).unwrap();
        let taken = manager.backup_dir().join("taken.db");
        fs::write(&taken, b"old").unwrap();

        assert!(manager.copy_new(&taken).is_err());
        assert_eq!(fs::read(&taken).unwrap(), b"old");
    }

    #[test]
    fn prune_respects_threshold() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        fs::create_dir_all(manager.backup_dir()).unwrap();
        let now = SystemTime::now();
        let threshold = Duration::from_secs(4 * SECS_PER_DAY);

        let exact = manager.backup_dir().join("exact.db");
        let older = manager.backup_dir().join("older.db");
        let younger = manager.backup_dir().join("younger.db");
        for path in [&exact, &older, &younger] {
            fs::write(path, b"x").unwrap();
        }
        set_age(&exact, threshold, now);
        set_age(&older, threshold + Duration::from_secs(60), now);
        set_age(&younger, threshold - Duration::from_secs(60), now);

        let report = manager.prune_older_than(threshold, now);

        assert_eq!(report.removed.len(), 2);
        assert!(report.failures.is_empty());
        assert!(!exact.exists());
        assert!(!older.exists());
        assert!(younger.exists());
    }

    #[test]
    fn prune_skips_directories_and_missing_dir() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(manager.prune_old_backups(4).removed.is_empty());

        fs::create_dir_all(manager.backup_dir().join("nested")).unwrap();
        let report = manager.prune_older_than(Duration::ZERO, SystemTime::now());
        assert!(report.removed.is_empty());
        assert!(manager.backup_dir().join("nested").exists());
    }
}
