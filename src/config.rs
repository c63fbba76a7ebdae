use crate::ota::transaction::PersistenceSet;
use config::{Environment, File};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE: &str = "updater.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub release: ReleaseConfig,
    pub backup: BackupConfig,
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub executable: String,
    pub version_file: String,
    pub data_file: String,
    pub settings_file: String,
    pub updater_binary: Option<String>,
    /// Upper bound for `<executable> --version` when no version file exists.
    pub version_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub url: String,
    pub package_asset: String,
    pub package_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: String,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub auto_update_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            executable: "media-player".to_string(),
            version_file: "version.txt".to_string(),
            data_file: "media.db".to_string(),
            settings_file: "app_config.json".to_string(),
            updater_binary: None,
            version_timeout_secs: 10,
        }
    }
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            url: "https://api.github.com/repos/vortex3225/media_player/releases/latest".to_string(),
            package_asset: "media_player.zip".to_string(),
            package_url:
                "https://github.com/vortex3225/media_player/releases/latest/download/media_player.zip"
                    .to_string(),
            user_agent: "Media Player Updater".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: "Backups".to_string(),
            retention_days: 4,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_update_file: "auto_update.cfg".to_string(),
        }
    }
}

impl Config {
    /// Loads defaults, then `updater.toml` from the installation directory (if present),
    /// then `UPDATER_*` environment overrides such as `UPDATER_RELEASE__URL`.
    pub fn load(install_dir: &Path) -> Result<Self, config::ConfigError> {
        let path = install_dir.join(CONFIG_FILE);
        debug!("Loading updater configuration from {:?}", path);

        let settings = config::Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("UPDATER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Name of the updater's own executable; it must never be displaced.
    pub fn updater_binary(&self) -> String {
        self.app.updater_binary.clone().unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "app-updater".to_string())
        })
    }

    /// Top-level installation entries that hold user state.
    ///
    /// Configured paths may be nested (`state/media.db`); the whole top-level entry
    /// containing them is protected. Paths resolving outside `install_dir` are skipped.
    pub fn persistence_set(&self, install_dir: &Path) -> PersistenceSet {
        let configured = [
            self.app.data_file.clone(),
            self.backup.dir.clone(),
            self.update.auto_update_file.clone(),
            self.updater_binary(),
            self.app.settings_file.clone(),
            CONFIG_FILE.to_string(),
        ];
        PersistenceSet::new(
            configured
                .iter()
                .filter_map(|name| top_level_entry(install_dir, name)),
        )
    }

    pub fn executable_path(&self, install_dir: &Path) -> PathBuf {
        install_dir.join(&self.app.executable)
    }

    pub fn data_file_path(&self, install_dir: &Path) -> PathBuf {
        install_dir.join(&self.app.data_file)
    }

    pub fn backup_dir_path(&self, install_dir: &Path) -> PathBuf {
        install_dir.join(&self.backup.dir)
    }

    /// Unattended mode is on only when the flag file exists and contains `true`.
    pub fn auto_update_enabled(&self, install_dir: &Path) -> bool {
        fs::read_to_string(install_dir.join(&self.update.auto_update_file))
            .map(|contents| contents.contains("true"))
            .unwrap_or(false)
    }
}

fn top_level_entry(install_dir: &Path, configured: &str) -> Option<String> {
    let full = install_dir.join(configured);
    let relative = full.strip_prefix(install_dir).ok()?;
    match relative.components().next()? {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_without_config_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.app.data_file, "media.db");
        assert_eq!(config.backup.dir, "Backups");
        assert_eq!(config.backup.retention_days, 4);
        assert_eq!(config.release.timeout_secs, 15);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[app]\nexecutable = \"player\"\n\n[backup]\nretention_days = 7\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.app.executable, "player");
        assert_eq!(config.backup.retention_days, 7);
        assert_eq!(config.app.data_file, "media.db");
    }

    #[test]
    fn auto_update_flag_requires_true_token() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        assert!(!config.auto_update_enabled(dir.path()));

        fs::write(dir.path().join("auto_update.cfg"), "false").unwrap();
        assert!(!config.auto_update_enabled(dir.path()));

        fs::write(dir.path().join("auto_update.cfg"), "auto=true\n").unwrap();
        assert!(config.auto_update_enabled(dir.path()));
    }

    #[test]
    fn persistence_set_covers_user_files() {
        let mut config = Config::default();
        config.app.updater_binary = Some("updater.exe".to_string());
        let set = config.persistence_set(Path::new("/opt/player"));

        for name in [
            "media.db",
            "Backups",
            "auto_update.cfg",
            "updater.exe",
            "app_config.json",
            "updater.toml",
        ] {
            assert!(set.contains(name), "{name} should be persistent");
        }
        assert!(!set.contains("media-player"));
    }

    #[test]
    fn nested_state_paths_protect_their_top_level_directory() {
        let mut config = Config::default();
        config.app.data_file = "state/media.db".to_string();
        config.backup.dir = "./state/Backups".to_string();
        config.app.settings_file = "/etc/player/app_config.json".to_string();
        config.update.auto_update_file = "../auto_update.cfg".to_string();

        let set = config.persistence_set(Path::new("/opt/player"));

        assert!(set.contains("state"));
        assert!(set.contains("STATE"));
        assert!(!set.contains("media.db"));
        assert!(!set.contains("etc"));
        assert!(!set.contains(".."));
        assert!(!set.contains("auto_update.cfg"));
    }
}
