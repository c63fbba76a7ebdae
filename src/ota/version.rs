use crate::config::Config;
use crate::error::{UpdateError, RELEASE_QUERY};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Installed or released application version.
///
/// Wraps a [`semver::Version`] but parses the looser tags used by release feeds and
/// Windows file versions: an optional non-numeric prefix (`v1.3.0`), one to three
/// numeric components, and an optional fourth build component kept as build metadata.
/// Equality is structural, so `1.2.0` and `1.2.0.0` are different versions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(semver::Version);

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version(semver::Version::new(major, minor, patch))
    }

    pub fn parse(input: &str) -> Result<Self, UpdateError> {
        let trimmed = input
            .trim()
            .trim_start_matches(|c: char| !c.is_ascii_digit());
        if trimmed.is_empty() {
            return Err(UpdateError::Parse(format!("'{input}' is not a version")));
        }

        if let Ok(version) = semver::Version::parse(trimmed) {
            return Ok(Version(version));
        }

        let parts = trimmed
            .split('.')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| UpdateError::Parse(format!("'{input}' is not a version")))?;

        let mut version = match parts.as_slice() {
            [major] => semver::Version::new(*major, 0, 0),
            [major, minor] => semver::Version::new(*major, *minor, 0),
            [major, minor, patch] | [major, minor, patch, _] => {
                semver::Version::new(*major, *minor, *patch)
            }
            _ => return Err(UpdateError::Parse(format!("'{input}' is not a version"))),
        };
        if let [_, _, _, build] = parts.as_slice() {
            version.build = semver::BuildMetadata::new(&build.to_string())
                .map_err(|e| UpdateError::Parse(e.to_string()))?;
        }
        Ok(Version(version))
    }

    /// Structural equality; ordering plays no part.
    pub fn is_latest(&self, latest: &Version) -> bool {
        self == latest
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

/// Four-component versions print in their dotted form (`1.2.0.0`).
impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.0;
        let numeric_build = !v.build.is_empty()
            && v.pre.is_empty()
            && v.build.as_str().bytes().all(|b| b.is_ascii_digit());
        if numeric_build {
            write!(f, "{}.{}.{}.{}", v.major, v.minor, v.patch, v.build.as_str())
        } else {
            v.fmt(f)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseDescriptor {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone)]
pub struct LatestRelease {
    pub version: Version,
    pub download_url: String,
    pub changelog_url: Option<String>,
    /// Set when the feed had no usable tag and the current version was assumed.
    pub assumed_current: bool,
}

/// Resolves the installed version and the latest published release.
pub struct VersionSource {
    client: reqwest::Client,
    release_url: String,
    package_asset: String,
    package_url: String,
    timeout: Duration,
    version_timeout: Duration,
    executable: PathBuf,
    version_file: PathBuf,
}

impl VersionSource {
    pub fn new(client: reqwest::Client, config: &Config, install_dir: &Path) -> Self {
        Self {
            client,
            release_url: config.release.url.clone(),
            package_asset: config.release.package_asset.clone(),
            package_url: config.release.package_url.clone(),
            timeout: Duration::from_secs(config.release.timeout_secs),
            version_timeout: Duration::from_secs(config.app.version_timeout_secs),
            executable: config.executable_path(install_dir),
            version_file: install_dir.join(&config.app.version_file),
        }
    }

    /// Reads the sidecar version file, falling back to `<executable> --version`.
    ///
    /// The fallback is bounded by the configured version timeout; a child that does not
    /// exit in time is killed and the version is reported unavailable.
    pub async fn current_version(&self) -> Result<Version, UpdateError> {
        match fs::read_to_string(&self.version_file) {
            Ok(contents) => {
                debug!("Reading installed version from {:?}", self.version_file);
                return Version::parse(&contents).map_err(|e| {
                    UpdateError::VersionUnavailable(format!(
                        "{}: {e}",
                        self.version_file.display()
                    ))
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(UpdateError::VersionUnavailable(format!(
                    "{}: {e}",
                    self.version_file.display()
                )))
            }
        }

        debug!("Querying {:?} --version", self.executable);
        let unavailable = |reason: String| {
            UpdateError::VersionUnavailable(format!("{}: {reason}", self.executable.display()))
        };

        let child = tokio::process::Command::new(&self.executable)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(e.to_string()))?;

        let output = tokio::time::timeout(self.version_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(
                    "{:?} --version did not exit within {:?}",
                    self.executable, self.version_timeout
                );
                unavailable(format!(
                    "--version did not exit within {}s",
                    self.version_timeout.as_secs()
                ))
            })?
            .map_err(|e| unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(unavailable(format!("--version exited with {}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .split_whitespace()
            .map(|token| token.trim_start_matches(['v', 'V']))
            .filter(|token| token.starts_with(|c: char| c.is_ascii_digit()))
            .find_map(|token| Version::parse(token).ok())
            .ok_or_else(|| unavailable("no version in --version output".to_string()))
    }

    pub async fn fetch_release(&self) -> Result<ReleaseDescriptor, UpdateError> {
        info!("Requesting latest release from: {}", self.release_url);

        let response = self
            .client
            .get(&self.release_url)
            .header("Accept", "application/vnd.github.v3+json")
            .timeout(self.timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UpdateError::network(RELEASE_QUERY, e))?;

        let body = response
            .text()
            .await
            .map_err(|e| UpdateError::network(RELEASE_QUERY, e))?;

        serde_json::from_str(&body).map_err(|e| UpdateError::Parse(e.to_string()))
    }

    /// A missing or blank tag yields `current` with `assumed_current` set; a tag that
    /// is present but unparsable is an error.
    pub async fn latest_version(&self, current: &Version) -> Result<LatestRelease, UpdateError> {
        let release = self.fetch_release().await?;
        self.resolve_release(release, current)
    }

    pub fn resolve_release(
        &self,
        release: ReleaseDescriptor,
        current: &Version,
    ) -> Result<LatestRelease, UpdateError> {
        let download_url = release
            .assets
            .iter()
            .find(|asset| asset.name == self.package_asset)
            .map(|asset| asset.browser_download_url.clone())
            .unwrap_or_else(|| self.package_url.clone());

        let tag = release.tag_name.as_deref().map(str::trim).unwrap_or("");
        if tag.is_empty() {
            warn!(
                "Release feed returned no tag_name, assuming {} is the latest version",
                current
            );
            return Ok(LatestRelease {
                version: current.clone(),
                download_url,
                changelog_url: release.html_url,
                assumed_current: true,
            });
        }

        let version = Version::parse(tag)?;
        info!("Latest version: {}", version);
        Ok(LatestRelease {
            version,
            download_url,
            changelog_url: release.html_url,
            assumed_current: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> VersionSource {
        let dir = std::env::temp_dir();
        VersionSource::new(reqwest::Client::new(), &Config::default(), &dir)
    }

    #[test]
    fn parses_prefixed_and_short_versions() {
        assert_eq!(Version::parse("v1.3.0").unwrap(), Version::new(1, 3, 0));
        assert_eq!(Version::parse(" 2.1 \n").unwrap(), Version::new(2, 1, 0));
        assert_eq!(Version::parse("release-4").unwrap(), Version::new(4, 0, 0));
        assert!(Version::parse("v").is_err());
        assert!(Version::parse("1.x.0").is_err());
    }

    #[test]
    fn four_component_versions_keep_their_build() {
        let windows = Version::parse("1.2.0.0").unwrap();
        assert_ne!(windows, Version::new(1, 2, 0));
        assert_eq!(windows.to_string(), "1.2.0.0");
        assert_eq!(Version::parse("v1.3.0").unwrap().to_string(), "1.3.0");
        assert_eq!(Version::parse("2.0.0-rc.1").unwrap().to_string(), "2.0.0-rc.1");
    }

    #[test]
    fn latest_is_equality_not_ordering() {
        let v = Version::new(1, 2, 0);
        assert!(v.is_latest(&Version::new(1, 2, 0)));
        assert!(!v.is_latest(&Version::new(1, 3, 0)));
        assert!(!Version::new(2, 0, 0).is_latest(&Version::new(1, 3, 0)));
    }

    #[test]
    fn blank_tag_falls_back_to_current() {
        let current = Version::new(1, 2, 0);
        let release = ReleaseDescriptor {
            tag_name: Some("  ".to_string()),
            html_url: None,
            assets: vec![],
        };

        let latest = source().resolve_release(release, &current).unwrap();
        assert!(latest.assumed_current);
        assert_eq!(latest.version, current);
    }

    #[test]
    fn garbage_tag_is_a_parse_error() {
        let release = ReleaseDescriptor {
            tag_name: Some("nightly".to_string()),
            html_url: None,
            assets: vec![],
        };
        let err = source()
            .resolve_release(release, &Version::new(1, 0, 0))
            .unwrap_err();
        assert!(matches!(err, UpdateError::Parse(_)));
    }

    #[test]
    fn prefers_named_asset_over_fixed_url() {
        let release = ReleaseDescriptor {
            tag_name: Some("v1.3.0".to_string()),
            html_url: Some("https://example.invalid/releases/v1.3.0".to_string()),
            assets: vec![
                ReleaseAsset {
                    name: "checksums.txt".to_string(),
                    browser_download_url: "https://example.invalid/checksums.txt".to_string(),
                },
                ReleaseAsset {
                    name: "media_player.zip".to_string(),
                    browser_download_url: "https://example.invalid/media_player.zip".to_string(),
                },
            ],
        };

        let latest = source().resolve_release(release, &Version::new(1, 2, 0)).unwrap();
        assert_eq!(latest.version, Version::new(1, 3, 0));
        assert_eq!(latest.download_url, "https://example.invalid/media_player.zip");

        let bare = ReleaseDescriptor {
            tag_name: Some("1.3.0".to_string()),
            html_url: None,
            assets: vec![],
        };
        let latest = source().resolve_release(bare, &Version::new(1, 2, 0)).unwrap();
        assert_eq!(latest.download_url, Config::default().release.package_url);
    }

    #[tokio::test]
    async fn reads_version_file_next_to_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("version.txt"), "1.2.0\n").unwrap();
        let source = VersionSource::new(reqwest::Client::new(), &Config::default(), dir.path());
        assert_eq!(source.current_version().await.unwrap(), Version::new(1, 2, 0));
    }

    #[tokio::test]
    async fn missing_metadata_is_version_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = VersionSource::new(reqwest::Client::new(), &Config::default(), dir.path());
        assert!(matches!(
            source.current_version().await,
            Err(UpdateError::VersionUnavailable(_))
        ));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_flag_output_is_used_without_version_file() {
        let dir = tempfile::TempDir::new().unwrap();
        write_script(dir.path(), "media-player", "echo 'Media Player v1.4.2 (build 77)'");
        let source = VersionSource::new(reqwest::Client::new(), &Config::default(), dir.path());

        assert_eq!(source.current_version().await.unwrap(), Version::new(1, 4, 2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_executable_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        write_script(dir.path(), "media-player", "exec sleep 30");
        let mut config = Config::default();
        config.app.version_timeout_secs = 1;
        let source = VersionSource::new(reqwest::Client::new(), &config, dir.path());

        let started = std::time::Instant::now();
        let result = source.current_version().await;

        assert!(matches!(result, Err(UpdateError::VersionUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
