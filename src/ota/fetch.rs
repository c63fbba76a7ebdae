use crate::error::{UpdateError, PACKAGE_DOWNLOAD};
use futures_util::StreamExt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Streams release archives into the staging area and unpacks them there.
///
/// Nothing here writes into the live installation directory.
pub struct PackageFetcher {
    client: reqwest::Client,
    chunk_timeout: Duration,
}

impl PackageFetcher {
    pub fn new(client: reqwest::Client, chunk_timeout: Duration) -> Self {
        Self {
            client,
            chunk_timeout,
        }
    }

    /// Downloads `url` to `dest`, which must not exist yet.
    ///
    /// `progress` receives `(downloaded, total)` after every chunk. A partially written
    /// archive is removed before an error is returned.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        progress: F,
    ) -> Result<PathBuf, UpdateError>
    where
        F: Fn(u64, Option<u64>),
    {
        info!("Downloading update package from {}", url);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .await
            .map_err(|e| UpdateError::Download {
                path: dest.to_path_buf(),
                reason: if e.kind() == io::ErrorKind::AlreadyExists {
                    "a stale archive is already staged".to_string()
                } else {
                    e.to_string()
                },
            })?;

        match self.stream_to(url, file, dest, progress).await {
            Ok(bytes) => {
                info!("Update downloaded successfully to {:?} ({} bytes)", dest, bytes);
                Ok(dest.to_path_buf())
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(dest).await {
                    warn!("Failed to remove partial download {:?}: {}", dest, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn stream_to<F>(
        &self,
        url: &str,
        mut file: tokio::fs::File,
        dest: &Path,
        progress: F,
    ) -> Result<u64, UpdateError>
    where
        F: Fn(u64, Option<u64>),
    {
        let response = tokio::time::timeout(self.chunk_timeout, self.client.get(url).send())
            .await
            .map_err(|_| UpdateError::network(PACKAGE_DOWNLOAD, "request timed out"))?
            .and_then(|r| r.error_for_status())
            .map_err(|e| UpdateError::network(PACKAGE_DOWNLOAD, e))?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::time::timeout(self.chunk_timeout, stream.next())
                .await
                .map_err(|_| UpdateError::network(PACKAGE_DOWNLOAD, "transfer stalled"))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| UpdateError::network(PACKAGE_DOWNLOAD, e))?;

            file.write_all(&chunk).await.map_err(|e| UpdateError::Download {
                path: dest.to_path_buf(),
                reason: e.to_string(),
            })?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }

        file.flush().await.map_err(|e| UpdateError::Download {
            path: dest.to_path_buf(),
            reason: e.to_string(),
        })?;

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(UpdateError::network(
                    PACKAGE_DOWNLOAD,
                    format!("received {downloaded} of {expected} bytes"),
                ));
            }
        }
        Ok(downloaded)
    }

    /// Unpacks the whole archive into `dest_dir`. On failure the partially extracted
    /// directory is removed.
    pub async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<usize, UpdateError> {
        info!("Extracting {:?} into {:?}", archive, dest_dir);
        let archive = archive.to_path_buf();
        let dest = dest_dir.to_path_buf();

        let result = tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
            .await
            .map_err(|e| UpdateError::ExtractionFailed(format!("extraction task failed: {e}")))?;

        if result.is_err() && dest_dir.exists() {
            if let Err(e) = fs::remove_dir_all(dest_dir) {
                warn!("Failed to remove partial extraction {:?}: {}", dest_dir, e);
            }
        }
        result
    }
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<usize, UpdateError> {
    let file = fs::File::open(archive).map_err(|e| extraction_error(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extraction_error(archive, e))?;
    fs::create_dir_all(dest).map_err(|e| extraction_error(archive, e))?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extraction_error(archive, e))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            UpdateError::ExtractionFailed(format!(
                "{}: entry '{}' escapes the extraction directory",
                archive.display(),
                entry.name()
            ))
        })?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| extraction_error(archive, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| extraction_error(archive, e))?;
        }
        let mut outfile = fs::File::create(&out_path).map_err(|e| extraction_error(archive, e))?;
        io::copy(&mut entry, &mut outfile).map_err(|e| extraction_error(archive, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))
                    .map_err(|e| extraction_error(archive, e))?;
            }
        }

        debug!("Extracted {:?}", out_path);
        files += 1;
    }

    Ok(files)
}

fn extraction_error(archive: &Path, err: impl std::fmt::Display) -> UpdateError {
    UpdateError::ExtractionFailed(format!("{}: {}", archive.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn fetcher() -> PackageFetcher {
        PackageFetcher::new(reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn downloads_archive_and_reports_progress() {
        let server = MockServer::start().await;
        let payload = zip_bytes(&[("app", b"binary")]);
        Mock::given(method("GET"))
            .and(path("/pkg.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("package.zip");
        let seen = std::cell::Cell::new(0u64);

        fetcher()
            .download(&format!("{}/pkg.zip", server.uri()), &dest, |done, _| seen.set(done))
            .await
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), payload);
        assert_eq!(seen.get(), payload.len() as u64);
    }

    #[tokio::test]
    async fn refuses_stale_archive() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("package.zip");
        fs::write(&dest, b"partial").unwrap();

        let err = fetcher()
            .download("http://127.0.0.1:9/pkg.zip", &dest, |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Download { .. }));
        assert_eq!(fs::read(&dest).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn http_error_removes_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("package.zip");
        let err = fetcher()
            .download(&format!("{}/missing.zip", server.uri()), &dest, |_, _| {})
            .await
            .unwrap_err();

        assert!(err.is_network());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn extracts_nested_entries() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("package.zip");
        fs::write(
            &archive,
            zip_bytes(&[("app", b"v2"), ("assets/logo.png", b"png")]),
        )
        .unwrap();

        let out = dir.path().join("extracted");
        let count = fetcher().extract(&archive, &out).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(fs::read(out.join("app")).unwrap(), b"v2");
        assert_eq!(fs::read(out.join("assets/logo.png")).unwrap(), b"png");
    }

    #[tokio::test]
    async fn corrupt_archive_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("package.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        let out = dir.path().join("extracted");
        let err = fetcher().extract(&archive, &out).await.unwrap_err();

        assert!(matches!(err, UpdateError::ExtractionFailed(_)));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn rejects_entries_outside_destination() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("package.zip");
        fs::write(&archive, zip_bytes(&[("ok", b"1"), ("../evil", b"2")])).unwrap();

        let out = dir.path().join("extracted");
        let err = fetcher().extract(&archive, &out).await.unwrap_err();

        assert!(matches!(err, UpdateError::ExtractionFailed(_)));
        assert!(!out.exists());
        assert!(!dir.path().join("evil").exists());
    }
}
