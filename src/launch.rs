use crate::error::UpdateError;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// Hands control over to the main application once the updater is done.
pub trait AppLauncher: Send + Sync {
    fn launch(&self, executable: &Path, working_dir: &Path) -> Result<(), UpdateError>;
}

/// Spawns the application as a detached child process.
pub struct ProcessLauncher;

impl AppLauncher for ProcessLauncher {
    fn launch(&self, executable: &Path, working_dir: &Path) -> Result<(), UpdateError> {
        info!("Launching {:?}", executable);
        Command::new(executable)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|source| UpdateError::LaunchFailed {
                path: executable.to_path_buf(),
                source,
            })
    }
}
