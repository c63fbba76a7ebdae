use crate::error::{Stage, UpdateError};
use crate::ota::update::{UpdateReporter, UserDecision};
use crate::ota::version::Version;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// Terminal front end for the updater.
pub struct ConsoleReporter {
    assume_yes: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            bar: Mutex::new(None),
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some(bar) = bar.take() {
                bar.finish_with_message("Download completed");
            }
        }
    }
}

impl UpdateReporter for ConsoleReporter {
    fn versions(&self, current: &Version, latest: &Version, changelog: Option<&str>) {
        println!("Current version: {}", current);
        println!("Latest version: {}", latest);
        if let Some(url) = changelog {
            println!("Changelog: {}", url);
        }
    }

    fn network_unavailable(&self, error: &UpdateError) {
        eprintln!("Network unavailable: {}", error);
        eprintln!("Check your internet connection and run the updater again.");
    }

    fn confirm_update(&self, current: &Version, latest: &Version) -> UserDecision {
        if self.assume_yes {
            return UserDecision::Proceed;
        }

        print!("Update from {} to {}? [y/N] ", current, latest);
        let _ = io::stdout().flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return UserDecision::Skip;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => UserDecision::Proceed,
            _ => UserDecision::Skip,
        }
    }

    fn stage(&self, stage: Stage) {
        self.finish_bar();
        println!("==> {}", stage);
    }

    fn prune_failed(&self, failures: &[(PathBuf, String)]) {
        eprintln!("Could not remove {} expired backup(s):", failures.len());
        for (path, reason) in failures {
            eprintln!("  {}: {}", path.display(), reason);
        }
    }

    fn download_progress(&self, downloaded: u64, total: Option<u64>) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        let bar = slot.get_or_insert_with(|| {
            let pb = ProgressBar::new(total.unwrap_or(0));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        });
        if let Some(total) = total {
            bar.set_length(total);
        }
        bar.set_position(downloaded);
    }

    fn failed(&self, error: &UpdateError) {
        self.finish_bar();
        eprintln!("Update failed during {}: {}", error.stage(), error);
        if let UpdateError::RollbackFailed { quarantine, .. } = error {
            eprintln!(
                "The installation could not be restored automatically. Move the files in {} \
                 back into the installation directory before starting the application.",
                quarantine.display()
            );
            eprintln!("Your data file backups are untouched in the backup directory.");
        }
    }
}
