pub mod backup;
pub mod fetch;
pub mod transaction;
pub mod update;
pub mod version;


pub use backup::BackupManager;
pub use fetch::PackageFetcher;
pub use transaction::{InstallTransaction, PersistenceSet, StagingArea};
pub use update::{Outcome, UpdateMode, UpdateOrchestrator, UpdateReporter, UserDecision};
pub use version::{Version, VersionSource};
