//! keeper-archive: verified incremental archives of a target set.
//!
//! The [`Archiver`] writes gzip tar archives whose embedded manifest records
//! the parent archive and chain root, so [`BackupChain`] can rebuild lineage
//! from the artifacts alone. [`retention`] plans deletions over a chain and
//! [`BackupJob`] wires the pieces together under the advisory lock.

pub mod archiver;
pub mod chain;
pub mod error;
pub mod format;
pub mod job;
pub mod lock;
pub mod retention;
pub mod scan;
pub mod space;
pub mod state;
pub mod transfer;

pub use archiver::{ArchiveRecord, Archiver, sweep_partials};
pub use chain::{BackupChain, ChainRecord, Orphan, RestoreReport, restore, restore_archive};
pub use error::{ArchiveError, ArchiveResult};
pub use format::{ArchiveKind, Destination, Manifest};
pub use job::{BackupJob, BackupReport};
pub use lock::TargetLock;
pub use retention::{PruneItem, PrunePlan, PruneReason, RetentionWindow};
pub use scan::TargetSet;
pub use space::{FixedSpace, FsSpace, SpaceProbe};
pub use state::{SnapshotState, SnapshotStateStore};
pub use transfer::{RemoteTransfer, TransferLedger, TransferOutcome};
