//! keeper-update: transactional release apply with automatic rollback.
//!
//! [`ApplyRollbackController::trigger`] takes the newest Ready release from
//! staging, archives what it is about to replace into a [`RollbackPoint`],
//! stops the managed units, swaps the install tree, restarts and probes.
//! Any failure after the units were stopped restores the rollback point.

pub mod apply;
pub mod controller;
pub mod error;
pub mod rollback;
pub mod state;

pub use apply::{ApplyReport, apply_release, run_hook};
pub use controller::{ApplyRollbackController, TxOutcome, UpdateSettings};
pub use error::{UpdateError, UpdateResult};
pub use rollback::RollbackPoint;
pub use state::{StatusStore, TxState, TxStatus};
