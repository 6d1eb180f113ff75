//! Supervision state and its durability.
//!
//! - [`store`]: the locked [`StateStore`] every component shares
//! - [`snapshot`]: on-disk snapshot format and the background writer

mod snapshot;
mod store;

pub use snapshot::{load_snapshot, SnapshotWriter, Snapshotter};
pub use store::{RunOutcome, StateOrigin, StateStore};
