//! Immutable snapshot storage.

mod storage;

pub use storage::{SnapshotStore, HISTORY_DIR, VERSIONS_DIR};
