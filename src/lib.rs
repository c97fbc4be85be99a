//! # Folio
//!
//! A per-document, branch-based version store for an editor. Each document
//! keeps a table of named branches pointing into a chain of immutable
//! snapshots, and a plain-text mirror file that follows `main`.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: Write-once saves of a document, linked by parent
//! - **Branches**: Named heads; a new branch starts at its parent's head
//! - **Registry**: Document id to path, current branch and branch table
//! - **Mirror**: The user-visible file, rewritten when `main` is saved
//! - **Autosave**: Debounced saves that never land on a switched branch
//!
//! ## Example
//!
//! ```ignore
//! use folio::{JsonTreeCodec, StoreConfig, VersionStore};
//!
//! let store = VersionStore::open_or_create(StoreConfig::at("./.folio"), JsonTreeCodec)?;
//!
//! // Put a file under version control
//! let doc = store.initialize_document("notes.md")?;
//!
//! // Branch off and save there
//! store.create_branch(&doc.id, "rewrite")?;
//! store.switch_branch(&doc.id, "rewrite")?;
//! store.save_version(&doc.id, &serde_json::json!({ "type": "doc", "content": [] }))?;
//!
//! // Bring it back
//! store.switch_branch(&doc.id, "main")?;
//! store.merge_branch(&doc.id, "rewrite", "main")?;
//! store.sync_mirror(&doc.id)?;
//! ```

pub mod autosave;
pub mod branches;
pub mod codec;
pub mod config;
pub mod durable;
pub mod error;
pub mod registry;
pub mod snapshots;
pub mod store;
pub mod types;

// Re-exports
pub use autosave::{AutosaveEvent, AutosaveScheduler};
pub use branches::{validate_branch_name, BranchTable, MAIN_BRANCH};
pub use codec::{ContentCodec, JsonTreeCodec, PlainTextCodec};
pub use config::{AutosaveConfig, StoreConfig};
pub use error::{ErrorKind, Result, StoreError};
pub use registry::{DocumentRegistry, DocumentUpdate};
pub use snapshots::SnapshotStore;
pub use store::VersionStore;
pub use types::*;
