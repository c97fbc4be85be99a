//! Error types for the version store.

use crate::types::{DocumentId, Hash, VersionId};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for version store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("No document registered for path: {0}")]
    PathNotRegistered(PathBuf),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(VersionId),

    #[error("Document already registered for path: {0}")]
    DocumentExists(PathBuf),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Branch is protected: {0}")]
    ProtectedBranch(String),

    #[error("Cannot modify the current branch: {0}")]
    BranchInUse(String),

    #[error("Invalid branch name: {0:?}")]
    InvalidBranchName(String),

    #[error("Current branch is {actual}, not {expected}")]
    StaleBranch { expected: String, actual: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Content codec error: {0}")]
    Codec(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: Hash, got: Hash },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Autosave scheduler has stopped")]
    SchedulerStopped,
}

/// Coarse classification of a [`StoreError`].
///
/// `NotFound`, `AlreadyExists`, `Protected`, `BranchInUse` and
/// `InvalidInput` are expected conditions meant for the user; `StorageIo`
/// and `Corrupt` mean the disk disagreed with us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Protected,
    BranchInUse,
    InvalidInput,
    StorageIo,
    Corrupt,
    Unavailable,
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::DocumentNotFound(_)
            | StoreError::PathNotRegistered(_)
            | StoreError::BranchNotFound(_)
            | StoreError::SnapshotNotFound(_) => ErrorKind::NotFound,
            StoreError::DocumentExists(_) | StoreError::BranchExists(_) => {
                ErrorKind::AlreadyExists
            }
            StoreError::ProtectedBranch(_) => ErrorKind::Protected,
            StoreError::BranchInUse(_) => ErrorKind::BranchInUse,
            StoreError::InvalidBranchName(_)
            | StoreError::StaleBranch { .. }
            | StoreError::Codec(_) => ErrorKind::InvalidInput,
            StoreError::Io(_) | StoreError::Serialization(_) => ErrorKind::StorageIo,
            StoreError::Deserialization(_)
            | StoreError::Corruption(_)
            | StoreError::ChecksumMismatch { .. }
            | StoreError::HashMismatch { .. }
            | StoreError::InvalidFormat(_) => ErrorKind::Corrupt,
            StoreError::Locked | StoreError::NotInitialized | StoreError::SchedulerStopped => {
                ErrorKind::Unavailable
            }
        }
    }

    /// Whether the caller should show this to the user rather than treat it
    /// as a storage failure.
    pub fn is_expected(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound
                | ErrorKind::AlreadyExists
                | ErrorKind::Protected
                | ErrorKind::BranchInUse
                | ErrorKind::InvalidInput
        )
    }
}

// For reads. Writes go through `durable::write_json_atomic`.
impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            StoreError::Serialization(e.to_string())
        } else {
            StoreError::Deserialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
