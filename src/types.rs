//! Core types for the version store.

use crate::branches::BranchTable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable identifier for a versioned document.
///
/// Assigned once when the document is first put under version control and
/// never changes, even when the mirrored file is renamed or moved.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        DocumentId(Uuid::new_v4())
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DocumentId(Uuid::parse_str(s)?))
    }
}

/// Identifier of a single snapshot. Unique across the whole store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub Uuid);

impl VersionId {
    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        VersionId(Uuid::new_v4())
    }

    /// File stem used for this snapshot on disk.
    pub fn file_stem(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({})", &self.file_stem()[..8])
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

impl FromStr for VersionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(VersionId(Uuid::parse_str(s)?))
    }
}

/// Content hash for snapshot payloads (SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Per-branch entry of a document's branch table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Newest snapshot on this branch, `None` until the first save.
    pub head: Option<VersionId>,

    /// When the branch was created.
    pub created: Timestamp,

    /// Last time the head moved or the entry changed.
    pub last_modified: Timestamp,

    /// Branch this one was created from (`None` for `main`).
    #[serde(default)]
    pub parent: Option<String>,

    /// Head of `parent` at creation time.
    #[serde(default)]
    pub branch_point: Option<VersionId>,
}

impl BranchInfo {
    /// A root branch with no snapshot yet.
    pub fn root(now: Timestamp) -> Self {
        Self {
            head: None,
            created: now,
            last_modified: now,
            parent: None,
            branch_point: None,
        }
    }
}

/// A versioned document as recorded in the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,

    /// Location of the mirrored plain-text file.
    pub path: PathBuf,

    /// Branch the editor is viewing. Always a key of `branches`.
    pub current_branch: String,

    pub created: Timestamp,
    pub last_modified: Timestamp,

    pub branches: BranchTable,
}

impl Document {
    /// Head of the current branch.
    pub fn current_head(&self) -> Option<VersionId> {
        self.branches
            .get(&self.current_branch)
            .and_then(|info| info.head)
    }

    /// Lightweight listing view.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            path: self.path.clone(),
            current_branch: self.current_branch.clone(),
            branches: self.branches.names(),
            created: self.created,
            last_modified: self.last_modified,
        }
    }
}

/// Listing view of a document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub path: PathBuf,
    pub current_branch: String,
    pub branches: Vec<String>,
    pub created: Timestamp,
    pub last_modified: Timestamp,
}

/// An immutable point-in-time save of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: VersionId,
    pub document: DocumentId,

    /// Snapshot this one was saved on top of.
    pub parent: Option<VersionId>,

    /// Branch the snapshot was created on. Not rewritten on rename.
    pub branch: String,

    pub timestamp: Timestamp,

    /// Opaque encoded document (see [`crate::codec::ContentCodec`]).
    pub content: Vec<u8>,

    pub content_hash: Hash,
}

/// What happened to the mirror file during a save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorSync {
    /// Not on `main`, or mirroring disabled.
    Skipped,
    /// Mirror file rewritten.
    Written(PathBuf),
    /// Mirror write failed; the snapshot is still committed.
    Failed(String),
}

/// Result of a successful save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveReceipt {
    pub version: VersionId,
    pub branch: String,
    pub mirror: MirrorSync,
}

/// Result of a fast-forward merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub previous_head: Option<VersionId>,
    pub new_head: Option<VersionId>,

    /// The target had snapshots the source did not contain; they are no
    /// longer reachable from the target's head.
    pub discarded_target_changes: bool,
}

/// How two branches' histories relate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchRelation {
    Identical,
    /// First branch has `n` snapshots the second lacks.
    Ahead(usize),
    /// Second branch has `n` snapshots the first lacks.
    Behind(usize),
    Diverged { ahead: usize, behind: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let hash = Hash::from_bytes(b"hello world");
        let parsed = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_version_id_parses_file_stem() {
        let id = VersionId::generate();
        let stem = id.file_stem();
        assert_eq!(stem.len(), 32);
        assert_eq!(stem.parse::<VersionId>().unwrap(), id);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(VersionId::generate(), VersionId::generate());
        assert_ne!(DocumentId::generate(), DocumentId::generate());
    }

    #[test]
    fn test_timestamp_monotonic_enough() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
    }
}
