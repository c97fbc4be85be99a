//! Snapshot storage implementation.

use crate::branches::validate_branch_name;
use crate::durable::{sync_dir, write_atomic};
use crate::error::{Result, StoreError};
use crate::types::{DocumentId, Hash, Snapshot, Timestamp, VersionId};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Extension of snapshot files.
const SNAPSHOT_EXT: &str = "snap";

/// Lookups retried when a located file disappears before it is opened.
const LOCATE_ATTEMPTS: usize = 3;

/// Upper bound on an encoded header; anything larger is garbage.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Per-document directory holding one sub-directory per branch.
pub const VERSIONS_DIR: &str = "versions";

/// Per-branch directory for superseded snapshots.
pub const HISTORY_DIR: &str = "history";

/// Snapshot metadata stored ahead of the content.
#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    id: VersionId,
    document: DocumentId,
    parent: Option<VersionId>,
    branch: String,
    timestamp: Timestamp,
    content_hash: Hash,
}

type SnapshotKey = (DocumentId, VersionId);

/// Write-once storage of document snapshots.
///
/// Each snapshot is a single file filed under the branch it was created on.
/// Files are never rewritten; superseding a branch head only moves the old
/// head's file into that branch's `history/` directory.
pub struct SnapshotStore {
    /// Root directory holding one directory per document.
    path: PathBuf,

    /// LRU cache for recently loaded snapshots.
    cache: Mutex<LruCache<SnapshotKey, Snapshot>>,

    /// Where each known snapshot currently lives.
    locations: RwLock<HashMap<SnapshotKey, PathBuf>>,
}

impl SnapshotStore {
    /// Create snapshot storage rooted at `path`.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            locations: RwLock::new(HashMap::new()),
        })
    }

    /// Directory owned by one document.
    pub fn document_dir(&self, document: &DocumentId) -> PathBuf {
        self.path.join(document.to_string())
    }

    fn versions_dir(&self, document: &DocumentId) -> PathBuf {
        self.document_dir(document).join(VERSIONS_DIR)
    }

    fn branch_dir(&self, document: &DocumentId, branch: &str) -> PathBuf {
        self.versions_dir(document).join(branch)
    }

    fn file_name(version: &VersionId) -> String {
        format!("{}.{}", version.file_stem(), SNAPSHOT_EXT)
    }

    /// Write a new snapshot and return its id.
    pub fn save_snapshot(
        &self,
        document: &DocumentId,
        branch: &str,
        content: &[u8],
        parent: Option<VersionId>,
    ) -> Result<VersionId> {
        validate_branch_name(branch)?;

        let branch_dir = self.branch_dir(document, branch);
        fs::create_dir_all(branch_dir.join(HISTORY_DIR))?;

        let mut id = VersionId::generate();
        while branch_dir.join(Self::file_name(&id)).exists() {
            id = VersionId::generate();
        }

        let snapshot = Snapshot {
            id,
            document: *document,
            parent,
            branch: branch.to_string(),
            timestamp: Timestamp::now(),
            content: content.to_vec(),
            content_hash: Hash::from_bytes(content),
        };

        let path = branch_dir.join(Self::file_name(&id));
        write_atomic(&path, &Self::encode(&snapshot)?)?;

        debug!(
            document = %document,
            branch,
            version = %id,
            bytes = content.len(),
            "snapshot written"
        );

        self.locations.write().insert((*document, id), path);
        self.cache.lock().put((*document, id), snapshot);

        Ok(id)
    }

    /// Move `version` into `branch`'s history directory if it is currently
    /// filed at the top of that branch's directory.
    ///
    /// Returns whether anything moved.
    pub fn retire(&self, document: &DocumentId, branch: &str, version: &VersionId) -> Result<bool> {
        let branch_dir = self.branch_dir(document, branch);
        let current = branch_dir.join(Self::file_name(version));
        if !current.exists() {
            return Ok(false);
        }

        let history_dir = branch_dir.join(HISTORY_DIR);
        fs::create_dir_all(&history_dir)?;
        let retired = history_dir.join(Self::file_name(version));

        fs::rename(&current, &retired)?;
        sync_dir(&branch_dir)?;
        sync_dir(&history_dir)?;

        self.locations.write().insert((*document, *version), retired);
        Ok(true)
    }

    /// Load a snapshot by id.
    pub fn load_snapshot(
        &self,
        document: &DocumentId,
        version: &VersionId,
    ) -> Result<Option<Snapshot>> {
        let key = (*document, *version);

        // Check cache first
        if let Some(cached) = self.cache.lock().get(&key).cloned() {
            return Ok(Some(cached));
        }

        // A snapshot can move into history/ between locate and open; look
        // it up again rather than report it missing.
        for _ in 0..LOCATE_ATTEMPTS {
            let path = match self.locate(document, version)? {
                Some(path) => path,
                None => return Ok(None),
            };

            let snapshot = match Self::read_file(&path) {
                Ok(snapshot) => snapshot,
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    self.locations.write().remove(&key);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if snapshot.id != *version || snapshot.document != *document {
                return Err(StoreError::Corruption(format!(
                    "{} holds snapshot {} of document {}",
                    path.display(),
                    snapshot.id,
                    snapshot.document
                )));
            }

            self.cache.lock().put(key, snapshot.clone());
            return Ok(Some(snapshot));
        }

        Ok(None)
    }

    /// Whether a snapshot exists.
    pub fn contains(&self, document: &DocumentId, version: &VersionId) -> Result<bool> {
        if self.cache.lock().contains(&(*document, *version)) {
            return Ok(true);
        }
        Ok(self.locate(document, version)?.is_some())
    }

    /// Walk parent pointers from `from`, newest first.
    ///
    /// A missing or unreadable ancestor ends the walk early; the chain up to
    /// that point is returned.
    pub fn load_history(&self, document: &DocumentId, from: &VersionId) -> Result<Vec<Snapshot>> {
        let head = self
            .load_snapshot(document, from)?
            .ok_or(StoreError::SnapshotNotFound(*from))?;

        let mut seen = HashSet::new();
        seen.insert(head.id);
        let mut next = head.parent;
        let mut history = vec![head];

        while let Some(parent) = next {
            if !seen.insert(parent) {
                warn!(document = %document, version = %parent, "cycle in snapshot chain");
                break;
            }
            match self.load_snapshot(document, &parent) {
                Ok(Some(snapshot)) => {
                    next = snapshot.parent;
                    history.push(snapshot);
                }
                Ok(None) => {
                    warn!(
                        document = %document,
                        version = %parent,
                        "history truncated: parent snapshot missing"
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        document = %document,
                        version = %parent,
                        error = %e,
                        "history truncated: parent snapshot unreadable"
                    );
                    break;
                }
            }
        }

        Ok(history)
    }

    /// All snapshot ids stored for a document, in no particular order.
    pub fn list_versions(&self, document: &DocumentId) -> Result<Vec<VersionId>> {
        let mut versions = Vec::new();
        let versions_dir = self.versions_dir(document);
        if !versions_dir.exists() {
            return Ok(versions);
        }

        for entry in fs::read_dir(&versions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            Self::collect_versions(&entry.path(), &mut versions)?;
            let history = entry.path().join(HISTORY_DIR);
            if history.is_dir() {
                Self::collect_versions(&history, &mut versions)?;
            }
        }

        Ok(versions)
    }

    /// Remove every snapshot of a document.
    pub fn delete_document(&self, document: &DocumentId) -> Result<()> {
        self.locations.write().retain(|(doc, _), _| doc != document);
        {
            let mut cache = self.cache.lock();
            let keys: Vec<SnapshotKey> = cache
                .iter()
                .filter(|((doc, _), _)| doc == document)
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                cache.pop(&key);
            }
        }

        let versions_dir = self.versions_dir(document);
        if versions_dir.exists() {
            fs::remove_dir_all(&versions_dir)?;
        }
        Ok(())
    }

    /// Find the file holding `version`, scanning branch directories on a
    /// location-cache miss.
    fn locate(&self, document: &DocumentId, version: &VersionId) -> Result<Option<PathBuf>> {
        let key = (*document, *version);
        if let Some(path) = self.locations.read().get(&key) {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
        }

        let versions_dir = self.versions_dir(document);
        if !versions_dir.exists() {
            return Ok(None);
        }

        let name = Self::file_name(version);
        for entry in fs::read_dir(&versions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let branch_dir = entry.path();
            for candidate in [
                branch_dir.join(&name),
                branch_dir.join(HISTORY_DIR).join(&name),
            ] {
                if candidate.is_file() {
                    self.locations.write().insert(key, candidate.clone());
                    return Ok(Some(candidate));
                }
            }
        }

        self.locations.write().remove(&key);
        Ok(None)
    }

    fn collect_versions(dir: &Path, out: &mut Vec<VersionId>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<VersionId>().ok())
            {
                out.push(id);
            }
        }
        Ok(())
    }

    fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
        let header = rmp_serde::to_vec_named(&SnapshotHeader {
            id: snapshot.id,
            document: snapshot.document,
            parent: snapshot.parent,
            branch: snapshot.branch.clone(),
            timestamp: snapshot.timestamp,
            content_hash: snapshot.content_hash,
        })?;

        let mut bytes = Vec::with_capacity(4 + 1 + 4 + header.len() + 8 + snapshot.content.len() + 4);

        // Header
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);

        // Content
        bytes.extend_from_slice(&(snapshot.content.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&snapshot.content);

        // Checksum
        bytes.extend_from_slice(&crc32fast::hash(&snapshot.content).to_le_bytes());

        Ok(bytes)
    }

    fn read_file(path: &Path) -> Result<Snapshot> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        Self::decode(&mut reader, file_len).map_err(|e| match e {
            StoreError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                StoreError::Corruption(format!("{} is truncated", path.display()))
            }
            other => other,
        })
    }

    fn decode(reader: &mut impl Read, file_len: u64) -> Result<Snapshot> {
        // Read and verify magic
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
        }

        // Read version
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        // Read header
        let mut header_len_bytes = [0u8; 4];
        reader.read_exact(&mut header_len_bytes)?;
        let header_len = u32::from_le_bytes(header_len_bytes) as usize;
        if header_len > MAX_HEADER_LEN || header_len as u64 > file_len {
            return Err(StoreError::Corruption(format!(
                "snapshot header length {} out of range",
                header_len
            )));
        }

        let mut header_bytes = vec![0u8; header_len];
        reader.read_exact(&mut header_bytes)?;
        let header: SnapshotHeader = rmp_serde::from_slice(&header_bytes)?;

        // Read content
        let mut content_len_bytes = [0u8; 8];
        reader.read_exact(&mut content_len_bytes)?;
        let content_len = u64::from_le_bytes(content_len_bytes);
        if content_len > file_len {
            return Err(StoreError::Corruption(format!(
                "snapshot content length {} exceeds file size {}",
                content_len, file_len
            )));
        }

        let mut content = vec![0u8; content_len as usize];
        reader.read_exact(&mut content)?;

        // Read and verify checksum
        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&content);

        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        // Verify hash
        let computed_hash = Hash::from_bytes(&content);
        if computed_hash != header.content_hash {
            return Err(StoreError::HashMismatch {
                expected: header.content_hash,
                got: computed_hash,
            });
        }

        Ok(Snapshot {
            id: header.id,
            document: header.document,
            parent: header.parent,
            branch: header.branch,
            timestamp: header.timestamp,
            content,
            content_hash: computed_hash,
        })
    }
}
