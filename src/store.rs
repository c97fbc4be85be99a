//! Main VersionStore struct tying all components together.

use crate::branches::MAIN_BRANCH;
use crate::codec::ContentCodec;
use crate::config::StoreConfig;
use crate::durable::write_atomic;
use crate::error::{Result, StoreError};
use crate::registry::{DocumentRegistry, DocumentUpdate};
use crate::snapshots::SnapshotStore;
use crate::types::{
    BranchInfo, BranchRelation, Document, DocumentId, DocumentSummary, MergeOutcome, MirrorSync,
    SaveReceipt, Snapshot, Timestamp, VersionId,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FOL\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Directory holding one sub-directory per document.
const DOCUMENTS_DIR: &str = "documents";

/// The document version store.
///
/// Provides a unified interface for:
/// - Putting files under version control
/// - Saving and loading snapshots on the current branch
/// - Creating, switching, deleting, renaming and merging branches
/// - Keeping the mirror file in step with `main`
///
/// Mutating calls on one document are serialized; calls on different
/// documents proceed independently.
pub struct VersionStore<C: ContentCodec> {
    /// Store configuration.
    config: StoreConfig,

    codec: C,

    /// Lock file for exclusive access.
    _lock_file: File,

    registry: DocumentRegistry,

    snapshots: SnapshotStore,

    /// Per-document write locks.
    document_locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl<C: ContentCodec> VersionStore<C> {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig, codec: C) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config, codec)
        } else if config.create_if_missing {
            Self::create(config, codec)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig, codec: C) -> Result<Self> {
        // Create directory structure
        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join(DOCUMENTS_DIR))?;

        // Acquire lock
        let lock_file = Self::acquire_lock(&config.path)?;

        // Write manifest and tunables
        Self::write_manifest(&config.path)?;
        config.persist(&config.path)?;

        let registry = DocumentRegistry::open(config.path.join(DOCUMENTS_DIR))?;
        let snapshots =
            SnapshotStore::new(config.path.join(DOCUMENTS_DIR), config.snapshot_cache_size)?;

        info!(path = %config.path.display(), "version store created");

        Ok(Self {
            config,
            codec,
            _lock_file: lock_file,
            registry,
            snapshots,
            document_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig, codec: C) -> Result<Self> {
        // Verify manifest
        Self::verify_manifest(&config.path)?;

        // Acquire lock
        let lock_file = Self::acquire_lock(&config.path)?;

        let root = config.path.clone();
        let config = config.merge_from_root(&root)?;

        let registry = DocumentRegistry::open(root.join(DOCUMENTS_DIR))?;
        let snapshots = SnapshotStore::new(root.join(DOCUMENTS_DIR), config.snapshot_cache_size)?;

        let corrupt = registry.corrupt_documents().len();
        if corrupt > 0 {
            warn!(corrupt, "some documents could not be loaded");
        }
        info!(path = %root.display(), documents = registry.list().len(), "version store opened");

        Ok(Self {
            config,
            codec,
            _lock_file: lock_file,
            registry,
            snapshots,
            document_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The codec documents pass through.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn document_lock(&self, id: &DocumentId) -> Arc<Mutex<()>> {
        Arc::clone(self.document_locks.lock().entry(*id).or_default())
    }

    // --- Documents ---

    /// Put the file at `path` under version control, or return its
    /// existing record.
    ///
    /// A new document's first snapshot on `main` holds the file's current
    /// text, or the codec's empty document if the file doesn't exist yet.
    /// If writing that snapshot fails the new record is removed again. A
    /// record left without a first snapshot, by a crash between the two
    /// writes, gets it on the next call.
    ///
    /// Documents are found by path through their records, so a document
    /// whose record is corrupt is not found here and a second document is
    /// registered for the same path. [`corrupt_documents`] lists the
    /// unreadable records; deleting the old id clears it.
    ///
    /// [`corrupt_documents`]: VersionStore::corrupt_documents
    pub fn initialize_document(&self, path: impl AsRef<Path>) -> Result<Document> {
        let path = path.as_ref();

        if let Some(document) = self.registry.get_document_by_path(path)? {
            self.verify_heads(&document)?;
            if document.branches.head(MAIN_BRANCH)?.is_some() {
                return Ok(document);
            }
            warn!(document = %document.id, "document has no first snapshot, writing it now");
            return self.write_first_snapshot(&document.id);
        }

        let document = match self.registry.create_document(path) {
            Ok(document) => document,
            Err(StoreError::DocumentExists(existing)) => {
                // Lost a race with another initializer. Waits for its first
                // snapshot, or writes it if that initializer gave up.
                let document = self
                    .registry
                    .get_document_by_path(&existing)?
                    .ok_or(StoreError::PathNotRegistered(existing))?;
                return self.write_first_snapshot(&document.id);
            }
            Err(e) => return Err(e),
        };

        match self.write_first_snapshot(&document.id) {
            Ok(document) => {
                info!(
                    document = %document.id,
                    path = %document.path.display(),
                    "document initialized"
                );
                Ok(document)
            }
            Err(e) => {
                if let Err(cleanup) = self.delete_document(&document.id) {
                    warn!(
                        document = %document.id,
                        error = %cleanup,
                        "failed to remove partially initialized document"
                    );
                }
                Err(e)
            }
        }
    }

    /// Store the mirror's current content as the first snapshot on `main`,
    /// unless `main` already has a head.
    fn write_first_snapshot(&self, id: &DocumentId) -> Result<Document> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let document = self.registry.get_document(id)?;
        if document.branches.head(MAIN_BRANCH)?.is_some() {
            return Ok(document);
        }

        let initial = if document.path.is_file() {
            let text = fs::read_to_string(&document.path)?;
            self.codec.from_mirror_text(&text)?
        } else {
            self.codec.empty_document()
        };
        let blob = self.codec.encode(&initial)?;

        let version = self
            .snapshots
            .save_snapshot(id, MAIN_BRANCH, &blob, None)?;
        let (document, ()) = self.registry.modify(id, |doc| {
            doc.branches
                .advance_head(MAIN_BRANCH, version, Timestamp::now())
        })?;
        debug!(document = %id, version = %version, "first snapshot written");
        Ok(document)
    }

    /// Every branch head must resolve to a stored snapshot.
    fn verify_heads(&self, document: &Document) -> Result<()> {
        for (name, info) in document.branches.iter() {
            if let Some(head) = info.head {
                if !self.snapshots.contains(&document.id, &head)? {
                    return Err(StoreError::Corruption(format!(
                        "document {}: head {} of branch {:?} is missing",
                        document.id, head, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get a document record.
    pub fn get_document(&self, id: &DocumentId) -> Result<Document> {
        self.registry.get_document(id)
    }

    /// Find the document mirrored at `path`.
    pub fn find_document(&self, path: impl AsRef<Path>) -> Result<Option<Document>> {
        self.registry.get_document_by_path(path)
    }

    /// Summaries of all loadable documents.
    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        self.registry.list()
    }

    /// Documents whose record failed to load, with the reason.
    pub fn corrupt_documents(&self) -> Vec<(DocumentId, String)> {
        self.registry.corrupt_documents()
    }

    /// Point the document at a new mirror path. Branches and snapshots are
    /// untouched.
    pub fn update_document_path(
        &self,
        id: &DocumentId,
        new_path: impl AsRef<Path>,
    ) -> Result<Document> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let document = self.registry.update_document(
            id,
            DocumentUpdate {
                path: Some(new_path.as_ref().to_path_buf()),
                ..Default::default()
            },
        )?;
        info!(document = %id, path = %document.path.display(), "document path updated");
        Ok(document)
    }

    /// Remove a document's record and all of its snapshots.
    ///
    /// This is also how a corrupt document is cleared.
    pub fn delete_document(&self, id: &DocumentId) -> Result<()> {
        let lock = self.document_lock(id);
        {
            let _guard = lock.lock();
            self.registry.delete_document(id)?;
            self.snapshots.delete_document(id)?;
        }
        self.document_locks.lock().remove(id);
        Ok(())
    }

    // --- Versions ---

    /// Save `content` as a new snapshot on the current branch.
    pub fn save_version(&self, id: &DocumentId, content: &C::Document) -> Result<SaveReceipt> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let document = self.registry.get_document(id)?;
        let branch = document.current_branch.clone();
        self.commit(&document, &branch, content)
    }

    /// Save `content` only if `branch` is still the current branch.
    ///
    /// Fails with [`StoreError::StaleBranch`] otherwise, leaving the store
    /// unchanged.
    pub fn save_version_on(
        &self,
        id: &DocumentId,
        branch: &str,
        content: &C::Document,
    ) -> Result<SaveReceipt> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let document = self.registry.get_document(id)?;
        if document.current_branch != branch {
            return Err(StoreError::StaleBranch {
                expected: branch.to_string(),
                actual: document.current_branch,
            });
        }
        self.commit(&document, branch, content)
    }

    /// Write the snapshot, advance the head, then mirror. Caller holds the
    /// document lock.
    fn commit(&self, document: &Document, branch: &str, content: &C::Document) -> Result<SaveReceipt> {
        let blob = self.codec.encode(content)?;
        let parent = document.branches.head(branch)?;

        let version = self
            .snapshots
            .save_snapshot(&document.id, branch, &blob, parent)?;

        let (document, ()) = self.registry.modify(&document.id, |doc| {
            doc.branches.advance_head(branch, version, Timestamp::now())
        })?;

        if let Some(parent) = parent {
            if let Err(e) = self.snapshots.retire(&document.id, branch, &parent) {
                warn!(
                    document = %document.id,
                    version = %parent,
                    error = %e,
                    "could not move superseded snapshot to history"
                );
            }
        }

        let mirror = if branch == MAIN_BRANCH && self.config.mirror_sync {
            match self.write_mirror(&document.path, content) {
                Ok(()) => MirrorSync::Written(document.path.clone()),
                Err(e) => {
                    warn!(
                        document = %document.id,
                        path = %document.path.display(),
                        error = %e,
                        "mirror write failed; version is saved"
                    );
                    MirrorSync::Failed(e.to_string())
                }
            }
        } else {
            MirrorSync::Skipped
        };

        debug!(document = %document.id, branch, version = %version, "version saved");

        Ok(SaveReceipt {
            version,
            branch: branch.to_string(),
            mirror,
        })
    }

    fn write_mirror(&self, path: &Path, content: &C::Document) -> Result<()> {
        let text = self.codec.to_mirror_text(content)?;
        write_atomic(path, text.as_bytes())?;
        Ok(())
    }

    /// Rewrite the mirror file from `main`'s head.
    pub fn sync_mirror(&self, id: &DocumentId) -> Result<PathBuf> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let document = self.registry.get_document(id)?;
        let content = self.load_head(&document, MAIN_BRANCH)?;
        self.write_mirror(&document.path, &content)?;

        debug!(document = %id, path = %document.path.display(), "mirror synced");
        Ok(document.path)
    }

    /// Content of `branch`'s head, or the empty document if it has none.
    pub fn load_document(&self, id: &DocumentId, branch: &str) -> Result<C::Document> {
        let document = self.registry.get_document(id)?;
        self.load_head(&document, branch)
    }

    fn load_head(&self, document: &Document, branch: &str) -> Result<C::Document> {
        match document.branches.head(branch)? {
            Some(head) => {
                let snapshot = self
                    .snapshots
                    .load_snapshot(&document.id, &head)?
                    .ok_or(StoreError::SnapshotNotFound(head))?;
                self.codec.decode(&snapshot.content)
            }
            None => Ok(self.codec.empty_document()),
        }
    }

    /// Load a single snapshot.
    pub fn get_snapshot(&self, id: &DocumentId, version: &VersionId) -> Result<Snapshot> {
        self.registry.get_document(id)?;
        self.snapshots
            .load_snapshot(id, version)?
            .ok_or(StoreError::SnapshotNotFound(*version))
    }

    /// Snapshots reachable from `branch`'s head, newest first.
    pub fn history(&self, id: &DocumentId, branch: &str) -> Result<Vec<Snapshot>> {
        let document = self.registry.get_document(id)?;
        match document.branches.head(branch)? {
            Some(head) => self.snapshots.load_history(id, &head),
            None => Ok(Vec::new()),
        }
    }

    // --- Branches ---

    /// Create `name` from the current branch's head.
    pub fn create_branch(&self, id: &DocumentId, name: &str) -> Result<BranchInfo> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let (document, info) = self.registry.modify(id, |doc| {
            let from = doc.current_branch.clone();
            doc.branches.create(name, &from, Timestamp::now()).cloned()
        })?;

        info!(
            document = %id,
            branch = name,
            from = info.parent.as_deref().unwrap_or(MAIN_BRANCH),
            branches = document.branches.len(),
            "branch created"
        );
        Ok(info)
    }

    /// Make `name` the current branch.
    ///
    /// Pending edits are not saved; callers save first.
    pub fn switch_branch(&self, id: &DocumentId, name: &str) -> Result<()> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        self.registry.modify(id, |doc| {
            if !doc.branches.contains(name) {
                return Err(StoreError::BranchNotFound(name.to_string()));
            }
            doc.current_branch = name.to_string();
            Ok(())
        })?;

        info!(document = %id, branch = name, "switched branch");
        Ok(())
    }

    /// Remove a branch entry. Its snapshots remain on disk.
    pub fn delete_branch(&self, id: &DocumentId, name: &str) -> Result<()> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        self.registry.modify(id, |doc| {
            let current = doc.current_branch.clone();
            doc.branches.delete(name, &current)
        })?;

        info!(document = %id, branch = name, "branch deleted");
        Ok(())
    }

    /// Rename a branch, following it if it is the current one.
    pub fn rename_branch(&self, id: &DocumentId, old: &str, new: &str) -> Result<()> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        self.registry.modify(id, |doc| {
            doc.branches.rename(old, new, Timestamp::now())?;
            if doc.current_branch == old {
                doc.current_branch = new.to_string();
            }
            Ok(())
        })?;

        info!(document = %id, from = old, to = new, "branch renamed");
        Ok(())
    }

    /// Fast-forward `target`'s head to `source`'s head.
    ///
    /// No content merge happens. Snapshots only reachable from the old
    /// target head stop being part of its history; the outcome reports
    /// whether that happened.
    pub fn merge_branch(&self, id: &DocumentId, source: &str, target: &str) -> Result<MergeOutcome> {
        let lock = self.document_lock(id);
        let _guard = lock.lock();

        let document = self.registry.get_document(id)?;
        let relation = self.relation(&document, source, target)?;
        let discarded_target_changes = matches!(
            relation,
            BranchRelation::Behind(_) | BranchRelation::Diverged { .. }
        );

        if discarded_target_changes {
            warn!(
                document = %id,
                source,
                target,
                relation = ?relation,
                "fast-forward merge discards changes only on the target branch"
            );
        }

        let (_, (previous_head, new_head)) = self.registry.modify(id, |doc| {
            doc.branches.fast_forward(source, target, Timestamp::now())
        })?;

        info!(document = %id, source, target, "branches merged");

        Ok(MergeOutcome {
            previous_head,
            new_head,
            discarded_target_changes,
        })
    }

    /// How `a`'s history relates to `b`'s.
    pub fn compare_branches(&self, id: &DocumentId, a: &str, b: &str) -> Result<BranchRelation> {
        let document = self.registry.get_document(id)?;
        self.relation(&document, a, b)
    }

    fn relation(&self, document: &Document, a: &str, b: &str) -> Result<BranchRelation> {
        let a_chain = self.chain(document, a)?;
        let b_chain = self.chain(document, b)?;

        let a_set: HashSet<_> = a_chain.iter().collect();
        let b_set: HashSet<_> = b_chain.iter().collect();

        let ahead = a_chain.iter().filter(|v| !b_set.contains(v)).count();
        let behind = b_chain.iter().filter(|v| !a_set.contains(v)).count();

        Ok(match (ahead, behind) {
            (0, 0) => BranchRelation::Identical,
            (n, 0) => BranchRelation::Ahead(n),
            (0, n) => BranchRelation::Behind(n),
            (ahead, behind) => BranchRelation::Diverged { ahead, behind },
        })
    }

    fn chain(&self, document: &Document, branch: &str) -> Result<Vec<VersionId>> {
        match document.branches.head(branch)? {
            Some(head) => Ok(self
                .snapshots
                .load_history(&document.id, &head)?
                .into_iter()
                .map(|s| s.id)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Branch names, `main` first.
    pub fn get_branches(&self, id: &DocumentId) -> Result<Vec<String>> {
        Ok(self.registry.get_document(id)?.branches.names())
    }

    /// Name of the current branch.
    pub fn get_current_branch(&self, id: &DocumentId) -> Result<String> {
        Ok(self.registry.get_document(id)?.current_branch)
    }

    /// Branch lineage from `branch` back to its root.
    pub fn branch_ancestry(&self, id: &DocumentId, branch: &str) -> Result<Vec<String>> {
        self.registry.get_document(id)?.branches.ancestry(branch)
    }

    /// Next unused `branch-N` name.
    pub fn next_branch_name(&self, id: &DocumentId) -> Result<String> {
        Ok(self.registry.get_document(id)?.branches.next_branch_name())
    }

    // --- Internal ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(StoreError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}
