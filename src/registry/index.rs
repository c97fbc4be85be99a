//! Document registry backed by one `index.json` per document.

use crate::branches::{BranchTable, MAIN_BRANCH};
use crate::durable::write_json_atomic;
use crate::error::{Result, StoreError};
use crate::types::{Document, DocumentId, DocumentSummary, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the per-document record file.
pub const INDEX_FILE: &str = "index.json";

/// Partial update applied by [`DocumentRegistry::update_document`].
///
/// `None` fields are left as they are.
#[derive(Clone, Debug, Default)]
pub struct DocumentUpdate {
    pub path: Option<PathBuf>,
    pub current_branch: Option<String>,
    pub branches: Option<BranchTable>,
}

#[derive(Default)]
struct RegistryState {
    documents: HashMap<DocumentId, Document>,
    by_path: HashMap<PathBuf, DocumentId>,
    /// Documents whose record failed to load, with the reason.
    corrupt: HashMap<DocumentId, String>,
}

impl RegistryState {
    fn document(&self, id: &DocumentId) -> Result<&Document> {
        if let Some(reason) = self.corrupt.get(id) {
            return Err(StoreError::Corruption(format!("document {}: {}", id, reason)));
        }
        self.documents
            .get(id)
            .ok_or(StoreError::DocumentNotFound(*id))
    }
}

/// Maps document ids to their records and mirror paths to ids.
///
/// Every mutation writes the complete record to disk before the in-memory
/// view changes, so a failed call leaves both untouched.
pub struct DocumentRegistry {
    root: PathBuf,
    state: RwLock<RegistryState>,
}

impl DocumentRegistry {
    /// Load every document record under `root`.
    ///
    /// A record that cannot be parsed marks only that document as corrupt.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut state = RegistryState::default();

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let dir = entry.path();
            let id = match entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<DocumentId>().ok())
            {
                Some(id) => id,
                None => {
                    warn!(dir = %dir.display(), "ignoring unrecognised directory in registry");
                    continue;
                }
            };

            let index = dir.join(INDEX_FILE);
            if !index.exists() {
                warn!(document = %id, "document directory has no index record; ignoring");
                continue;
            }

            match Self::read_record(&index, &id) {
                Ok(document) => {
                    state.by_path.insert(document.path.clone(), id);
                    state.documents.insert(id, document);
                }
                Err(e) => {
                    warn!(document = %id, error = %e, "document record is corrupt");
                    state.corrupt.insert(id, e.to_string());
                }
            }
        }

        debug!(
            documents = state.documents.len(),
            corrupt = state.corrupt.len(),
            "registry loaded"
        );

        Ok(Self {
            root,
            state: RwLock::new(state),
        })
    }

    fn read_record(index: &Path, id: &DocumentId) -> Result<Document> {
        let data = fs::read(index)?;
        let document: Document = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Corruption(format!("{}: {}", index.display(), e)))?;

        if document.id != *id {
            return Err(StoreError::Corruption(format!(
                "{} records document {}",
                index.display(),
                document.id
            )));
        }
        document.branches.validate(&document.current_branch)?;
        Ok(document)
    }

    /// Directory owned by a document.
    pub fn document_dir(&self, id: &DocumentId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn persist(&self, document: &Document) -> Result<()> {
        write_json_atomic(&self.document_dir(&document.id).join(INDEX_FILE), document)?;
        debug!(document = %document.id, branch = %document.current_branch, "document record persisted");
        Ok(())
    }

    /// Register a new document for `path` with an empty `main` branch.
    pub fn create_document(&self, path: impl AsRef<Path>) -> Result<Document> {
        let path = normalize_path(path.as_ref())?;
        let mut state = self.state.write();

        if state.by_path.contains_key(&path) {
            return Err(StoreError::DocumentExists(path));
        }

        let mut id = DocumentId::generate();
        while state.documents.contains_key(&id) || state.corrupt.contains_key(&id) {
            id = DocumentId::generate();
        }

        let now = Timestamp::now();
        let document = Document {
            id,
            path: path.clone(),
            current_branch: MAIN_BRANCH.to_string(),
            created: now,
            last_modified: now,
            branches: BranchTable::new(now),
        };

        self.persist(&document)?;
        state.by_path.insert(path, id);
        state.documents.insert(id, document.clone());

        info!(document = %id, path = %document.path.display(), "document registered");
        Ok(document)
    }

    /// Get a document by id.
    pub fn get_document(&self, id: &DocumentId) -> Result<Document> {
        self.state.read().document(id).cloned()
    }

    /// Get the document mirrored at `path`, if any.
    pub fn get_document_by_path(&self, path: impl AsRef<Path>) -> Result<Option<Document>> {
        let path = normalize_path(path.as_ref())?;
        let state = self.state.read();
        Ok(state
            .by_path
            .get(&path)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    /// Apply a partial update and persist the whole record.
    pub fn update_document(&self, id: &DocumentId, update: DocumentUpdate) -> Result<Document> {
        let DocumentUpdate {
            path,
            current_branch,
            branches,
        } = update;

        let path = path.map(|p| normalize_path(&p)).transpose()?;

        self.modify(id, |document| {
            if let Some(branches) = branches {
                document.branches = branches;
            }
            if let Some(branch) = current_branch {
                if !document.branches.contains(&branch) {
                    return Err(StoreError::BranchNotFound(branch));
                }
                document.current_branch = branch;
            }
            if let Some(path) = path {
                document.path = path;
            }
            Ok(())
        })
        .map(|(document, ())| document)
    }

    /// Run `f` against a copy of the record, then persist and publish it.
    ///
    /// If `f` or the write fails, nothing changes.
    pub(crate) fn modify<T>(
        &self,
        id: &DocumentId,
        f: impl FnOnce(&mut Document) -> Result<T>,
    ) -> Result<(Document, T)> {
        let mut state = self.state.write();

        let original = state.document(id)?;
        let old_path = original.path.clone();
        let mut document = original.clone();

        let output = f(&mut document)?;

        if document.path != old_path {
            if let Some(owner) = state.by_path.get(&document.path) {
                if owner != id {
                    return Err(StoreError::DocumentExists(document.path));
                }
            }
        }

        document.last_modified = Timestamp::now();
        document.branches.validate(&document.current_branch)?;

        self.persist(&document)?;

        if document.path != old_path {
            state.by_path.remove(&old_path);
            state.by_path.insert(document.path.clone(), *id);
        }
        state.documents.insert(*id, document.clone());

        Ok((document, output))
    }

    /// Remove a document's record and everything under its directory.
    ///
    /// Works on corrupt documents too.
    pub fn delete_document(&self, id: &DocumentId) -> Result<()> {
        let mut state = self.state.write();

        let known = state.documents.contains_key(id) || state.corrupt.contains_key(id);
        if !known {
            return Err(StoreError::DocumentNotFound(*id));
        }

        let dir = self.document_dir(id);
        let index = dir.join(INDEX_FILE);
        if index.exists() {
            fs::remove_file(&index)?;
        }
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }

        if let Some(document) = state.documents.remove(id) {
            state.by_path.remove(&document.path);
        }
        state.corrupt.remove(id);

        info!(document = %id, "document deleted");
        Ok(())
    }

    /// Summaries of every loadable document, ordered by path.
    pub fn list(&self) -> Vec<DocumentSummary> {
        let state = self.state.read();
        let mut summaries: Vec<_> = state.documents.values().map(Document::summary).collect();
        summaries.sort_by(|a, b| a.path.cmp(&b.path));
        summaries
    }

    /// Documents whose record failed to load.
    pub fn corrupt_documents(&self) -> Vec<(DocumentId, String)> {
        self.state
            .read()
            .corrupt
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .collect()
    }
}

/// Make `path` absolute and strip `.`/`..` components lexically.
///
/// Symlinks are not resolved; the file may not exist yet.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
