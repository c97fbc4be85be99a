//! Per-document branch table.

use crate::error::{Result, StoreError};
use crate::types::{BranchInfo, Timestamp, VersionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Name of the protected default branch.
pub const MAIN_BRANCH: &str = "main";

/// Prefix used by [`BranchTable::next_branch_name`].
const GENERATED_PREFIX: &str = "branch-";

/// Longest accepted branch name, in bytes.
const MAX_BRANCH_NAME_LEN: usize = 255;

/// Check that `name` can be used as a branch name.
///
/// Branch names double as directory names under `versions/`, so path
/// separators, `.`/`..` and control characters are rejected.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() > MAX_BRANCH_NAME_LEN
        || name == "."
        || name == ".."
        || name.trim() != name
        || name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control());

    if invalid {
        return Err(StoreError::InvalidBranchName(name.to_string()));
    }
    Ok(())
}

/// Mapping of branch name to [`BranchInfo`] for one document.
///
/// Always contains [`MAIN_BRANCH`]. Pure in-memory structure: persistence
/// happens when the owning document record is written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchTable {
    branches: BTreeMap<String, BranchInfo>,
}

impl BranchTable {
    /// Create a table holding only an empty `main` branch.
    pub fn new(now: Timestamp) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(MAIN_BRANCH.to_string(), BranchInfo::root(now));
        Self { branches }
    }

    /// Get a branch by name.
    pub fn get(&self, name: &str) -> Option<&BranchInfo> {
        self.branches.get(name)
    }

    /// Whether a branch exists.
    pub fn contains(&self, name: &str) -> bool {
        self.branches.contains_key(name)
    }

    /// Number of branches.
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Always false; `main` cannot be removed.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Branch names, `main` first and the rest in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.branches.len());
        if self.branches.contains_key(MAIN_BRANCH) {
            names.push(MAIN_BRANCH.to_string());
        }
        names.extend(
            self.branches
                .keys()
                .filter(|name| name.as_str() != MAIN_BRANCH)
                .cloned(),
        );
        names
    }

    /// Iterate over all entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BranchInfo)> {
        self.branches.iter()
    }

    /// Head of a branch.
    pub fn head(&self, name: &str) -> Result<Option<VersionId>> {
        self.branches
            .get(name)
            .map(|info| info.head)
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))
    }

    /// Create `name` as a copy of `from`'s current head.
    ///
    /// No snapshot is written: the new branch shares `from`'s head until its
    /// first save.
    pub fn create(&mut self, name: &str, from: &str, now: Timestamp) -> Result<&BranchInfo> {
        if self.branches.contains_key(name) {
            return Err(StoreError::BranchExists(name.to_string()));
        }
        validate_branch_name(name)?;

        let parent_head = self.head(from)?;

        let info = BranchInfo {
            head: parent_head,
            created: now,
            last_modified: now,
            parent: Some(from.to_string()),
            branch_point: parent_head,
        };

        Ok(self.branches.entry(name.to_string()).or_insert(info))
    }

    /// Move a branch's head to a newly saved snapshot.
    pub fn advance_head(&mut self, name: &str, head: VersionId, now: Timestamp) -> Result<()> {
        let info = self
            .branches
            .get_mut(name)
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))?;

        info.head = Some(head);
        info.last_modified = now;
        Ok(())
    }

    /// Remove a branch entry. Snapshots are left untouched.
    ///
    /// Children of the removed branch are re-parented to its parent.
    pub fn delete(&mut self, name: &str, current: &str) -> Result<BranchInfo> {
        if name == MAIN_BRANCH {
            return Err(StoreError::ProtectedBranch(name.to_string()));
        }
        if !self.branches.contains_key(name) {
            return Err(StoreError::BranchNotFound(name.to_string()));
        }
        if name == current {
            return Err(StoreError::BranchInUse(name.to_string()));
        }

        let removed = self
            .branches
            .remove(name)
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))?;

        for info in self.branches.values_mut() {
            if info.parent.as_deref() == Some(name) {
                info.parent = removed.parent.clone();
            }
        }

        Ok(removed)
    }

    /// Move `old`'s entry to `new`.
    pub fn rename(&mut self, old: &str, new: &str, now: Timestamp) -> Result<()> {
        if old == MAIN_BRANCH || new == MAIN_BRANCH {
            return Err(StoreError::ProtectedBranch(MAIN_BRANCH.to_string()));
        }
        if !self.branches.contains_key(old) {
            return Err(StoreError::BranchNotFound(old.to_string()));
        }
        if self.branches.contains_key(new) {
            return Err(StoreError::BranchExists(new.to_string()));
        }
        validate_branch_name(new)?;

        let mut info = self
            .branches
            .remove(old)
            .ok_or_else(|| StoreError::BranchNotFound(old.to_string()))?;
        info.last_modified = now;
        self.branches.insert(new.to_string(), info);

        for info in self.branches.values_mut() {
            if info.parent.as_deref() == Some(old) {
                info.parent = Some(new.to_string());
            }
        }

        Ok(())
    }

    /// Point `target`'s head at `source`'s head.
    ///
    /// Returns the target's `(previous, new)` heads.
    pub fn fast_forward(
        &mut self,
        source: &str,
        target: &str,
        now: Timestamp,
    ) -> Result<(Option<VersionId>, Option<VersionId>)> {
        let source_head = self.head(source)?;
        let info = self
            .branches
            .get_mut(target)
            .ok_or_else(|| StoreError::BranchNotFound(target.to_string()))?;

        let previous = info.head;
        info.head = source_head;
        info.last_modified = now;
        Ok((previous, source_head))
    }

    /// Branch lineage from `name` up to its root (usually `main`).
    pub fn ancestry(&self, name: &str) -> Result<Vec<String>> {
        let mut current = self
            .branches
            .get_key_value(name)
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))?;

        let mut seen = HashSet::new();
        let mut ancestry = Vec::new();

        loop {
            let (branch_name, info) = current;
            if !seen.insert(branch_name.as_str()) {
                break;
            }
            ancestry.push(branch_name.clone());

            match info
                .parent
                .as_deref()
                .and_then(|p| self.branches.get_key_value(p))
            {
                Some(parent) => current = parent,
                None => break,
            }
        }

        Ok(ancestry)
    }

    /// Next free `branch-N` name.
    pub fn next_branch_name(&self) -> String {
        let highest = self
            .branches
            .keys()
            .filter_map(|name| name.strip_prefix(GENERATED_PREFIX))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        // Past u64::MAX, wrap around and take the first free number.
        let mut next = highest.checked_add(1).unwrap_or(1);
        loop {
            let name = format!("{}{}", GENERATED_PREFIX, next);
            if !self.branches.contains_key(&name) {
                return name;
            }
            next = next.checked_add(1).unwrap_or(1);
        }
    }

    /// Check structural invariants after loading from disk.
    pub fn validate(&self, current: &str) -> Result<()> {
        if !self.branches.contains_key(MAIN_BRANCH) {
            return Err(StoreError::Corruption(
                "branch table has no main branch".into(),
            ));
        }
        if !self.branches.contains_key(current) {
            return Err(StoreError::Corruption(format!(
                "current branch {:?} is not in the branch table",
                current
            )));
        }
        Ok(())
    }
}
