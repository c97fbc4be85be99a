//! Integration tests for the version store.

use folio::{
    BranchRelation, JsonTreeCodec, MirrorSync, PlainTextCodec, StoreConfig, StoreError,
    VersionStore, MAIN_BRANCH,
};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> VersionStore<PlainTextCodec> {
    VersionStore::create(StoreConfig::at(dir.path().join("store")), PlainTextCodec).unwrap()
}

fn open_store(dir: &TempDir) -> VersionStore<PlainTextCodec> {
    let mut config = StoreConfig::at(dir.path().join("store"));
    config.create_if_missing = false;
    VersionStore::open_or_create(config, PlainTextCodec).unwrap()
}

fn text(s: &str) -> String {
    s.to_string()
}

// --- Documented Scenarios ---

#[test]
fn test_fresh_document_has_only_main() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();

    assert_eq!(doc.current_branch, MAIN_BRANCH);
    assert_eq!(store.get_branches(&doc.id).unwrap(), vec![MAIN_BRANCH]);
    assert_eq!(store.get_current_branch(&doc.id).unwrap(), MAIN_BRANCH);
}

#[test]
fn test_draft_save_does_not_touch_main() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let file = dir.path().join("doc.md");
    fs::write(&file, "before branching").unwrap();
    let doc = store.initialize_document(&file).unwrap();

    store.create_branch(&doc.id, "draft").unwrap();
    store.switch_branch(&doc.id, "draft").unwrap();
    store.save_version(&doc.id, &text("draft edit")).unwrap();
    store.switch_branch(&doc.id, MAIN_BRANCH).unwrap();

    assert_eq!(
        store.load_document(&doc.id, MAIN_BRANCH).unwrap(),
        "before branching"
    );
    assert_eq!(store.load_document(&doc.id, "draft").unwrap(), "draft edit");
    assert_eq!(fs::read_to_string(&file).unwrap(), "before branching");
}

#[test]
fn test_delete_current_branch_needs_switch() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();

    store.create_branch(&doc.id, "draft").unwrap();
    store.switch_branch(&doc.id, "draft").unwrap();

    let result = store.delete_branch(&doc.id, "draft");
    assert!(matches!(result, Err(StoreError::BranchInUse(_))));

    store.switch_branch(&doc.id, MAIN_BRANCH).unwrap();
    store.delete_branch(&doc.id, "draft").unwrap();
    assert_eq!(store.get_branches(&doc.id).unwrap(), vec![MAIN_BRANCH]);
}

#[test]
fn test_rename_current_branch() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();

    store.create_branch(&doc.id, "draft").unwrap();
    store.switch_branch(&doc.id, "draft").unwrap();

    let result = store.rename_branch(&doc.id, "draft", MAIN_BRANCH);
    assert!(matches!(result, Err(StoreError::ProtectedBranch(_))));

    store.rename_branch(&doc.id, "draft", "draft2").unwrap();
    assert_eq!(store.get_current_branch(&doc.id).unwrap(), "draft2");
    assert_eq!(
        store.get_branches(&doc.id).unwrap(),
        vec![MAIN_BRANCH, "draft2"]
    );
}

// --- Realistic Workflow Tests ---

#[test]
fn test_rich_text_editing_session() {
    let dir = TempDir::new().unwrap();
    let store =
        VersionStore::create(StoreConfig::at(dir.path().join("store")), JsonTreeCodec).unwrap();
    let file = dir.path().join("chapter.md");
    fs::write(&file, "Chapter One\nIt was a dark night.").unwrap();

    let doc = store.initialize_document(&file).unwrap();
    let loaded = store.load_document(&doc.id, MAIN_BRANCH).unwrap();
    assert_eq!(loaded["content"].as_array().unwrap().len(), 2);

    let edited = json!({
        "type": "doc",
        "content": [
            { "type": "heading", "content": [{ "type": "text", "text": "Chapter One" }] },
            { "type": "paragraph", "content": [
                { "type": "text", "text": "It was a " },
                { "type": "text", "text": "stormy", "marks": [{ "type": "bold" }] }
            ]}
        ]
    });
    let receipt = store.save_version(&doc.id, &edited).unwrap();

    assert_eq!(receipt.mirror, MirrorSync::Written(doc.path.clone()));
    assert_eq!(store.load_document(&doc.id, MAIN_BRANCH).unwrap(), edited);
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "Chapter One\nIt was a \nstormy"
    );
}

#[test]
fn test_explore_alternative_then_merge() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let file = dir.path().join("essay.md");
    let doc = store.initialize_document(&file).unwrap();
    store.save_version(&doc.id, &text("thesis")).unwrap();

    // Try an alternative on a branch
    store.create_branch(&doc.id, "bolder").unwrap();
    store.switch_branch(&doc.id, "bolder").unwrap();
    store.save_version(&doc.id, &text("bolder thesis")).unwrap();
    store.save_version(&doc.id, &text("bolder thesis, with evidence")).unwrap();

    assert_eq!(
        store.compare_branches(&doc.id, "bolder", MAIN_BRANCH).unwrap(),
        BranchRelation::Ahead(2)
    );

    // Adopt it
    store.switch_branch(&doc.id, MAIN_BRANCH).unwrap();
    let outcome = store.merge_branch(&doc.id, "bolder", MAIN_BRANCH).unwrap();
    assert!(!outcome.discarded_target_changes);
    assert_eq!(outcome.new_head, store.get_document(&doc.id).unwrap().current_head());

    store.sync_mirror(&doc.id).unwrap();
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "bolder thesis, with evidence"
    );
    assert_eq!(
        store.compare_branches(&doc.id, "bolder", MAIN_BRANCH).unwrap(),
        BranchRelation::Identical
    );
}

#[test]
fn test_history_crosses_branch_point() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();
    store.save_version(&doc.id, &text("main 1")).unwrap();

    store.create_branch(&doc.id, "side").unwrap();
    store.switch_branch(&doc.id, "side").unwrap();
    store.save_version(&doc.id, &text("side 1")).unwrap();

    let history = store.history(&doc.id, "side").unwrap();
    let contents: Vec<_> = history
        .iter()
        .map(|s| String::from_utf8(s.content.clone()).unwrap())
        .collect();
    assert_eq!(contents, vec!["side 1", "main 1", ""]);
    assert_eq!(history[0].branch, "side");
    assert_eq!(history[1].branch, MAIN_BRANCH);
}

#[test]
fn test_branch_lineage() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();

    let first = store.next_branch_name(&doc.id).unwrap();
    assert_eq!(first, "branch-1");
    store.create_branch(&doc.id, &first).unwrap();
    store.switch_branch(&doc.id, &first).unwrap();

    let second = store.next_branch_name(&doc.id).unwrap();
    assert_eq!(second, "branch-2");
    store.create_branch(&doc.id, &second).unwrap();

    assert_eq!(
        store.branch_ancestry(&doc.id, &second).unwrap(),
        vec!["branch-2", "branch-1", MAIN_BRANCH]
    );

    store.switch_branch(&doc.id, MAIN_BRANCH).unwrap();
    store.delete_branch(&doc.id, &first).unwrap();
    assert_eq!(
        store.branch_ancestry(&doc.id, &second).unwrap(),
        vec!["branch-2", MAIN_BRANCH]
    );
}

#[test]
fn test_renamed_branch_keeps_snapshot_tags() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();

    store.create_branch(&doc.id, "draft").unwrap();
    store.switch_branch(&doc.id, "draft").unwrap();
    store.save_version(&doc.id, &text("tagged draft")).unwrap();
    store.rename_branch(&doc.id, "draft", "final").unwrap();

    // Saving after the rename files new snapshots under the new name.
    store.save_version(&doc.id, &text("tagged final")).unwrap();

    let history = store.history(&doc.id, "final").unwrap();
    assert_eq!(history[0].branch, "final");
    assert_eq!(history[1].branch, "draft");
    assert_eq!(store.load_document(&doc.id, "final").unwrap(), "tagged final");
}

#[test]
fn test_deleted_branch_snapshots_remain() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let doc = store.initialize_document(dir.path().join("doc.md")).unwrap();

    store.create_branch(&doc.id, "scratch").unwrap();
    store.switch_branch(&doc.id, "scratch").unwrap();
    let receipt = store.save_version(&doc.id, &text("scratch work")).unwrap();
    store.switch_branch(&doc.id, MAIN_BRANCH).unwrap();
    store.delete_branch(&doc.id, "scratch").unwrap();

    let snapshot = store.get_snapshot(&doc.id, &receipt.version).unwrap();
    assert_eq!(snapshot.content, b"scratch work");
}

#[test]
fn test_document_path_rename() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    let old = dir.path().join("old.md");
    let new = dir.path().join("new.md");
    let doc = store.initialize_document(&old).unwrap();
    let head = doc.current_head();

    let moved = store.update_document_path(&doc.id, &new).unwrap();
    assert_eq!(moved.id, doc.id);
    assert_eq!(moved.current_head(), head);
    assert!(store.find_document(&old).unwrap().is_none());
    assert_eq!(store.find_document(&new).unwrap().unwrap().id, doc.id);

    store.save_version(&doc.id, &text("after move")).unwrap();
    assert_eq!(fs::read_to_string(&new).unwrap(), "after move");
    assert!(!old.exists());
}

#[test]
fn test_list_documents() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let b = store.initialize_document(dir.path().join("b.md")).unwrap();
    let a = store.initialize_document(dir.path().join("a.md")).unwrap();
    store.create_branch(&b.id, "alt").unwrap();

    let listed = store.list_documents();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, a.id);
    assert_eq!(listed[1].id, b.id);
    assert_eq!(listed[1].branches, vec![MAIN_BRANCH, "alt"]);
}

// --- Persistence Tests ---

#[test]
fn test_reopen_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("doc.md");

    let (id, draft_head) = {
        let store = test_store(&dir);
        let doc = store.initialize_document(&file).unwrap();
        store.save_version(&doc.id, &text("main text")).unwrap();
        store.create_branch(&doc.id, "draft").unwrap();
        store.switch_branch(&doc.id, "draft").unwrap();
        let receipt = store.save_version(&doc.id, &text("draft text")).unwrap();
        (doc.id, receipt.version)
    };

    let store = open_store(&dir);
    let doc = store.initialize_document(&file).unwrap();
    assert_eq!(doc.id, id);
    assert_eq!(doc.current_branch, "draft");
    assert_eq!(doc.current_head(), Some(draft_head));
    assert_eq!(store.load_document(&id, MAIN_BRANCH).unwrap(), "main text");
    assert_eq!(store.load_document(&id, "draft").unwrap(), "draft text");
    assert_eq!(store.history(&id, "draft").unwrap().len(), 3);
}

#[test]
fn test_many_saves_across_reopen() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("doc.md");

    let id = {
        let store = test_store(&dir);
        let doc = store.initialize_document(&file).unwrap();
        for i in 0..20 {
            store.save_version(&doc.id, &format!("revision {}", i)).unwrap();
        }
        doc.id
    };

    let store = open_store(&dir);
    assert_eq!(store.load_document(&id, MAIN_BRANCH).unwrap(), "revision 19");
    assert_eq!(store.history(&id, MAIN_BRANCH).unwrap().len(), 21);
    assert_eq!(fs::read_to_string(&file).unwrap(), "revision 19");
}
