//! Autosave scheduler tests.

use folio::{
    AutosaveConfig, AutosaveEvent, AutosaveScheduler, DocumentId, MirrorSync, PlainTextCodec,
    StoreConfig, VersionStore, MAIN_BRANCH,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn setup(dir: &TempDir, autosave: AutosaveConfig) -> (Arc<VersionStore<PlainTextCodec>>, DocumentId) {
    init_tracing();
    let mut config = StoreConfig::at(dir.path().join("store"));
    config.autosave = autosave;
    let store = VersionStore::open_or_create(config, PlainTextCodec).unwrap();
    let doc = store
        .initialize_document(dir.path().join("doc.md"))
        .unwrap();
    (Arc::new(store), doc.id)
}

fn quick() -> AutosaveConfig {
    AutosaveConfig {
        enabled: true,
        debounce_ms: 25,
    }
}

fn slow() -> AutosaveConfig {
    AutosaveConfig {
        enabled: true,
        debounce_ms: 60_000,
    }
}

#[test]
fn test_debounced_save_writes_mirror() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(&dir, quick());
    let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();
    let events = scheduler.events();
    assert_eq!(scheduler.debounce(), Duration::from_millis(25));

    scheduler.note_change(&id, "typed".to_string()).unwrap();

    match events.recv_timeout(WAIT).unwrap() {
        AutosaveEvent::Saved { document, receipt } => {
            assert_eq!(document, id);
            assert_eq!(receipt.branch, MAIN_BRANCH);
            assert!(matches!(receipt.mirror, MirrorSync::Written(_)));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(fs::read_to_string(dir.path().join("doc.md")).unwrap(), "typed");
}

#[test]
fn test_burst_of_edits_saves_latest_once() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(&dir, quick());
    let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();
    let events = scheduler.events();

    let mut typed = String::new();
    for c in "hello world".chars() {
        typed.push(c);
        scheduler.note_change(&id, typed.clone()).unwrap();
    }

    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        AutosaveEvent::Saved { .. }
    ));
    assert!(events.recv_timeout(Duration::from_millis(150)).is_err());
    assert_eq!(store.load_document(&id, MAIN_BRANCH).unwrap(), "hello world");
    assert_eq!(store.history(&id, MAIN_BRANCH).unwrap().len(), 2);
}

#[test]
fn test_pending_edit_dropped_after_switch() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(&dir, slow());
    let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();
    let events = scheduler.events();

    store.create_branch(&id, "draft").unwrap();
    scheduler.note_change(&id, "meant for main".to_string()).unwrap();

    // User switches before the timer fires.
    store.switch_branch(&id, "draft").unwrap();
    assert!(scheduler.flush(&id).unwrap().is_none());

    match events.recv_timeout(WAIT).unwrap() {
        AutosaveEvent::Dropped {
            branch, current, ..
        } => {
            assert_eq!(branch, MAIN_BRANCH);
            assert_eq!(current, "draft");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert_eq!(store.load_document(&id, "draft").unwrap(), "");
    assert_eq!(store.load_document(&id, MAIN_BRANCH).unwrap(), "");
}

#[test]
fn test_flush_on_blur() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(&dir, slow());
    let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();

    scheduler.note_change(&id, "first".to_string()).unwrap();
    scheduler.note_change(&id, "second".to_string()).unwrap();
    let receipt = scheduler.flush(&id).unwrap().unwrap();

    let doc = store.get_document(&id).unwrap();
    assert_eq!(doc.current_head(), Some(receipt.version));
    assert_eq!(store.load_document(&id, MAIN_BRANCH).unwrap(), "second");
}

#[test]
fn test_shutdown_flushes_pending() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(&dir, slow());

    {
        let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();
        scheduler.note_change(&id, "saved on close".to_string()).unwrap();
        // Dropped here.
    }

    assert_eq!(
        store.load_document(&id, MAIN_BRANCH).unwrap(),
        "saved on close"
    );
}

#[test]
fn test_disabled_autosave_ignores_changes() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(
        &dir,
        AutosaveConfig {
            enabled: false,
            debounce_ms: 1,
        },
    );
    let mut scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();

    scheduler.note_change(&id, "ignored".to_string()).unwrap();
    assert!(scheduler.flush(&id).unwrap().is_none());
    scheduler.shutdown().unwrap();

    assert_eq!(store.history(&id, MAIN_BRANCH).unwrap().len(), 1);
}

#[test]
fn test_failed_save_reported() {
    let dir = TempDir::new().unwrap();
    let (store, id) = setup(&dir, slow());
    let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();
    let events = scheduler.events();

    scheduler.note_change(&id, "orphaned".to_string()).unwrap();
    store.delete_document(&id).unwrap();

    assert!(scheduler.flush(&id).is_err());
    assert!(matches!(
        events.recv_timeout(WAIT).unwrap(),
        AutosaveEvent::Failed { .. }
    ));
}

#[test]
fn test_unknown_document_rejected_up_front() {
    let dir = TempDir::new().unwrap();
    let (store, _) = setup(&dir, quick());
    let scheduler = AutosaveScheduler::new(store).unwrap();

    let err = scheduler
        .note_change(&DocumentId::generate(), "x".to_string())
        .unwrap_err();
    assert_eq!(err.kind(), folio::ErrorKind::NotFound);
}

#[test]
fn test_multiple_documents_saved_independently() {
    let dir = TempDir::new().unwrap();
    let (store, a) = setup(&dir, quick());
    let b = store
        .initialize_document(dir.path().join("other.md"))
        .unwrap()
        .id;
    let scheduler = AutosaveScheduler::new(Arc::clone(&store)).unwrap();
    let events = scheduler.events();

    scheduler.note_change(&a, "for a".to_string()).unwrap();
    scheduler.note_change(&b, "for b".to_string()).unwrap();

    let mut saved = Vec::new();
    for _ in 0..2 {
        if let AutosaveEvent::Saved { document, .. } = events.recv_timeout(WAIT).unwrap() {
            saved.push(document);
        }
    }
    saved.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(saved, expected);

    assert_eq!(store.load_document(&a, MAIN_BRANCH).unwrap(), "for a");
    assert_eq!(store.load_document(&b, MAIN_BRANCH).unwrap(), "for b");
}
