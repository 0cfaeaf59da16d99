//! Registry/supervisor behavior: session lifecycle, cancellation semantics,
//! listing, and retention sweeps.

mod common;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use common::{FakeRemote, MemoryBlobStore, fixture_issues, test_env, test_request};
use gantry::GantryError;
use gantry::import::registry::ImportRegistry;
use gantry::storage::SqliteStorage;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(30);

fn target(dir: &TempDir, workspace_id: Uuid) -> SqliteStorage {
    let storage = SqliteStorage::open(&dir.path().join("gantry.db")).unwrap();
    storage.ensure_workspace(workspace_id, "ws").unwrap();
    storage
}

fn finished_session(registry: &ImportRegistry, dir: &TempDir, actor: &str) -> Uuid {
    let workspace_id = Uuid::new_v4();
    let remote = Arc::new(FakeRemote::new(fixture_issues()));
    let blobs = Arc::new(MemoryBlobStore::default());
    let id = registry
        .begin_import(
            test_request(workspace_id, actor),
            test_env(remote, blobs),
            target(dir, workspace_id),
        )
        .unwrap();
    registry.wait_finished(id, WAIT).unwrap();
    id
}

#[test]
fn cancel_of_unknown_session_is_an_error() {
    let registry = ImportRegistry::new();
    let missing = Uuid::new_v4();
    assert!(matches!(
        registry.cancel(missing),
        Err(GantryError::SessionNotFound { .. })
    ));
    assert!(matches!(
        registry.status(missing),
        Err(GantryError::SessionNotFound { .. })
    ));
}

#[test]
fn cancel_after_finish_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let registry = ImportRegistry::new();
    let id = finished_session(&registry, &dir, "alice");

    let before = registry.status(id).unwrap();
    assert!(before.finished);
    assert!(before.error.is_empty());

    registry.cancel(id).unwrap();

    let after = registry.status(id).unwrap();
    assert!(after.error.is_empty(), "cancel must not overwrite a finished outcome");
}

#[test]
fn listing_by_actor_and_active() {
    let dir = TempDir::new().unwrap();
    let registry = ImportRegistry::new();
    let done = finished_session(&registry, &dir, "alice");

    let workspace_id = Uuid::new_v4();
    let slow_remote = Arc::new(
        FakeRemote::new(fixture_issues()).with_delay(Duration::from_millis(30)),
    );
    let running = registry
        .begin_import(
            test_request(workspace_id, "bob"),
            test_env(slow_remote, Arc::new(MemoryBlobStore::default())),
            target(&dir, workspace_id),
        )
        .unwrap();

    let alices = registry.list_for_actor("alice");
    assert_eq!(alices.len(), 1);
    assert_eq!(alices[0].id, done);

    let active = registry.list_active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, running);
    assert_eq!(active[0].actor, "bob");

    registry.cancel(running).unwrap();
    registry.wait_finished(running, WAIT).unwrap();
    assert!(registry.list_active().is_empty());
}

#[test]
fn cancel_workspace_cancels_only_that_workspace() {
    let dir = TempDir::new().unwrap();
    let registry = ImportRegistry::new();

    let workspace_a = Uuid::new_v4();
    let workspace_b = Uuid::new_v4();
    let remote = || {
        Arc::new(FakeRemote::new(fixture_issues()).with_delay(Duration::from_millis(30)))
    };

    let in_a = registry
        .begin_import(
            test_request(workspace_a, "alice"),
            test_env(remote(), Arc::new(MemoryBlobStore::default())),
            target(&dir, workspace_a),
        )
        .unwrap();
    let in_b = registry
        .begin_import(
            test_request(workspace_b, "bob"),
            test_env(remote(), Arc::new(MemoryBlobStore::default())),
            target(&dir, workspace_b),
        )
        .unwrap();

    assert_eq!(registry.cancel_workspace(workspace_a), 1);

    let status_a = registry.wait_finished(in_a, WAIT).unwrap();
    assert_eq!(status_a.error, "import cancelled");

    // The other workspace's import proceeds to a normal finish.
    let status_b = registry.wait_finished(in_b, WAIT).unwrap();
    assert!(status_b.error.is_empty());
}

#[test]
fn sweep_purges_finished_sessions_past_retention() {
    let dir = TempDir::new().unwrap();
    let registry = ImportRegistry::with_retention(Duration::ZERO);
    let id = finished_session(&registry, &dir, "alice");

    // finished_at must fall strictly before the sweep cutoff.
    std::thread::sleep(Duration::from_millis(20));
    registry.sweep();

    assert!(matches!(
        registry.status(id),
        Err(GantryError::SessionNotFound { .. })
    ));
}

#[test]
fn sweep_keeps_running_sessions() {
    let dir = TempDir::new().unwrap();
    let registry = ImportRegistry::with_retention(Duration::ZERO);

    let workspace_id = Uuid::new_v4();
    let remote = Arc::new(
        FakeRemote::new(fixture_issues()).with_delay(Duration::from_millis(30)),
    );
    let id = registry
        .begin_import(
            test_request(workspace_id, "alice"),
            test_env(remote, Arc::new(MemoryBlobStore::default())),
            target(&dir, workspace_id),
        )
        .unwrap();

    registry.sweep();
    assert!(registry.status(id).is_ok(), "running sessions survive sweeps");

    registry.cancel(id).unwrap();
    registry.wait_finished(id, WAIT).unwrap();
}
