//! Migration runs against a scripted in-memory driver.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use common::{Ledger, add_migration, collect, describe, scripted_driver, scripted_migrator};
use oxide_stepwise::pipe::ABORT_MESSAGE;
use oxide_stepwise::prelude::*;

fn three_migrations() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    add_migration(&store, 1, "users", "CREATE users", "DROP users");
    add_migration(&store, 2, "posts", "CREATE posts", "DROP posts");
    add_migration(&store, 3, "tags", "CREATE tags", "DROP tags");
    store
}

#[tokio::test]
async fn test_up_applies_everything_in_order() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Up)).await;
    assert_eq!(describe(&events), vec!["up 1", "up 2", "up 3"]);
    assert_eq!(ledger.version(""), 3);
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);

    let version = assert_ok!(migrator.version().await);
    assert_eq!(version, 3);
}

#[tokio::test]
async fn test_up_is_idempotent() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    assert!(migrator.up_sync().await.ok);
    ledger.clear_steps();

    let outcome = migrator.up_sync().await;
    assert!(outcome.ok);
    assert!(outcome.errors.is_empty());
    assert!(ledger.steps().is_empty());
    assert_eq!(ledger.version(""), 3);
}

#[tokio::test]
async fn test_down_rolls_back_in_reverse() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2, 3]);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Down)).await;
    assert_eq!(describe(&events), vec!["down 3", "down 2", "down 1"]);
    assert_eq!(ledger.version(""), 0);
}

#[tokio::test]
async fn test_failure_halts_run() {
    let ledger = Ledger::new();
    let store = three_migrations();
    add_migration(&store, 3, "tags", "FAIL: broken", "DROP tags");
    add_migration(&store, 4, "votes", "CREATE votes", "DROP votes");
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Up)).await;
    assert_eq!(describe(&events), vec!["up 1", "up 2", "up 3", "error"]);
    assert!(matches!(
        &events[3],
        Event::Error(MigrateError::Step { file, .. }) if file == "0003_tags.up.sql"
    ));
    assert_eq!(ledger.version(""), 2);
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);

    let outcome = migrator.up_sync().await;
    assert!(!outcome.ok);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(ledger.version(""), 2);
}

#[tokio::test]
async fn test_close_error_is_reported_but_not_fatal() {
    let ledger = Ledger::new();
    ledger.fail_close.store(true, Ordering::SeqCst);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let outcome = migrator.up_sync().await;
    assert!(outcome.ok);
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(outcome.errors[0], MigrateError::Close(_)));
    assert_eq!(ledger.version(""), 3);
}

#[tokio::test]
async fn test_unknown_scheme() {
    let migrator = Migrator::new("postgres://localhost/app")
        .registry(DriverRegistry::empty().with("scripted", scripted_driver))
        .interrupts(InterruptMode::NonGraceful);

    let outcome = migrator.up_sync().await;
    assert!(!outcome.ok);
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(&outcome.errors[0], MigrateError::UnknownDriver(s) if s == "postgres"));
}

#[tokio::test]
async fn test_driver_initialization_failure() {
    let migrator = Migrator::new("scripted://test")
        .registry(DriverRegistry::empty().with("scripted", scripted_driver))
        .interrupts(InterruptMode::NonGraceful);

    let events = collect(migrator.stream(Operation::Up)).await;
    assert_eq!(describe(&events), vec!["error"]);
    assert!(matches!(events[0], Event::Error(MigrateError::Connection(_))));

    assert_err!(migrator.version().await);
}

#[tokio::test]
async fn test_discovery_error_closes_driver() {
    let ledger = Ledger::new();
    let store = Arc::new(MemoryStore::new());
    store.insert("migrations/0001_users.up.sql", "CREATE users");
    let migrator = scripted_migrator(&ledger, &store);

    let outcome = migrator.up_sync().await;
    assert!(!outcome.ok);
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(outcome.errors[0], MigrateError::Discovery { .. }));
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
    assert!(ledger.steps().is_empty());
}

#[tokio::test]
async fn test_migrate_relative() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    assert!(migrator.migrate_sync(2).await.ok);
    assert_eq!(ledger.version(""), 2);

    assert!(migrator.migrate_sync(-1).await.ok);
    assert_eq!(ledger.version(""), 1);

    // Counts past the end are truncated.
    assert!(migrator.migrate_sync(10).await.ok);
    assert_eq!(ledger.version(""), 3);

    ledger.clear_steps();
    assert!(migrator.migrate_sync(0).await.ok);
    assert!(ledger.steps().is_empty());

    assert!(migrator.migrate_sync(-3).await.ok);
    assert_eq!(ledger.version(""), 0);
}

#[tokio::test]
async fn test_migrate_from_unknown_version() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[7]);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let outcome = migrator.migrate_sync(1).await;
    assert!(!outcome.ok);
    assert!(matches!(outcome.errors[..], [MigrateError::UnknownVersion(7)]));
    assert!(ledger.steps().is_empty());
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_goto() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    assert!(migrator.goto_sync(2).await.ok);
    assert_eq!(ledger.version(""), 2);

    assert!(migrator.goto_sync(0).await.ok);
    assert_eq!(ledger.version(""), 0);

    let outcome = migrator.goto_sync(5).await;
    assert!(matches!(outcome.errors[..], [MigrateError::UnknownVersion(5)]));
    assert_eq!(ledger.version(""), 0);
}

#[tokio::test]
async fn test_redo() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2]);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Redo)).await;
    assert_eq!(describe(&events), vec!["down 2", "up 2"]);
    assert_eq!(
        ledger.steps(),
        vec![(2, Direction::Down), (2, Direction::Up)]
    );
    assert_eq!(ledger.version(""), 2);
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reset() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2]);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Reset)).await;
    assert_eq!(
        describe(&events),
        vec!["down 2", "down 1", "up 1", "up 2", "up 3"]
    );
    assert_eq!(ledger.version(""), 3);
}

#[tokio::test]
async fn test_reset_survives_close_errors() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2, 3]);
    ledger.fail_close.store(true, Ordering::SeqCst);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let outcome = migrator.reset_sync().await;
    assert!(outcome.ok);
    assert!(!outcome.aborted);
    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome
        .errors
        .iter()
        .all(|err| matches!(err, MigrateError::Close(_))));
    assert_eq!(ledger.version(""), 3);
    assert_eq!(ledger.steps().len(), 6);
}

#[tokio::test]
async fn test_redo_survives_close_errors() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2]);
    ledger.fail_close.store(true, Ordering::SeqCst);
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let outcome = migrator.redo_sync().await;
    assert!(outcome.ok);
    assert_eq!(outcome.errors.len(), 2);
    assert_eq!(
        ledger.steps(),
        vec![(2, Direction::Down), (2, Direction::Up)]
    );
    assert_eq!(ledger.version(""), 2);
}

#[tokio::test]
async fn test_redo_at_zero_applies_nothing() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Redo)).await;
    assert!(events.is_empty());
    assert!(ledger.steps().is_empty());
    assert_eq!(ledger.version(""), 0);

    let outcome = migrator.redo_sync().await;
    assert!(outcome.ok);
    assert_eq!(ledger.version(""), 0);
}

#[tokio::test]
async fn test_reset_stops_when_rollback_fails() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2]);
    let store = three_migrations();
    add_migration(&store, 1, "users", "CREATE users", "FAIL: locked");
    let migrator = scripted_migrator(&ledger, &store);

    let events = collect(migrator.stream(Operation::Reset)).await;
    assert_eq!(describe(&events), vec!["down 2", "down 1", "error"]);
    assert_eq!(ledger.steps(), vec![(2, Direction::Down)]);
    assert_eq!(ledger.version(""), 1);
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_identities_track_separately() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let tenant = scripted_migrator(&ledger, &store).id("tenant");
    let default = scripted_migrator(&ledger, &store);

    assert!(tenant.migrate_sync(1).await.ok);
    assert_eq!(ledger.version("tenant"), 1);
    assert_eq!(ledger.version(""), 0);

    assert!(default.up_sync().await.ok);
    assert_eq!(ledger.version("tenant"), 1);
    assert_eq!(ledger.version(""), 3);
}

#[tokio::test]
async fn test_interrupt_finishes_current_step() {
    let ledger = Ledger::new();
    ledger.gated.store(true, Ordering::SeqCst);
    let store = three_migrations();
    let handle = InterruptHandle::new();
    let migrator =
        scripted_migrator(&ledger, &store).interrupts(InterruptMode::Handle(handle.clone()));

    let mut pipe = migrator.stream(Operation::Up);
    let first = pipe.recv().await.expect("first event");
    assert!(matches!(&first, Event::File(file) if file.version == 1));

    // The step is parked on the gate; interrupt it, then let it finish.
    assert_eq!(handle.interrupt(), 1);
    ledger.gate.add_permits(3);

    let rest = collect(pipe).await;
    assert_eq!(describe(&rest), vec!["text"]);
    assert!(matches!(&rest[0], Event::Text(text) if text == ABORT_MESSAGE));
    assert_eq!(ledger.version(""), 1);
    assert_eq!(ledger.steps(), vec![(1, Direction::Up)]);
    assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_interrupt_before_run_is_not_carried_over() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let handle = InterruptHandle::new();
    assert_eq!(handle.interrupt(), 0);

    let migrator =
        scripted_migrator(&ledger, &store).interrupts(InterruptMode::Handle(handle.clone()));
    assert!(migrator.up_sync().await.ok);
    assert_eq!(ledger.version(""), 3);
}

#[tokio::test]
async fn test_create_next_version() {
    let ledger = Ledger::new();
    let store = three_migrations();
    let migrator = scripted_migrator(&ledger, &store);

    let pair = assert_ok!(migrator.create("add votes").await);
    assert_eq!(pair.version, 4);
    assert_eq!(pair.up.file_name, "0004_add_votes.up.sql");
    assert_eq!(pair.down.file_name, "0004_add_votes.down.sql");

    let files = assert_ok!(migrator.files().await);
    assert_eq!(files.len(), 4);
    assert_eq!(files.last_version(), 4);
}

#[tokio::test]
async fn test_interrupted_sync_run_reports_aborted() {
    let ledger = Ledger::new();
    ledger.gated.store(true, Ordering::SeqCst);
    let store = three_migrations();
    let handle = InterruptHandle::new();
    let migrator =
        scripted_migrator(&ledger, &store).interrupts(InterruptMode::Handle(handle.clone()));

    let run = tokio::spawn(async move { migrator.up_sync().await });

    // Wait until the first step has armed its listener.
    while handle.interrupt() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    ledger.gate.add_permits(3);

    let outcome = run.await.unwrap();
    assert!(outcome.ok);
    assert!(outcome.aborted);
    assert!(outcome.errors.is_empty());
    assert_eq!(ledger.version(""), 1);

    let outcome = scripted_migrator(&ledger, &store).up_sync().await;
    assert!(outcome.ok);
    assert!(!outcome.aborted);
    assert_eq!(ledger.version(""), 3);
}

#[tokio::test]
async fn test_interrupted_reset_aborts_once() {
    let ledger = Ledger::new();
    ledger.set_versions("", &[1, 2, 3]);
    ledger.gated.store(true, Ordering::SeqCst);
    let store = three_migrations();
    let handle = InterruptHandle::new();
    let migrator =
        scripted_migrator(&ledger, &store).interrupts(InterruptMode::Handle(handle.clone()));

    let mut pipe = migrator.stream(Operation::Reset);
    let first = pipe.recv().await.expect("first event");
    assert!(matches!(&first, Event::File(file) if file.version == 3));

    // Only the running step listens.
    assert_eq!(handle.interrupt(), 1);
    ledger.gate.add_permits(6);

    let rest = collect(pipe).await;
    assert_eq!(describe(&rest), vec!["text"]);
    assert_eq!(ledger.steps(), vec![(3, Direction::Down)]);
    assert_eq!(ledger.version(""), 2);
}
