use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use deferred_sql::prelude::*;
use deferred_sql::test_utils::{ASYNC_CONNECTION, MemoryStore, SYNC_CONNECTION, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn open(store: &MemoryStore) -> Database {
    Database::initialize(DatabaseOptions::new("memory"), store.factory()).unwrap()
}

#[test]
fn staged_statements_commit_as_one_unit() {
    let store = MemoryStore::new();
    let db = open(&store);

    db.begin_transaction().unwrap();
    for sql in ["INSERT a", "INSERT b", "INSERT c"] {
        db.async_execute(sql).unwrap();
    }
    assert!(db.has_open_transaction());
    assert_eq!(db.staged_statements(), 3);
    assert!(store.journal().is_empty());

    db.commit_transaction().unwrap();
    assert!(!db.has_open_transaction());
    assert!(wait_until(WAIT, || store.commits() == 1));
    assert_eq!(store.visible(), vec!["INSERT a", "INSERT b", "INSERT c"]);
    assert_eq!(store.rollbacks(), 0);
}

#[test]
fn failing_statement_rolls_back_the_whole_transaction() {
    let store = MemoryStore::new();
    store.fail_on("INSERT b");
    let db = open(&store);

    db.begin_transaction().unwrap();
    for sql in ["INSERT a", "INSERT b", "INSERT c"] {
        db.async_execute(sql).unwrap();
    }
    db.commit_transaction().unwrap();

    assert!(wait_until(WAIT, || store.rollbacks() == 1));
    assert!(store.visible().is_empty());
    assert_eq!(store.executed_on(ASYNC_CONNECTION), vec!["INSERT a", "INSERT b"]);
    assert_eq!(store.commits(), 0);
}

#[test]
fn failing_commit_leaves_nothing_behind() {
    let store = MemoryStore::new();
    store.fail_commits(true);
    let db = open(&store);

    db.begin_transaction().unwrap();
    db.async_execute("INSERT a").unwrap();
    db.async_execute("INSERT b").unwrap();
    db.commit_transaction().unwrap();

    assert!(wait_until(WAIT, || store.rollbacks() == 1));
    assert!(store.visible().is_empty());
}

#[test]
fn second_begin_is_refused_and_keeps_staged_work() {
    let store = MemoryStore::new();
    let db = open(&store);

    db.begin_transaction().unwrap();
    db.async_execute("INSERT a").unwrap();
    let err = db.begin_transaction().unwrap_err();
    assert!(matches!(err, DbError::TransactionAlreadyOpen));
    assert!(err.is_rejection());
    assert_eq!(db.staged_statements(), 1);

    assert!(db.rollback_transaction());
    assert!(!db.rollback_transaction());
    assert!(!db.has_open_transaction());
}

#[test]
fn commit_without_transaction_does_nothing() {
    let store = MemoryStore::new();
    let db = open(&store);

    db.commit_transaction().unwrap();
    db.begin_transaction().unwrap();
    db.commit_transaction().unwrap();
    db.commit_transaction_direct().unwrap();

    db.async_execute("UPDATE marker").unwrap();
    assert!(wait_until(WAIT, || !store.journal().is_empty()));
    assert_eq!(store.executed_on(ASYNC_CONNECTION), vec!["UPDATE marker"]);
    assert_eq!(store.commits(), 0);
}

#[test]
fn rolled_back_statements_never_run() {
    let store = MemoryStore::new();
    let db = open(&store);

    db.begin_transaction().unwrap();
    db.async_execute("DELETE everything").unwrap();
    assert!(db.rollback_transaction());

    db.async_execute("UPDATE marker").unwrap();
    assert!(wait_until(WAIT, || !store.journal().is_empty()));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(store.executed_on(ASYNC_CONNECTION), vec!["UPDATE marker"]);
}

#[test]
fn transactions_belong_to_the_thread_that_opened_them() {
    let store = MemoryStore::new();
    let db = open(&store);
    let staged = Barrier::new(2);
    let checked = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            db.begin_transaction().unwrap();
            db.async_execute("INSERT staged").unwrap();
            staged.wait();
            checked.wait();
            db.commit_transaction().unwrap();
        });
        s.spawn(|| {
            staged.wait();
            assert!(!db.has_open_transaction());
            assert_eq!(db.staged_statements(), 0);
            db.async_execute("UPDATE immediate").unwrap();
            assert!(wait_until(WAIT, || {
                store.executed_on(ASYNC_CONNECTION) == vec!["UPDATE immediate"]
            }));
            checked.wait();
        });
    });

    assert!(wait_until(WAIT, || store.commits() == 1));
    assert_eq!(store.visible(), vec!["UPDATE immediate", "INSERT staged"]);
}

#[test]
fn sync_execute_bypasses_the_open_transaction() {
    let store = MemoryStore::new();
    let db = open(&store);

    db.begin_transaction().unwrap();
    db.execute("UPDATE now").unwrap();
    assert_eq!(store.executed_on(SYNC_CONNECTION), vec!["UPDATE now"]);
    assert_eq!(db.staged_statements(), 0);
    assert!(db.rollback_transaction());
}

#[test]
fn direct_commit_reports_the_outcome() {
    let store = MemoryStore::new();
    store.fail_on("INSERT bad");
    let db = open(&store);

    db.begin_transaction().unwrap();
    db.async_execute("INSERT good").unwrap();
    db.commit_transaction_direct().unwrap();
    assert_eq!(store.commits(), 1);
    assert_eq!(store.visible(), vec!["INSERT good"]);

    db.begin_transaction().unwrap();
    db.async_execute("INSERT other").unwrap();
    db.async_execute("INSERT bad").unwrap();
    let err = db.commit_transaction_direct().unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(_)));
    assert_eq!(store.rollbacks(), 1);
    assert_eq!(store.visible(), vec!["INSERT good"]);
    assert!(!db.has_open_transaction());

    let journal = store.journal();
    assert!(journal.iter().all(|entry| entry.connection == ASYNC_CONNECTION));
    assert!(journal.iter().all(|entry| entry.thread == thread::current().id()));
}

#[test]
fn threads_that_exit_mid_transaction_release_their_slot() {
    let store = MemoryStore::new();
    let db = open(&store);

    // Joining each handle waits for the thread's locals to be destroyed.
    thread::scope(|s| {
        let handles: Vec<_> = (0..3)
            .map(|n| {
                let db = &db;
                s.spawn(move || {
                    db.begin_transaction().unwrap();
                    db.async_execute_formatted(format_args!("INSERT abandoned {n}"))
                        .unwrap();
                    assert!(db.has_open_transaction());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });

    assert_eq!(db.open_transactions(), 0);
    db.halt();
    assert!(store.journal().is_empty());
}

#[test]
fn thread_end_discards_what_was_staged() {
    let store = MemoryStore::new();
    let db = open(&store);

    thread::scope(|s| {
        s.spawn(|| {
            assert_eq!(db.thread_end(), 0);
            db.begin_transaction().unwrap();
            db.async_execute("INSERT a").unwrap();
            db.async_execute("INSERT b").unwrap();
            assert_eq!(db.thread_end(), 2);
            assert!(!db.has_open_transaction());
            assert_eq!(db.open_transactions(), 0);
        });
    });

    db.begin_transaction().unwrap();
    assert_eq!(db.open_transactions(), 1);
    assert!(db.rollback_transaction());
}
