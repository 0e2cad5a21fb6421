use super::*;
use crate::sync::SqliteStatusStore;
use crate::sync::test_support::{FakeStatusStore, RecordingRunner, account};
use sqlx::sqlite::SqlitePoolOptions;

fn folders(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn engine(store: &Arc<FakeStatusStore>, runner: &Arc<RecordingRunner>) -> ResyncEngine {
    ResyncEngine::new(store.clone(), SyncInvoker::new(runner.clone()))
}

#[tokio::test]
async fn idle_account_starts_sync_without_touching_status() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::Synced);
    let runner = RecordingRunner::new();
    let engine = engine(&store, &runner);

    let report = engine
        .handle_change(&account(1, "a@example.com"), &folders(&["INBOX"]))
        .await
        .unwrap();
    engine.invoker().wait_idle().await;

    assert_eq!(report.outcome("INBOX"), Some(FolderOutcome::SyncStarted));
    assert_eq!(runner.requests()[0].folder.as_deref(), Some("INBOX"));
    assert_eq!(runner.requests()[0].email.as_deref(), Some("a@example.com"));
    assert_eq!(store.get(1, "INBOX"), Some(FolderSyncStatus::Synced));
    assert_eq!(store.cas_calls(), 0);
}

#[tokio::test]
async fn busy_account_marks_synced_and_syncing_folders() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::Synced);
    store.set(1, "Sent", FolderSyncStatus::Syncing);
    store.set(1, "Drafts", FolderSyncStatus::NotSynced);
    let runner = RecordingRunner::new();
    let engine = engine(&store, &runner);

    let report = engine
        .handle_change(
            &account(1, "a@example.com"),
            &folders(&["INBOX", "Sent", "Drafts"]),
        )
        .await
        .unwrap();

    assert_eq!(
        report.outcome("INBOX"),
        Some(FolderOutcome::Marked(FolderSyncStatus::SyncedNeedResync))
    );
    assert_eq!(
        report.outcome("Sent"),
        Some(FolderOutcome::Marked(FolderSyncStatus::SyncingNeedResync))
    );
    assert_eq!(report.outcome("Drafts"), Some(FolderOutcome::Unchanged));
    assert_eq!(store.get(1, "Drafts"), Some(FolderSyncStatus::NotSynced));
    assert_eq!(runner.runs(), 0);
    assert_eq!(store.syncing_checks(), 1);
}

#[tokio::test]
async fn already_marked_folder_is_left_alone() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::SyncingNeedResync);
    let runner = RecordingRunner::new();
    let engine = engine(&store, &runner);

    let report = engine
        .handle_change(&account(1, "a@example.com"), &folders(&["INBOX"]))
        .await
        .unwrap();

    assert_eq!(report.outcome("INBOX"), Some(FolderOutcome::Unchanged));
    assert_eq!(store.get(1, "INBOX"), Some(FolderSyncStatus::SyncingNeedResync));
}

#[tokio::test]
async fn lost_compare_and_set_re_decides_from_fresh_status() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::Synced);
    store.set(1, "Sent", FolderSyncStatus::Syncing);
    // A worker picks INBOX up between the read and the write.
    store.interfere_once(|folders| {
        folders.insert((1, "INBOX".to_string()), FolderSyncStatus::Syncing);
    });
    let runner = RecordingRunner::new();
    let engine = engine(&store, &runner);

    let report = engine
        .handle_change(&account(1, "a@example.com"), &folders(&["INBOX"]))
        .await
        .unwrap();

    assert_eq!(
        report.outcome("INBOX"),
        Some(FolderOutcome::Marked(FolderSyncStatus::SyncingNeedResync))
    );
    assert_eq!(store.get(1, "INBOX"), Some(FolderSyncStatus::SyncingNeedResync));
    assert_eq!(store.cas_calls(), 2);
}

#[tokio::test]
async fn per_folder_failures_are_collected() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::Syncing);
    store.set(1, "Sent", FolderSyncStatus::Synced);
    store.break_folder("Sent");
    let runner = RecordingRunner::new();
    let engine = engine(&store, &runner);

    let report = engine
        .handle_change(&account(1, "a@example.com"), &folders(&["INBOX", "Sent"]))
        .await
        .unwrap();

    assert_eq!(
        report.outcome("INBOX"),
        Some(FolderOutcome::Marked(FolderSyncStatus::SyncingNeedResync))
    );
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].folder, "Sent");
    assert!(matches!(report.failures[0].error, ResyncError::Store(_)));
}

#[tokio::test]
async fn repeated_trigger_for_running_folder_is_coalesced() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::Synced);
    let runner = RecordingRunner::gated();
    let engine = engine(&store, &runner);
    let account = account(1, "a@example.com");

    let first = engine.handle_change(&account, &folders(&["INBOX"])).await.unwrap();
    runner.wait_for_runs(1).await;
    let second = engine.handle_change(&account, &folders(&["INBOX"])).await.unwrap();

    assert_eq!(first.outcome("INBOX"), Some(FolderOutcome::SyncStarted));
    assert_eq!(second.outcome("INBOX"), Some(FolderOutcome::Coalesced));
    runner.release(2);
    engine.invoker().wait_idle().await;
    assert_eq!(runner.runs(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_for_one_folder_start_a_single_sync() {
    let store = Arc::new(FakeStatusStore::new());
    store.set(1, "INBOX", FolderSyncStatus::Synced);
    let runner = RecordingRunner::gated();
    let engine = engine(&store, &runner);
    let account = account(1, "a@example.com");

    let triggers: Vec<_> = (0..50)
        .map(|_| {
            let engine = engine.clone();
            let account = account.clone();
            tokio::spawn(async move {
                engine
                    .handle_change(&account, &folders(&["INBOX"]))
                    .await
                    .unwrap()
                    .outcome("INBOX")
            })
        })
        .collect();
    let mut outcomes = Vec::new();
    for trigger in triggers {
        outcomes.push(trigger.await.unwrap());
    }

    let started = outcomes
        .iter()
        .filter(|outcome| **outcome == Some(FolderOutcome::SyncStarted))
        .count();
    let coalesced = outcomes
        .iter()
        .filter(|outcome| **outcome == Some(FolderOutcome::Coalesced))
        .count();
    assert_eq!(started, 1);
    assert_eq!(coalesced, 49);
    runner.wait_for_runs(1).await;
    assert_eq!(engine.invoker().in_flight(), 1);

    runner.release(2);
    engine.invoker().wait_idle().await;
    assert_eq!(runner.runs(), 2);
    assert_eq!(engine.invoker().in_flight(), 0);
    assert_eq!(store.get(1, "INBOX"), Some(FolderSyncStatus::Synced));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_markers_on_sqlite_apply_once() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteStatusStore::from_pool(pool));
    store.init().await.unwrap();
    let account_id = sqlx::query(
        "INSERT INTO accounts (email, password, imap_host) VALUES ('a@example.com', 'x', 'imap')",
    )
    .execute(store.pool())
    .await
    .unwrap()
    .last_insert_rowid();
    for (name, status) in [
        ("INBOX", FolderSyncStatus::Synced),
        ("Sent", FolderSyncStatus::Syncing),
    ] {
        sqlx::query("INSERT INTO folders (account_id, name, sync_status) VALUES (?, ?, ?)")
            .bind(account_id)
            .bind(name)
            .bind(status.as_str())
            .execute(store.pool())
            .await
            .unwrap();
    }
    let runner = RecordingRunner::new();
    let engine = ResyncEngine::new(store.clone(), SyncInvoker::new(runner.clone()));
    let account = account(account_id, "a@example.com");

    let triggers: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            let account = account.clone();
            tokio::spawn(async move {
                engine
                    .handle_change(&account, &folders(&["INBOX"]))
                    .await
                    .unwrap()
                    .outcome("INBOX")
            })
        })
        .collect();
    let mut outcomes = Vec::new();
    for trigger in triggers {
        outcomes.push(trigger.await.unwrap());
    }

    let marked = outcomes
        .iter()
        .filter(|outcome| {
            **outcome == Some(FolderOutcome::Marked(FolderSyncStatus::SyncedNeedResync))
        })
        .count();
    let unchanged = outcomes
        .iter()
        .filter(|outcome| **outcome == Some(FolderOutcome::Unchanged))
        .count();
    assert_eq!(marked, 1);
    assert_eq!(unchanged, 19);
    let info = store
        .folder_sync_info(account_id, "INBOX")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.status, FolderSyncStatus::SyncedNeedResync);
    assert_eq!(runner.runs(), 0);
}
