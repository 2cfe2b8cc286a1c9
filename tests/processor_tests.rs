
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use standings_engine::config::RetentionPolicy;
use standings_engine::controller::AutomationState;
use standings_engine::scheduler::{CalculationTrigger, JobId, JobStatus};
use standings_engine::standings::{Game, TableKey};
use standings_engine::storage::{GameSource, MemoryGameSource, MemoryStorage, Storage};
use test_harness::{
    fast_config, league, league_games, test_processor, FlakyStorage, SlowGameSource,
    TestProcessor,
};

async fn enqueue_manual(tp: &TestProcessor, key: &TableKey) -> JobId {
    tp.queue
        .write()
        .await
        .enqueue(CalculationTrigger::manual(key.clone(), None), None)
        .unwrap()
        .job_id
}

/// Run jobs until one reaches a terminal state, waiting out retry delays.
async fn run_to_finish(tp: &TestProcessor) -> JobStatus {
    for _ in 0..100 {
        match tp.processor.run_next().await {
            Some(JobStatus::Pending) | None => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Some(status) => return status,
        }
    }
    panic!("job did not finish");
}

#[tokio::test]
async fn test_job_writes_live_table_and_history() {
    let key = league();
    let games = Arc::new(MemoryGameSource::with_games(league_games(&key)).await);
    let storage = Arc::new(MemoryStorage::new());
    let tp = test_processor(fast_config(), games, storage.clone());

    let job_id = enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Completed));

    let table = storage.live_table(&key).await.unwrap().unwrap();
    assert_eq!(table.entries.len(), 3);
    assert_eq!(table.entries[0].team, "Ajax");
    assert!(matches!(table.trigger, CalculationTrigger::Manual { .. }));

    let history = storage.history(&key.league, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].job_id, Some(job_id));
    assert_eq!(history[0].status, JobStatus::Completed);
    assert_eq!(history[0].entries_updated, 3);
    assert_eq!(history[0].attempts, 1);

    // Nothing to snapshot on the first computation.
    assert!(storage.snapshots_for(&key).await.unwrap().is_empty());

    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_previous_table_is_snapshotted_before_replacement() {
    let key = league();
    let games = Arc::new(MemoryGameSource::with_games(league_games(&key)).await);
    let storage = Arc::new(MemoryStorage::new());
    let tp = test_processor(fast_config(), games.clone(), storage.clone());

    enqueue_manual(&tp, &key).await;
    tp.processor.run_next().await;
    let first = storage.live_table(&key).await.unwrap().unwrap();

    games
        .upsert_game(Game::completed("g4", &key, "Celtic", "Borussia", 3, 2))
        .await;
    let trigger = CalculationTrigger::GameResult {
        key: key.clone(),
        game_id: "g4".to_string(),
    };
    tp.queue.write().await.enqueue(trigger.clone(), None).unwrap();
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Completed));

    let snapshots = storage.snapshots_for(&key).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].reason, trigger);
    let saved = storage.snapshot(&snapshots[0].id).await.unwrap().unwrap();
    assert_eq!(saved.table, *first);

    let second = storage.live_table(&key).await.unwrap().unwrap();
    assert_ne!(second.entries, first.entries);
}

#[tokio::test]
async fn test_retry_after_transient_failure_gives_identical_table() {
    let key = league();

    let clean_storage = Arc::new(MemoryStorage::new());
    let clean = test_processor(
        fast_config(),
        Arc::new(MemoryGameSource::with_games(league_games(&key)).await),
        clean_storage.clone(),
    );
    enqueue_manual(&clean, &key).await;
    assert_eq!(clean.processor.run_next().await, Some(JobStatus::Completed));

    let flaky = Arc::new(FlakyStorage::failing(1));
    let tp = test_processor(
        fast_config(),
        Arc::new(MemoryGameSource::with_games(league_games(&key)).await),
        flaky.clone(),
    );
    let job_id = enqueue_manual(&tp, &key).await;

    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Pending));
    assert_eq!(run_to_finish(&tp).await, JobStatus::Completed);

    let expected = clean_storage.live_table(&key).await.unwrap().unwrap();
    let actual = flaky.live_table(&key).await.unwrap().unwrap();
    assert_eq!(actual.entries, expected.entries);

    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.attempt_errors.len(), 1);
    assert_eq!(job.attempt_errors[0].kind, "storage_error");

    let history = flaky.history(&key.league, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].attempts, 2);
    assert!(history[0].is_success());
}

#[tokio::test]
async fn test_exhausted_retries_fail_with_history() {
    let key = league();
    let storage = Arc::new(FlakyStorage::default());
    let config = fast_config().with_max_retries(2);
    let tp = test_processor(
        config,
        Arc::new(MemoryGameSource::with_games(league_games(&key)).await),
        storage.clone(),
    );

    enqueue_manual(&tp, &key).await;
    tp.processor.run_next().await;
    let before = storage.live_table(&key).await.unwrap().unwrap();

    storage.always_fail.store(true, Ordering::SeqCst);
    storage.write_attempts.store(0, Ordering::SeqCst);
    let job_id = enqueue_manual(&tp, &key).await;

    assert_eq!(run_to_finish(&tp).await, JobStatus::Failed);
    assert_eq!(storage.write_attempts.load(Ordering::SeqCst), 3);

    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_errors.len(), 3);

    let history = storage.history(&key.league, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, JobStatus::Failed);
    assert_eq!(history[0].error_kind.as_deref(), Some("storage_error"));
    assert_eq!(history[0].attempts, 3);

    // Live table untouched; snapshots staged by failed attempts discarded.
    let after = storage.live_table(&key).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(storage.snapshots_for(&key).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_leaves_live_table_untouched() {
    let key = league();
    let games = Arc::new(SlowGameSource::with_games(league_games(&key), 0).await);
    let storage = Arc::new(MemoryStorage::new());
    let config = fast_config().with_job_timeout_ms(50).with_max_retries(0);
    let tp = test_processor(config, games.clone(), storage.clone());

    enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Completed));
    let before = storage.live_table(&key).await.unwrap().unwrap();

    games.set_delay_ms(500);
    let job_id = enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Failed));

    let after = storage.live_table(&key).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert!(job.attempt_errors[0].is_timeout());
    let history = storage.history(&key.league, 1).await.unwrap();
    assert!(history[0].is_timeout());
}

#[tokio::test]
async fn test_timeout_is_retried() {
    let key = league();
    let games = Arc::new(SlowGameSource::with_games(league_games(&key), 500).await);
    let storage = Arc::new(MemoryStorage::new());
    let config = fast_config().with_job_timeout_ms(50).with_max_retries(1);
    let tp = test_processor(config, games.clone(), storage.clone());

    enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Pending));

    games.set_delay_ms(0);
    assert_eq!(run_to_finish(&tp).await, JobStatus::Completed);
    assert!(storage.live_table(&key).await.unwrap().is_some());
    assert_eq!(games.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_input_is_not_retried() {
    let key = league();
    let games = Arc::new(MemoryGameSource::with_games(league_games(&key)).await);
    games
        .set_roster(key.clone(), vec!["Ajax".to_string(), "Borussia".to_string()])
        .await;
    let storage = Arc::new(MemoryStorage::new());
    let tp = test_processor(fast_config(), games, storage.clone());

    let job_id = enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Failed));

    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert_eq!(job.retry_count, 0);
    let history = storage.history(&key.league, 10).await.unwrap();
    assert_eq!(history[0].error_kind.as_deref(), Some("invalid_input"));
}

#[tokio::test]
async fn test_no_games_writes_nothing() {
    let key = league();
    let storage = Arc::new(MemoryStorage::new());
    let tp = test_processor(fast_config(), Arc::new(MemoryGameSource::new()), storage.clone());

    enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Completed));

    assert!(storage.live_table(&key).await.unwrap().is_none());
    let history = storage.history(&key.league, 10).await.unwrap();
    assert_eq!(history[0].entries_updated, 0);
}

#[tokio::test]
async fn test_deleting_last_game_empties_table() {
    let key = league();
    let games = Arc::new(
        MemoryGameSource::with_games(vec![Game::completed("g1", &key, "Ajax", "Borussia", 1, 0)])
            .await,
    );
    let storage = Arc::new(MemoryStorage::new());
    let tp = test_processor(fast_config(), games.clone(), storage.clone());

    enqueue_manual(&tp, &key).await;
    tp.processor.run_next().await;

    games.remove_game(&key, "g1").await.unwrap();
    assert!(games.tables().await.unwrap().is_empty());
    enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Completed));

    let table = storage.live_table(&key).await.unwrap().unwrap();
    assert!(table.is_empty());
    let snapshots = storage.snapshots_for(&key).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].entries, 2);
}

#[tokio::test]
async fn test_snapshots_are_pruned_after_each_job() {
    let key = league();
    let config = fast_config().with_retention(RetentionPolicy::keep_last(2));
    let storage = Arc::new(MemoryStorage::new());
    let tp = test_processor(
        config,
        Arc::new(MemoryGameSource::with_games(league_games(&key)).await),
        storage.clone(),
    );

    for _ in 0..5 {
        enqueue_manual(&tp, &key).await;
        assert_eq!(tp.processor.run_next().await, Some(JobStatus::Completed));
    }

    assert_eq!(storage.snapshots_for(&key).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_history_append_retries_the_job() {
    let key = league();
    let storage = Arc::new(FlakyStorage::failing_history(1));
    let tp = test_processor(
        fast_config(),
        Arc::new(MemoryGameSource::with_games(league_games(&key)).await),
        storage.clone(),
    );
    let job_id = enqueue_manual(&tp, &key).await;

    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Pending));
    assert_eq!(run_to_finish(&tp).await, JobStatus::Completed);

    let history = storage.history(&key.league, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].job_id, Some(job_id));
    assert_eq!(history[0].attempts, 2);
    assert!(history[0].is_success());

    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert_eq!(job.attempt_errors[0].kind, "storage_error");
    assert_eq!(storage.live_table(&key).await.unwrap().unwrap().entries.len(), 3);
}

#[tokio::test]
async fn test_failure_is_recorded_despite_history_hiccup() {
    let key = league();
    let games = Arc::new(MemoryGameSource::with_games(league_games(&key)).await);
    games
        .set_roster(key.clone(), vec!["Ajax".to_string(), "Borussia".to_string()])
        .await;
    let storage = Arc::new(FlakyStorage::failing_history(1));
    let tp = test_processor(fast_config().with_max_retries(2), games, storage.clone());

    enqueue_manual(&tp, &key).await;
    assert_eq!(tp.processor.run_next().await, Some(JobStatus::Failed));

    let history = storage.history(&key.league, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, JobStatus::Failed);
    assert_eq!(history[0].error_kind.as_deref(), Some("invalid_input"));
}

#[tokio::test]
async fn test_worker_does_not_dequeue_after_pause_during_lock_wait() {
    let key = league();
    let tp = test_processor(
        fast_config(),
        Arc::new(MemoryGameSource::with_games(league_games(&key)).await),
        Arc::new(MemoryStorage::new()),
    );
    let (state_tx, state_rx) = watch::channel(AutomationState::Running);
    let shutdown = CancellationToken::new();

    let mut queue = tp.queue.write().await;
    let job_id = queue
        .enqueue(CalculationTrigger::manual(key.clone(), None), None)
        .unwrap()
        .job_id;

    let worker = tokio::spawn(tp.processor.clone().run_worker(0, state_rx, shutdown.clone()));
    // Let the worker pass its state check and block on the queue lock.
    tokio::time::sleep(Duration::from_millis(50)).await;
    state_tx.send(AutomationState::Paused).unwrap();
    drop(queue);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = tp.queue.read().await.get_job(&job_id).cloned().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    shutdown.cancel();
    worker.await.unwrap();
}
