
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use standings_engine::config::EngineConfig;
use standings_engine::controller::{AutomationController, AutomationState};
use standings_engine::error::EngineError;
use standings_engine::health::HealthStatus;
use standings_engine::scheduler::{JobStatus, Priority};
use standings_engine::standings::{Game, TableKey};
use standings_engine::storage::{MemoryGameSource, MemoryStorage};
use test_harness::{assert_eventually, fast_config, league, league_games, SlowGameSource};

async fn controller_with(
    config: EngineConfig,
    games: Vec<Game>,
) -> (Arc<AutomationController>, Arc<MemoryGameSource>) {
    let source = Arc::new(MemoryGameSource::with_games(games).await);
    let controller = AutomationController::new(
        config,
        source.clone(),
        Arc::new(MemoryStorage::new()),
    )
    .unwrap();
    (Arc::new(controller), source)
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let result = AutomationController::new(
        EngineConfig::default().with_concurrency(0),
        Arc::new(MemoryGameSource::new()),
        Arc::new(MemoryStorage::new()),
    );
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_starts_stopped_and_rejects_triggers() {
    let (controller, _) = controller_with(fast_config(), league_games(&league())).await;
    assert_eq!(controller.state(), AutomationState::Stopped);

    let result = controller
        .trigger_recalculation("kreisliga-a", "2024-25", None, None)
        .await;
    assert!(matches!(result, Err(EngineError::AutomationStopped)));
    assert!(matches!(
        controller.pause(),
        Err(EngineError::AutomationStopped)
    ));
    assert!(matches!(
        controller.rollback(&uuid::Uuid::new_v4()).await,
        Err(EngineError::AutomationStopped)
    ));
}

#[tokio::test]
async fn test_manual_trigger_is_processed() {
    let key = league();
    let (controller, _) = controller_with(fast_config(), league_games(&key)).await;
    controller.start().await.unwrap();

    let job_id = controller
        .trigger_recalculation(&key.league, &key.season, None, Some("fix".to_string()))
        .await
        .unwrap();

    assert_eventually(
        || async { controller.live_table(&key).await.is_ok() },
        Duration::from_secs(5),
        "live table should be computed",
    )
    .await;

    let job = controller.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.priority, Priority::High);
    let history = controller.history(&key.league, 10).await.unwrap();
    assert_eq!(history.len(), 1);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_transitions_are_idempotent() {
    let (controller, _) = controller_with(fast_config(), Vec::new()).await;

    controller.start().await.unwrap();
    controller.start().await.unwrap();
    assert_eq!(controller.state(), AutomationState::Running);

    controller.pause().unwrap();
    controller.pause().unwrap();
    assert_eq!(controller.state(), AutomationState::Paused);

    controller.resume().unwrap();
    controller.resume().unwrap();
    assert_eq!(controller.state(), AutomationState::Running);

    controller.stop();
    controller.stop();
    assert_eq!(controller.state(), AutomationState::Stopped);

    controller.start().await.unwrap();
    assert_eq!(controller.state(), AutomationState::Running);

    controller.shutdown().await;
    assert!(matches!(
        controller.start().await,
        Err(EngineError::AutomationStopped)
    ));
}

#[tokio::test]
async fn test_paused_controller_queues_then_drains_in_priority_order() {
    let a = TableKey::new("kreisliga-a", "2024-25");
    let b = TableKey::new("kreisliga-b", "2024-25");
    let mut games = league_games(&a);
    games.extend(league_games(&b));
    let config = fast_config().with_concurrency(1);
    let (controller, _) = controller_with(config, games).await;
    controller.start().await.unwrap();
    controller.pause().unwrap();

    let low = controller
        .trigger_recalculation(&a.league, &a.season, Some(Priority::Low), None)
        .await
        .unwrap();
    let critical = controller
        .trigger_recalculation(&b.league, &b.season, Some(Priority::Critical), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = controller.queue_status().await;
    assert_eq!(status.pending, 2);
    assert_eq!(status.processing, 0);

    controller.resume().unwrap();
    assert_eventually(
        || async { controller.queue_status().await.completed == 2 },
        Duration::from_secs(5),
        "backlog should drain after resume",
    )
    .await;

    let low_job = controller.job(&low).await.unwrap();
    let critical_job = controller.job(&critical).await.unwrap();
    assert!(critical_job.started_at.unwrap() <= low_job.started_at.unwrap());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_triggers_for_pending_table_coalesce() {
    let key = league();
    let (controller, _) = controller_with(fast_config(), league_games(&key)).await;
    controller.start().await.unwrap();
    controller.pause().unwrap();

    let game = Game::completed("g1", &key, "Ajax", "Borussia", 2, 1);
    let first = controller.game_saved(&game).await.unwrap();
    let second = controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();

    assert!(!first.coalesced);
    assert_eq!(second, first.job_id);
    let pending = controller.pending_jobs().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, Priority::High);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_one_execution_per_table_at_a_time() {
    let key = league();
    let source = Arc::new(SlowGameSource::with_games(league_games(&key), 150).await);
    let controller = Arc::new(
        AutomationController::new(
            fast_config().with_concurrency(4),
            source.clone(),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap(),
    );
    controller.start().await.unwrap();

    let first = controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    assert_eventually(
        || async { controller.queue_status().await.processing == 1 },
        Duration::from_secs(5),
        "first job should start",
    )
    .await;

    // While processing: a new pending job, not a second execution.
    let second = controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    let third = controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    assert_ne!(second, first);
    assert_eq!(third, second);

    let status = controller.queue_status().await;
    assert_eq!(status.processing, 1);
    assert_eq!(status.pending, 1);

    assert_eventually(
        || async { controller.queue_status().await.completed == 2 },
        Duration::from_secs(5),
        "both jobs should complete",
    )
    .await;
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);

    let first_job = controller.job(&first).await.unwrap();
    let second_job = controller.job(&second).await.unwrap();
    assert!(second_job.started_at.unwrap() >= first_job.completed_at.unwrap());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_cancel_through_controller() {
    let key = league();
    let (controller, _) = controller_with(fast_config(), league_games(&key)).await;
    controller.start().await.unwrap();
    controller.pause().unwrap();

    let job_id = controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    let cancelled = controller.cancel(&job_id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(controller.pending_jobs().await.is_empty());

    assert!(matches!(
        controller.cancel(&job_id).await,
        Err(EngineError::NotFound(_))
    ));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_rollback_restores_previous_table() {
    let key = league();
    let (controller, source) = controller_with(fast_config(), league_games(&key)).await;
    controller.start().await.unwrap();

    controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    assert_eventually(
        || async { controller.live_table(&key).await.is_ok() },
        Duration::from_secs(5),
        "first table",
    )
    .await;
    let original = controller.live_table(&key).await.unwrap();

    let changed = Game::completed("g4", &key, "Celtic", "Borussia", 3, 2);
    source.upsert_game(changed.clone()).await;
    controller.game_saved(&changed).await.unwrap();
    assert_eventually(
        || async { controller.list_snapshots(&key).await.unwrap().len() == 1 },
        Duration::from_secs(5),
        "snapshot before second table",
    )
    .await;
    assert_eventually(
        || async { controller.queue_status().await.completed == 2 },
        Duration::from_secs(5),
        "second job",
    )
    .await;
    assert_ne!(controller.live_table(&key).await.unwrap().entries, original.entries);

    let snapshot = controller.list_snapshots(&key).await.unwrap()[0].id;
    controller.pause().unwrap();
    controller.rollback(&snapshot).await.unwrap();

    assert_eq!(*controller.live_table(&key).await.unwrap(), *original);
    let history = controller.history(&key.league, 1).await.unwrap();
    assert!(history[0].trigger.is_rollback());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_sweep_enqueues_every_known_table() {
    let a = TableKey::new("kreisliga-a", "2024-25");
    let b = TableKey::new("kreisliga-b", "2024-25");
    let mut games = league_games(&a);
    games.extend(league_games(&b));
    let (controller, _) = controller_with(fast_config(), games).await;
    controller.start().await.unwrap();
    controller.pause().unwrap();

    assert_eq!(controller.sweep_now().await.unwrap(), 2);
    assert_eq!(controller.sweep_now().await.unwrap(), 2);

    let pending = controller.pending_jobs().await;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|j| j.priority == Priority::Low));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_periodic_sweep_recomputes_tables() {
    let key = league();
    let config = fast_config().with_sweep_interval_secs(1);
    let (controller, _) = controller_with(config, league_games(&key)).await;
    controller.start().await.unwrap();

    assert_eventually(
        || async { controller.live_table(&key).await.is_ok() },
        Duration::from_secs(5),
        "sweep should compute the table",
    )
    .await;

    controller.shutdown().await;
}

#[tokio::test]
async fn test_health_reflects_failures() {
    let key = league();
    let mut roster_games = league_games(&key);
    // Plays itself: invalid input, fails without retry.
    roster_games.push(Game::completed("g9", &key, "Ajax", "Ajax", 1, 1));
    let (controller, _) = controller_with(fast_config(), roster_games).await;
    controller.start().await.unwrap();

    let healthy = controller.health().await.unwrap();
    assert_eq!(healthy.status, HealthStatus::Healthy);
    assert_eq!(healthy.automation, AutomationState::Running);

    controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    assert_eventually(
        || async { controller.queue_status().await.failed == 1 },
        Duration::from_secs(5),
        "job should fail",
    )
    .await;

    let report = controller.health().await.unwrap();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.recent_failures, 1);
    assert!(report.last_success.is_empty());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let key = league();
    let source = Arc::new(SlowGameSource::with_games(league_games(&key), 200).await);
    let controller = AutomationController::new(
        fast_config(),
        source.clone(),
        Arc::new(MemoryStorage::new()),
    )
    .unwrap();
    controller.start().await.unwrap();

    let job_id = controller
        .trigger_recalculation(&key.league, &key.season, None, None)
        .await
        .unwrap();
    assert_eventually(
        || async { source.calls.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(5),
        "job should start",
    )
    .await;

    controller.shutdown().await;

    assert_eq!(
        controller.job(&job_id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(controller.state(), AutomationState::Stopped);
}
