//! Queue admission, persistence and self-healing.

#![cfg(feature = "robot")]

use alembic::prelude::*;
use alembic::{Activity, ActivityType, QUEUE_URI, RecordKind};
use std::time::Duration;

fn quick_lab(max_length: usize) -> Arc<Lab> {
    Lab::with_settings(
        LabSettings::default()
            .with_queue_max_length(max_length)
            .with_queue_settle_delay(0.0)
            .with_queue_tick_interval(1.0),
    )
}

/// `create -> wait`, waiting `seconds` of (virtual) time.
async fn waiting_experiment(lab: &Arc<Lab>, user: &User, seconds: f64) -> Arc<Experiment> {
    let protocol = Protocol::new(lab).await.unwrap();
    let create = lab.create_process("Create").await.unwrap();
    let wait = lab.create_process("Wait").await.unwrap();
    wait.set_param("waiting_time", seconds).unwrap();
    protocol.add_process("create", &create).unwrap();
    protocol.add_process("wait", &wait).unwrap();
    protocol.connect(&create, "robot", &wait, "robot").unwrap();
    Experiment::new(lab, Study::new("Queued"), user.clone(), Some(protocol))
        .await
        .unwrap()
}

async fn settle(queue: &Queue) {
    for _ in 0..100 {
        if queue.in_flight().await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("the in-flight experiment never settled");
}

#[tokio::test]
async fn test_full_queue_rejects_entries() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();

    for _ in 0..10 {
        let experiment = waiting_experiment(&lab, &user, 1.0).await;
        queue.add(QueueEntry::new(&experiment, &user), false).await.unwrap();
    }
    let extra = waiting_experiment(&lab, &user, 1.0).await;
    let err = queue.add(QueueEntry::new(&extra, &user), false).await.unwrap_err();
    assert!(matches!(err, EngineError::QueueFull(10)));
    assert_eq!(queue.len(), 10);
    assert_eq!(lab.store().list(RecordKind::QueueEntry).await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_orphaned_entries_are_dropped() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();

    let mut experiments = Vec::new();
    for _ in 0..3 {
        let experiment = waiting_experiment(&lab, &user, 1.0).await;
        queue.add(QueueEntry::new(&experiment, &user), false).await.unwrap();
        experiments.push(experiment);
    }
    let uris = queue.entry_uris();

    lab.store().delete(RecordKind::QueueEntry, &uris[0]).await.unwrap();
    lab.store()
        .delete(RecordKind::Experiment, experiments[1].uri())
        .await
        .unwrap();

    let head = queue.next().await.unwrap().unwrap();
    assert_eq!(head.uri, uris[2]);
    assert_eq!(head.experiment_uri, experiments[2].uri());
    assert_eq!(queue.entry_uris(), vec![uris[2].clone()]);
    assert!(!lab.store().exists(RecordKind::QueueEntry, &uris[1]).await.unwrap());
}

#[tokio::test]
async fn test_an_experiment_is_queued_once() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();
    let experiment = waiting_experiment(&lab, &user, 1.0).await;

    let entry = QueueEntry::new(&experiment, &user);
    queue.add(entry.clone(), false).await.unwrap();
    queue.add(entry, false).await.unwrap();
    assert_eq!(queue.len(), 1);

    let err = queue
        .add(QueueEntry::new(&experiment, &user), false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExperimentState { .. }));

    assert!(queue.remove(experiment.uri()).await.unwrap());
    assert!(queue.is_empty());
    assert!(!queue.remove(experiment.uri()).await.unwrap());
}

#[tokio::test]
async fn test_queue_survives_a_reload() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();
    for _ in 0..2 {
        let experiment = waiting_experiment(&lab, &user, 1.0).await;
        queue.add(QueueEntry::new(&experiment, &user), false).await.unwrap();
    }

    let reloaded = Queue::load(&lab).await.unwrap();
    assert_eq!(reloaded.entry_uris(), queue.entry_uris());
    assert_eq!(reloaded.max_length(), 10);
    assert!(!reloaded.is_active());

    let entries = reloaded.entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.user_uri == user.uri));
}

#[tokio::test(start_paused = true)]
async fn test_one_experiment_in_flight_at_a_time() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();
    let first = waiting_experiment(&lab, &user, 5.0).await;
    let second = waiting_experiment(&lab, &user, 5.0).await;
    queue.add(QueueEntry::new(&first, &user), false).await.unwrap();
    queue.add(QueueEntry::new(&second, &user), false).await.unwrap();

    queue.tick().await.unwrap();
    queue.tick().await.unwrap();
    assert_eq!(queue.in_flight().await.as_deref(), Some(first.uri()));
    assert!(!second.is_running().await.unwrap());
    assert!(!second.protocol().is_running());

    settle(&queue).await;
    assert!(first.is_finished().await.unwrap());
    assert!(!second.protocol().is_running());

    // Drops the finished head, then starts the next one.
    queue.tick().await.unwrap();
    assert_eq!(queue.len(), 1);
    queue.tick().await.unwrap();
    assert_eq!(queue.in_flight().await.as_deref(), Some(second.uri()));

    settle(&queue).await;
    queue.tick().await.unwrap();
    assert!(second.is_finished().await.unwrap());
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queued_experiment_runs_once_after_its_handle_is_dropped() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();
    let experiment_uri = {
        let protocol = Protocol::new(&lab).await.unwrap();
        let create = lab.create_process("Create").await.unwrap();
        let eat = lab.create_process("Eat").await.unwrap();
        protocol.add_process("create", &create).unwrap();
        protocol.add_process("eat", &eat).unwrap();
        protocol.connect(&create, "robot", &eat, "robot").unwrap();
        let experiment = Experiment::new(&lab, Study::new("Detached"), user.clone(), Some(protocol))
            .await
            .unwrap();
        queue.add(QueueEntry::new(&experiment, &user), false).await.unwrap();
        experiment.uri().to_string()
    };

    for _ in 0..4 {
        queue.tick().await.unwrap();
        settle(&queue).await;
    }

    assert!(queue.is_empty());
    let starts = Activity::list_for(&lab, &experiment_uri)
        .await
        .unwrap()
        .into_iter()
        .filter(|activity| activity.activity_type == ActivityType::Start)
        .count();
    assert_eq!(starts, 1);
    let eat_jobs = lab
        .store()
        .list(RecordKind::Job)
        .await
        .unwrap()
        .into_iter()
        .filter(|job| job.str_field("process_type") == "Eat")
        .count();
    assert_eq!(eat_jobs, 1);

    let reloaded = lab.experiment(&experiment_uri).await.unwrap();
    assert!(reloaded.is_finished().await.unwrap());
    assert!(reloaded.protocol().is_finished());
}

#[tokio::test]
async fn test_experiments_that_cannot_run_leave_the_queue() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();
    let archived = waiting_experiment(&lab, &user, 1.0).await;
    archived.archive(true).await.unwrap();
    queue.add(QueueEntry::new(&archived, &user), false).await.unwrap();

    queue.tick().await.unwrap();
    assert!(queue.is_empty());
    assert!(queue.in_flight().await.is_none());
    assert!(!archived.protocol().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_auto_start_activates_the_queue() {
    let lab = quick_lab(10);
    let user = User::new("ada");
    let queue = lab.queue().await.unwrap();
    let experiment = waiting_experiment(&lab, &user, 3.0).await;

    queue.add(QueueEntry::new(&experiment, &user), true).await.unwrap();
    assert!(queue.is_active());

    let mut drained = false;
    for _ in 0..100 {
        if queue.is_empty() && experiment.is_finished().await.unwrap() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(drained);

    queue.deinit().await.unwrap();
    assert!(!queue.is_active());
    let record = lab
        .store()
        .get_by_uri(RecordKind::Queue, QUEUE_URI)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.body["is_active"], false);
    assert_eq!(record.body["data"]["jobs"].as_array().unwrap().len(), 0);
}
