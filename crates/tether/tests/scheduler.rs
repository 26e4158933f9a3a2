//! Reuse policies against real worker processes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tether::{
    CommandSpawner, CoordinatorConfig, ReusePolicy, ScheduleError, Scheduler, SchedulerConfig,
    remote_method,
};

remote_method! {
    Pid = "pid", () -> u32
}

remote_method! {
    Slow = "slow", (u64,) -> String
}

fn config(policy: ReusePolicy) -> SchedulerConfig {
    let coordinator = CoordinatorConfig::new(CommandSpawner::new(env!(
        "CARGO_BIN_EXE_tether-fixture-worker"
    )))
    .with_handshake_timeout(Duration::from_secs(30));
    SchedulerConfig::new(coordinator)
        .with_policy(policy)
        .with_max_workers(2)
}

#[tokio::test]
async fn shared_policy_serves_every_job_from_one_worker() {
    let scheduler = Arc::new(Scheduler::new(config(ReusePolicy::Shared)));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let scheduler = Arc::clone(&scheduler);
        tasks.push(tokio::spawn(async move {
            scheduler.call::<Pid>(()).await.unwrap()
        }));
    }
    let mut pids = HashSet::new();
    for task in tasks {
        pids.insert(task.await.unwrap());
    }
    assert_eq!(pids.len(), 1);

    scheduler.shutdown().await;
    assert!(matches!(
        scheduler.call::<Pid>(()).await,
        Err(ScheduleError::ShutDown)
    ));
}

#[tokio::test]
async fn per_call_policy_spawns_a_worker_per_job() {
    let scheduler = Scheduler::new(config(ReusePolicy::PerCall));

    let first = scheduler.call::<Pid>(()).await.unwrap();
    let second = scheduler.call::<Pid>(()).await.unwrap();
    assert_ne!(first, second);

    let coordinator = scheduler.run(|c| async move { Ok(c) }).await.unwrap();
    assert!(!coordinator.is_alive());
}

#[tokio::test]
async fn jobs_beyond_the_limit_wait_their_turn() {
    let scheduler = Arc::new(Scheduler::new(config(ReusePolicy::Shared)));
    assert_eq!(scheduler.limit(), 2);

    let started = std::time::Instant::now();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let scheduler = Arc::clone(&scheduler);
        tasks.push(tokio::spawn(async move {
            scheduler.call::<Slow>((200,)).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "slow");
    }
    // Four 200ms jobs, two at a time.
    assert!(started.elapsed() >= Duration::from_millis(400));

    scheduler.shutdown().await;
}
