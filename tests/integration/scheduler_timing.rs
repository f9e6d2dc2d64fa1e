//! Scheduler ordering and timing behavior
//!
//! All tests run under paused virtual time: sleeps auto-advance, so
//! multi-second schedules resolve in milliseconds while deadlines stay
//! exact.

use std::time::Duration;

use metricbus::router::table::RouteSpec;
use metricbus::router::{Router, RouterOptions};
use metricbus::scheduler::queue::Job;
use metricbus::scheduler::{Scheduler, SchedulerConfig};
use metricbus::util::Clock;

use super::helpers::*;

#[tokio::test(start_paused = true)]
async fn test_dispatches_in_nondecreasing_deadline_order() {
    let (target, out) = socket_pair("scheduler.out", 64);
    let scheduler = Scheduler::new(target, SchedulerConfig::default());
    let handle = scheduler.handle();
    let clock = Clock::new();

    // Inserted out of order, with one-shot-ish huge intervals so each job
    // fires once inside the observation window.
    let base = clock.now_us();
    let offsets_us = [900_000, 100_000, 500_000, 300_000, 700_000];
    let jobs: Vec<Job> = offsets_us
        .iter()
        .enumerate()
        .map(|(i, offset)| {
            Job::new(format!("agent-{i}").as_str(), vec![], base + offset, 3_600_000_000)
        })
        .collect();
    handle.add_jobs(jobs);

    tokio::spawn(scheduler.run());

    let mut timestamps = Vec::new();
    for _ in 0..offsets_us.len() {
        timestamps.push(recv_with_timeout(&out, Duration::from_secs(30)).await.timestamp);
    }

    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted, "dispatch order must follow deadlines");

    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_urgent_job_added_mid_wait_jumps_the_queue() {
    let (target, out) = socket_pair("scheduler.out", 64);
    let scheduler = Scheduler::new(target, SchedulerConfig::default());
    let handle = scheduler.handle();
    let clock = Clock::new();

    let base = clock.now_us();
    handle.add_jobs(vec![Job::new("slow", vec![], base + 10_000_000, 3_600_000_000)]);

    tokio::spawn(scheduler.run());

    // Let the loop settle into waiting on the 10s job, then add one due in
    // 300ms. The tick-based wait must notice it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.add_jobs(vec![Job::new("urgent", vec![], base + 300_000, 3_600_000_000)]);

    let first = recv_with_timeout(&out, Duration::from_secs(30)).await;
    assert_eq!(first.from.as_str(), "urgent");

    let second = recv_with_timeout(&out, Duration::from_secs(30)).await;
    assert_eq!(second.from.as_str(), "slow");

    handle.stop();
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_feeds_router_end_to_end() {
    // Full pipeline: scheduler -> router feed input -> agent-facing sink.
    let mut router = Router::new(
        "e2e",
        RouterOptions {
            error_socket: None,
            poll_timeout: Duration::from_millis(10),
        },
    );

    let (feed, feed_peer) = socket_pair("scheduler.feed", 64);
    let (agents, agents_out) = socket_pair("agents", 64);

    router
        .route(RouteSpec::from("plugin_exec", feed, agents))
        .unwrap();

    let shutdown = router.shutdown_handle();
    let router_task = tokio::spawn(router.run());

    let scheduler = Scheduler::new(feed_peer, SchedulerConfig::default());
    let handle = scheduler.handle();
    let clock = Clock::new();

    let due = clock.now_us() + 200_000;
    handle.add_jobs(vec![Job::new(
        "agent-9",
        b"run_plugin".to_vec(),
        due,
        3_600_000_000,
    )]);

    tokio::spawn(scheduler.run());

    let delivered = recv_with_timeout(&agents_out, Duration::from_secs(30)).await;
    assert_eq!(delivered.from.as_str(), "agent-9");
    assert_eq!(delivered.timestamp, due);
    assert_eq!(delivered.payload, b"run_plugin".to_vec());

    handle.stop();
    shutdown.shutdown();
    router_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_backlog_drains_without_extra_delay() {
    let (target, out) = socket_pair("scheduler.out", 64);
    let scheduler = Scheduler::new(target, SchedulerConfig::default());
    let handle = scheduler.handle();
    let clock = Clock::new();

    // Every deadline is already behind `now`; the whole backlog must fire
    // immediately, still in deadline order.
    let now = clock.now_us();
    let jobs: Vec<Job> = (1..=5u64)
        .map(|i| {
            Job::new(
                format!("agent-{i}").as_str(),
                vec![],
                now.saturating_sub(i * 1_000_000),
                3_600_000_000,
            )
        })
        .collect();
    handle.add_jobs(jobs);

    tokio::spawn(scheduler.run());

    let mut froms = Vec::new();
    for _ in 0..5 {
        froms.push(recv_with_timeout(&out, Duration::from_secs(5)).await.from);
    }

    // Oldest deadline first.
    assert_eq!(froms[0].as_str(), "agent-5");
    assert_eq!(froms[4].as_str(), "agent-1");

    handle.stop();
}
