use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use herald_core::scheduler::{CronScheduler, JobContext, JobHandler, JobRegistry};
use herald_core::types::{EntityId, JobSpec};
use herald_core::{HeraldError, Result};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Counter {
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for Counter {
    async fn run(&self, _ctx: JobContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

#[async_trait]
impl JobHandler for Failing {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        Err(HeraldError::Internal(format!("{} exploded", ctx.job_type)))
    }
}

struct Panicking;

#[async_trait]
impl JobHandler for Panicking {
    async fn run(&self, _ctx: JobContext) -> Result<()> {
        panic!("handler bug");
    }
}

/// Tracks how many firings are running at once.
#[derive(Default)]
struct Slow {
    running: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for Slow {
    async fn run(&self, _ctx: JobContext) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn every_second(job_type: &str) -> JobSpec {
    JobSpec::new(job_type).with_cron("* * * * * *")
}

fn scheduler_with(counter: &Arc<Counter>) -> CronScheduler {
    let mut registry = JobRegistry::new();
    registry
        .register("count", counter.clone())
        .register("fail", Arc::new(Failing))
        .register("panic", Arc::new(Panicking));
    CronScheduler::new(registry)
}

#[tokio::test]
async fn scheduled_job_fires() {
    let counter = Arc::new(Counter::default());
    let scheduler = scheduler_with(&counter);
    let owner = CancellationToken::new();

    let handle = scheduler
        .schedule_job(&EntityId::from("spring"), &every_second("count"), &owner)
        .expect("schedule");
    assert_eq!(handle.cron, "* * * * * *");

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    assert!(counter.runs.load(Ordering::SeqCst) >= 1);
    scheduler.shutdown();
}

#[tokio::test]
async fn stopped_job_never_fires() {
    let counter = Arc::new(Counter::default());
    let scheduler = scheduler_with(&counter);
    let owner = CancellationToken::new();
    let id = EntityId::from("spring");

    scheduler
        .schedule_job(&id, &every_second("count"), &owner)
        .expect("schedule");
    assert_eq!(scheduler.stop_jobs(&id), 1);
    assert_eq!(scheduler.stop_jobs(&id), 0);
    assert!(scheduler.jobs_for(&id).is_empty());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
    scheduler.shutdown();
}

#[tokio::test]
async fn cancelled_owner_silences_job() {
    let counter = Arc::new(Counter::default());
    let scheduler = scheduler_with(&counter);
    let owner = CancellationToken::new();

    scheduler
        .schedule_job(&EntityId::from("spring"), &every_second("count"), &owner)
        .expect("schedule");
    owner.cancel();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
    scheduler.shutdown();
}

#[tokio::test]
async fn failing_jobs_do_not_disturb_others() {
    let counter = Arc::new(Counter::default());
    let scheduler = scheduler_with(&counter);
    let owner = CancellationToken::new();

    for (entity, job) in [("a", "fail"), ("b", "panic"), ("c", "count")] {
        scheduler
            .schedule_job(&EntityId::from(entity), &every_second(job), &owner)
            .expect("schedule");
    }

    tokio::time::sleep(Duration::from_millis(3_200)).await;
    assert!(counter.runs.load(Ordering::SeqCst) >= 2);
    assert_eq!(scheduler.job_count(), 3);
    assert!(scheduler.fired() >= 6);
    scheduler.shutdown();
    assert_eq!(scheduler.job_count(), 0);
}

#[tokio::test]
async fn invalid_registrations_are_rejected() {
    let counter = Arc::new(Counter::default());
    let scheduler = scheduler_with(&counter);
    let owner = CancellationToken::new();
    let id = EntityId::from("spring");

    let cases = [
        JobSpec::new("  "),
        JobSpec::new("count").with_cron("every tuesday"),
        JobSpec::new("unregistered"),
    ];
    for spec in cases {
        let err = scheduler
            .schedule_job(&id, &spec, &owner)
            .expect_err("rejected");
        assert!(matches!(err, HeraldError::JobSpec(_)), "{spec:?}: {err}");
    }
    assert_eq!(scheduler.job_count(), 0);
}

#[tokio::test]
async fn omitted_cron_defaults_to_midnight() {
    let counter = Arc::new(Counter::default());
    let scheduler = scheduler_with(&counter);
    let handle = scheduler
        .schedule_job(
            &EntityId::from("spring"),
            &JobSpec::new("count"),
            &CancellationToken::new(),
        )
        .expect("schedule");
    assert_eq!(handle.cron, "0 0 * * *");
    scheduler.shutdown();
}

#[tokio::test]
async fn long_job_never_overlaps_itself() {
    let slow = Arc::new(Slow::default());
    let mut registry = JobRegistry::new();
    registry.register("slow", slow.clone());
    let scheduler = CronScheduler::new(registry);

    scheduler
        .schedule_job(
            &EntityId::from("spring"),
            &every_second("slow"),
            &CancellationToken::new(),
        )
        .expect("schedule");

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert!(slow.runs.load(Ordering::SeqCst) >= 1);
    assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
    assert!(scheduler.skipped() >= 1);
    scheduler.shutdown();
}
