//! Shared helpers for the end-to-end tests.
//!
//! Spins up a real server against an in-memory storage provider with a short
//! poll interval, plus a set of instrumented job handlers.
#![allow(dead_code)]

use jobmill::scheduling::{JobHandler, JobHandlerRegistry, JobRunContext, JobScheduler};
use jobmill::server::{BackgroundJobServer, BackgroundJobServerConfiguration};
use jobmill::storage::InMemoryStorageProvider;
use jobmill::{Job, StateName, StorageProvider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const COUNTING_JOB: &str = "test.Counting";
pub const FAILING_JOB: &str = "test.Failing";
pub const SLOW_JOB: &str = "test.Slow";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "jobmill=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Counts its executions.
pub struct CountingHandler {
    pub calls: AtomicUsize,
}

impl JobHandler for CountingHandler {
    fn run(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always fails.
pub struct FailingHandler;

impl JobHandler for FailingHandler {
    fn run(&self, _ctx: &JobRunContext) -> anyhow::Result<()> {
        anyhow::bail!("simulated failure")
    }
}

/// Runs for a configurable time, honoring cooperative cancellation.
pub struct SlowHandler {
    pub duration: Duration,
}

impl JobHandler for SlowHandler {
    fn run(&self, ctx: &JobRunContext) -> anyhow::Result<()> {
        let started = Instant::now();
        while started.elapsed() < self.duration {
            if ctx.is_cancellation_requested() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }
}

pub struct TestHarness {
    pub storage: Arc<InMemoryStorageProvider>,
    pub server: BackgroundJobServer,
    pub scheduler: JobScheduler,
    pub counting: Arc<CountingHandler>,
}

/// Start a server with the instrumented handlers and a 5s poll interval.
pub fn start_test_server() -> TestHarness {
    init_tracing();
    let storage = Arc::new(InMemoryStorageProvider::new());
    let counting = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });

    let registry = Arc::new(JobHandlerRegistry::new());
    registry.register(COUNTING_JOB, counting.clone());
    registry.register(FAILING_JOB, Arc::new(FailingHandler));
    registry.register(
        SLOW_JOB,
        Arc::new(SlowHandler {
            duration: Duration::from_secs(12),
        }),
    );

    let config = BackgroundJobServerConfiguration::default()
        .with_poll_interval_seconds(5)
        .with_worker_pool_size(4);
    let server = BackgroundJobServer::new(storage.clone(), registry, config);
    server.start().expect("server should start");

    let scheduler = JobScheduler::new(storage.clone());
    TestHarness {
        storage,
        server,
        scheduler,
        counting,
    }
}

/// Poll until `predicate` holds or `timeout` elapses; returns the final
/// evaluation.
pub async fn await_until<F>(timeout: Duration, predicate: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    predicate()
}

pub fn job_state(storage: &Arc<InMemoryStorageProvider>, id: Uuid) -> Option<StateName> {
    storage.get_job_by_id(id).ok().map(|job| job.state_name())
}

pub fn job(storage: &Arc<InMemoryStorageProvider>, id: Uuid) -> Job {
    storage.get_job_by_id(id).expect("job should exist")
}
