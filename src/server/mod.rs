//! Server lifecycle.
//!
//! A [`BackgroundJobServer`] owns the worker pool, the coordination loop and
//! the liveness heartbeat. Several servers may share one storage backend;
//! they elect the longest-announced live server as master.

mod concurrent;
mod config;
mod coordinator;
mod strategy;
mod system;
mod worker;

pub use config::{BackgroundJobServerConfiguration, MIN_POLL_INTERVAL};
pub use strategy::{BasicWorkDistributionStrategy, WorkDistributionStrategy};

use crate::clock::{Clock, SystemClock};
use crate::jobs::JobFilters;
use crate::scheduling::JobHandlerRegistry;
use crate::storage::{BackgroundJobServerStatus, StorageProvider, StorageResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use coordinator::JobCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use system::SystemResourceSampler;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use worker::ProcessingRegistry;

/// Shared context: the server owns it, the coordinator and the workers hold
/// clones. Keeps the mutually referencing pieces cycle-free.
pub(crate) struct ServerContext {
    pub id: Uuid,
    pub config: BackgroundJobServerConfiguration,
    pub storage: Arc<dyn StorageProvider>,
    pub clock: Arc<dyn Clock>,
    pub filters: JobFilters,
    pub handlers: Arc<JobHandlerRegistry>,
    pub processing: Arc<ProcessingRegistry>,
    pub worker_permits: Arc<Semaphore>,
    pub running: AtomicBool,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    /// Loud self-termination after repeated coordination failures.
    pub fn initiate_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

pub struct BackgroundJobServer {
    ctx: Arc<ServerContext>,
    coordinator: Arc<JobCoordinator>,
    sampler: Arc<SystemResourceSampler>,
    first_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl BackgroundJobServer {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        handlers: Arc<JobHandlerRegistry>,
        config: BackgroundJobServerConfiguration,
    ) -> Self {
        Self::with_clock(storage, handlers, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn StorageProvider>,
        handlers: Arc<JobHandlerRegistry>,
        config: BackgroundJobServerConfiguration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ctx = Arc::new(ServerContext {
            id: Uuid::new_v4(),
            worker_permits: Arc::new(Semaphore::new(config.worker_pool_size)),
            filters: JobFilters::with_default_filters(config.max_retries),
            config,
            storage,
            clock,
            handlers,
            processing: Arc::new(ProcessingRegistry::new()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        let coordinator = JobCoordinator::new(ctx.clone());
        Self {
            ctx,
            coordinator,
            sampler: Arc::new(SystemResourceSampler::new()),
            first_heartbeat: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id
    }

    pub fn is_master(&self) -> bool {
        self.coordinator.is_master()
    }

    /// Number of jobs currently executing on this server.
    pub fn work_queue_size(&self) -> usize {
        self.ctx.processing.len()
    }

    /// Announce the server and spawn the periodic tasks. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let now = self.ctx.clock.now();
        *self.first_heartbeat.lock().unwrap() = Some(now);
        let status = build_status(&self.ctx, &self.sampler, now, now, true);
        self.ctx
            .storage
            .announce_background_job_server(&status)
            .context("could not announce the background job server")?;
        evaluate_mastership(&self.ctx, &self.coordinator)
            .context("could not evaluate mastership")?;
        self.spawn_heartbeat_loop(now);
        self.spawn_coordination_loop();
        info!(server_id = %self.ctx.id, "background job server started");
        Ok(())
    }

    /// Stop issuing ticks, drain the worker pool within the grace period,
    /// cancel what remains, and close the storage provider. Jobs interrupted
    /// mid-execution stay PROCESSING and are detected as orphans later.
    pub async fn stop(&self) {
        if !self.ctx.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(server_id = %self.ctx.id, "stopping background job server");
        self.coordinator.set_is_master(false);
        self.ctx.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.ctx.config.stop_grace_period;
        while self.ctx.processing.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.ctx.processing.len() > 0 {
            warn!(
                "{} job(s) still running after the grace period; cancelling them",
                self.ctx.processing.len()
            );
            self.ctx.processing.cancel_all();
            let unwind_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while self.ctx.processing.len() > 0 && tokio::time::Instant::now() < unwind_deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let now = self.ctx.clock.now();
        if let Some(first_heartbeat) = *self.first_heartbeat.lock().unwrap() {
            let status = build_status(&self.ctx, &self.sampler, first_heartbeat, now, false);
            if let Err(e) = self.ctx.storage.signal_background_job_server_alive(&status) {
                warn!("could not announce the server stop: {e}");
            }
        }
        self.ctx.storage.close();
        info!(server_id = %self.ctx.id, "background job server stopped");
    }

    fn spawn_coordination_loop(&self) {
        let ctx = Arc::clone(&self.ctx);
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let coordinator = Arc::clone(&coordinator);
                        // Storage calls block; keep the tick off the async workers.
                        let _ = tokio::task::spawn_blocking(move || coordinator.run_tick()).await;
                    }
                }
            }
        });
    }

    fn spawn_heartbeat_loop(&self, first_heartbeat: DateTime<Utc>) {
        let ctx = Arc::clone(&self.ctx);
        let coordinator = Arc::clone(&self.coordinator);
        let sampler = Arc::clone(&self.sampler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // start() already announced and evaluated; skip the immediate fire.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let ctx = Arc::clone(&ctx);
                        let coordinator = Arc::clone(&coordinator);
                        let sampler = Arc::clone(&sampler);
                        let _ = tokio::task::spawn_blocking(move || {
                            heartbeat_once(&ctx, &coordinator, &sampler, first_heartbeat)
                        })
                        .await;
                    }
                }
            }
        });
    }
}

fn heartbeat_once(
    ctx: &ServerContext,
    coordinator: &JobCoordinator,
    sampler: &SystemResourceSampler,
    first_heartbeat: DateTime<Utc>,
) {
    let now = ctx.clock.now();
    let status = build_status(ctx, sampler, first_heartbeat, now, ctx.running.load(Ordering::SeqCst));
    if let Err(e) = ctx.storage.signal_background_job_server_alive(&status) {
        warn!("could not signal server liveness: {e}");
    }
    match ctx
        .storage
        .remove_timed_out_background_job_servers(now - ctx.config.liveness_timeout())
    {
        Ok(removed) if removed > 0 => info!("removed {removed} timed-out server(s) from the roster"),
        Ok(_) => {}
        Err(e) => warn!("could not remove timed-out servers: {e}"),
    }
    if let Err(e) = evaluate_mastership(ctx, coordinator) {
        warn!("could not evaluate mastership: {e}");
    }
}

/// Earliest announcement wins: among live servers the one with the smallest
/// `first_heartbeat` is master, ties broken by server id.
fn evaluate_mastership(ctx: &ServerContext, coordinator: &JobCoordinator) -> StorageResult<()> {
    let servers = ctx.storage.get_background_job_servers()?;
    let now = ctx.clock.now();
    let timeout = ctx.config.liveness_timeout();
    let master = servers
        .iter()
        .filter(|s| now - s.last_heartbeat <= timeout)
        .min_by_key(|s| (s.first_heartbeat, s.id));
    let is_master = master.is_some_and(|m| m.id == ctx.id);
    coordinator.set_is_master(is_master);
    Ok(())
}

fn build_status(
    ctx: &ServerContext,
    sampler: &SystemResourceSampler,
    first_heartbeat: DateTime<Utc>,
    now: DateTime<Utc>,
    is_running: bool,
) -> BackgroundJobServerStatus {
    let sample = sampler.sample();
    BackgroundJobServerStatus {
        id: ctx.id,
        worker_pool_size: ctx.config.worker_pool_size,
        poll_interval_seconds: ctx.config.poll_interval.as_secs() as u32,
        first_heartbeat,
        last_heartbeat: now,
        is_running,
        free_memory_bytes: sample.free_memory_bytes,
        system_cpu_load: sample.system_cpu_load,
        process_cpu_load: sample.process_cpu_load,
    }
}
