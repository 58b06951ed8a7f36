//! Change-listener fan-out.
//!
//! Listeners are notified by a background ticker (3s initial delay, 5s
//! period), never synchronously with writes. The ticker starts lazily on the
//! first registration and stops when the last listener is removed. Job-stats
//! notifications go through the registry's rate limiter so write bursts
//! collapse to one notification per period. A failing listener never affects
//! another and is never auto-unregistered.

use super::rate_limit::RateLimiter;
use super::{BackgroundJobServerStatus, JobStats, StorageError, StorageProvider};
use crate::jobs::Job;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

const TICKER_INITIAL_DELAY: Duration = Duration::from_secs(3);
const TICKER_PERIOD: Duration = Duration::from_secs(5);

pub trait JobStatsChangeListener: Send + Sync {
    fn on_change(&self, stats: &JobStats);
}

/// Listener for updates of one particular job. Closed and removed when the
/// job no longer exists.
pub trait JobChangeListener: Send + Sync {
    fn job_id(&self) -> Uuid;
    fn on_change(&self, job: &Job);
    fn close(&self) {}
}

pub trait BackgroundJobServerStatusChangeListener: Send + Sync {
    fn on_change(&self, servers: &[BackgroundJobServerStatus]);
}

#[derive(Clone)]
pub enum StorageChangeListener {
    JobStats(Arc<dyn JobStatsChangeListener>),
    Job(Arc<dyn JobChangeListener>),
    ServerStatus(Arc<dyn BackgroundJobServerStatusChangeListener>),
}

impl StorageChangeListener {
    fn same_as(&self, other: &StorageChangeListener) -> bool {
        match (self, other) {
            (Self::JobStats(a), Self::JobStats(b)) => Arc::ptr_eq(a, b),
            (Self::Job(a), Self::Job(b)) => Arc::ptr_eq(a, b),
            (Self::ServerStatus(a), Self::ServerStatus(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

struct TickerHandle {
    token: CancellationToken,
    _task: JoinHandle<()>,
}

/// Shared listener registry embedded in every storage provider.
pub struct ListenerRegistry {
    listeners: Mutex<Vec<StorageChangeListener>>,
    rate_limiter: RateLimiter,
    ticker: Mutex<Option<TickerHandle>>,
    start_lock: Mutex<()>,
}

impl ListenerRegistry {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            rate_limiter,
            ticker: Mutex::new(None),
            start_lock: Mutex::new(()),
        }
    }

    pub fn add<P>(registry: &Arc<ListenerRegistry>, provider: &P, listener: StorageChangeListener)
    where
        P: StorageProvider + Clone + 'static,
    {
        registry.listeners.lock().unwrap().push(listener);
        Self::start_ticker_if_needed(registry, provider);
    }

    pub fn remove(&self, listener: &StorageChangeListener) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|l| !l.same_as(listener));
        let empty = listeners.is_empty();
        drop(listeners);
        if empty {
            // try_lock: when another thread is mid-start, leave the ticker
            // running.
            if let Ok(_guard) = self.start_lock.try_lock() {
                if let Some(handle) = self.ticker.lock().unwrap().take() {
                    handle.token.cancel();
                }
            }
        }
    }

    /// Stop the ticker unconditionally; called from provider `close`.
    pub fn shutdown(&self) {
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            handle.token.cancel();
        }
    }

    fn start_ticker_if_needed<P>(registry: &Arc<ListenerRegistry>, provider: &P)
    where
        P: StorageProvider + Clone + 'static,
    {
        if registry.ticker.lock().unwrap().is_some() {
            return;
        }
        // try_lock: when another thread is already starting the ticker we
        // proceed without double-scheduling.
        let Ok(_guard) = registry.start_lock.try_lock() else {
            return;
        };
        let mut slot = registry.ticker.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let reg = Arc::clone(registry);
        let prov = provider.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => return,
                _ = tokio::time::sleep(TICKER_INITIAL_DELAY) => {}
            }
            let mut ticker = tokio::time::interval(TICKER_PERIOD);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => reg.notify(&prov),
                }
            }
        });
        *slot = Some(TickerHandle { token, _task: task });
    }

    fn notify(&self, provider: &dyn StorageProvider) {
        let snapshot: Vec<StorageChangeListener> = self.listeners.lock().unwrap().clone();
        self.notify_job_stats_listeners(provider, &snapshot);
        self.notify_job_listeners(provider, &snapshot);
        self.notify_server_status_listeners(provider, &snapshot);
    }

    fn notify_job_stats_listeners(
        &self,
        provider: &dyn StorageProvider,
        snapshot: &[StorageChangeListener],
    ) {
        if !self.rate_limiter.try_acquire() {
            return;
        }
        let listeners: Vec<_> = snapshot
            .iter()
            .filter_map(|l| match l {
                StorageChangeListener::JobStats(l) => Some(l),
                _ => None,
            })
            .collect();
        if listeners.is_empty() {
            return;
        }
        match provider.get_job_stats() {
            Ok(stats) => {
                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener.on_change(&stats))).is_err() {
                        error!("job stats change listener panicked");
                    }
                }
            }
            Err(e) => warn!("could not load job stats for change listeners: {e}"),
        }
    }

    fn notify_job_listeners(
        &self,
        provider: &dyn StorageProvider,
        snapshot: &[StorageChangeListener],
    ) {
        let mut by_job: HashMap<Uuid, Vec<&Arc<dyn JobChangeListener>>> = HashMap::new();
        for listener in snapshot {
            if let StorageChangeListener::Job(l) = listener {
                by_job.entry(l.job_id()).or_default().push(l);
            }
        }
        let mut closed: Vec<Arc<dyn JobChangeListener>> = Vec::new();
        for (job_id, listeners) in by_job {
            match provider.get_job_by_id(job_id) {
                Ok(job) => {
                    for listener in listeners {
                        if catch_unwind(AssertUnwindSafe(|| listener.on_change(&job))).is_err() {
                            error!(%job_id, "job change listener panicked");
                        }
                    }
                }
                Err(StorageError::JobNotFound(_)) => {
                    for listener in listeners {
                        if catch_unwind(AssertUnwindSafe(|| listener.close())).is_err() {
                            error!(%job_id, "job change listener panicked on close");
                        }
                        closed.push(Arc::clone(listener));
                    }
                }
                Err(e) => warn!(%job_id, "could not load job for change listeners: {e}"),
            }
        }
        if !closed.is_empty() {
            self.listeners.lock().unwrap().retain(|l| match l {
                StorageChangeListener::Job(candidate) => {
                    !closed.iter().any(|c| Arc::ptr_eq(c, candidate))
                }
                _ => true,
            });
        }
    }

    fn notify_server_status_listeners(
        &self,
        provider: &dyn StorageProvider,
        snapshot: &[StorageChangeListener],
    ) {
        let listeners: Vec<_> = snapshot
            .iter()
            .filter_map(|l| match l {
                StorageChangeListener::ServerStatus(l) => Some(l),
                _ => None,
            })
            .collect();
        if listeners.is_empty() {
            return;
        }
        match provider.get_background_job_servers() {
            Ok(servers) => {
                for listener in listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener.on_change(&servers))).is_err() {
                        error!("server status change listener panicked");
                    }
                }
            }
            Err(e) => warn!("could not load server roster for change listeners: {e}"),
        }
    }
}
