//! SQLite storage provider.

use super::listeners::{ListenerRegistry, StorageChangeListener};
use super::rate_limit::RateLimiter;
use super::schema::JOB_STORAGE_SCHEMA_SQL;
use super::{
    BackgroundJobServerStatus, ConcurrentJobModification, JobStats, PageRequest, StorageError,
    StorageProvider, StorageResult,
};
use crate::jobs::{Job, JobDetails, RecurringJob, StateName};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStorageProvider {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<ListenerRegistry>,
}

impl SqliteStorageProvider {
    pub fn new<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let conn = Connection::open(&db_path).map_err(sqlite_err)?;
        let provider = Self::with_connection(conn)?;
        info!("Opened job storage at {:?}", db_path.as_ref());
        Ok(provider)
    }

    #[cfg(test)]
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(sqlite_err)?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(sqlite_err)?;
        conn.execute_batch(JOB_STORAGE_SCHEMA_SQL).map_err(sqlite_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry: Arc::new(ListenerRegistry::new(RateLimiter::per_second(5))),
        })
    }

    pub fn with_change_notification_rate_limit(mut self, rate_limiter: RateLimiter) -> Self {
        self.registry = Arc::new(ListenerRegistry::new(rate_limiter));
        self
    }

    fn upsert_job(tx: &Transaction, job: &Job) -> StorageResult<()> {
        let json = serde_json::to_string(job)
            .context("could not serialize job")
            .map_err(StorageError::Internal)?;
        tx.execute(
            r#"INSERT OR REPLACE INTO jobmill_jobs
               (id, version, jobSignature, state, createdAt, updatedAt, scheduledAt, recurringJobId, jobAsJson)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                job.id().to_string(),
                job.version(),
                job.signature(),
                job.state_name().as_str(),
                millis(job.created_at()),
                millis(job.updated_at()),
                job.scheduled_at().map(millis),
                job.recurring_job_id(),
                json,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    fn query_jobs(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(sqlite_err)?;
        let jobs = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(sqlite_err)?;
        jobs.into_iter().map(|json| job_from_json(&json)).collect()
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn job_from_json(json: &str) -> StorageResult<Job> {
    serde_json::from_str(json)
        .context("could not deserialize stored job")
        .map_err(StorageError::Internal)
}

/// Busy and locked databases surface as `Unavailable` so the coordinator
/// pauses its tick instead of counting the failure; everything else is an
/// internal error.
fn sqlite_err(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            StorageError::Unavailable(e.to_string())
        }
        _ => StorageError::Internal(anyhow::Error::new(e)),
    }
}

impl StorageProvider for SqliteStorageProvider {
    fn save_job(&self, job: Job) -> StorageResult<Job> {
        self.save_jobs(vec![job]).map(|mut jobs| jobs.remove(0))
    }

    fn save_jobs(&self, jobs: Vec<Job>) -> StorageResult<Vec<Job>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(sqlite_err)?;

        let mut conflicts = Vec::new();
        for job in &jobs {
            let stored: Option<(u32, String)> = tx
                .query_row(
                    "SELECT version, jobAsJson FROM jobmill_jobs WHERE id = ?1",
                    params![job.id().to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sqlite_err)?;
            let stored_version = stored.as_ref().map(|(v, _)| *v).unwrap_or(0);
            if stored_version != job.version() {
                conflicts.push(ConcurrentJobModification {
                    local: job.clone(),
                    remote: stored.and_then(|(_, json)| job_from_json(&json).ok()),
                });
            }
        }
        if !conflicts.is_empty() {
            return Err(StorageError::ConcurrentModification(conflicts));
        }

        let mut saved = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            job.set_version(job.version() + 1);
            Self::upsert_job(&tx, &job)?;
            saved.push(job);
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(saved)
    }

    fn get_job_by_id(&self, id: Uuid) -> StorageResult<Job> {
        let json: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT jobAsJson FROM jobmill_jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        match json {
            Some(json) => job_from_json(&json),
            None => Err(StorageError::JobNotFound(id)),
        }
    }

    fn get_jobs(&self, state: StateName, page: PageRequest) -> StorageResult<Vec<Job>> {
        self.query_jobs(
            r#"SELECT jobAsJson FROM jobmill_jobs
               WHERE state = ?1
               ORDER BY updatedAt ASC LIMIT ?2 OFFSET ?3"#,
            &[
                &state.as_str(),
                &(page.limit as i64),
                &(page.offset as i64),
            ],
        )
    }

    fn get_jobs_updated_before(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Job>> {
        self.query_jobs(
            r#"SELECT jobAsJson FROM jobmill_jobs
               WHERE state = ?1 AND updatedAt < ?2
               ORDER BY updatedAt ASC LIMIT ?3 OFFSET ?4"#,
            &[
                &state.as_str(),
                &millis(updated_before),
                &(page.limit as i64),
                &(page.offset as i64),
            ],
        )
    }

    fn get_scheduled_jobs(
        &self,
        scheduled_before: DateTime<Utc>,
        page: PageRequest,
    ) -> StorageResult<Vec<Job>> {
        self.query_jobs(
            r#"SELECT jobAsJson FROM jobmill_jobs
               WHERE state = 'SCHEDULED' AND scheduledAt < ?1
               ORDER BY scheduledAt ASC LIMIT ?2 OFFSET ?3"#,
            &[
                &millis(scheduled_before),
                &(page.limit as i64),
                &(page.offset as i64),
            ],
        )
    }

    fn delete_jobs(
        &self,
        state: StateName,
        updated_before: DateTime<Utc>,
    ) -> StorageResult<usize> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM jobmill_jobs WHERE state = ?1 AND updatedAt < ?2",
                params![state.as_str(), millis(updated_before)],
            )
            .map_err(sqlite_err)
    }

    fn exists(&self, details: &JobDetails, state: StateName) -> StorageResult<bool> {
        let count: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM jobmill_jobs WHERE jobSignature = ?1 AND state = ?2",
                params![details.signature(), state.as_str()],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;
        Ok(count > 0)
    }

    fn count_jobs(&self, state: StateName) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM jobmill_jobs WHERE state = ?1",
                params![state.as_str()],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;
        Ok(count as u64)
    }

    fn get_job_stats(&self) -> StorageResult<JobStats> {
        let conn = self.conn.lock().unwrap();
        let mut stats = JobStats::default();
        {
            let mut stmt = conn
                .prepare("SELECT state, COUNT(*) FROM jobmill_jobs GROUP BY state")
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sqlite_err)?;
            for row in rows {
                let (state, count) = row.map_err(sqlite_err)?;
                let count = count as u64;
                match StateName::parse(&state) {
                    Some(StateName::Scheduled) => stats.scheduled = count,
                    Some(StateName::Enqueued) => stats.enqueued = count,
                    Some(StateName::Processing) => stats.processing = count,
                    Some(StateName::Succeeded) => stats.succeeded = count,
                    Some(StateName::Failed) => stats.failed = count,
                    Some(StateName::Deleted) => stats.deleted = count,
                    None => {}
                }
            }
        }
        let counter: Option<i64> = conn
            .query_row(
                "SELECT amount FROM jobmill_job_counters WHERE name = ?1",
                params![StateName::Succeeded.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        stats.all_time_succeeded = counter.unwrap_or(0) as u64 + stats.succeeded;
        Ok(stats)
    }

    fn publish_job_stat_counter(&self, state: StateName, delta: u64) -> StorageResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"INSERT INTO jobmill_job_counters (name, amount) VALUES (?1, ?2)
                   ON CONFLICT(name) DO UPDATE SET amount = amount + ?2"#,
                params![state.as_str(), delta as i64],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn get_recurring_jobs(&self) -> StorageResult<Vec<RecurringJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT jobAsJson FROM jobmill_recurring_jobs ORDER BY id ASC")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(sqlite_err)?;
        rows.into_iter()
            .map(|json| {
                serde_json::from_str(&json)
                    .context("could not deserialize recurring job")
                    .map_err(StorageError::Internal)
            })
            .collect()
    }

    fn save_recurring_job(&self, job: RecurringJob) -> StorageResult<RecurringJob> {
        let json = serde_json::to_string(&job)
            .context("could not serialize recurring job")
            .map_err(StorageError::Internal)?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO jobmill_recurring_jobs (id, version, jobAsJson) VALUES (?1, 1, ?2)",
                params![job.id(), json],
            )
            .map_err(sqlite_err)?;
        Ok(job)
    }

    fn delete_recurring_job(&self, id: &str) -> StorageResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM jobmill_recurring_jobs WHERE id = ?1", params![id])
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn announce_background_job_server(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> StorageResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"INSERT OR REPLACE INTO jobmill_background_job_servers
                   (id, firstHeartbeat, lastHeartbeat, running, workerPoolSize, pollIntervalSeconds,
                    freeMemory, systemCpuLoad, processCpuLoad)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                params![
                    status.id.to_string(),
                    millis(status.first_heartbeat),
                    millis(status.last_heartbeat),
                    status.is_running,
                    status.worker_pool_size as i64,
                    status.poll_interval_seconds,
                    status.free_memory_bytes as i64,
                    status.system_cpu_load,
                    status.process_cpu_load,
                ],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn signal_background_job_server_alive(
        &self,
        status: &BackgroundJobServerStatus,
    ) -> StorageResult<()> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"UPDATE jobmill_background_job_servers
                   SET lastHeartbeat = ?2, running = ?3, freeMemory = ?4,
                       systemCpuLoad = ?5, processCpuLoad = ?6
                   WHERE id = ?1"#,
                params![
                    status.id.to_string(),
                    millis(status.last_heartbeat),
                    status.is_running,
                    status.free_memory_bytes as i64,
                    status.system_cpu_load,
                    status.process_cpu_load,
                ],
            )
            .map_err(sqlite_err)?;
        if updated == 0 {
            // Removed as timed out in the meantime; announce afresh.
            self.announce_background_job_server(status)?;
        }
        Ok(())
    }

    fn get_background_job_servers(&self) -> StorageResult<Vec<BackgroundJobServerStatus>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"SELECT id, firstHeartbeat, lastHeartbeat, running, workerPoolSize,
                          pollIntervalSeconds, freeMemory, systemCpuLoad, processCpuLoad
                   FROM jobmill_background_job_servers
                   ORDER BY firstHeartbeat ASC, id ASC"#,
            )
            .map_err(sqlite_err)?;
        let servers = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                ))
            })
            .map_err(sqlite_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_err)?;
        servers
            .into_iter()
            .map(|(id, first, last, running, pool, poll, mem, sys, proc)| {
                Ok(BackgroundJobServerStatus {
                    id: id
                        .parse()
                        .context("invalid server id in storage")
                        .map_err(StorageError::Internal)?,
                    first_heartbeat: from_millis(first)?,
                    last_heartbeat: from_millis(last)?,
                    is_running: running,
                    worker_pool_size: pool as usize,
                    poll_interval_seconds: poll,
                    free_memory_bytes: mem as u64,
                    system_cpu_load: sys,
                    process_cpu_load: proc,
                })
            })
            .collect()
    }

    fn remove_timed_out_background_job_servers(
        &self,
        heartbeat_older_than: DateTime<Utc>,
    ) -> StorageResult<usize> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM jobmill_background_job_servers WHERE lastHeartbeat < ?1",
                params![millis(heartbeat_older_than)],
            )
            .map_err(sqlite_err)
    }

    fn add_change_listener(&self, listener: StorageChangeListener) {
        ListenerRegistry::add(&self.registry, self, listener);
    }

    fn remove_change_listener(&self, listener: &StorageChangeListener) {
        self.registry.remove(listener);
    }

    fn close(&self) {
        self.registry.shutdown();
    }
}

fn from_millis(ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Internal(anyhow::anyhow!("invalid timestamp {ms} in storage")))
}
