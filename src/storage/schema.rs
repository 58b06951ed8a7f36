//! SQLite schema for the job storage.
//!
//! The job document itself lives in `jobAsJson`; the other columns are
//! denormalized copies of the fields the page queries filter and order on.
//! All timestamps are Unix milliseconds.

pub const JOB_STORAGE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobmill_jobs (
    id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    jobSignature TEXT NOT NULL,
    state TEXT NOT NULL,
    createdAt INTEGER NOT NULL,
    updatedAt INTEGER NOT NULL,
    scheduledAt INTEGER,
    recurringJobId TEXT,
    jobAsJson TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobmill_jobs_state_updated_at
    ON jobmill_jobs(state, updatedAt);

CREATE INDEX IF NOT EXISTS idx_jobmill_jobs_state_scheduled_at
    ON jobmill_jobs(state, scheduledAt);

CREATE INDEX IF NOT EXISTS idx_jobmill_jobs_signature_state
    ON jobmill_jobs(jobSignature, state);

CREATE TABLE IF NOT EXISTS jobmill_recurring_jobs (
    id TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    jobAsJson TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobmill_background_job_servers (
    id TEXT PRIMARY KEY,
    firstHeartbeat INTEGER NOT NULL,
    lastHeartbeat INTEGER NOT NULL,
    running INTEGER NOT NULL,
    workerPoolSize INTEGER NOT NULL,
    pollIntervalSeconds INTEGER NOT NULL,
    freeMemory INTEGER NOT NULL,
    systemCpuLoad REAL NOT NULL,
    processCpuLoad REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS jobmill_job_counters (
    name TEXT PRIMARY KEY,
    amount INTEGER NOT NULL
);
"#;
