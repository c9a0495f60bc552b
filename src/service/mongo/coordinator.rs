use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use log::{debug, error, info};
use serde::Serialize;
use tokio::fs;
use crate::config::Config;
use crate::database::{BackupStatus, Cadence, Database, NewBackupRecord};
use crate::error::BackupError;
use crate::service::mongo::mongodump::{parse_dump_stats, DumpRunner};
use crate::service::mongo::retention::RetentionPolicy;
use crate::utils;

// Captures the log lines of one attempt so they settle into that record's
// log_text and nowhere else. Lines are mirrored to the process log.
pub struct AttemptLog {
    lines: Vec<String>,
}

impl AttemptLog {
    pub fn new() -> AttemptLog {
        AttemptLog { lines: Vec::new() }
    }

    pub fn push(&mut self, line: &str) {
        info!("{}", line);
        self.lines
            .push(format!("{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), line));
    }

    pub fn into_text(self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct CurrentRun {
    pub cadence: Cadence,
    pub folder_name: String,
    pub started_at: DateTime<FixedOffset>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct RunState {
    pub is_running: bool,
    pub current: Option<CurrentRun>,
}

// Held for the duration of one attempt; dropping it clears the run state on
// every exit path, including panics inside the dump invocation.
struct RunClaim {
    state: Arc<Mutex<RunState>>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.is_running = false;
            state.current = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Skipped,
    Success,
    Failed,
}

#[derive(Clone)]
pub struct Coordinator {
    config: Arc<Config>,
    tz: Tz,
    database_name: String,
    db: Database,
    runner: Arc<dyn DumpRunner>,
    retention: RetentionPolicy,
    state: Arc<Mutex<RunState>>,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        tz: Tz,
        database_name: String,
        db: Database,
        runner: Arc<dyn DumpRunner>,
    ) -> Coordinator {
        let retention = RetentionPolicy::new(config.clone(), tz, db.clone());
        Coordinator {
            config,
            tz,
            database_name,
            db,
            runner,
            retention,
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_running
    }

    // Read path for the dashboard.
    pub fn snapshot(&self) -> RunState {
        self.state.lock().unwrap().clone()
    }

    pub fn folder_name(now: &DateTime<Tz>, database_name: &str) -> String {
        // Fixed-width prefix so folder names sort in timestamp order.
        format!("{}_{}", now.format("%Y-%m-%d_%H-%M-%S"), database_name)
    }

    fn target_dir(&self, cadence: Cadence, folder_name: &str) -> PathBuf {
        PathBuf::from(&self.config.backup.basedir)
            .join(cadence.as_str())
            .join(folder_name)
    }

    // Check and transition in one critical section; overlapping triggers see
    // the claim fail and skip.
    fn try_claim(
        &self,
        cadence: Cadence,
        folder_name: &str,
        started_at: DateTime<FixedOffset>,
    ) -> Option<RunClaim> {
        let mut state = self.state.lock().unwrap();
        if state.is_running {
            return None;
        }
        state.is_running = true;
        state.current = Some(CurrentRun {
            cadence,
            folder_name: folder_name.to_string(),
            started_at,
        });
        Some(RunClaim {
            state: Arc::clone(&self.state),
        })
    }

    pub async fn execute(&self, cadence: Cadence) -> ExecuteOutcome {
        let now = self.now();
        let folder_name = Self::folder_name(&now, &self.database_name);
        let started_at = now.fixed_offset();

        let _claim = match self.try_claim(cadence, &folder_name, started_at) {
            Some(claim) => claim,
            None => {
                info!(
                    "Skipping {} backup, another backup is still running.",
                    cadence
                );
                return ExecuteOutcome::Skipped;
            }
        };

        let started = Instant::now();
        let mut attempt_log = AttemptLog::new();
        attempt_log.push(&format!(
            "Starting {} backup of {}.",
            cadence, self.database_name
        ));

        let target_dir = self.target_dir(cadence, &folder_name);
        let dump_result = match fs::create_dir_all(&target_dir).await {
            Ok(()) => self.runner.run_dump(&target_dir, &mut attempt_log).await,
            Err(e) => Err(BackupError::Execution(format!(
                "failed to create {}: {}",
                target_dir.display(),
                e
            ))),
        };

        match dump_result {
            Ok(dump) if dump.success => {
                let stats = parse_dump_stats(&dump.output);
                let backup_size_bytes = match utils::get_size(&target_dir) {
                    Ok(size) => size as i64,
                    Err(e) => {
                        error!("Failed to measure {}: {}", target_dir.display(), e);
                        0
                    }
                };
                attempt_log.push(&format!(
                    "Finished {} backup: {} collections, {} documents, {} bytes.",
                    cadence, stats.collections, stats.documents, backup_size_bytes
                ));

                let record = NewBackupRecord {
                    timestamp: started_at,
                    cadence,
                    folder_name,
                    database_name: self.database_name.clone(),
                    status: BackupStatus::Success,
                    duration_seconds: started.elapsed().as_secs() as i64,
                    collections_count: stats.collections as i64,
                    documents_count: stats.documents as i64,
                    indexes_count: stats.indexes as i64,
                    error_message: None,
                    backup_size_bytes,
                    log_text: attempt_log.into_text(),
                };
                self.persist(&record).await;
                self.retention.apply(cadence).await;
                ExecuteOutcome::Success
            }
            Ok(dump) => {
                self.settle_failure(cadence, folder_name, started_at, started, attempt_log, dump.output)
                    .await;
                ExecuteOutcome::Failed
            }
            Err(e) => {
                self.settle_failure(cadence, folder_name, started_at, started, attempt_log, e.to_string())
                    .await;
                ExecuteOutcome::Failed
            }
        }
    }

    async fn settle_failure(
        &self,
        cadence: Cadence,
        folder_name: String,
        timestamp: DateTime<FixedOffset>,
        started: Instant,
        mut attempt_log: AttemptLog,
        error_message: String,
    ) {
        let target_dir = self.target_dir(cadence, &folder_name);
        error!(
            "{} backup of {} failed: {}",
            cadence, self.database_name, error_message
        );
        attempt_log.push(&format!("{} backup failed.", cadence));

        // A failed attempt must not leave a half-written artifact behind;
        // retention never looks at it either way.
        if let Err(e) = fs::remove_dir_all(&target_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(
                    "Failed to remove incomplete artifact {}: {}",
                    target_dir.display(),
                    e
                );
            }
        }

        let record = NewBackupRecord {
            timestamp,
            cadence,
            folder_name,
            database_name: self.database_name.clone(),
            status: BackupStatus::Failed,
            duration_seconds: started.elapsed().as_secs() as i64,
            collections_count: 0,
            documents_count: 0,
            indexes_count: 0,
            error_message: Some(error_message),
            backup_size_bytes: 0,
            log_text: attempt_log.into_text(),
        };
        self.persist(&record).await;
    }

    // A record that fails to persist is logged and dropped; it must never
    // block future attempts.
    async fn persist(&self, record: &NewBackupRecord) {
        match self.db.insert(record).await {
            Ok(id) => debug!("Persisted {} backup record {}.", record.cadence, id),
            Err(e) => error!(
                "Failed to persist {} backup record: {}",
                record.cadence, e
            ),
        }
    }
}
