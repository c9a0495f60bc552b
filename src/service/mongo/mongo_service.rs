use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use log::{error, info};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use url::Url;
use which::which;
use crate::config::Config;
use crate::database::{Cadence, Database};
use crate::error::{BackupError, Result};
use crate::service::mongo::coordinator::Coordinator;
use crate::service::mongo::mongodump::MongoDump;
use crate::service::mongo::scheduler;
use crate::service::service::Service;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MongoService {
    config: Arc<Config>,
    tz: Tz,
    db: Database,
    coordinator: Coordinator,
}

impl MongoService {
    pub fn new(config: Arc<Config>, tz: Tz, db: Database) -> Result<MongoService> {
        let database_name = config.database_name()?;
        let runner = Arc::new(MongoDump::new(&config.database.uri));
        let coordinator =
            Coordinator::new(config.clone(), tz, database_name, db.clone(), runner);
        Ok(MongoService {
            config,
            tz,
            db,
            coordinator,
        })
    }

    // Both the dump tool and its target must be reachable before any
    // scheduling starts; later connection losses only fail single attempts.
    pub async fn probe(&self) -> Result<()> {
        which("mongodump").map_err(|e| {
            BackupError::Connectivity(format!("mongodump not found in PATH: {}", e))
        })?;

        let parsed = Url::parse(&self.config.database.uri).map_err(|e| {
            BackupError::Configuration(format!("invalid connection URI: {}", e))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| BackupError::Configuration("connection URI has no host".to_string()))?;
        let port = parsed.port().unwrap_or(27017);
        let addr = format!("{}:{}", host, port);

        match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                info!("Confirmed {} is reachable.", addr);
                Ok(())
            }
            Ok(Err(e)) => Err(BackupError::Connectivity(format!(
                "cannot reach {}: {}",
                addr, e
            ))),
            Err(_) => Err(BackupError::Connectivity(format!(
                "timed out connecting to {}",
                addr
            ))),
        }
    }

    pub async fn backfill(&self) -> Result<()> {
        scheduler::check_and_backfill_missing(&self.coordinator, &self.db, &self.config.backup)
            .await
    }
}

#[async_trait]
impl Service for MongoService {
    async fn schedule(&self, sched: &mut JobScheduler) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Cadence>(8);

        // Single consumer: the timers decide when a cadence is due, this loop
        // decides whether it is safe to run. A trigger that meets a running
        // attempt is skipped, never queued.
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            while let Some(cadence) = rx.recv().await {
                if coordinator.is_running() {
                    if let Some(current) = coordinator.snapshot().current {
                        info!(
                            "Skipping {} backup, {} backup {} is still running.",
                            cadence, current.cadence, current.folder_name
                        );
                    }
                    continue;
                }
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.execute(cadence).await;
                });
            }
        });

        // The daily cadence runs on its own fixed interval.
        let daily_tx = tx.clone();
        let interval = Duration::from_secs(self.config.backup.daily.interval_minutes * 60);
        let daily_job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let tx = daily_tx.clone();
            Box::pin(async move {
                if let Err(e) = tx.send(Cadence::Daily).await {
                    error!("Failed to hand the daily trigger to the scheduler loop: {}", e);
                }
            })
        })?;
        sched.add(daily_job).await?;

        // Coarser cadences piggyback on minute-zero boundaries; the tick
        // instant decides which one is due.
        let schedule = Schedule::from_str("0 0 * * * *").map_err(|e| {
            BackupError::Configuration(format!("invalid boundary schedule: {}", e))
        })?;
        let config = self.config.clone();
        let tz = self.tz;
        let boundary_tx = tx;
        let boundary_job = Job::new_async(schedule, move |_uuid, _l| {
            let tx = boundary_tx.clone();
            let config = config.clone();
            Box::pin(async move {
                let now = Utc::now().with_timezone(&tz);
                let cadence = scheduler::classify_instant(&now, &config.backup);
                if cadence != Cadence::Daily {
                    if let Err(e) = tx.send(cadence).await {
                        error!(
                            "Failed to hand the {} trigger to the scheduler loop: {}",
                            cadence, e
                        );
                    }
                }
            })
        })?;
        sched.add(boundary_job).await?;

        info!(
            "Armed daily timer every {} minutes plus the hourly boundary check.",
            self.config.backup.daily.interval_minutes
        );
        Ok(())
    }
}
