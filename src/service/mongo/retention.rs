use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use tokio::fs;
use crate::config::Config;
use crate::database::{BackupRecord, BackupStatus, Cadence, Database, QueryFilter};
use crate::error::{BackupError, Result};

// Count-based cleanup for the daily cadence, age-based for the coarser ones.
// Only successful records are ever considered; failed rows own no artifacts.
#[derive(Clone)]
pub struct RetentionPolicy {
    config: Arc<Config>,
    tz: Tz,
    db: Database,
}

impl RetentionPolicy {
    pub fn new(config: Arc<Config>, tz: Tz, db: Database) -> RetentionPolicy {
        RetentionPolicy { config, tz, db }
    }

    // Runs after every successful attempt of the given cadence.
    pub async fn apply(&self, cadence: Cadence) {
        let result = match cadence {
            Cadence::Daily => self.apply_daily().await,
            Cadence::Weekly => {
                self.apply_age_based(cadence, self.config.backup.weekly.max_age_weeks)
                    .await
            }
            Cadence::Monthly => {
                self.apply_age_based(cadence, self.config.backup.monthly.max_age_months)
                    .await
            }
            Cadence::Yearly => {
                self.apply_age_based(cadence, self.config.backup.yearly.max_age_years)
                    .await
            }
        };
        if let Err(e) = result {
            error!("Retention for {} backups did not complete: {}", cadence, e);
        }
    }

    // Keeps the newest keep_last successful records of the current calendar
    // day; -1 disables the cleanup entirely.
    async fn apply_daily(&self) -> Result<()> {
        let keep_last = self.config.backup.daily.keep_last;
        if keep_last == -1 {
            return Ok(());
        }
        let today = Utc::now().with_timezone(&self.tz).date_naive();

        let filter = QueryFilter {
            status: Some(BackupStatus::Success),
            ..Default::default()
        };
        let records = self
            .db
            .query(Cadence::Daily, &filter)
            .await
            .map_err(|e| BackupError::Retention(format!("could not list daily records: {}", e)))?;
        let expired = records
            .iter()
            .filter(|r| r.timestamp.with_timezone(&self.tz).date_naive() == today)
            .skip(keep_last as usize);
        for record in expired {
            self.delete_artifact(record).await;
        }
        Ok(())
    }

    // Deletes artifacts whose timestamp date is strictly before now minus the
    // configured age; zero or negative disables the cleanup.
    async fn apply_age_based(&self, cadence: Cadence, max_age: i32) -> Result<()> {
        if max_age <= 0 {
            return Ok(());
        }
        let now = Utc::now().with_timezone(&self.tz);
        let cutoff = match cutoff_date(cadence, &now, max_age as u32) {
            Some(date) => date,
            None => return Ok(()),
        };

        let filter = QueryFilter {
            status: Some(BackupStatus::Success),
            ..Default::default()
        };
        let records = self.db.query(cadence, &filter).await.map_err(|e| {
            BackupError::Retention(format!("could not list {} records: {}", cadence, e))
        })?;
        for record in &records {
            if record.timestamp.with_timezone(&self.tz).date_naive() < cutoff {
                self.delete_artifact(record).await;
            }
        }
        Ok(())
    }

    // Best effort per record; the history row stays either way.
    async fn delete_artifact(&self, record: &BackupRecord) {
        let path = PathBuf::from(&self.config.backup.basedir)
            .join(record.cadence.as_str())
            .join(&record.folder_name);
        if !path.exists() {
            // Cleaned up by an earlier pass already.
            return;
        }
        match fs::remove_dir_all(&path).await {
            Ok(()) => info!(
                "Removed expired {} backup {}.",
                record.cadence, record.folder_name
            ),
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

fn cutoff_date(cadence: Cadence, now: &DateTime<Tz>, max_age: u32) -> Option<NaiveDate> {
    match cadence {
        Cadence::Weekly => Some(now.date_naive() - Duration::weeks(max_age as i64)),
        Cadence::Monthly => now.date_naive().checked_sub_months(Months::new(max_age)),
        Cadence::Yearly => now.date_naive().checked_sub_months(Months::new(12 * max_age)),
        Cadence::Daily => None,
    }
}
