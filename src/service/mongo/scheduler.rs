use std::time::Duration;
use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Weekday};
use chrono_tz::Tz;
use log::{debug, info};
use crate::config::BackupConfig;
use crate::database::{BackupStatus, Cadence, Database};
use crate::error::Result;
use crate::service::mongo::coordinator::{Coordinator, ExecuteOutcome};

const BACKFILL_RETRY_DELAY: Duration = Duration::from_secs(30);

// N equally spaced slots across the week, expressed as an hour stride.
pub fn slot_interval_hours(per_week: u32) -> u32 {
    (168.0 / per_week as f64).round().max(1.0) as u32
}

// One cadence label per tick. A Jan-1 midnight tick is a yearly backup, not
// also a monthly or a plain daily one.
pub fn classify_instant(now: &DateTime<Tz>, config: &BackupConfig) -> Cadence {
    let at_boundary = now.minute() == 0;
    if config.yearly.count > 0 && now.ordinal() == 1 && now.hour() == 0 && at_boundary {
        return Cadence::Yearly;
    }
    if config.monthly.count > 0 && now.day() == 1 && now.hour() == 0 && at_boundary {
        return Cadence::Monthly;
    }
    if config.weekly.per_week > 0
        && at_boundary
        && now.hour() % slot_interval_hours(config.weekly.per_week) == 0
    {
        return Cadence::Weekly;
    }
    Cadence::Daily
}

fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    match date.and_time(NaiveTime::MIN).and_local_timezone(tz) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Midnight fell into a DST gap; the UTC reading is close enough for a
        // period boundary.
        LocalResult::None => tz.from_utc_datetime(&date.and_time(NaiveTime::MIN)),
    }
}

pub fn start_of_week(now: &DateTime<Tz>) -> DateTime<Tz> {
    let first_day = now.date_naive().week(Weekday::Mon).first_day();
    local_midnight(now.timezone(), first_day)
}

pub fn start_of_month(now: &DateTime<Tz>) -> DateTime<Tz> {
    let first_day = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap_or_else(|| now.date_naive());
    local_midnight(now.timezone(), first_day)
}

pub fn start_of_year(now: &DateTime<Tz>) -> DateTime<Tz> {
    let first_day =
        NaiveDate::from_ymd_opt(now.year(), 1, 1).unwrap_or_else(|| now.date_naive());
    local_midnight(now.timezone(), first_day)
}

pub fn period_start(cadence: Cadence, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    match cadence {
        Cadence::Weekly => Some(start_of_week(now)),
        Cadence::Monthly => Some(start_of_month(now)),
        Cadence::Yearly => Some(start_of_year(now)),
        Cadence::Daily => None,
    }
}

// Runs once at startup, before the periodic timers are armed, so a process
// that was down over a period boundary still covers the current week, month
// and year.
pub async fn check_and_backfill_missing(
    coordinator: &Coordinator,
    db: &Database,
    config: &BackupConfig,
) -> Result<()> {
    let candidates = [
        (Cadence::Weekly, config.weekly.per_week),
        (Cadence::Monthly, config.monthly.count),
        (Cadence::Yearly, config.yearly.count),
    ];

    for (cadence, count) in candidates {
        if count == 0 {
            continue;
        }
        let now = coordinator.now();
        let period_start = match period_start(cadence, &now) {
            Some(t) => t,
            None => continue,
        };
        let existing = db
            .count_since(cadence, BackupStatus::Success, period_start.fixed_offset())
            .await?;
        if existing > 0 {
            debug!(
                "Found a {} backup since {}, nothing to backfill.",
                cadence, period_start
            );
            continue;
        }

        info!("No {} backup found since {}, backfilling.", cadence, period_start);
        // A held run-lock defers this check; it is retried, never dropped.
        loop {
            match coordinator.execute(cadence).await {
                ExecuteOutcome::Skipped => tokio::time::sleep(BACKFILL_RETRY_DELAY).await,
                _ => break,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::tempdir;
    use crate::config::{
        Config, DailyTimerConfig, MongoConnectionConfig, MonthlyTimerConfig, WeeklyTimerConfig,
        YearlyTimerConfig,
    };
    use crate::database::NewBackupRecord;
    use crate::error::Result;
    use crate::service::mongo::coordinator::AttemptLog;
    use crate::service::mongo::mongodump::{DumpOutput, DumpRunner};

    fn test_config(basedir: &Path) -> Config {
        Config {
            database: MongoConnectionConfig {
                uri: "mongodb://127.0.0.1:27017/appdb".to_string(),
            },
            backup: crate::config::BackupConfig {
                basedir: basedir.to_str().unwrap().to_string(),
                timezone: "UTC".to_string(),
                metadata_path: None,
                daily: DailyTimerConfig {
                    interval_minutes: 60,
                    keep_last: -1,
                },
                weekly: WeeklyTimerConfig {
                    per_week: 7,
                    max_age_weeks: 4,
                },
                monthly: MonthlyTimerConfig {
                    count: 1,
                    max_age_months: 12,
                },
                yearly: YearlyTimerConfig {
                    count: 1,
                    max_age_years: 5,
                },
            },
        }
    }

    fn berlin(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        chrono_tz::Europe::Berlin
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_slot_interval_hours() {
        assert_eq!(slot_interval_hours(7), 24);
        assert_eq!(slot_interval_hours(14), 12);
        assert_eq!(slot_interval_hours(28), 6);
        assert_eq!(slot_interval_hours(168), 1);
        assert_eq!(slot_interval_hours(1), 168);
    }

    #[test]
    fn test_new_years_midnight_classifies_as_yearly() {
        let config = test_config(Path::new("/tmp"));
        let now = berlin(2024, 1, 1, 0, 0);
        assert_eq!(classify_instant(&now, &config.backup), Cadence::Yearly);
    }

    #[test]
    fn test_first_of_month_midnight_classifies_as_monthly() {
        let config = test_config(Path::new("/tmp"));
        let now = berlin(2024, 3, 1, 0, 0);
        assert_eq!(classify_instant(&now, &config.backup), Cadence::Monthly);
    }

    #[test]
    fn test_disabled_yearly_falls_through_to_monthly() {
        let mut config = test_config(Path::new("/tmp"));
        config.backup.yearly.count = 0;
        let now = berlin(2024, 1, 1, 0, 0);
        assert_eq!(classify_instant(&now, &config.backup), Cadence::Monthly);
    }

    #[test]
    fn test_weekly_slot_alignment() {
        let mut config = test_config(Path::new("/tmp"));
        config.backup.weekly.per_week = 28; // every 6 hours
        // March 5th is no month boundary; 06:00 sits on a slot.
        assert_eq!(
            classify_instant(&berlin(2024, 3, 5, 6, 0), &config.backup),
            Cadence::Weekly
        );
        assert_eq!(
            classify_instant(&berlin(2024, 3, 5, 3, 0), &config.backup),
            Cadence::Daily
        );
    }

    #[test]
    fn test_off_boundary_minutes_classify_as_daily() {
        let config = test_config(Path::new("/tmp"));
        let now = berlin(2024, 1, 1, 0, 30);
        assert_eq!(classify_instant(&now, &config.backup), Cadence::Daily);
    }

    #[test]
    fn test_period_starts_are_timezone_aware() {
        let now = berlin(2024, 3, 6, 15, 42); // a Wednesday
        let week = start_of_week(&now);
        assert_eq!(week.to_rfc3339(), "2024-03-04T00:00:00+01:00");
        let month = start_of_month(&now);
        assert_eq!(month.to_rfc3339(), "2024-03-01T00:00:00+01:00");
        let year = start_of_year(&now);
        assert_eq!(year.to_rfc3339(), "2024-01-01T00:00:00+01:00");
    }

    #[test]
    fn test_period_start_for_daily_is_none() {
        let now = berlin(2024, 3, 6, 15, 42);
        assert!(period_start(Cadence::Daily, &now).is_none());
    }

    struct CountingRunner {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DumpRunner for CountingRunner {
        async fn run_dump(&self, _target_dir: &Path, _log: &mut AttemptLog) -> Result<DumpOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(DumpOutput {
                success: true,
                output: "done dumping appdb.users (10 documents)".to_string(),
            })
        }
    }

    async fn backfill_fixture(
        config: Config,
    ) -> (Coordinator, Database, Arc<Config>, Arc<AtomicUsize>) {
        let config = Arc::new(config);
        let db = Database::connect_in_memory().await.unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(CountingRunner { runs: runs.clone() });
        let coordinator = Coordinator::new(
            config.clone(),
            chrono_tz::UTC,
            "appdb".to_string(),
            db.clone(),
            runner,
        );
        (coordinator, db, config, runs)
    }

    #[tokio::test]
    async fn test_backfill_covers_missing_periods_once() {
        let dir = tempdir().unwrap();
        let (coordinator, db, config, runs) = backfill_fixture(test_config(dir.path())).await;

        // Empty store: weekly, monthly and yearly all get backfilled.
        check_and_backfill_missing(&coordinator, &db, &config.backup)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        // The runs it just recorded satisfy the second pass.
        check_and_backfill_missing(&coordinator, &db, &config.backup)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backfill_is_idempotent_with_existing_record() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.backup.weekly.per_week = 0;
        config.backup.yearly.count = 0;
        let (coordinator, db, config, runs) = backfill_fixture(config).await;

        // A monthly success inside the current period means nothing to do.
        let now = Utc::now().with_timezone(&chrono_tz::UTC);
        db.insert(&NewBackupRecord {
            timestamp: now.fixed_offset(),
            cadence: Cadence::Monthly,
            folder_name: "existing_appdb".to_string(),
            database_name: "appdb".to_string(),
            status: BackupStatus::Success,
            duration_seconds: 10,
            collections_count: 1,
            documents_count: 10,
            indexes_count: 0,
            error_message: None,
            backup_size_bytes: 64,
            log_text: String::new(),
        })
        .await
        .unwrap();

        check_and_backfill_missing(&coordinator, &db, &config.backup)
            .await
            .unwrap();
        check_and_backfill_missing(&coordinator, &db, &config.backup)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backfill_skips_failed_records() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.backup.weekly.per_week = 0;
        config.backup.yearly.count = 0;
        let (coordinator, db, config, runs) = backfill_fixture(config).await;

        // A failed monthly attempt does not count as coverage.
        let now = Utc::now().with_timezone(&chrono_tz::UTC);
        db.insert(&NewBackupRecord {
            timestamp: now.fixed_offset(),
            cadence: Cadence::Monthly,
            folder_name: "failed_appdb".to_string(),
            database_name: "appdb".to_string(),
            status: BackupStatus::Failed,
            duration_seconds: 1,
            collections_count: 0,
            documents_count: 0,
            indexes_count: 0,
            error_message: Some("error connecting".to_string()),
            backup_size_bytes: 0,
            log_text: String::new(),
        })
        .await
        .unwrap();

        check_and_backfill_missing(&coordinator, &db, &config.backup)
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
