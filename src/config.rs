use std::path::PathBuf;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::fs;
use url::Url;
use crate::error::{BackupError, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DailyTimerConfig {
    pub interval_minutes: u64,
    pub keep_last: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WeeklyTimerConfig {
    pub per_week: u32,
    pub max_age_weeks: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonthlyTimerConfig {
    pub count: u32,
    pub max_age_months: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct YearlyTimerConfig {
    pub count: u32,
    pub max_age_years: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MongoConnectionConfig {
    pub uri: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackupConfig {
    pub basedir: String,
    pub timezone: String,
    pub metadata_path: Option<String>,
    pub daily: DailyTimerConfig,
    pub weekly: WeeklyTimerConfig,
    pub monthly: MonthlyTimerConfig,
    pub yearly: YearlyTimerConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub database: MongoConnectionConfig,
    pub backup: BackupConfig,
}

impl Config {
    pub async fn new(path: &str) -> Result<Config> {
        let config_str = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }

    // Checks everything that must be fatal before any scheduling starts and
    // hands back the parsed timezone.
    pub fn validate(&self) -> Result<Tz> {
        if self.database.uri.trim().is_empty() {
            return Err(BackupError::Configuration(
                "database.uri must not be empty".to_string(),
            ));
        }
        self.database_name()?;

        if self.backup.basedir.trim().is_empty() {
            return Err(BackupError::Configuration(
                "backup.basedir must not be empty".to_string(),
            ));
        }
        if self.backup.daily.interval_minutes == 0 {
            return Err(BackupError::Configuration(
                "daily interval_minutes must be at least 1".to_string(),
            ));
        }
        // -1 disables daily retention; zero or any other negative value would
        // retain nothing forever.
        if self.backup.daily.keep_last == 0 || self.backup.daily.keep_last < -1 {
            return Err(BackupError::Configuration(format!(
                "daily keep_last of {} is invalid, use a positive count or -1 for unlimited",
                self.backup.daily.keep_last
            )));
        }

        let tz = self.backup.timezone.parse::<Tz>().map_err(|e| {
            BackupError::Configuration(format!(
                "unknown timezone '{}': {}",
                self.backup.timezone, e
            ))
        })?;
        Ok(tz)
    }

    // The database name is part of the connection URI path and stays constant
    // for the process lifetime.
    pub fn database_name(&self) -> Result<String> {
        let parsed = Url::parse(&self.database.uri).map_err(|e| {
            BackupError::Configuration(format!("invalid connection URI: {}", e))
        })?;
        let name = parsed.path().trim_start_matches('/');
        if name.is_empty() {
            return Err(BackupError::Configuration(
                "connection URI must name a database".to_string(),
            ));
        }
        Ok(name.to_string())
    }

    pub fn metadata_path(&self) -> PathBuf {
        match &self.backup.metadata_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.backup.basedir).join("backups.db"),
        }
    }
}
