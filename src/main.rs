use std::env;
use std::sync::Arc;
use log::{error, info};
use tokio::fs;
use tokio_cron_scheduler::JobScheduler;
use crate::config::Config;
use crate::database::Database;
use crate::error::Result;
use crate::service::mongo::mongo_service::MongoService;
use crate::service::service::Service;

mod config;
mod database;
mod error;
mod service;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Arc::new(Config::new(&config_path).await?);
    let tz = config.validate()?;
    let database_name = config.database_name()?;

    fs::create_dir_all(&config.backup.basedir).await?;
    let db = Database::connect(&config.metadata_path()).await?;

    let service = MongoService::new(config.clone(), tz, db)?;
    service.probe().await?;

    // Cover any weekly, monthly or yearly run missed while the process was
    // down, before the periodic timers take over.
    if let Err(e) = service.backfill().await {
        error!("Startup backfill did not complete: {}", e);
    }

    let mut sched = JobScheduler::new().await?;
    service.schedule(&mut sched).await?;
    sched.start().await?;
    info!("Backup scheduler started for database '{}'.", database_name);

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, exiting.");
    Ok(())
}
