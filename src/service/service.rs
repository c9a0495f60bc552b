use async_trait::async_trait;
use tokio_cron_scheduler::JobScheduler;
use crate::error::Result;

#[async_trait]
pub trait Service: Send + Sync {
    async fn schedule(&self, sched: &mut JobScheduler) -> Result<()>;
}
