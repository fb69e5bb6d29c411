use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::activations::ActivationService;
use crate::errors::ServiceError;

/// Initialize and start the background job scheduler.
///
/// Pending activations are lazily expired on the request path; the sweep
/// catches the ones nobody asks about again.
pub async fn init_scheduler(activations: ActivationService) -> Result<JobScheduler, ServiceError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| ServiceError::Other(format!("failed to create job scheduler: {e}")))?;

    // Expire pending activations - runs every 5 minutes
    let expire_job = Job::new_async("0 */5 * * * *", move |_uuid, _l| {
        let activations = activations.clone();
        Box::pin(async move {
            info!("Running expire_pending_activations job");
            match activations.expire_pending_activations().await {
                Ok(count) => {
                    info!("Expired {} pending activations", count);
                }
                Err(e) => {
                    error!("Failed to expire pending activations: {}", e);
                }
            }
        })
    })
    .map_err(|e| ServiceError::Other(format!("failed to create expiry job: {e}")))?;

    sched
        .add(expire_job)
        .await
        .map_err(|e| ServiceError::Other(format!("failed to add expiry job: {e}")))?;

    sched
        .start()
        .await
        .map_err(|e| ServiceError::Other(format!("failed to start job scheduler: {e}")))?;

    info!("Job scheduler started");

    Ok(sched)
}
