use tracing::{error, info};

use super::model::{Job, JobStatus, now_unix};
use super::store::{JobStore, JobStoreError};

/// A saturated job is only reported once its last outcome is this old. The
/// worker that recorded it normally completes the job well within that.
pub const STALL_GRACE_SECS: i64 = 60;

pub fn stall_cutoff(now: i64) -> i64 {
    now.saturating_sub(STALL_GRACE_SECS)
}

/// Sole writer of the `completed` and `completed_with_errors` states.
#[derive(Clone)]
pub struct CompletionAggregator {
    store: JobStore,
}

impl CompletionAggregator {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    /// Finishes the job if every file has an outcome. Safe to call from any
    /// number of tasks at once; only one of them gets `Some`.
    pub async fn try_complete(&self, job_id: &str) -> Result<Option<JobStatus>, JobStoreError> {
        let finished = self.store.complete_if_saturated(job_id, now_unix()).await?;
        if let Some(status) = finished {
            info!(job_id, status = status.as_str(), "import job finished");
        }
        Ok(finished)
    }

    /// Reports processing jobs whose counters have been saturated for longer
    /// than [`STALL_GRACE_SECS`]. These are left untouched for an operator to
    /// inspect.
    pub async fn sweep_stalled(&self) -> Result<Vec<Job>, JobStoreError> {
        let stalled = self.store.find_stalled(stall_cutoff(now_unix())).await?;
        for job in &stalled {
            error!(
                job_id = %job.id,
                total_files = job.total_files,
                processed_files = job.processed_files,
                failed_files = job.failed_files,
                "job has every outcome recorded but is still processing"
            );
        }
        Ok(stalled)
    }
}
