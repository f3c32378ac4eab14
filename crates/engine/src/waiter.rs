//! The synchronous waiter (component F): submit happens elsewhere
//! (`Engine::submit_job` or `EngineWorkflowSubmitter`), this just polls
//! the Job Store until the job reaches a terminal state or the caller's
//! timeout elapses. Per the design note this exists at the edge, not
//! inside the scheduler — no subscription mechanism is embedded in the
//! core poll loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use loom_core::model::Job;
use loom_store::JobStore;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Polls a [`JobStore`] at `poll_interval` for a job's terminal state.
/// Backs the submission API's synchronous `workflow/<name>` route.
pub struct SyncWaiter {
    job_store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl SyncWaiter {
    #[must_use]
    pub fn new(job_store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            job_store,
            poll_interval,
        }
    }

    /// Poll until `job_id` reaches a terminal status or `timeout`
    /// elapses. The returned job's `status` tells the caller whether it
    /// completed, failed, or was cancelled — only a timeout is an `Err`.
    pub async fn wait(&self, job_id: Uuid, timeout: Duration) -> EngineResult<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.job_store.get_job(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Deadline(job_id));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_store::memory::MemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn returns_immediately_once_job_is_terminal() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = Job::new(None, None, json!({}), None);
        let id = job.id;
        store.create_job(job).await.unwrap();
        store.mark_job_running(id).await.unwrap();
        store.mark_job_completed(id, json!({"ok": true})).await.unwrap();

        let waiter = SyncWaiter::new(Arc::clone(&store), Duration::from_millis(10));
        let result = waiter.wait(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.status, loom_core::model::JobStatus::Completed);
        assert_eq!(result.output_data, json!({"ok": true}));
    }

    #[tokio::test]
    async fn times_out_while_job_stays_queued() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = Job::new(None, None, json!({}), None);
        let id = job.id;
        store.create_job(job).await.unwrap();

        let waiter = SyncWaiter::new(Arc::clone(&store), Duration::from_millis(10));
        let err = waiter.wait(id, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::Deadline(job_id) if job_id == id));
    }
}
