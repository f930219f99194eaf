//! The executable unit a worker invokes for each job.

use std::future::Future;

use async_trait::async_trait;

use spool_core::{JobArguments, JobOutcome};

use crate::store::JobRecord;

/// Context provided to job handlers.
pub struct JobContext {
    /// The record being attempted, as read just before the attempt.
    pub job: JobRecord,
    worker_id: String,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: JobRecord, worker_id: impl Into<String>) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        self.job.id()
    }

    /// Get the job arguments.
    pub fn arguments(&self) -> &JobArguments {
        self.job.arguments()
    }

    /// Retries already recorded for this job (0 on the first attempt).
    pub fn retry_count(&self) -> u32 {
        self.job.retry_count()
    }

    /// Worker running the attempt.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully; the record is deleted.
    Success,
    /// Job failed with a reason; routed through the retry policy.
    Failed(String),
}

impl JobResult {
    pub fn outcome(&self) -> JobOutcome {
        match self {
            JobResult::Success => JobOutcome::Success,
            JobResult::Failed(_) => JobOutcome::Fail,
        }
    }
}

/// Trait for job handlers.
///
/// The worker awaits `execute` before it looks at the next record, so a slow
/// handler delays every job queued on that worker. No timeout is applied.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// No-op handler for testing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl NoOpHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
///
/// ```ignore
/// let handler = handler_fn(|ctx: JobContext| async move {
///     println!("running {}", ctx.job_id());
///     JobResult::Success
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.f)(ctx).await
    }
}
