//! Workload and metrics-collector abstractions.
//!
//! A workload runs one trial's job somewhere outside the controller. The
//! controller addresses jobs by the trial name only, so a job created by an
//! aborted pass can be found again and adopted.

use async_trait::async_trait;
use hy_types::{HyResult, StudyId, TrialId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What to run for a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    /// Job name; equal to the trial name.
    pub name: String,
    pub study_id: StudyId,
    pub trial_id: TrialId,
    /// Rendered trial template.
    pub command: String,
}

/// Reference to a job known to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub name: String,
}

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Job state as reported by a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The workload has no job under this handle.
    NotFound,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::NotFound)
    }
}

/// Runs trial jobs.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Start a job. Fails if a job with the same name already exists.
    async fn create_job(&self, manifest: &JobManifest) -> HyResult<JobHandle>;

    /// Look a job up by name.
    async fn find_job(&self, name: &str) -> HyResult<Option<JobHandle>>;

    async fn get_job_status(&self, handle: &JobHandle) -> HyResult<JobStatus>;

    /// Stop and forget a job. Deleting an unknown job is not an error.
    async fn delete_job(&self, handle: &JobHandle) -> HyResult<()>;
}

/// Where a collector should send the metrics it harvests for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorTarget {
    pub trial_id: TrialId,
    pub trial_name: String,
    pub objective_metric: String,
    pub additional_metrics: Vec<String>,
}

/// Harvests metrics from running jobs and reports them to the store.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Start collecting for a trial. Registering the same trial twice is
    /// harmless.
    async fn register(&self, target: CollectorTarget) -> HyResult<()>;
}
