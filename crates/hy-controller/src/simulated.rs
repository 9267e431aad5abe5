//! Simulated workload for sandbox runs and tests.
//!
//! Jobs live in memory and never execute anything. Their status changes when
//! the caller says so, or automatically after a configurable number of
//! status polls.

use async_trait::async_trait;
use dashmap::DashMap;
use hy_types::{HyResult, TransientIoError};
use parking_lot::Mutex;
use tracing::info;

use crate::workload::{
    CollectorTarget, JobHandle, JobManifest, JobStatus, MetricsCollector, Workload,
};

#[derive(Debug, Clone)]
struct SimulatedJob {
    manifest: JobManifest,
    status: JobStatus,
    polls: u32,
}

#[derive(Debug, Default)]
struct Counters {
    created: usize,
    failing_creates: usize,
    failing_polls: usize,
    deleted: Vec<String>,
}

/// In-process workload and collector.
#[derive(Debug, Default)]
pub struct SimulatedWorkload {
    jobs: DashMap<String, SimulatedJob>,
    targets: DashMap<String, CollectorTarget>,
    counters: Mutex<Counters>,
    /// Finish every job with this status once it has been polled this often.
    auto_complete: Option<(u32, JobStatus)>,
}

impl SimulatedWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_complete(mut self, after_polls: u32, outcome: JobStatus) -> Self {
        self.auto_complete = Some((after_polls, outcome));
        self
    }

    /// Make the next `n` job creations fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.counters.lock().failing_creates = n;
    }

    /// Make the next `n` status queries fail.
    pub fn fail_next_polls(&self, n: usize) {
        self.counters.lock().failing_polls = n;
    }

    /// Force a job into `status`. Returns false for unknown jobs.
    pub fn set_status(&self, name: &str, status: JobStatus) -> bool {
        match self.jobs.get_mut(name) {
            Some(mut job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// Drop a job without going through `delete_job`, as if it vanished.
    pub fn forget(&self, name: &str) {
        self.jobs.remove(name);
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|j| j.key().clone()).collect();
        names.sort();
        names
    }

    pub fn manifest(&self, name: &str) -> Option<JobManifest> {
        self.jobs.get(name).map(|j| j.manifest.clone())
    }

    /// Jobs whose status is still pending or running.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
            .count()
    }

    pub fn created_count(&self) -> usize {
        self.counters.lock().created
    }

    pub fn deleted(&self) -> Vec<String> {
        self.counters.lock().deleted.clone()
    }

    pub fn target(&self, trial_name: &str) -> Option<CollectorTarget> {
        self.targets.get(trial_name).map(|t| t.clone())
    }

    fn take_failure(slot: &mut usize) -> bool {
        if *slot > 0 {
            *slot -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Workload for SimulatedWorkload {
    async fn create_job(&self, manifest: &JobManifest) -> HyResult<JobHandle> {
        if Self::take_failure(&mut self.counters.lock().failing_creates) {
            return Err(TransientIoError::Workload {
                message: format!("simulated create failure for {}", manifest.name),
            }
            .into());
        }
        if self.jobs.contains_key(&manifest.name) {
            return Err(TransientIoError::Workload {
                message: format!("job {} already exists", manifest.name),
            }
            .into());
        }
        self.jobs.insert(
            manifest.name.clone(),
            SimulatedJob {
                manifest: manifest.clone(),
                status: JobStatus::Running,
                polls: 0,
            },
        );
        self.counters.lock().created += 1;
        info!(job = %manifest.name, command = %manifest.command, "simulated job created");
        Ok(JobHandle::new(&manifest.name))
    }

    async fn find_job(&self, name: &str) -> HyResult<Option<JobHandle>> {
        Ok(self.jobs.contains_key(name).then(|| JobHandle::new(name)))
    }

    async fn get_job_status(&self, handle: &JobHandle) -> HyResult<JobStatus> {
        if Self::take_failure(&mut self.counters.lock().failing_polls) {
            return Err(TransientIoError::Workload {
                message: format!("simulated status failure for {handle}"),
            }
            .into());
        }
        let Some(mut job) = self.jobs.get_mut(&handle.name) else {
            return Ok(JobStatus::NotFound);
        };
        job.polls += 1;
        if let Some((after, outcome)) = self.auto_complete {
            if job.status == JobStatus::Running && job.polls >= after {
                job.status = outcome;
            }
        }
        Ok(job.status)
    }

    async fn delete_job(&self, handle: &JobHandle) -> HyResult<()> {
        if self.jobs.remove(&handle.name).is_some() {
            self.counters.lock().deleted.push(handle.name.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsCollector for SimulatedWorkload {
    async fn register(&self, target: CollectorTarget) -> HyResult<()> {
        self.targets.insert(target.trial_name.clone(), target);
        Ok(())
    }
}
