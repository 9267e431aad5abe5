//! Local child-process workload.
//!
//! Each job is a `sh -c <rendered template>` child. Its stdout is streamed
//! through the metrics log parser and every line's points are reported to
//! the store as they arrive; points the store turns away are retried. The
//! job's status only turns terminal after its output has been fully
//! reported.

use async_trait::async_trait;
use dashmap::DashMap;
use hy_metrics::MetricsLogParser;
use hy_store::Store;
use hy_types::{HyError, HyResult, Observation, TransientIoError};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::workload::{
    CollectorTarget, JobHandle, JobManifest, JobStatus, MetricsCollector, Workload,
};

struct ProcessJob {
    status: Arc<RwLock<JobStatus>>,
    target: watch::Sender<Option<CollectorTarget>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Runs trials as local shell commands and collects their stdout metrics.
pub struct ProcessWorkload {
    store: Arc<dyn Store>,
    jobs: DashMap<String, ProcessJob>,
    shell: String,
    workdir: Option<PathBuf>,
}

impl ProcessWorkload {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            jobs: DashMap::new(),
            shell: "sh".to_string(),
            workdir: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Workload for ProcessWorkload {
    async fn create_job(&self, manifest: &JobManifest) -> HyResult<JobHandle> {
        if self.jobs.contains_key(&manifest.name) {
            return Err(TransientIoError::Workload {
                message: format!("job {} already exists", manifest.name),
            }
            .into());
        }

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&manifest.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|err| TransientIoError::Workload {
            message: format!("failed to start job {}: {err}", manifest.name),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransientIoError::Workload {
            message: format!("job {} has no stdout", manifest.name),
        })?;

        let status = Arc::new(RwLock::new(JobStatus::Running));
        let (target_tx, target_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(
            manifest.name.clone(),
            child,
            stdout,
            target_rx,
            kill_rx,
            status.clone(),
            self.store.clone(),
        ));

        self.jobs.insert(
            manifest.name.clone(),
            ProcessJob {
                status,
                target: target_tx,
                kill: Some(kill_tx),
            },
        );
        info!(job = %manifest.name, command = %manifest.command, "job started");
        Ok(JobHandle::new(&manifest.name))
    }

    async fn find_job(&self, name: &str) -> HyResult<Option<JobHandle>> {
        Ok(self.jobs.contains_key(name).then(|| JobHandle::new(name)))
    }

    async fn get_job_status(&self, handle: &JobHandle) -> HyResult<JobStatus> {
        Ok(self
            .jobs
            .get(&handle.name)
            .map(|job| *job.status.read())
            .unwrap_or(JobStatus::NotFound))
    }

    async fn delete_job(&self, handle: &JobHandle) -> HyResult<()> {
        if let Some((_, mut job)) = self.jobs.remove(&handle.name) {
            if let Some(kill) = job.kill.take() {
                let _ = kill.send(());
            }
            info!(job = %handle.name, "job deleted");
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsCollector for ProcessWorkload {
    async fn register(&self, target: CollectorTarget) -> HyResult<()> {
        let job = self
            .jobs
            .get(&target.trial_name)
            .ok_or_else(|| HyError::not_found("job", target.trial_name.clone()))?;
        debug!(job = %target.trial_name, "metrics collector registered");
        job.target.send_replace(Some(target));
        Ok(())
    }
}

async fn supervise(
    name: String,
    mut child: Child,
    stdout: ChildStdout,
    mut target_rx: watch::Receiver<Option<CollectorTarget>>,
    mut kill_rx: oneshot::Receiver<()>,
    status: Arc<RwLock<JobStatus>>,
    store: Arc<dyn Store>,
) {
    let drained = tokio::select! {
        _ = &mut kill_rx => false,
        _ = collect(&name, stdout, &mut target_rx, store.as_ref()) => true,
    };

    let exit = if drained {
        tokio::select! {
            _ = &mut kill_rx => None,
            exit = child.wait() => Some(exit),
        }
    } else {
        None
    };

    let final_status = match exit {
        Some(Ok(code)) if code.success() => JobStatus::Succeeded,
        Some(Ok(code)) => {
            info!(job = %name, %code, "job exited with failure");
            JobStatus::Failed
        }
        Some(Err(err)) => {
            warn!(job = %name, %err, "failed to wait for job");
            JobStatus::Failed
        }
        None => {
            if let Err(err) = child.kill().await {
                debug!(job = %name, %err, "kill after delete failed");
            }
            JobStatus::Failed
        }
    };
    *status.write() = final_status;
    debug!(job = %name, status = ?final_status, "job finished");
}

/// First delay before re-reporting points the store turned away.
const REPORT_RETRY_BASE: Duration = Duration::from_millis(50);
const REPORT_RETRY_MAX: Duration = Duration::from_secs(2);

/// Parses one job's output for its collector target. Points the store
/// rejects with a retryable error stay pending and go out with the next
/// report.
struct Reporter {
    target: CollectorTarget,
    parser: MetricsLogParser,
    pending: Observation,
}

impl Reporter {
    fn new(target: CollectorTarget) -> Self {
        let parser = MetricsLogParser::new(&target.objective_metric, &target.additional_metrics);
        Self {
            target,
            parser,
            pending: Observation::new(),
        }
    }

    async fn feed(&mut self, job: &str, line: &str, store: &dyn Store) {
        self.pending.extend(self.parser.feed_line(line));
        self.flush(job, store).await;
    }

    /// One report attempt. Returns false while points remain pending.
    async fn flush(&mut self, job: &str, store: &dyn Store) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        match store
            .report_observation_log(self.target.trial_id, self.pending.clone())
            .await
        {
            Ok(()) => {
                self.pending = Observation::new();
                true
            }
            Err(err) if err.is_retryable() => {
                warn!(job, %err, pending = self.pending.len(), "failed to report metrics; will retry");
                false
            }
            Err(err) => {
                warn!(job, %err, dropped = self.pending.len(), "metrics rejected");
                self.pending = Observation::new();
                true
            }
        }
    }

    /// Retry with backoff until nothing is pending.
    async fn drain(&mut self, job: &str, store: &dyn Store) {
        let mut delay = REPORT_RETRY_BASE;
        while !self.flush(job, store).await {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(REPORT_RETRY_MAX);
        }
        if let Some(err) = self.parser.first_error() {
            debug!(job, %err, "job output contained malformed lines");
        }
    }
}

/// Stream stdout into the store. Output is read from the first line so the
/// child never blocks on a full pipe; lines read before a collector target
/// is registered are held and parsed once it arrives.
async fn collect(
    name: &str,
    stdout: ChildStdout,
    target_rx: &mut watch::Receiver<Option<CollectorTarget>>,
    store: &dyn Store,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut reporter: Option<Reporter> = None;
    let mut held = Vec::new();
    let mut registrable = true;

    loop {
        tokio::select! {
            changed = target_rx.changed(), if reporter.is_none() && registrable => {
                if changed.is_err() {
                    registrable = false;
                    continue;
                }
                let target = target_rx.borrow_and_update().clone();
                if let Some(target) = target {
                    reporter = Some(attach(name, target, &mut held, store).await);
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match reporter.as_mut() {
                    Some(reporter) => reporter.feed(name, &line, store).await,
                    None => held.push(line),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(job = name, %err, "reading job output failed");
                    break;
                }
            },
        }
    }

    if reporter.is_none() && registrable {
        debug!(job = name, held = held.len(), "output ended before collector registration");
        let target = target_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|target| (*target).clone());
        if let Some(target) = target {
            reporter = Some(attach(name, target, &mut held, store).await);
        }
    }

    if let Some(mut reporter) = reporter {
        reporter.drain(name, store).await;
    }
}

async fn attach(
    name: &str,
    target: CollectorTarget,
    held: &mut Vec<String>,
    store: &dyn Store,
) -> Reporter {
    let mut reporter = Reporter::new(target);
    for line in held.drain(..) {
        reporter.feed(name, &line, store).await;
    }
    reporter
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hy_store::{MemoryStore, StoreOp};
    use hy_types::Trial;

    async fn setup(name: &str) -> (Arc<MemoryStore>, ProcessWorkload, Trial) {
        let store = Arc::new(MemoryStore::new());
        let trial = Trial::new("exp", name, vec![]);
        store.put_trial(trial.clone()).await.unwrap();
        let workload = ProcessWorkload::new(store.clone());
        (store, workload, trial)
    }

    fn manifest(trial: &Trial, command: &str) -> JobManifest {
        JobManifest {
            name: trial.name.clone(),
            study_id: trial.study_id.clone(),
            trial_id: trial.id,
            command: command.to_string(),
        }
    }

    fn target(trial: &Trial) -> CollectorTarget {
        CollectorTarget {
            trial_id: trial.id,
            trial_name: trial.name.clone(),
            objective_metric: "accuracy".to_string(),
            additional_metrics: vec!["loss".to_string()],
        }
    }

    async fn wait_finished(workload: &ProcessWorkload, handle: &JobHandle) -> JobStatus {
        for _ in 0..500 {
            let status = workload.get_job_status(handle).await.unwrap();
            if status.is_finished() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {handle} did not finish");
    }

    #[tokio::test]
    async fn stdout_metrics_reach_the_store() {
        let (store, workload, trial) = setup("exp-ok").await;
        let script = "echo 'accuracy=0.5'; echo 'epoch 1 done'; \
                      echo '2024-01-01T00:00:00Z accuracy=0.7 loss=1.5 other=3'";
        let handle = workload.create_job(&manifest(&trial, script)).await.unwrap();
        workload.register(target(&trial)).await.unwrap();

        assert_eq!(wait_finished(&workload, &handle).await, JobStatus::Succeeded);

        let logs = store.get_trial_logs(trial.id, &[]).await.unwrap();
        let accuracy: Vec<&str> = logs
            .series("accuracy")
            .iter()
            .map(|p| p.value.as_str())
            .collect();
        assert_eq!(accuracy, vec!["0.5", "0.7"]);
        assert_eq!(logs.series("loss").len(), 1);
        assert!(logs.series("other").is_empty());
        assert!(logs.series("accuracy")[1].timestamp.is_some());
    }

    fn accuracy_values(logs: &Observation) -> Vec<String> {
        logs.series("accuracy").iter().map(|p| p.value.clone()).collect()
    }

    #[tokio::test]
    async fn rejected_points_go_out_with_the_next_line() {
        let (store, workload, trial) = setup("exp-retry").await;
        store.fail_next(StoreOp::ReportObservationLog, 1);
        let handle = workload
            .create_job(&manifest(&trial, "echo accuracy=0.5; sleep 0.2; echo accuracy=0.7"))
            .await
            .unwrap();
        workload.register(target(&trial)).await.unwrap();

        assert_eq!(wait_finished(&workload, &handle).await, JobStatus::Succeeded);
        let logs = store.get_trial_logs(trial.id, &[]).await.unwrap();
        assert_eq!(accuracy_values(&logs), vec!["0.5", "0.7"]);
        assert_eq!(store.get_stats().injected_failures, 1);
    }

    #[tokio::test]
    async fn rejected_final_points_are_retried_before_finishing() {
        let (store, workload, trial) = setup("exp-retry-last").await;
        store.fail_next(StoreOp::ReportObservationLog, 3);
        let handle = workload
            .create_job(&manifest(&trial, "echo accuracy=0.9"))
            .await
            .unwrap();
        workload.register(target(&trial)).await.unwrap();

        assert_eq!(wait_finished(&workload, &handle).await, JobStatus::Succeeded);
        let logs = store.get_trial_logs(trial.id, &[]).await.unwrap();
        assert_eq!(accuracy_values(&logs), vec!["0.9"]);
        assert_eq!(store.get_stats().injected_failures, 3);
    }

    #[tokio::test]
    async fn output_drains_before_registration() {
        let (store, workload, trial) = setup("exp-chatty").await;
        let marker = std::env::temp_dir().join(format!("halyard-{}", uuid::Uuid::new_v4()));
        let script = format!(
            "yes accuracy=1 | head -n 20000; touch {}",
            marker.display()
        );
        let handle = workload.create_job(&manifest(&trial, &script)).await.unwrap();

        let mut exited = false;
        for _ in 0..500 {
            if marker.exists() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(exited, "job blocked on its output");
        assert_eq!(
            workload.get_job_status(&handle).await.unwrap(),
            JobStatus::Running
        );

        workload.register(target(&trial)).await.unwrap();
        assert_eq!(wait_finished(&workload, &handle).await, JobStatus::Succeeded);
        let logs = store.get_trial_logs(trial.id, &[]).await.unwrap();
        assert_eq!(logs.series("accuracy").len(), 20_000);
        let _ = std::fs::remove_file(&marker);
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_job() {
        let (_store, workload, trial) = setup("exp-fail").await;
        let handle = workload
            .create_job(&manifest(&trial, "echo accuracy=0.1; exit 3"))
            .await
            .unwrap();
        workload.register(target(&trial)).await.unwrap();
        assert_eq!(wait_finished(&workload, &handle).await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn delete_kills_and_forgets() {
        let (_store, workload, trial) = setup("exp-long").await;
        let handle = workload
            .create_job(&manifest(&trial, "sleep 30"))
            .await
            .unwrap();
        assert!(workload.find_job(&trial.name).await.unwrap().is_some());
        assert!(workload.create_job(&manifest(&trial, "sleep 30")).await.is_err());

        workload.delete_job(&handle).await.unwrap();
        assert!(workload.find_job(&trial.name).await.unwrap().is_none());
        assert_eq!(
            workload.get_job_status(&handle).await.unwrap(),
            JobStatus::NotFound
        );
    }

    #[tokio::test]
    async fn registering_unknown_job_is_not_found() {
        let (_store, workload, trial) = setup("exp-none").await;
        let err = workload.register(target(&trial)).await.unwrap_err();
        assert!(matches!(err, HyError::NotFound { .. }));
    }
}
