//! Experiment reconciliation.
//!
//! One [`ExperimentController::reconcile`] call is one pass over one
//! experiment: it compares the trials in the store with the experiment's
//! budget, creates and launches new trials, harvests finished ones, applies
//! early stopping and writes the resulting status back. Passes are
//! idempotent; anything a failed pass left half done is picked up by the
//! next one.

use crossbeam_channel::Sender;
use hy_earlystop::EarlyStoppingService;
use hy_store::Store;
use hy_suggest::{SuggestionQuery, SuggestionService};
use hy_types::{
    logic_error, EarlyStoppingParam, Experiment, ExperimentPhase, HyError, HyResult, LogicError,
    Trial, TrialCounts, TrialLog, TrialStatus,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::events::ControllerEvent;
use crate::template;
use crate::workload::{CollectorTarget, JobHandle, JobManifest, JobStatus, MetricsCollector, Workload};

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NAME_SUFFIX_LEN: usize = 8;
const NAME_ATTEMPTS: usize = 16;

/// What the work queue should do with the experiment after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Still running; look again after the delay.
    Requeue(Duration),
    /// Terminal or gone.
    Done,
}

pub struct ExperimentController {
    store: Arc<dyn Store>,
    workload: Arc<dyn Workload>,
    collector: Arc<dyn MetricsCollector>,
    suggestions: Arc<SuggestionService>,
    early_stopping: Arc<EarlyStoppingService>,
    events: Option<Sender<ControllerEvent>>,
    poll_interval: Duration,
}

impl ExperimentController {
    pub fn new(
        store: Arc<dyn Store>,
        workload: Arc<dyn Workload>,
        collector: Arc<dyn MetricsCollector>,
        suggestions: Arc<SuggestionService>,
        early_stopping: Arc<EarlyStoppingService>,
    ) -> Self {
        Self {
            store,
            workload,
            collector,
            suggestions,
            early_stopping,
            events: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Emit [`ControllerEvent`]s on `tx`.
    pub fn with_events(mut self, tx: Sender<ControllerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn suggestions(&self) -> &Arc<SuggestionService> {
        &self.suggestions
    }

    pub fn early_stopping(&self) -> &Arc<EarlyStoppingService> {
        &self.early_stopping
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        if let Some(tx) = &self.events {
            // Best-effort; a dropped receiver only loses the event.
            let _ = tx.try_send(event);
        }
    }

    /// Run one reconcile pass for `name`.
    pub async fn reconcile(&self, name: &str) -> HyResult<ReconcileOutcome> {
        let mut experiment = match self.store.get_experiment(name).await {
            Ok(experiment) => experiment,
            Err(HyError::NotFound { .. }) => {
                debug!(experiment = name, "experiment gone");
                return Ok(ReconcileOutcome::Done);
            }
            Err(err) => return Err(err),
        };
        let issued_before = experiment.total_issued;

        if experiment.deletion_requested {
            return match self.finalize(&mut experiment).await {
                Ok(()) => Ok(ReconcileOutcome::Done),
                Err(err) => {
                    self.record_error(&mut experiment, issued_before, &err).await;
                    Err(err)
                }
            };
        }
        if experiment.is_terminal() {
            return Ok(ReconcileOutcome::Done);
        }

        match self.sync(&mut experiment).await {
            Ok(outcome) => Ok(outcome),
            Err(err @ HyError::Config(_)) => {
                error!(experiment = name, %err, "experiment configuration rejected");
                experiment.mark_failed(err.to_string());
                self.store
                    .update_experiment_status(name, experiment.status.clone(), experiment.total_issued)
                    .await?;
                self.emit(ControllerEvent::ExperimentFinished {
                    experiment: name.to_string(),
                    phase: ExperimentPhase::Failed,
                });
                Err(err)
            }
            Err(err @ HyError::Logic(_)) => {
                self.record_error(&mut experiment, issued_before, &err).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Put `err` on the status error field. Failures here are only logged.
    async fn record_error(&self, experiment: &mut Experiment, issued: u32, err: &HyError) {
        experiment.status.last_error = Some(err.to_string());
        if let Err(store_err) = self
            .store
            .update_experiment_status(experiment.name(), experiment.status.clone(), issued)
            .await
        {
            warn!(experiment = %experiment.name(), %store_err, "could not record reconcile error");
        }
    }

    async fn sync(&self, experiment: &mut Experiment) -> HyResult<ReconcileOutcome> {
        let name = experiment.name().to_string();
        experiment.mark_running();
        experiment.status.last_error = None;

        let trials = self.store.get_trial_list(&name).await?;
        let existing = trials.len() as u32;
        if existing > experiment.total_issued {
            debug!(
                experiment = %name,
                recorded = experiment.total_issued,
                existing,
                "issued count behind trial list"
            );
            experiment.total_issued = existing;
        }
        experiment.recompute_best(&trials);

        for trial in trials.iter().filter(|t| t.status == TrialStatus::Pending) {
            self.launch(experiment, trial).await?;
        }

        let exhausted = self.create_trials(experiment, &trials).await?;

        let trials = self.store.get_trial_list(&name).await?;
        for trial in trials.iter().filter(|t| t.status == TrialStatus::Running) {
            self.poll_trial(experiment, trial).await?;
        }

        let trials = self.store.get_trial_list(&name).await?;
        self.apply_early_stopping(experiment, &trials).await?;

        let trials = self.store.get_trial_list(&name).await?;
        experiment.recompute_best(&trials);
        self.update_phase(experiment, &trials, exhausted).await?;

        self.store
            .update_experiment_status(&name, experiment.status.clone(), experiment.total_issued)
            .await?;

        if experiment.is_terminal() {
            info!(
                experiment = %name,
                phase = ?experiment.status.phase,
                best = ?experiment.status.best_trial.as_ref().map(|b| b.objective_value),
                "experiment finished"
            );
            self.emit(ControllerEvent::ExperimentFinished {
                experiment: name,
                phase: experiment.status.phase,
            });
            Ok(ReconcileOutcome::Done)
        } else {
            Ok(ReconcileOutcome::Requeue(self.poll_interval))
        }
    }

    /// Fill free parallel slots with new trials. Returns true when the
    /// suggestion engine handed out fewer sets than requested.
    async fn create_trials(&self, experiment: &mut Experiment, trials: &[Trial]) -> HyResult<bool> {
        let study = experiment.study().clone();
        let active = TrialCounts::tally(trials).active() as u32;
        let slots = study
            .parallel_trial_count
            .saturating_sub(active)
            .min(experiment.remaining_budget());
        if slots == 0 || experiment.goal_reached() {
            return Ok(false);
        }

        let assignments = self.suggestions.get_suggestions(&SuggestionQuery {
            study_id: &study.name,
            algorithm: &study.suggestion_algorithm,
            request_count: i32::try_from(slots).unwrap_or(i32::MAX),
            parameters: &study.parameters,
            prior_trials: trials,
            param_id: experiment.suggestion_param_id.as_deref(),
        })?;
        let exhausted = assignments.len() < slots as usize;
        if exhausted {
            info!(
                experiment = %study.name,
                requested = slots,
                received = assignments.len(),
                "search space exhausted"
            );
        }

        for parameters in assignments {
            let trial_name = self.unique_trial_name(&study.name).await?;
            let trial = Trial::new(study.name.clone(), trial_name, parameters);
            self.store.put_trial(trial.clone()).await?;
            experiment.total_issued += 1;
            info!(experiment = %study.name, trial = %trial.name, "trial created");
            self.emit(ControllerEvent::TrialCreated {
                experiment: study.name.clone(),
                trial: trial.name.clone(),
            });
            self.launch(experiment, &trial).await?;
        }
        Ok(exhausted)
    }

    async fn unique_trial_name(&self, experiment: &str) -> HyResult<String> {
        for _ in 0..NAME_ATTEMPTS {
            let candidate = format!("{experiment}-{}", random_suffix());
            if self
                .store
                .get_trial_by_name(experiment, &candidate)
                .await?
                .is_none()
            {
                return Ok(candidate);
            }
        }
        Err(logic_error!("no free trial name for experiment {experiment}"))
    }

    /// Start (or adopt) the job of a Pending trial and mark it Running.
    async fn launch(&self, experiment: &Experiment, trial: &Trial) -> HyResult<()> {
        let handle = match self.workload.find_job(&trial.name).await? {
            Some(handle) => {
                info!(trial = %trial.name, "adopting existing job");
                handle
            }
            None => {
                let created = match template::render(&experiment.spec.trial_template, trial) {
                    Ok(command) => {
                        self.workload
                            .create_job(&JobManifest {
                                name: trial.name.clone(),
                                study_id: trial.study_id.clone(),
                                trial_id: trial.id,
                                command,
                            })
                            .await
                    }
                    Err(err) => Err(err.into()),
                };
                match created {
                    Ok(handle) => handle,
                    Err(err) => {
                        warn!(trial = %trial.name, %err, "job creation failed; failing trial");
                        self.store
                            .update_trial_status(trial.id, TrialStatus::Failed, None)
                            .await?;
                        self.emit(ControllerEvent::TrialCompleted {
                            experiment: trial.study_id.clone(),
                            trial: trial.name.clone(),
                            status: TrialStatus::Failed,
                            objective_value: None,
                        });
                        return Ok(());
                    }
                }
            }
        };

        self.collector
            .register(collector_target(experiment, trial))
            .await?;
        self.store
            .update_trial_status(trial.id, TrialStatus::Running, None)
            .await?;
        debug!(trial = %trial.name, job = %handle, "trial running");
        Ok(())
    }

    /// Move a Running trial to its terminal state once its job has finished.
    async fn poll_trial(&self, experiment: &Experiment, trial: &Trial) -> HyResult<()> {
        let status = self
            .workload
            .get_job_status(&JobHandle::new(&trial.name))
            .await?;
        let (next, objective_value) = match status {
            JobStatus::Pending | JobStatus::Running => return Ok(()),
            JobStatus::Succeeded => {
                let metric = &experiment.study().objective_metric;
                let logs = self
                    .store
                    .get_trial_logs(trial.id, std::slice::from_ref(metric))
                    .await?;
                let value = logs.latest(metric);
                if value.is_none() {
                    warn!(trial = %trial.name, metric = %metric, "trial succeeded without a numeric objective");
                }
                (TrialStatus::Succeeded, value)
            }
            JobStatus::Failed => (TrialStatus::Failed, None),
            JobStatus::NotFound => {
                warn!(trial = %trial.name, "job vanished; failing trial");
                (TrialStatus::Failed, None)
            }
        };

        self.store
            .update_trial_status(trial.id, next, objective_value)
            .await?;
        info!(trial = %trial.name, status = %next, objective = ?objective_value, "trial completed");
        self.emit(ControllerEvent::TrialCompleted {
            experiment: trial.study_id.clone(),
            trial: trial.name.clone(),
            status: next,
            objective_value,
        });
        Ok(())
    }

    async fn apply_early_stopping(&self, experiment: &Experiment, trials: &[Trial]) -> HyResult<()> {
        let study = experiment.study();
        if study.early_stopping_algorithm.is_empty() {
            return Ok(());
        }
        let running: Vec<&Trial> = trials
            .iter()
            .filter(|t| t.status == TrialStatus::Running)
            .collect();
        let succeeded: Vec<&Trial> = trials
            .iter()
            .filter(|t| t.status == TrialStatus::Succeeded)
            .collect();
        if running.is_empty() || succeeded.is_empty() {
            return Ok(());
        }

        let completed_logs = self.trial_logs(&succeeded).await?;
        let running_logs = self.trial_logs(&running).await?;
        let decisions = self.early_stopping.should_trial_stop(
            study,
            &study.early_stopping_algorithm,
            experiment.early_stopping_param_id.as_deref(),
            &completed_logs,
            &running_logs,
        )?;

        for decision in decisions {
            if let Some(trial) = running.iter().find(|t| t.id == decision.trial_id) {
                self.kill_trial(trial, &decision.summary()).await?;
            }
        }
        Ok(())
    }

    async fn trial_logs(&self, trials: &[&Trial]) -> HyResult<Vec<TrialLog>> {
        let mut logs = Vec::with_capacity(trials.len());
        for trial in trials {
            let observation = self.store.get_trial_logs(trial.id, &[]).await?;
            logs.push(TrialLog::new(trial.id, observation));
        }
        Ok(logs)
    }

    async fn kill_trial(&self, trial: &Trial, reason: &str) -> HyResult<()> {
        self.workload
            .delete_job(&JobHandle::new(&trial.name))
            .await?;
        self.store
            .update_trial_status(trial.id, TrialStatus::Killed, None)
            .await?;
        info!(trial = %trial.name, reason, "trial killed");
        self.emit(ControllerEvent::TrialKilled {
            experiment: trial.study_id.clone(),
            trial: trial.name.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn kill_active(&self, trials: &[Trial], reason: &str) -> HyResult<()> {
        for trial in trials.iter().filter(|t| t.status.is_active()) {
            self.kill_trial(trial, reason).await?;
        }
        Ok(())
    }

    async fn update_phase(
        &self,
        experiment: &mut Experiment,
        trials: &[Trial],
        exhausted: bool,
    ) -> HyResult<()> {
        let study = experiment.study().clone();
        let counts = TrialCounts::tally(trials);
        let too_many_failures = study
            .max_failed_trial_count
            .filter(|limit| counts.failed > *limit as usize);

        if experiment.goal_reached() {
            self.kill_active(trials, "optimization goal reached").await?;
            experiment.mark_succeeded();
        } else if let Some(limit) = too_many_failures {
            self.kill_active(trials, "too many failed trials").await?;
            experiment.mark_failed(format!(
                "{} trials failed, more than the limit of {limit}",
                counts.failed
            ));
        } else if counts.active() == 0
            && (experiment.total_issued >= study.max_trial_count || exhausted)
        {
            experiment.mark_succeeded();
        }

        let trials = self.store.get_trial_list(&study.name).await?;
        experiment.status.trials = TrialCounts::tally(&trials);
        Ok(())
    }

    /// Delete an experiment: stop its jobs, cascade-delete its trials,
    /// verify the cascade and release the finalizer.
    async fn finalize(&self, experiment: &mut Experiment) -> HyResult<()> {
        let name = experiment.name().to_string();
        if experiment.status.phase != ExperimentPhase::Terminating {
            experiment.status.phase = ExperimentPhase::Terminating;
            self.store
                .update_experiment_status(&name, experiment.status.clone(), experiment.total_issued)
                .await?;
        }

        let trials = self.store.get_trial_list(&name).await?;
        for trial in trials.iter().filter(|t| t.status.is_active()) {
            self.workload
                .delete_job(&JobHandle::new(&trial.name))
                .await?;
        }
        let deleted = self.store.delete_trials_for_study(&name).await?;
        let remaining = self.store.get_trial_list(&name).await?.len();
        if remaining > 0 {
            return Err(LogicError::CascadeIncomplete {
                experiment: name,
                remaining,
            }
            .into());
        }

        self.suggestions.remove_study(&name);
        self.early_stopping.remove_study(&name);
        if experiment.finalizer {
            self.store.clear_finalizer(&name).await?;
        }
        self.store.remove_experiment(&name).await?;
        info!(experiment = %name, deleted, "experiment deleted");
        self.emit(ControllerEvent::ExperimentDeleted { experiment: name });
        Ok(())
    }
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

/// Objective plus additional metrics, plus the early-stopping metric when it
/// is neither.
fn collector_target(experiment: &Experiment, trial: &Trial) -> CollectorTarget {
    let study = experiment.study();
    let mut additional = study.additional_metrics.clone();
    let eval_metric = EarlyStoppingParam::from_parameters(&experiment.spec.early_stopping_parameters)
        .ok()
        .and_then(|param| param.eval_metric)
        .filter(|m| !m.is_empty() && *m != study.objective_metric);
    if let Some(metric) = eval_metric {
        if !additional.contains(&metric) {
            additional.push(metric);
        }
    }
    CollectorTarget {
        trial_id: trial.id,
        trial_name: trial.name.clone(),
        objective_metric: study.objective_metric.clone(),
        additional_metrics: additional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedWorkload;
    use async_trait::async_trait;
    use crossbeam_channel::{unbounded, Receiver};
    use hy_store::{MemoryStore, StoreOp};
    use hy_types::{
        ExperimentSpec, ExperimentStatus, MetricPoint, Observation, OptimizationType,
        ParameterConfig, StudyConfig, TrialId,
    };

    struct Harness {
        store: Arc<MemoryStore>,
        workload: Arc<SimulatedWorkload>,
        suggestions: Arc<SuggestionService>,
        early_stopping: Arc<EarlyStoppingService>,
        controller: ExperimentController,
        events: Receiver<ControllerEvent>,
    }

    fn harness_with(store: Arc<dyn Store>, memory: Arc<MemoryStore>, workload: SimulatedWorkload) -> Harness {
        let workload = Arc::new(workload);
        let suggestions = Arc::new(SuggestionService::new());
        let early_stopping = Arc::new(EarlyStoppingService::new());
        let (tx, rx) = unbounded();
        let controller = ExperimentController::new(
            store,
            workload.clone(),
            workload.clone(),
            suggestions.clone(),
            early_stopping.clone(),
        )
        .with_events(tx)
        .with_poll_interval(Duration::from_millis(10));
        Harness {
            store: memory,
            workload,
            suggestions,
            early_stopping,
            controller,
            events: rx,
        }
    }

    fn harness(workload: SimulatedWorkload) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with(store.clone(), store, workload)
    }

    fn spec(parallel: u32, max: u32) -> ExperimentSpec {
        let study = StudyConfig::new("exp", "accuracy")
            .with_parameter(ParameterConfig::double("lr", 0.01, 0.1))
            .with_optimization(OptimizationType::Maximize, None)
            .with_trial_limits(parallel, max);
        ExperimentSpec::new(study, "train --lr={{lr}} --name={{trial_name}}")
    }

    async fn submit(h: &Harness, spec: ExperimentSpec) -> String {
        let name = spec.study.name.clone();
        let mut experiment = Experiment::new(spec.clone());
        experiment.suggestion_param_id = Some(
            h.suggestions
                .set_suggestion_parameters(
                    &name,
                    &spec.study.suggestion_algorithm,
                    spec.suggestion_parameters.clone(),
                )
                .unwrap(),
        );
        if !spec.study.early_stopping_algorithm.is_empty() {
            experiment.early_stopping_param_id = Some(
                h.early_stopping
                    .set_early_stopping_parameters(
                        &name,
                        &spec.study.early_stopping_algorithm,
                        spec.early_stopping_parameters.clone(),
                    )
                    .unwrap(),
            );
        }
        h.store.create_experiment(experiment).await.unwrap();
        name
    }

    async fn trials(h: &Harness, name: &str) -> Vec<Trial> {
        h.store.get_trial_list(name).await.unwrap()
    }

    async fn report(h: &Harness, trial: TrialId, values: &[&str]) {
        let mut obs = Observation::new();
        for v in values {
            obs.push("accuracy", MetricPoint::new(None, *v));
        }
        h.store.report_observation_log(trial, obs).await.unwrap();
    }

    #[tokio::test]
    async fn sequential_budget_runs_exactly_max_trials() {
        let h = harness(SimulatedWorkload::new().with_auto_complete(1, JobStatus::Succeeded));
        let name = submit(&h, spec(1, 3)).await;

        let mut passes = 0;
        loop {
            passes += 1;
            assert!(passes <= 10, "experiment did not finish");
            let outcome = h.controller.reconcile(&name).await.unwrap();
            let active = TrialCounts::tally(&trials(&h, &name).await).active();
            assert!(active <= 1);
            if outcome == ReconcileOutcome::Done {
                break;
            }
        }

        let all = trials(&h, &name).await;
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|t| t.status.is_terminal()));
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.status.phase, ExperimentPhase::Succeeded);
        assert_eq!(experiment.total_issued, 3);
        assert_eq!(experiment.status.trials.succeeded, 3);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(2, 2)).await;

        for _ in 0..3 {
            let outcome = h.controller.reconcile(&name).await.unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Requeue(_)));
        }
        assert_eq!(trials(&h, &name).await.len(), 2);
        assert_eq!(h.workload.created_count(), 2);
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.total_issued, 2);
        assert_eq!(experiment.status.phase, ExperimentPhase::Running);
        assert_eq!(experiment.status.trials.running, 2);
    }

    #[tokio::test]
    async fn terminal_experiment_is_left_alone() {
        let h = harness(SimulatedWorkload::new().with_auto_complete(1, JobStatus::Succeeded));
        let name = submit(&h, spec(1, 1)).await;
        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);
        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);
        assert_eq!(trials(&h, &name).await.len(), 1);
        assert_eq!(h.workload.created_count(), 1);
    }

    #[tokio::test]
    async fn trial_names_and_commands() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(1, 1)).await;
        h.controller.reconcile(&name).await.unwrap();

        let trial = &trials(&h, &name).await[0];
        let suffix = trial.name.strip_prefix("exp-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let manifest = h.workload.manifest(&trial.name).unwrap();
        let lr = trial.parameter("lr").unwrap();
        assert_eq!(
            manifest.command,
            format!("train --lr={lr} --name={}", trial.name)
        );
        let target = h.workload.target(&trial.name).unwrap();
        assert_eq!(target.trial_id, trial.id);
        assert_eq!(target.objective_metric, "accuracy");
    }

    #[tokio::test]
    async fn store_failure_does_not_persist_issued_count() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(2, 4)).await;

        h.store.fail_next(StoreOp::UpdateExperimentStatus, 1);
        let err = h.controller.reconcile(&name).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.store.get_experiment(&name).await.unwrap().total_issued, 0);
        assert_eq!(trials(&h, &name).await.len(), 2);

        // Next pass reconciles the count from the trials that exist and
        // creates nothing new while both slots are busy.
        h.controller.reconcile(&name).await.unwrap();
        assert_eq!(h.store.get_experiment(&name).await.unwrap().total_issued, 2);
        assert_eq!(trials(&h, &name).await.len(), 2);
        assert_eq!(h.workload.created_count(), 2);
    }

    #[tokio::test]
    async fn pending_trial_adopts_existing_job() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(1, 1)).await;

        // Job gets created, then marking the trial Running fails.
        h.store.fail_next(StoreOp::UpdateTrialStatus, 1);
        assert!(h.controller.reconcile(&name).await.is_err());
        let trial = trials(&h, &name).await.remove(0);
        assert_eq!(trial.status, TrialStatus::Pending);
        assert_eq!(h.workload.created_count(), 1);

        h.controller.reconcile(&name).await.unwrap();
        let trial = trials(&h, &name).await.remove(0);
        assert_eq!(trial.status, TrialStatus::Running);
        assert_eq!(h.workload.created_count(), 1);
        assert_eq!(trials(&h, &name).await.len(), 1);
    }

    #[tokio::test]
    async fn create_failure_fails_only_that_trial() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(2, 2)).await;
        h.workload.fail_next_creates(1);

        h.controller.reconcile(&name).await.unwrap();
        let counts = TrialCounts::tally(&trials(&h, &name).await);
        assert_eq!((counts.failed, counts.running), (1, 1));
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.status.phase, ExperimentPhase::Running);
    }

    #[tokio::test]
    async fn vanished_job_fails_trial() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(1, 2)).await;
        h.controller.reconcile(&name).await.unwrap();

        let first = trials(&h, &name).await.remove(0);
        h.workload.forget(&first.name);
        h.controller.reconcile(&name).await.unwrap();
        let first = h.store.get_trial(first.id).await.unwrap();
        assert_eq!(first.status, TrialStatus::Failed);
    }

    #[tokio::test]
    async fn objective_recorded_and_best_trial_tracked() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(2, 2)).await;
        h.controller.reconcile(&name).await.unwrap();

        let all = trials(&h, &name).await;
        report(&h, all[0].id, &["0.4", "0.6"]).await;
        report(&h, all[1].id, &["0.9", "0.7"]).await;
        for t in &all {
            h.workload.set_status(&t.name, JobStatus::Succeeded);
        }

        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);
        let first = h.store.get_trial(all[0].id).await.unwrap();
        assert_eq!(first.objective_value, Some(0.6));

        let experiment = h.store.get_experiment(&name).await.unwrap();
        let best = experiment.status.best_trial.unwrap();
        assert_eq!(best.trial_name, all[1].name);
        assert_eq!(best.objective_value, 0.7);
    }

    #[tokio::test]
    async fn reaching_the_goal_kills_remaining_trials() {
        let h = harness(SimulatedWorkload::new());
        let mut spec = spec(2, 10);
        spec.study.optimization_goal = Some(0.9);
        let name = submit(&h, spec).await;
        h.controller.reconcile(&name).await.unwrap();

        let all = trials(&h, &name).await;
        report(&h, all[0].id, &["0.95"]).await;
        h.workload.set_status(&all[0].name, JobStatus::Succeeded);

        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.status.phase, ExperimentPhase::Succeeded);
        assert_eq!(
            h.store.get_trial(all[1].id).await.unwrap().status,
            TrialStatus::Killed
        );
        assert_eq!(h.workload.deleted(), vec![all[1].name.clone()]);
        assert_eq!(trials(&h, &name).await.len(), 2);
    }

    #[tokio::test]
    async fn too_many_failures_fail_the_experiment() {
        let h = harness(SimulatedWorkload::new().with_auto_complete(1, JobStatus::Failed));
        let mut spec = spec(1, 5);
        spec.study.max_failed_trial_count = Some(1);
        let name = submit(&h, spec).await;

        assert!(matches!(
            h.controller.reconcile(&name).await.unwrap(),
            ReconcileOutcome::Requeue(_)
        ));
        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);

        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.status.phase, ExperimentPhase::Failed);
        assert!(experiment.status.last_error.is_some());
        assert_eq!(experiment.status.trials.failed, 2);
    }

    #[tokio::test]
    async fn early_stopping_kills_poor_trials() {
        let h = harness(SimulatedWorkload::new());
        let mut spec = spec(2, 3).with_early_stopping_parameter("LeastStep", "2");
        spec.study.early_stopping_algorithm = "medianstopping".to_string();
        let name = submit(&h, spec).await;
        h.controller.reconcile(&name).await.unwrap();

        let all = trials(&h, &name).await;
        report(&h, all[0].id, &["0.8", "0.9"]).await;
        h.workload.set_status(&all[0].name, JobStatus::Succeeded);
        report(&h, all[1].id, &["0.1", "0.2"]).await;

        h.controller.reconcile(&name).await.unwrap();
        assert_eq!(
            h.store.get_trial(all[1].id).await.unwrap().status,
            TrialStatus::Killed
        );
        assert!(h.workload.deleted().contains(&all[1].name));
        let killed = h
            .events
            .try_iter()
            .filter(|e| matches!(e, ControllerEvent::TrialKilled { .. }))
            .count();
        assert_eq!(killed, 1);
    }

    #[tokio::test]
    async fn exhausted_grid_completes_the_experiment() {
        let h = harness(SimulatedWorkload::new().with_auto_complete(1, JobStatus::Succeeded));
        let study = StudyConfig::new("grid", "accuracy")
            .with_parameter(ParameterConfig::int("x", 1, 2))
            .with_optimization(OptimizationType::Maximize, None)
            .with_algorithms("grid", "")
            .with_trial_limits(2, 5);
        let spec = ExperimentSpec::new(study, "train {{x}}").with_suggestion_parameter("DefaultGrid", "2");
        let name = submit(&h, spec).await;

        assert!(matches!(
            h.controller.reconcile(&name).await.unwrap(),
            ReconcileOutcome::Requeue(_)
        ));
        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);

        let all = trials(&h, &name).await;
        let mut xs: Vec<&str> = all.iter().filter_map(|t| t.parameter("x")).collect();
        xs.sort();
        assert_eq!(xs, vec!["1", "2"]);
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.status.phase, ExperimentPhase::Succeeded);
    }

    #[tokio::test]
    async fn configuration_error_fails_the_experiment() {
        let h = harness(SimulatedWorkload::new());
        let study = StudyConfig::new("grid", "accuracy")
            .with_parameter(ParameterConfig::double("lr", 0.0, 1.0))
            .with_optimization(OptimizationType::Maximize, None)
            .with_algorithms("grid", "");
        let name = submit(&h, ExperimentSpec::new(study, "train")).await;

        let err = h.controller.reconcile(&name).await.unwrap_err();
        assert!(matches!(err, HyError::Config(_)));
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert_eq!(experiment.status.phase, ExperimentPhase::Failed);
        assert!(experiment.status.last_error.unwrap().contains("DefaultGrid"));
        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn deletion_cascades_to_trials_and_jobs() {
        let h = harness(SimulatedWorkload::new());
        let name = submit(&h, spec(2, 4)).await;
        h.controller.reconcile(&name).await.unwrap();
        let all = trials(&h, &name).await;

        h.store.request_experiment_deletion(&name).await.unwrap();
        assert_eq!(h.controller.reconcile(&name).await.unwrap(), ReconcileOutcome::Done);

        assert!(matches!(
            h.store.get_experiment(&name).await,
            Err(HyError::NotFound { .. })
        ));
        assert!(trials(&h, &name).await.is_empty());
        let mut deleted = h.workload.deleted();
        deleted.sort();
        let mut names: Vec<String> = all.iter().map(|t| t.name.clone()).collect();
        names.sort();
        assert_eq!(deleted, names);
        assert!(h.suggestions.suggestion_parameter_list(&name).is_empty());
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, ControllerEvent::ExperimentDeleted { .. })));
    }

    /// Store whose cascade delete silently keeps everything.
    struct LeakyStore(Arc<MemoryStore>);

    #[async_trait]
    impl Store for LeakyStore {
        async fn create_experiment(&self, experiment: Experiment) -> HyResult<()> {
            self.0.create_experiment(experiment).await
        }
        async fn get_experiment(&self, name: &str) -> HyResult<Experiment> {
            self.0.get_experiment(name).await
        }
        async fn list_experiments(&self) -> HyResult<Vec<Experiment>> {
            self.0.list_experiments().await
        }
        async fn update_experiment_status(
            &self,
            name: &str,
            status: ExperimentStatus,
            total_issued: u32,
        ) -> HyResult<()> {
            self.0.update_experiment_status(name, status, total_issued).await
        }
        async fn request_experiment_deletion(&self, name: &str) -> HyResult<()> {
            self.0.request_experiment_deletion(name).await
        }
        async fn clear_finalizer(&self, name: &str) -> HyResult<()> {
            self.0.clear_finalizer(name).await
        }
        async fn remove_experiment(&self, name: &str) -> HyResult<()> {
            self.0.remove_experiment(name).await
        }
        async fn get_study_config(&self, study_id: &str) -> HyResult<StudyConfig> {
            self.0.get_study_config(study_id).await
        }
        async fn get_trial_list(&self, study_id: &str) -> HyResult<Vec<Trial>> {
            self.0.get_trial_list(study_id).await
        }
        async fn get_trial(&self, trial_id: TrialId) -> HyResult<Trial> {
            self.0.get_trial(trial_id).await
        }
        async fn get_trial_by_name(&self, study_id: &str, name: &str) -> HyResult<Option<Trial>> {
            self.0.get_trial_by_name(study_id, name).await
        }
        async fn put_trial(&self, trial: Trial) -> HyResult<()> {
            self.0.put_trial(trial).await
        }
        async fn update_trial_status(
            &self,
            trial_id: TrialId,
            status: TrialStatus,
            objective_value: Option<f64>,
        ) -> HyResult<Trial> {
            self.0.update_trial_status(trial_id, status, objective_value).await
        }
        async fn delete_trials_for_study(&self, _study_id: &str) -> HyResult<usize> {
            Ok(0)
        }
        async fn report_observation_log(
            &self,
            trial_id: TrialId,
            observation: Observation,
        ) -> HyResult<()> {
            self.0.report_observation_log(trial_id, observation).await
        }
        async fn get_trial_logs(
            &self,
            trial_id: TrialId,
            metrics: &[String],
        ) -> HyResult<Observation> {
            self.0.get_trial_logs(trial_id, metrics).await
        }
    }

    #[tokio::test]
    async fn incomplete_cascade_keeps_the_experiment() {
        let memory = Arc::new(MemoryStore::new());
        let h = harness_with(
            Arc::new(LeakyStore(memory.clone())),
            memory,
            SimulatedWorkload::new(),
        );
        let name = submit(&h, spec(1, 1)).await;
        h.controller.reconcile(&name).await.unwrap();
        h.store.request_experiment_deletion(&name).await.unwrap();

        let err = h.controller.reconcile(&name).await.unwrap_err();
        assert!(matches!(
            err,
            HyError::Logic(LogicError::CascadeIncomplete { remaining: 1, .. })
        ));
        let experiment = h.store.get_experiment(&name).await.unwrap();
        assert!(experiment.finalizer);
        assert_eq!(experiment.status.phase, ExperimentPhase::Terminating);
        assert!(experiment
            .status
            .last_error
            .unwrap()
            .contains("left after cascade delete"));
    }

    #[test]
    fn collector_target_includes_eval_metric() {
        let spec = spec(1, 1).with_early_stopping_parameter("EvalMetric", "loss");
        let experiment = Experiment::new(spec);
        let trial = Trial::new("exp", "exp-1", vec![]);
        let target = collector_target(&experiment, &trial);
        assert_eq!(target.additional_metrics, vec!["loss".to_string()]);
    }
}
