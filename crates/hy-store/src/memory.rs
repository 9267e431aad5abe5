//! In-memory store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hy_types::{
    logic_error, ConfigError, Experiment, ExperimentStatus, HyError, HyResult, Observation,
    StudyConfig, TransientIoError, Trial, TrialId, TrialStatus,
};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::store::Store;

/// Store operations, used to count accesses and address injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateExperiment,
    GetExperiment,
    ListExperiments,
    UpdateExperimentStatus,
    RequestDeletion,
    ClearFinalizer,
    RemoveExperiment,
    GetTrialList,
    GetTrial,
    PutTrial,
    UpdateTrialStatus,
    DeleteTrials,
    ReportObservationLog,
    GetTrialLogs,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub injected_failures: u64,
}

/// Store backed by concurrent maps. Each read-modify-write happens under the
/// shard lock of the entry it touches and never across an `.await`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    experiments: DashMap<String, Experiment>,
    trials: DashMap<TrialId, Trial>,
    /// (study id, trial name) → trial id.
    trial_names: DashMap<(String, String), TrialId>,
    logs: DashMap<TrialId, Observation>,
    failures: DashMap<StoreOp, usize>,
    stats: RwLock<StoreStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with a transient error.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        self.failures.insert(op, times);
    }

    pub fn get_stats(&self) -> StoreStats {
        self.stats.read().clone()
    }

    fn check(&self, op: StoreOp) -> HyResult<()> {
        if let Some(mut remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                self.stats.write().injected_failures += 1;
                warn!(?op, "injected store failure");
                return Err(TransientIoError::Store {
                    message: format!("{op:?} unavailable"),
                }
                .into());
            }
        }
        Ok(())
    }

    fn read(&self, op: StoreOp) -> HyResult<()> {
        self.check(op)?;
        self.stats.write().reads += 1;
        Ok(())
    }

    fn write(&self, op: StoreOp) -> HyResult<()> {
        self.check(op)?;
        self.stats.write().writes += 1;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_experiment(&self, experiment: Experiment) -> HyResult<()> {
        self.write(StoreOp::CreateExperiment)?;
        match self.experiments.entry(experiment.name().to_string()) {
            Entry::Occupied(entry) => Err(ConfigError::InvalidStudy {
                message: format!("experiment {} already exists", entry.key()),
            }
            .into()),
            Entry::Vacant(entry) => {
                debug!(experiment = %entry.key(), "experiment stored");
                entry.insert(experiment);
                Ok(())
            }
        }
    }

    async fn get_experiment(&self, name: &str) -> HyResult<Experiment> {
        self.read(StoreOp::GetExperiment)?;
        self.experiments
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| HyError::not_found("experiment", name))
    }

    async fn list_experiments(&self) -> HyResult<Vec<Experiment>> {
        self.read(StoreOp::ListExperiments)?;
        let mut experiments: Vec<Experiment> =
            self.experiments.iter().map(|e| e.clone()).collect();
        experiments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(experiments)
    }

    async fn update_experiment_status(
        &self,
        name: &str,
        status: ExperimentStatus,
        total_issued: u32,
    ) -> HyResult<()> {
        self.write(StoreOp::UpdateExperimentStatus)?;
        let mut experiment = self
            .experiments
            .get_mut(name)
            .ok_or_else(|| HyError::not_found("experiment", name))?;
        experiment.status = status;
        experiment.total_issued = total_issued;
        Ok(())
    }

    async fn request_experiment_deletion(&self, name: &str) -> HyResult<()> {
        self.write(StoreOp::RequestDeletion)?;
        let mut experiment = self
            .experiments
            .get_mut(name)
            .ok_or_else(|| HyError::not_found("experiment", name))?;
        experiment.deletion_requested = true;
        Ok(())
    }

    async fn clear_finalizer(&self, name: &str) -> HyResult<()> {
        self.write(StoreOp::ClearFinalizer)?;
        let mut experiment = self
            .experiments
            .get_mut(name)
            .ok_or_else(|| HyError::not_found("experiment", name))?;
        experiment.finalizer = false;
        Ok(())
    }

    async fn remove_experiment(&self, name: &str) -> HyResult<()> {
        self.write(StoreOp::RemoveExperiment)?;
        match self.experiments.entry(name.to_string()) {
            Entry::Vacant(_) => Err(HyError::not_found("experiment", name)),
            Entry::Occupied(entry) if entry.get().finalizer => {
                Err(logic_error!("experiment {name} still has its finalizer"))
            }
            Entry::Occupied(entry) => {
                entry.remove();
                debug!(experiment = name, "experiment removed");
                Ok(())
            }
        }
    }

    async fn get_study_config(&self, study_id: &str) -> HyResult<StudyConfig> {
        self.read(StoreOp::GetExperiment)?;
        self.experiments
            .get(study_id)
            .map(|e| e.spec.study.clone())
            .ok_or_else(|| HyError::not_found("study", study_id))
    }

    async fn get_trial_list(&self, study_id: &str) -> HyResult<Vec<Trial>> {
        self.read(StoreOp::GetTrialList)?;
        let mut trials: Vec<Trial> = self
            .trials
            .iter()
            .filter(|t| t.study_id == study_id)
            .map(|t| t.clone())
            .collect();
        trials.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(trials)
    }

    async fn get_trial(&self, trial_id: TrialId) -> HyResult<Trial> {
        self.read(StoreOp::GetTrial)?;
        self.trials
            .get(&trial_id)
            .map(|t| t.clone())
            .ok_or_else(|| HyError::not_found("trial", trial_id.to_string()))
    }

    async fn get_trial_by_name(&self, study_id: &str, name: &str) -> HyResult<Option<Trial>> {
        self.read(StoreOp::GetTrial)?;
        let id = self
            .trial_names
            .get(&(study_id.to_string(), name.to_string()))
            .map(|id| *id);
        Ok(id.and_then(|id| self.trials.get(&id).map(|t| t.clone())))
    }

    async fn put_trial(&self, trial: Trial) -> HyResult<()> {
        self.write(StoreOp::PutTrial)?;
        let key = (trial.study_id.clone(), trial.name.clone());
        match self.trial_names.entry(key) {
            Entry::Occupied(_) => Err(logic_error!(
                "trial {} already exists in study {}",
                trial.name,
                trial.study_id
            )),
            Entry::Vacant(slot) => {
                slot.insert(trial.id);
                self.trials.insert(trial.id, trial);
                Ok(())
            }
        }
    }

    async fn update_trial_status(
        &self,
        trial_id: TrialId,
        status: TrialStatus,
        objective_value: Option<f64>,
    ) -> HyResult<Trial> {
        self.write(StoreOp::UpdateTrialStatus)?;
        let mut trial = self
            .trials
            .get_mut(&trial_id)
            .ok_or_else(|| HyError::not_found("trial", trial_id.to_string()))?;
        trial.transition(status)?;
        if objective_value.is_some() {
            trial.objective_value = objective_value;
        }
        Ok(trial.clone())
    }

    async fn delete_trials_for_study(&self, study_id: &str) -> HyResult<usize> {
        self.write(StoreOp::DeleteTrials)?;
        let doomed: Vec<(TrialId, String)> = self
            .trials
            .iter()
            .filter(|t| t.study_id == study_id)
            .map(|t| (t.id, t.name.clone()))
            .collect();
        for (id, name) in &doomed {
            self.trials.remove(id);
            self.logs.remove(id);
            self.trial_names.remove(&(study_id.to_string(), name.clone()));
        }
        debug!(study = study_id, deleted = doomed.len(), "trials deleted");
        Ok(doomed.len())
    }

    async fn report_observation_log(
        &self,
        trial_id: TrialId,
        observation: Observation,
    ) -> HyResult<()> {
        self.write(StoreOp::ReportObservationLog)?;
        if !self.trials.contains_key(&trial_id) {
            return Err(HyError::not_found("trial", trial_id.to_string()));
        }
        self.logs.entry(trial_id).or_default().extend(observation);
        Ok(())
    }

    async fn get_trial_logs(
        &self,
        trial_id: TrialId,
        metrics: &[String],
    ) -> HyResult<Observation> {
        self.read(StoreOp::GetTrialLogs)?;
        if !self.trials.contains_key(&trial_id) {
            return Err(HyError::not_found("trial", trial_id.to_string()));
        }
        Ok(self
            .logs
            .get(&trial_id)
            .map(|log| log.filtered(metrics))
            .unwrap_or_default())
    }
}
