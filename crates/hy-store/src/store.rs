use async_trait::async_trait;
use hy_types::{
    Experiment, ExperimentStatus, HyResult, Observation, StudyConfig, Trial, TrialId,
    TrialStatus,
};

/// Storage interface consumed by the controller, the manager and the metrics
/// collectors.
///
/// Experiments are keyed by name, which is also the study id of their
/// trials. Every method is a single transaction: implementations must not
/// leave a partial update visible when they return an error.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Experiments --------------------------------------------------------

    /// Insert a new experiment. Fails if the name is taken.
    async fn create_experiment(&self, experiment: Experiment) -> HyResult<()>;

    async fn get_experiment(&self, name: &str) -> HyResult<Experiment>;

    async fn list_experiments(&self) -> HyResult<Vec<Experiment>>;

    /// Persist the controller-owned fields of an experiment.
    async fn update_experiment_status(
        &self,
        name: &str,
        status: ExperimentStatus,
        total_issued: u32,
    ) -> HyResult<()>;

    /// Flag an experiment for deletion; the controller performs the cascade.
    async fn request_experiment_deletion(&self, name: &str) -> HyResult<()>;

    async fn clear_finalizer(&self, name: &str) -> HyResult<()>;

    /// Remove an experiment whose finalizer has been cleared.
    async fn remove_experiment(&self, name: &str) -> HyResult<()>;

    async fn get_study_config(&self, study_id: &str) -> HyResult<StudyConfig>;

    // -- Trials -------------------------------------------------------------

    /// Trials of a study, oldest first.
    async fn get_trial_list(&self, study_id: &str) -> HyResult<Vec<Trial>>;

    async fn get_trial(&self, trial_id: TrialId) -> HyResult<Trial>;

    async fn get_trial_by_name(&self, study_id: &str, name: &str) -> HyResult<Option<Trial>>;

    /// Insert a new trial. Names are unique per study.
    async fn put_trial(&self, trial: Trial) -> HyResult<()>;

    /// Move a trial to `status`, recording `objective_value` when given.
    /// Returns the updated trial.
    async fn update_trial_status(
        &self,
        trial_id: TrialId,
        status: TrialStatus,
        objective_value: Option<f64>,
    ) -> HyResult<Trial>;

    /// Delete every trial of a study together with its logs; returns how
    /// many trials were removed.
    async fn delete_trials_for_study(&self, study_id: &str) -> HyResult<usize>;

    // -- Observation logs ---------------------------------------------------

    /// Append points to a trial's log.
    async fn report_observation_log(
        &self,
        trial_id: TrialId,
        observation: Observation,
    ) -> HyResult<()>;

    /// A trial's log restricted to `metrics` (everything when empty).
    async fn get_trial_logs(&self, trial_id: TrialId, metrics: &[String])
        -> HyResult<Observation>;
}
