//! Manager facade: the operations exposed to users and collectors.

use hy_earlystop::{EarlyStoppingService, StopDecision};
use hy_store::Store;
use hy_suggest::{AssignmentSet, GridSuggester, SuggestionQuery, SuggestionService};
use hy_types::{
    config_error, AlgorithmParameter, Experiment, ExperimentSpec, HyError, HyResult,
    Observation, StudyConfig, Trial, TrialId, TrialLog, TrialStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::runtime::QueueHandle;
use crate::template;

pub struct Manager {
    store: Arc<dyn Store>,
    suggestions: Arc<SuggestionService>,
    early_stopping: Arc<EarlyStoppingService>,
    queue: Option<QueueHandle>,
}

impl Manager {
    pub fn new(
        store: Arc<dyn Store>,
        suggestions: Arc<SuggestionService>,
        early_stopping: Arc<EarlyStoppingService>,
    ) -> Self {
        Self {
            store,
            suggestions,
            early_stopping,
            queue: None,
        }
    }

    /// Enqueue experiments on `queue` when they are created or deleted.
    pub fn with_queue(mut self, queue: QueueHandle) -> Self {
        self.queue = Some(queue);
        self
    }

    fn enqueue(&self, name: &str) {
        if let Some(queue) = &self.queue {
            if !queue.enqueue(name) {
                debug!(experiment = name, "work queue closed");
            }
        }
    }

    /// Check `spec` without storing anything.
    pub fn validate_experiment(&self, spec: &ExperimentSpec) -> HyResult<()> {
        spec.validate()?;
        let study = &spec.study;
        if !self
            .suggestions
            .algorithms()
            .contains(&study.suggestion_algorithm.as_str())
        {
            return Err(config_error!(
                "unknown suggestion algorithm {}",
                study.suggestion_algorithm
            ));
        }
        if !study.early_stopping_algorithm.is_empty()
            && !self
                .early_stopping
                .algorithms()
                .contains(&study.early_stopping_algorithm.as_str())
        {
            return Err(config_error!(
                "unknown early stopping algorithm {}",
                study.early_stopping_algorithm
            ));
        }
        template::validate_template(&spec.trial_template, study)?;
        if study.suggestion_algorithm == "grid" {
            let axes = GridSuggester::axes(&study.parameters, &spec.suggestion_parameters)?;
            GridSuggester::grid_size(&axes)?;
        }
        Ok(())
    }

    /// Validate, register the algorithm settings and store a new experiment.
    pub async fn create_experiment(&self, spec: ExperimentSpec) -> HyResult<Experiment> {
        self.validate_experiment(&spec)?;
        let name = spec.study.name.clone();
        match self.store.get_experiment(&name).await {
            Ok(_) => return Err(config_error!("experiment {name} already exists")),
            Err(HyError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        let mut experiment = Experiment::new(spec);
        let study = experiment.study().clone();
        if let Err(err) = self.register_and_store(&mut experiment, &study).await {
            self.unregister(&experiment);
            return Err(err);
        }
        info!(
            experiment = %name,
            algorithm = %study.suggestion_algorithm,
            max_trials = study.max_trial_count,
            parallel = study.parallel_trial_count,
            "experiment created"
        );
        self.enqueue(&name);
        Ok(experiment)
    }

    async fn register_and_store(
        &self,
        experiment: &mut Experiment,
        study: &StudyConfig,
    ) -> HyResult<()> {
        experiment.suggestion_param_id = Some(self.suggestions.set_suggestion_parameters(
            &study.name,
            &study.suggestion_algorithm,
            experiment.spec.suggestion_parameters.clone(),
        )?);
        if !study.early_stopping_algorithm.is_empty() {
            experiment.early_stopping_param_id =
                Some(self.early_stopping.set_early_stopping_parameters(
                    &study.name,
                    &study.early_stopping_algorithm,
                    experiment.spec.early_stopping_parameters.clone(),
                )?);
        }
        self.store.create_experiment(experiment.clone()).await
    }

    /// Drop the parameter sets registered for an experiment that was never
    /// stored. Sets of a same-named experiment that won a create race stay.
    fn unregister(&self, experiment: &Experiment) {
        if let Some(param_id) = &experiment.suggestion_param_id {
            self.suggestions.remove_parameters(param_id);
        }
        if let Some(param_id) = &experiment.early_stopping_param_id {
            self.early_stopping.remove_parameters(param_id);
        }
        warn!(experiment = %experiment.name(), "experiment not stored; parameter sets released");
    }

    /// Current experiment record, including phase and last error.
    pub async fn get_experiment(&self, name: &str) -> HyResult<Experiment> {
        self.store.get_experiment(name).await
    }

    pub async fn list_experiments(&self) -> HyResult<Vec<Experiment>> {
        self.store.list_experiments().await
    }

    /// Flag the experiment for deletion; the controller runs the cascade.
    pub async fn delete_experiment(&self, name: &str) -> HyResult<()> {
        self.store.request_experiment_deletion(name).await?;
        info!(experiment = name, "deletion requested");
        self.enqueue(name);
        Ok(())
    }

    pub async fn list_trials(&self, study_id: &str) -> HyResult<Vec<Trial>> {
        self.store.get_trial_list(study_id).await
    }

    /// Ask the experiment's suggestion algorithm for `request_count` new
    /// assignment sets, using its registered settings and grid progress.
    pub async fn get_suggestions(
        &self,
        study_id: &str,
        request_count: i32,
    ) -> HyResult<Vec<AssignmentSet>> {
        let experiment = self.store.get_experiment(study_id).await?;
        let trials = self.store.get_trial_list(study_id).await?;
        let study = experiment.study();
        self.suggestions.get_suggestions(&SuggestionQuery {
            study_id,
            algorithm: &study.suggestion_algorithm,
            request_count,
            parameters: &study.parameters,
            prior_trials: &trials,
            param_id: experiment.suggestion_param_id.as_deref(),
        })
    }

    pub fn set_suggestion_parameters(
        &self,
        study_id: &str,
        algorithm: &str,
        parameters: Vec<AlgorithmParameter>,
    ) -> HyResult<String> {
        self.suggestions
            .set_suggestion_parameters(study_id, algorithm, parameters)
    }

    pub fn set_early_stopping_parameters(
        &self,
        study_id: &str,
        algorithm: &str,
        parameters: Vec<AlgorithmParameter>,
    ) -> HyResult<String> {
        self.early_stopping
            .set_early_stopping_parameters(study_id, algorithm, parameters)
    }

    /// Evaluate the study's early-stopping rule over its current trials.
    /// `param_id` selects registered settings; `None` uses the defaults.
    pub async fn should_trial_stop(
        &self,
        study_id: &str,
        param_id: Option<&str>,
    ) -> HyResult<Vec<StopDecision>> {
        let study = self.store.get_study_config(study_id).await?;
        if study.early_stopping_algorithm.is_empty() {
            return Err(config_error!(
                "study {study_id} has no early stopping algorithm"
            ));
        }

        let trials = self.store.get_trial_list(study_id).await?;
        let mut completed = Vec::new();
        let mut running = Vec::new();
        for trial in &trials {
            let bucket = match trial.status {
                TrialStatus::Succeeded => &mut completed,
                TrialStatus::Running => &mut running,
                _ => continue,
            };
            let observation = self.store.get_trial_logs(trial.id, &[]).await?;
            bucket.push(TrialLog::new(trial.id, observation));
        }

        self.early_stopping.should_trial_stop(
            &study,
            &study.early_stopping_algorithm,
            param_id,
            &completed,
            &running,
        )
    }

    /// Append collected metric points to a trial's log.
    pub async fn report_observation_log(
        &self,
        trial_id: TrialId,
        observation: Observation,
    ) -> HyResult<()> {
        self.store.report_observation_log(trial_id, observation).await
    }

    pub async fn get_trial_logs(
        &self,
        trial_id: TrialId,
        metrics: &[String],
    ) -> HyResult<Observation> {
        self.store.get_trial_logs(trial_id, metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hy_store::{MemoryStore, StoreOp};
    use hy_types::{ConfigError, MetricPoint, OptimizationType, ParameterConfig};

    fn manager() -> (Arc<MemoryStore>, Manager) {
        let store = Arc::new(MemoryStore::new());
        let manager = Manager::new(
            store.clone(),
            Arc::new(SuggestionService::new()),
            Arc::new(EarlyStoppingService::new()),
        );
        (store, manager)
    }

    fn spec(name: &str) -> ExperimentSpec {
        let study = StudyConfig::new(name, "accuracy")
            .with_parameter(ParameterConfig::double("lr", 0.005, 0.5))
            .with_optimization(OptimizationType::Maximize, None)
            .with_trial_limits(2, 4);
        ExperimentSpec::new(study, "train --lr={{lr}}")
    }

    fn observation(values: &[&str]) -> Observation {
        let mut obs = Observation::new();
        for v in values {
            obs.push("accuracy", MetricPoint::new(None, *v));
        }
        obs
    }

    #[tokio::test]
    async fn create_registers_parameter_sets() {
        let (store, manager) = manager();
        let mut spec = spec("exp").with_early_stopping_parameter("LeastStep", "3");
        spec.study.early_stopping_algorithm = "medianstopping".to_string();

        let created = manager.create_experiment(spec).await.unwrap();
        assert!(created.suggestion_param_id.is_some());
        assert!(created.early_stopping_param_id.is_some());
        assert_eq!(store.get_experiment("exp").await.unwrap(), created);

        let err = manager.create_experiment(self::spec("exp")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn failed_store_create_releases_parameter_sets() {
        let store = Arc::new(MemoryStore::new());
        let suggestions = Arc::new(SuggestionService::new());
        let early_stopping = Arc::new(EarlyStoppingService::new());
        let manager = Manager::new(store.clone(), suggestions.clone(), early_stopping.clone());
        let mut spec = spec("exp");
        spec.study.early_stopping_algorithm = "medianstopping".to_string();

        store.fail_next(StoreOp::CreateExperiment, 1);
        assert!(manager.create_experiment(spec.clone()).await.is_err());
        assert!(suggestions.suggestion_parameter_list("exp").is_empty());
        assert!(early_stopping.early_stopping_parameter_list("exp").is_empty());

        let created = manager.create_experiment(spec).await.unwrap();
        assert_eq!(suggestions.suggestion_parameter_list("exp").len(), 1);
        assert_eq!(early_stopping.early_stopping_parameter_list("exp").len(), 1);
        assert!(created.suggestion_param_id.is_some());
    }

    #[tokio::test]
    async fn invalid_experiments_are_rejected_before_storing() {
        let (store, manager) = manager();

        let mut unknown_algo = spec("a");
        unknown_algo.study.suggestion_algorithm = "bayes".to_string();
        assert!(matches!(
            manager.create_experiment(unknown_algo).await,
            Err(HyError::Config(_))
        ));

        let mut bad_template = spec("b");
        bad_template.trial_template = "train --depth={{depth}}".to_string();
        assert!(matches!(
            manager.create_experiment(bad_template).await,
            Err(HyError::Config(ConfigError::InvalidStudy { .. }))
        ));

        let mut grid = spec("c");
        grid.study.suggestion_algorithm = "grid".to_string();
        assert!(matches!(
            manager.create_experiment(grid).await,
            Err(HyError::Config(ConfigError::InvalidAlgorithmParameter { .. }))
        ));

        assert!(store.list_experiments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn grid_suggestions_are_issued_once() {
        let (_store, manager) = manager();
        let mut spec = spec("grid").with_suggestion_parameter("DefaultGrid", "4");
        spec.study.suggestion_algorithm = "grid".to_string();
        manager.create_experiment(spec).await.unwrap();

        let first = manager.get_suggestions("grid", 3).await.unwrap();
        let lrs: Vec<&str> = first.iter().map(|s| s[0].value.as_str()).collect();
        assert_eq!(lrs, vec!["0.005", "0.17", "0.335"]);

        let rest = manager.get_suggestions("grid", 0).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0][0].value, "0.5");
        assert!(manager.get_suggestions("grid", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_trial_stop_reads_trials_and_logs() {
        let (store, manager) = manager();
        let mut spec = spec("es");
        spec.study.early_stopping_algorithm = "medianstopping".to_string();
        manager.create_experiment(spec).await.unwrap();
        let param_id = manager
            .set_early_stopping_parameters(
                "es",
                "medianstopping",
                vec![AlgorithmParameter::new("LeastStep", "2")],
            )
            .unwrap();

        let done = Trial::new("es", "es-done", vec![]);
        let poor = Trial::new("es", "es-poor", vec![]);
        for trial in [&done, &poor] {
            store.put_trial(trial.clone()).await.unwrap();
            store
                .update_trial_status(trial.id, TrialStatus::Running, None)
                .await
                .unwrap();
        }
        store
            .update_trial_status(done.id, TrialStatus::Succeeded, Some(0.9))
            .await
            .unwrap();
        manager
            .report_observation_log(done.id, observation(&["0.8", "0.9"]))
            .await
            .unwrap();
        manager
            .report_observation_log(poor.id, observation(&["0.1", "0.2"]))
            .await
            .unwrap();

        let decisions = manager
            .should_trial_stop("es", Some(param_id.as_str()))
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].trial_id, poor.id);

        // Default LeastStep of 20 is not met yet.
        assert!(manager.should_trial_stop("es", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_trial_stop_requires_an_algorithm() {
        let (_store, manager) = manager();
        manager.create_experiment(spec("plain")).await.unwrap();
        assert!(matches!(
            manager.should_trial_stop("plain", None).await,
            Err(HyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn delete_only_flags_the_experiment() {
        let (store, manager) = manager();
        manager.create_experiment(spec("exp")).await.unwrap();
        manager.delete_experiment("exp").await.unwrap();
        assert!(store.get_experiment("exp").await.unwrap().deletion_requested);
        assert!(matches!(
            manager.delete_experiment("missing").await,
            Err(HyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn trial_logs_filtered_by_metric() {
        let (store, manager) = manager();
        let trial = Trial::new("exp", "exp-1", vec![]);
        store.put_trial(trial.clone()).await.unwrap();
        let mut obs = observation(&["0.5"]);
        obs.push("loss", MetricPoint::new(None, "1.2"));
        manager.report_observation_log(trial.id, obs).await.unwrap();

        let only_loss = manager
            .get_trial_logs(trial.id, &["loss".to_string()])
            .await
            .unwrap();
        assert_eq!(only_loss.series("loss").len(), 1);
        assert!(only_loss.series("accuracy").is_empty());
        assert_eq!(manager.list_trials("exp").await.unwrap().len(), 1);
    }
}
