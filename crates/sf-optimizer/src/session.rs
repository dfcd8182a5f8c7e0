//! Fit sessions: configuration, response loading and the fit entry point.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use sf_pool::WorkerPool;
use sf_stats::{load_response, CorrectedResponse, FitProblem, ModelSpec};
use sf_types::{
    config_error, FitConfig, FitError, FitResult, Parameter, ResponseMatrix, SessionId, SfResult,
    SpectrumBins,
};

use crate::evaluator::PoolEvaluator;
use crate::simplex::NelderMead;
use crate::uncertainty::curvature_errors;

/// One configured fitting context.
///
/// The configuration is fixed at construction. Sessions share nothing, so
/// several can run side by side with different settings.
#[derive(Debug, Clone)]
pub struct FitSession {
    id: SessionId,
    config: FitConfig,
}

impl FitSession {
    /// Validate `config` and pin the platform-dependent choices.
    pub fn new(mut config: FitConfig) -> SfResult<Self> {
        config.validate()?;
        config.multiprocessing_start_method = config.multiprocessing_start_method.resolve();
        if config.numcores.is_none() {
            config.numcores = Some(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            );
        }

        let id = Uuid::new_v4();
        info!(
            session_id = %id,
            statistic = %config.statistic,
            truncate = config.truncate,
            trunc_value = config.trunc_value,
            numcores = ?config.numcores,
            start_method = ?config.multiprocessing_start_method,
            "fit session created"
        );
        Ok(Self { id, config })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Validate a response and repair zero `ENERG_LO` edges with the
    /// configured `minimum_energy`.
    pub fn load_response(&self, matrix: ResponseMatrix) -> SfResult<CorrectedResponse> {
        load_response(matrix, self.config.minimum_energy)
    }

    /// Fit `model` to `data`, starting from `parameters`.
    ///
    /// Workers live for the duration of this call only.
    pub fn fit(
        &self,
        model: ModelSpec,
        data: SpectrumBins,
        response: Option<CorrectedResponse>,
        parameters: Vec<Parameter>,
    ) -> SfResult<FitResult> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = match self.config.optimizer.deadline_secs {
            Some(secs) => {
                let budget = Duration::try_from_secs_f64(secs)
                    .map_err(|e| config_error!("optimizer.deadline_secs: {e}"))?;
                Some(clock + budget)
            }
            None => None,
        };

        let problem = FitProblem::new(
            model,
            data,
            response,
            self.config.statistic,
            self.config.stat_config(),
            parameters,
        )?;
        let start = problem.free_parameters();
        if start.is_empty() {
            return Err(FitError::NoFreeParameters.into());
        }
        start.validate()?;

        // Shape problems surface here rather than as failed candidates.
        let initial = problem.evaluate(&start.values)?;
        info!(
            session_id = %self.id,
            free = start.len(),
            bins = problem.spectrum.len(),
            initial_statistic = initial.statistic,
            "fit started"
        );

        let problem = Arc::new(problem);
        let mut pool = WorkerPool::from_config(Arc::clone(&problem), &self.config);
        let mut evaluator = PoolEvaluator::new(&mut pool);

        let search = NelderMead::new(self.config.optimizer.clone())
            .with_deadline(deadline)
            .minimize(&start, &mut evaluator)?;
        let best = start.with_values(search.best);
        let mut evaluations = search.evaluations;

        let errors = if self.config.optimizer.estimate_errors && self.config.statistic.has_unit_delta() {
            let (errors, spent) = curvature_errors(&best, &mut evaluator);
            evaluations += spent;
            errors
        } else {
            vec![None; best.len()]
        };
        let pool_stats = pool.stats();
        drop(pool);

        let final_eval = problem.evaluate(&best.values)?;
        let parameter_values = problem.expand(&best.values)?;
        let dof = problem.spectrum.len() as i64 - best.len() as i64;

        if !search.status.is_converged() {
            warn!(session_id = %self.id, status = %search.status, "fit did not converge");
        }
        info!(
            session_id = %self.id,
            status = %search.status,
            statistic = final_eval.statistic,
            iterations = search.iterations,
            evaluations,
            crashes = pool_stats.crashes,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "fit finished"
        );

        Ok(FitResult {
            session_id: self.id,
            statistic_kind: self.config.statistic,
            best,
            parameter_values,
            statistic: final_eval.statistic,
            per_bin: final_eval.per_bin,
            status: search.status,
            iterations: search.iterations,
            evaluations,
            dof,
            errors,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_stats::Component;
    use sf_types::{SfError, Statistic};

    fn session() -> FitSession {
        FitSession::new(FitConfig::new(Statistic::Cash).with_numcores(Some(1))).unwrap()
    }

    #[test]
    fn new_resolves_platform_choices() {
        let session = FitSession::new(FitConfig::default()).unwrap();
        assert!(session.config().numcores.is_some());
        assert_ne!(
            session.config().multiprocessing_start_method,
            sf_types::StartMethod::Default
        );
        assert_ne!(session.id(), FitSession::new(FitConfig::default()).unwrap().id());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = FitConfig::default().with_truncation(true, -1.0);
        assert!(matches!(FitSession::new(config), Err(SfError::Config(_))));
    }

    #[test]
    fn load_response_uses_minimum_energy() {
        let matrix = ResponseMatrix::diagonal(vec![0.0, 1.0], vec![1.0, 2.0]).unwrap();
        let err = session().load_response(matrix.clone()).unwrap_err();
        assert!(matches!(err, SfError::Calibration(_)));

        let session = FitSession::new(FitConfig::default().with_minimum_energy(Some(1e-10))).unwrap();
        let rsp = session.load_response(matrix).unwrap();
        assert_eq!(rsp.energ_lo, vec![1e-10, 1.0]);
    }

    #[test]
    fn all_frozen_is_rejected() {
        let model = ModelSpec::single(Component::Constant);
        let mut params = model.default_parameters().unwrap();
        params[0].freeze();
        let data = SpectrumBins::new(vec![1.0], vec![2.0], vec![3.0]).unwrap();
        let err = session().fit(model, data, None, params).unwrap_err();
        assert!(matches!(err, SfError::Fit(FitError::NoFreeParameters)));
    }

    #[test]
    fn parameter_count_mismatch_is_a_shape_error() {
        let model = ModelSpec::single(Component::PowerLaw);
        let params = ModelSpec::single(Component::Constant).default_parameters().unwrap();
        let data = SpectrumBins::new(vec![1.0], vec![2.0], vec![3.0]).unwrap();
        let err = session().fit(model, data, None, params).unwrap_err();
        assert!(matches!(err, SfError::Stat(_)));
    }
}
