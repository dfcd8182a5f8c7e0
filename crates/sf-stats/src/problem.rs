use serde::{Deserialize, Serialize};

use sf_types::{
    expand_free_values, validate_links, Parameter, ParameterVector, SfResult, SpectrumBins,
    StatError, Statistic, StatisticConfig,
};

use crate::model::ModelSpec;
use crate::response::CorrectedResponse;
use crate::statistic::{evaluate, StatOutput};

/// Everything needed to turn a free-parameter vector into a statistic.
///
/// This is the setup payload handed to pool workers, so it must stay
/// self-contained and serializable. Evaluation never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitProblem {
    pub model: ModelSpec,
    pub spectrum: SpectrumBins,
    pub response: Option<CorrectedResponse>,
    pub statistic: Statistic,
    pub stat_config: StatisticConfig,
    pub parameters: Vec<Parameter>,
}

impl FitProblem {
    pub fn new(
        model: ModelSpec,
        spectrum: SpectrumBins,
        response: Option<CorrectedResponse>,
        statistic: Statistic,
        stat_config: StatisticConfig,
        parameters: Vec<Parameter>,
    ) -> SfResult<Self> {
        if parameters.len() != model.npars() {
            return Err(StatError::shape("model parameters", model.npars(), parameters.len()).into());
        }
        if let Some(rsp) = &response {
            if rsp.n_channels != spectrum.len() {
                return Err(StatError::shape("response channels", spectrum.len(), rsp.n_channels).into());
            }
        }
        validate_links(&parameters)?;

        Ok(Self {
            model,
            spectrum,
            response,
            statistic,
            stat_config,
            parameters,
        })
    }

    pub fn free_parameters(&self) -> ParameterVector {
        ParameterVector::from_parameters(&self.parameters)
    }

    /// Expected counts per spectrum bin for the full parameter list.
    pub fn predicted_counts(&self, full: &[f64]) -> Result<Vec<f64>, StatError> {
        let exposure = self.spectrum.exposure();
        let mut counts = match &self.response {
            Some(rsp) => {
                let flux = self.model.flux(full, &rsp.energ_lo, &rsp.energ_hi)?;
                let mut counts = vec![0.0; rsp.n_channels];
                for (e, &f) in flux.iter().enumerate() {
                    if f == 0.0 {
                        continue;
                    }
                    for (c, &r) in counts.iter_mut().zip(rsp.row(e)) {
                        *c += f * r;
                    }
                }
                counts.iter_mut().for_each(|c| *c *= exposure);
                counts
            }
            None => {
                let mut counts =
                    self.model
                        .flux(full, self.spectrum.energy_lo(), self.spectrum.energy_hi())?;
                counts.iter_mut().for_each(|c| *c *= exposure);
                counts
            }
        };

        if let Some(bkg) = self.spectrum.background() {
            for (c, &b) in counts.iter_mut().zip(&bkg.counts) {
                *c += b * bkg.scale;
            }
        }
        Ok(counts)
    }

    /// Statistic for a free-parameter vector.
    pub fn evaluate(&self, free: &[f64]) -> SfResult<StatOutput> {
        let full = self.expand(free)?;
        let predicted = self.predicted_counts(&full)?;
        Ok(evaluate(self.statistic, self.spectrum.counts(), &predicted, &self.stat_config)?)
    }

    /// Full parameter values for a free vector, frozen and linked values
    /// included.
    pub fn expand(&self, free: &[f64]) -> SfResult<Vec<f64>> {
        expand_free_values(&self.parameters, free)
    }
}
