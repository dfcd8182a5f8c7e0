//! Built-in spectral model components.
//!
//! Each component returns photon flux integrated over an energy bin
//! (photons/cm²/s per bin), so folding only has to multiply by the response
//! and exposure.

use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_2, PI};

use sf_types::{Parameter, SfResult, StatError, HUGE_VALUE};

/// A single additive model component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Flat spectrum. Parameters: `[ampl]`.
    Constant,
    /// `ampl * E^-gamma`. Parameters: `[gamma, ampl]`.
    PowerLaw,
    /// Gaussian line with total flux `ampl`. Parameters: `[fwhm, pos, ampl]`.
    Gaussian,
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::PowerLaw => "powerlaw",
            Self::Gaussian => "gaussian",
        }
    }

    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self {
            Self::Constant => &["ampl"],
            Self::PowerLaw => &["gamma", "ampl"],
            Self::Gaussian => &["fwhm", "pos", "ampl"],
        }
    }

    pub fn npars(&self) -> usize {
        self.parameter_names().len()
    }

    /// Default parameters named `<component>.<parameter>`.
    pub fn default_parameters(&self) -> SfResult<Vec<Parameter>> {
        self.parameters_named(self.name())
    }

    fn parameters_named(&self, prefix: &str) -> SfResult<Vec<Parameter>> {
        let full = |p: &str| format!("{prefix}.{p}");
        let params = match self {
            Self::Constant => vec![Parameter::new(full("ampl"), 1.0)?.with_limits(0.0, HUGE_VALUE)?],
            Self::PowerLaw => vec![
                Parameter::new(full("gamma"), 1.0)?.with_limits(-10.0, 10.0)?,
                Parameter::new(full("ampl"), 1.0)?.with_limits(0.0, HUGE_VALUE)?,
            ],
            Self::Gaussian => vec![
                Parameter::new(full("fwhm"), 0.1)?
                    .with_limits(f64::from(f32::MIN_POSITIVE), HUGE_VALUE)?
                    .with_units("keV"),
                Parameter::new(full("pos"), 1.0)?.with_units("keV"),
                Parameter::new(full("ampl"), 1.0)?,
            ],
        };
        Ok(params)
    }

    /// Flux integrated over `[lo, hi]`.
    pub fn integrate(&self, params: &[f64], lo: f64, hi: f64) -> f64 {
        match self {
            Self::Constant => params[0] * (hi - lo),
            Self::PowerLaw => {
                let (gamma, ampl) = (params[0], params[1]);
                let p = 1.0 - gamma;
                if p.abs() < f64::EPSILON {
                    ampl * (hi / lo).ln()
                } else {
                    ampl * (hi.powf(p) - lo.powf(p)) / p
                }
            }
            Self::Gaussian => {
                let (fwhm, pos, ampl) = (params[0], params[1], params[2]);
                let mid = 0.5 * (lo + hi);
                let x = (mid - pos) / fwhm;
                let norm = 2.0 * (LN_2 / PI).sqrt() / fwhm;
                ampl * norm * (-4.0 * LN_2 * x * x).exp() * (hi - lo)
            }
        }
    }
}

/// Sum of components evaluated on a fixed energy grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub components: Vec<Component>,
}

impl ModelSpec {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn single(component: Component) -> Self {
        Self::new(vec![component])
    }

    pub fn npars(&self) -> usize {
        self.components.iter().map(Component::npars).sum()
    }

    /// Default parameters for every component. A component repeated in the
    /// model gets a numbered prefix from its second use on (`gaussian2.pos`),
    /// so names stay unique for links.
    pub fn default_parameters(&self) -> SfResult<Vec<Parameter>> {
        let mut out = Vec::with_capacity(self.npars());
        for (i, c) in self.components.iter().enumerate() {
            let seen = self.components[..i].iter().filter(|o| *o == c).count();
            let prefix = match seen {
                0 => c.name().to_string(),
                n => format!("{}{}", c.name(), n + 1),
            };
            out.extend(c.parameters_named(&prefix)?);
        }
        Ok(out)
    }

    /// Flux per bin for the full parameter list `params`.
    pub fn flux(&self, params: &[f64], lo: &[f64], hi: &[f64]) -> Result<Vec<f64>, StatError> {
        if params.len() != self.npars() {
            return Err(StatError::shape("model parameters", self.npars(), params.len()));
        }
        if lo.len() != hi.len() {
            return Err(StatError::shape("energy grid", lo.len(), hi.len()));
        }

        let mut flux = vec![0.0; lo.len()];
        let mut offset = 0;
        for c in &self.components {
            let p = &params[offset..offset + c.npars()];
            for (f, (&l, &h)) in flux.iter_mut().zip(lo.iter().zip(hi)) {
                *f += c.integrate(p, l, h);
            }
            offset += c.npars();
        }
        Ok(flux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powerlaw_integrates_analytically() {
        let f = Component::PowerLaw.integrate(&[2.0, 3.0], 1.0, 2.0);
        // ∫ 3 E^-2 dE from 1 to 2 = 3 * (1 - 1/2)
        assert!((f - 1.5).abs() < 1e-12);

        let f = Component::PowerLaw.integrate(&[1.0, 2.0], 1.0, std::f64::consts::E);
        assert!((f - 2.0).abs() < 1e-12);
    }

    #[test]
    fn gaussian_integrates_to_amplitude() {
        let n = 4000;
        let lo: Vec<f64> = (0..n).map(|i| i as f64 * 0.001).collect();
        let hi: Vec<f64> = lo.iter().map(|l| l + 0.001).collect();
        let model = ModelSpec::single(Component::Gaussian);
        let flux = model.flux(&[0.1, 2.0, 5.0], &lo, &hi).unwrap();
        let total: f64 = flux.iter().sum();
        assert!((total - 5.0).abs() < 1e-4, "total = {total}");
    }

    #[test]
    fn components_are_summed_in_parameter_order() {
        let model = ModelSpec::new(vec![Component::Constant, Component::PowerLaw]);
        assert_eq!(model.npars(), 3);
        let flux = model.flux(&[1.0, 2.0, 3.0], &[1.0], &[2.0]).unwrap();
        assert!((flux[0] - (1.0 + 1.5)).abs() < 1e-12);

        let names: Vec<String> = model
            .default_parameters()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["constant.ampl", "powerlaw.gamma", "powerlaw.ampl"]);
    }

    #[test]
    fn repeated_components_get_numbered_names() {
        let model = ModelSpec::new(vec![Component::Gaussian, Component::Constant, Component::Gaussian]);
        let names: Vec<String> = model
            .default_parameters()
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "gaussian.fwhm",
                "gaussian.pos",
                "gaussian.ampl",
                "constant.ampl",
                "gaussian2.fwhm",
                "gaussian2.pos",
                "gaussian2.ampl"
            ]
        );
    }

    #[test]
    fn wrong_parameter_count_is_a_shape_error() {
        let model = ModelSpec::single(Component::PowerLaw);
        let err = model.flux(&[1.0], &[1.0], &[2.0]).unwrap_err();
        assert!(matches!(err, StatError::ShapeMismatch { expected: 2, found: 1, .. }));
    }
}
