use serde::{Deserialize, Serialize};

use crate::errors::{SfError, SfResult, StatError};

/// An observed counts spectrum on a fixed grid of bins.
///
/// Bins are ordered but need not be contiguous. Immutable once constructed;
/// the fitting core only ever borrows it. Deserializing runs the same checks
/// as the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSpectrum")]
pub struct SpectrumBins {
    energy_lo: Vec<f64>,
    energy_hi: Vec<f64>,
    counts: Vec<f64>,
    /// Exposure time in seconds.
    exposure: f64,
    background: Option<Background>,
}

/// Background counts subtracted from the source region by scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Background {
    pub counts: Vec<f64>,
    /// Ratio of source to background (area × exposure).
    pub scale: f64,
}

#[derive(Deserialize)]
struct RawSpectrum {
    energy_lo: Vec<f64>,
    energy_hi: Vec<f64>,
    counts: Vec<f64>,
    exposure: f64,
    #[serde(default)]
    background: Option<Background>,
}

impl TryFrom<RawSpectrum> for SpectrumBins {
    type Error = SfError;

    fn try_from(raw: RawSpectrum) -> SfResult<Self> {
        let spectrum = Self::new(raw.energy_lo, raw.energy_hi, raw.counts)?.with_exposure(raw.exposure)?;
        match raw.background {
            Some(bkg) => spectrum.with_background(bkg.counts, bkg.scale),
            None => Ok(spectrum),
        }
    }
}

impl SpectrumBins {
    pub fn new(energy_lo: Vec<f64>, energy_hi: Vec<f64>, counts: Vec<f64>) -> SfResult<Self> {
        let n = counts.len();
        if energy_lo.len() != n {
            return Err(StatError::shape("energy_lo", n, energy_lo.len()).into());
        }
        if energy_hi.len() != n {
            return Err(StatError::shape("energy_hi", n, energy_hi.len()).into());
        }
        for (i, (&lo, &hi)) in energy_lo.iter().zip(&energy_hi).enumerate() {
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                return Err(crate::data_error!(
                    "spectrum bin {i} has invalid edges [{lo}, {hi}]"
                ));
            }
        }
        if let Some(i) = counts.iter().position(|c| !c.is_finite() || *c < 0.0) {
            return Err(crate::data_error!(
                "spectrum bin {i} has invalid counts {}",
                counts[i]
            ));
        }

        Ok(Self {
            energy_lo,
            energy_hi,
            counts,
            exposure: 1.0,
            background: None,
        })
    }

    pub fn with_exposure(mut self, exposure: f64) -> SfResult<Self> {
        if !exposure.is_finite() || exposure <= 0.0 {
            return Err(crate::data_error!("exposure must be > 0, got {exposure}"));
        }
        self.exposure = exposure;
        Ok(self)
    }

    pub fn with_background(mut self, counts: Vec<f64>, scale: f64) -> SfResult<Self> {
        if counts.len() != self.len() {
            return Err(SfError::Stat(StatError::shape(
                "background",
                self.len(),
                counts.len(),
            )));
        }
        if !scale.is_finite() || scale < 0.0 {
            return Err(crate::data_error!("background scale must be >= 0, got {scale}"));
        }
        if counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(crate::data_error!("background counts must be finite and >= 0"));
        }
        self.background = Some(Background { counts, scale });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn energy_lo(&self) -> &[f64] {
        &self.energy_lo
    }

    pub fn energy_hi(&self) -> &[f64] {
        &self.energy_hi
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn exposure(&self) -> f64 {
        self.exposure
    }

    pub fn background(&self) -> Option<&Background> {
        self.background.as_ref()
    }

    pub fn total_counts(&self) -> f64 {
        self.counts.iter().sum()
    }
}
