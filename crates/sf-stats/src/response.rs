//! Instrument response loading and energy-grid repair.
//!
//! Some calibration products start their energy grid at exactly 0 keV, which
//! makes model folding undefined (a power law diverges there). Zero lower
//! edges are replaced by the configured `minimum_energy`, or rejected when no
//! replacement is configured.

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use tracing::{debug, warn};

use sf_types::{CalibrationError, ResponseMatrix, SfError, SfResult};

/// Replace zero-valued `ENERG_LO` entries in place.
///
/// Returns the number of replaced entries. With `minimum_energy = None` any
/// zero entry is fatal and the matrix is left untouched. Running this twice
/// is a no-op the second time.
pub fn correct_energy_bins(
    response: &mut ResponseMatrix,
    minimum_energy: Option<f64>,
) -> SfResult<usize> {
    let zeros: Vec<usize> = response
        .energ_lo
        .iter()
        .enumerate()
        .filter(|(_, lo)| **lo == 0.0)
        .map(|(i, _)| i)
        .collect();

    let Some(&first) = zeros.first() else {
        return Ok(0);
    };

    let replacement = match minimum_energy {
        None => {
            return Err(CalibrationError::InvalidCalibration {
                index: first,
                value: response.energ_lo[first],
            }
            .into())
        }
        Some(r) if !r.is_finite() || r <= 0.0 => {
            return Err(sf_types::config_error!(
                "minimum_energy must be a finite value > 0 keV, got {r}"
            ))
        }
        Some(r) => r,
    };

    for &i in &zeros {
        let hi = response.energ_hi.get(i).copied().unwrap_or(f64::NAN);
        if replacement >= hi {
            warn!(
                bin = i,
                replacement, hi, "minimum_energy is not below ENERG_HI; bin becomes empty or reversed"
            );
        }
        warn!(bin = i, replacement, "replacing ENERG_LO of 0 keV");
        response.energ_lo[i] = replacement;
    }

    Ok(zeros.len())
}

/// A response whose energy grid has been checked and repaired.
///
/// Only [`load_response`] constructs one, so holding a `CorrectedResponse`
/// means the check already ran for this session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseMatrix", into = "ResponseMatrix")]
pub struct CorrectedResponse {
    inner: ResponseMatrix,
}

impl CorrectedResponse {
    pub fn matrix(&self) -> &ResponseMatrix {
        &self.inner
    }

    pub fn into_inner(self) -> ResponseMatrix {
        self.inner
    }
}

impl Deref for CorrectedResponse {
    type Target = ResponseMatrix;

    fn deref(&self) -> &ResponseMatrix {
        &self.inner
    }
}

impl TryFrom<ResponseMatrix> for CorrectedResponse {
    type Error = SfError;

    fn try_from(matrix: ResponseMatrix) -> SfResult<Self> {
        load_response(matrix, None)
    }
}

impl From<CorrectedResponse> for ResponseMatrix {
    fn from(value: CorrectedResponse) -> Self {
        value.inner
    }
}

/// Validate a response, repair its energy grid and wrap it for use in fits.
pub fn load_response(
    mut matrix: ResponseMatrix,
    minimum_energy: Option<f64>,
) -> SfResult<CorrectedResponse> {
    matrix.check_shape()?;

    let replaced = correct_energy_bins(&mut matrix, minimum_energy)?;

    for (i, (&lo, &hi)) in matrix.energ_lo.iter().zip(&matrix.energ_hi).enumerate() {
        if !lo.is_finite() || !hi.is_finite() {
            return Err(CalibrationError::NonFiniteEdge { index: i }.into());
        }
        if lo >= hi || lo < 0.0 {
            return Err(CalibrationError::ReversedBin { index: i, lo, hi }.into());
        }
    }

    debug!(
        n_energy = matrix.n_energy(),
        n_channels = matrix.n_channels,
        replaced,
        "response loaded"
    );
    Ok(CorrectedResponse { inner: matrix })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_zero() -> ResponseMatrix {
        ResponseMatrix::diagonal(vec![0.0, 0.1, 0.2, 0.0], vec![0.1, 0.2, 0.3, 0.4]).unwrap()
    }

    #[test]
    fn replaces_only_zero_entries() {
        let mut rsp = response_with_zero();
        let original = rsp.clone();

        let replaced = correct_energy_bins(&mut rsp, Some(1e-10)).unwrap();
        assert_eq!(replaced, 2);
        assert_eq!(rsp.energ_lo, vec![1e-10, 0.1, 0.2, 1e-10]);
        assert_eq!(rsp.energ_hi, original.energ_hi);
        assert_eq!(rsp.matrix, original.matrix);
    }

    #[test]
    fn missing_replacement_is_fatal_and_leaves_matrix_untouched() {
        let mut rsp = response_with_zero();
        let original = rsp.clone();

        let err = correct_energy_bins(&mut rsp, None).unwrap_err();
        match err {
            SfError::Calibration(CalibrationError::InvalidCalibration { index, .. }) => {
                assert_eq!(index, 0)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(rsp, original);
    }

    #[test]
    fn invalid_replacement_is_a_config_error() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut rsp = response_with_zero();
            let original = rsp.clone();
            let err = correct_energy_bins(&mut rsp, Some(bad)).unwrap_err();
            assert!(matches!(err, SfError::Config(_)));
            assert_eq!(rsp, original);
        }
    }

    #[test]
    fn correction_is_idempotent() {
        let mut once = response_with_zero();
        correct_energy_bins(&mut once, Some(1e-10)).unwrap();

        let mut twice = once.clone();
        let replaced = correct_energy_bins(&mut twice, Some(1e-10)).unwrap();
        assert_eq!(replaced, 0);
        assert_eq!(once, twice);

        // Once corrected, even the strict policy passes.
        assert_eq!(correct_energy_bins(&mut twice, None).unwrap(), 0);
    }

    #[test]
    fn load_response_validates_edges() {
        let corrected = load_response(response_with_zero(), Some(1e-10)).unwrap();
        assert_eq!(corrected.energ_lo[0], 1e-10);
        assert_eq!(corrected.n_channels, 4);

        assert!(load_response(response_with_zero(), None).is_err());

        let reversed = ResponseMatrix::diagonal(vec![0.2, 0.1], vec![0.1, 0.2]).unwrap();
        let err = load_response(reversed, None).unwrap_err();
        assert!(matches!(
            err,
            SfError::Calibration(CalibrationError::ReversedBin { index: 0, .. })
        ));
    }

    #[test]
    fn corrected_response_deserializes_through_validation() {
        let corrected = load_response(response_with_zero(), Some(1e-10)).unwrap();
        let json = serde_json::to_string(&corrected).unwrap();
        let back: CorrectedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, corrected);

        let raw = serde_json::to_string(&response_with_zero()).unwrap();
        assert!(serde_json::from_str::<CorrectedResponse>(&raw).is_err());
    }
}
