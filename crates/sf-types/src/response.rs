use serde::{Deserialize, Serialize};

use crate::errors::{SfResult, StatError};

/// Instrument response: energy grid plus a redistribution matrix mapping
/// each true-energy bin onto detector channels.
///
/// `matrix` is stored row-major, one row of `n_channels` values per energy
/// bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMatrix {
    pub energ_lo: Vec<f64>,
    pub energ_hi: Vec<f64>,
    pub n_channels: usize,
    pub matrix: Vec<f64>,
}

impl ResponseMatrix {
    pub fn new(
        energ_lo: Vec<f64>,
        energ_hi: Vec<f64>,
        n_channels: usize,
        matrix: Vec<f64>,
    ) -> SfResult<Self> {
        let response = Self {
            energ_lo,
            energ_hi,
            n_channels,
            matrix,
        };
        response.check_shape()?;
        Ok(response)
    }

    /// Diagonal response: energy bin `i` lands entirely in channel `i`.
    pub fn diagonal(energ_lo: Vec<f64>, energ_hi: Vec<f64>) -> SfResult<Self> {
        let n = energ_lo.len();
        let mut matrix = vec![0.0; n * n];
        for i in 0..n {
            matrix[i * n + i] = 1.0;
        }
        Self::new(energ_lo, energ_hi, n, matrix)
    }

    pub fn n_energy(&self) -> usize {
        self.energ_lo.len()
    }

    /// Redistribution row for energy bin `e`.
    pub fn row(&self, e: usize) -> &[f64] {
        let start = e * self.n_channels;
        &self.matrix[start..start + self.n_channels]
    }

    pub fn check_shape(&self) -> Result<(), StatError> {
        if self.energ_hi.len() != self.energ_lo.len() {
            return Err(StatError::shape(
                "ENERG_HI",
                self.energ_lo.len(),
                self.energ_hi.len(),
            ));
        }
        let expected = self.energ_lo.len() * self.n_channels;
        if self.matrix.len() != expected {
            return Err(StatError::shape("redistribution matrix", expected, self.matrix.len()));
        }
        Ok(())
    }
}
