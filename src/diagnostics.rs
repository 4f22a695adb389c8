//! # Residual Autocorrelation Diagnostics
//!
//! Empirical autocorrelation of the marginal residuals, pooled across
//! cases, for judging whether the fitted AR(1) structure has absorbed the
//! serial dependence. Purely descriptive; nothing here feeds back into
//! estimation.

use crate::model::ModelFit;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_LAG: usize = 14;

/// Pooled empirical autocorrelation function with its significance band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutocorrelationResult {
    /// `values[k]` is the pooled autocorrelation at lag `k + 1`.
    pub values: Vec<f64>,
    /// Symmetric band, `±1.96 / sqrt(n)` over the total observation count.
    pub band: f64,
}

impl AutocorrelationResult {
    /// Lags whose pooled autocorrelation escapes the significance band.
    pub fn lags_outside_band(&self) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v.abs() > self.band)
            .map(|(k, _)| k + 1)
            .collect()
    }
}

pub struct AutocorrelationDiagnostic;

impl AutocorrelationDiagnostic {
    /// Computes the pooled per-case ACF of the fit's residuals up to
    /// `max_lag`. Lag products are accumulated within cases only (never
    /// across case boundaries) and normalized by the pooled centered sum
    /// of squares.
    pub fn compute(fit: &ModelFit, max_lag: usize) -> AutocorrelationResult {
        let residuals = fit.residuals();
        let n = residuals.len();
        let mean = residuals.sum() / n as f64;
        let denom: f64 = residuals.iter().map(|e| (e - mean) * (e - mean)).sum();

        let mut values = Vec::with_capacity(max_lag);
        for lag in 1..=max_lag {
            let mut num = 0.0;
            for rows in &fit.case_rows {
                let case = residuals.slice(ndarray::s![rows.clone()]);
                if case.len() <= lag {
                    continue;
                }
                for t in 0..case.len() - lag {
                    num += (case[t] - mean) * (case[t + lag] - mean);
                }
            }
            values.push(if denom > 0.0 { num / denom } else { 0.0 });
        }

        AutocorrelationResult {
            values,
            band: 1.96 / (n as f64).sqrt(),
        }
    }
}
