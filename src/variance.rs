//! # Variance-Scale Extraction and the Delta Method
//!
//! The optimizer works on an unconstrained transform of the variance
//! parameters; nothing on that scale is interpretable. This module maps a
//! fit's internal vector back to variances, covariances, correlations, and
//! the AR(1) coefficient, and propagates the optimizer's asymptotic
//! covariance through the nonlinear transforms to natural-scale standard
//! errors: `Var(g(theta)) ~ grad g' Cov(theta) grad g`.
//!
//! When the observed information at the optimum was not positive definite,
//! the fit carries an unreliability flag and every standard error derived
//! from it is withheld rather than reported as a nonsensical number. A
//! failure in one component's gradient is isolated to that component.

use crate::data::Phase;
use crate::model::{Level, ModelFit};
use crate::params::{
    log_sd_to_variance, log_sd_to_variance_deriv, z_to_correlation, z_to_correlation_deriv,
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Propagates the asymptotic covariance of the transformed variance
/// parameters into standard errors of nonlinear functions of them.
pub struct DeltaMethodEstimator<'a> {
    cov: &'a Array2<f64>,
    reliable: bool,
}

impl<'a> DeltaMethodEstimator<'a> {
    pub fn from_fit(fit: &'a ModelFit) -> Self {
        Self {
            cov: &fit.theta_cov,
            reliable: fit.theta_cov_reliable,
        }
    }

    /// Standard error of `g(theta)` from a full gradient vector. Returns
    /// `None` when the covariance is unreliable or the propagated variance
    /// is negative or non-finite.
    pub fn se(&self, gradient: &Array1<f64>) -> Option<f64> {
        if !self.reliable || gradient.len() != self.cov.nrows() {
            return None;
        }
        let variance = gradient.dot(&self.cov.dot(gradient));
        (variance.is_finite() && variance >= 0.0).then(|| variance.sqrt())
    }

    /// Standard error of a transform touching a single coordinate, given
    /// its analytic derivative there.
    pub fn se_scalar(&self, index: usize, deriv: f64) -> Option<f64> {
        let mut gradient = Array1::zeros(self.cov.nrows());
        if index >= gradient.len() {
            return None;
        }
        gradient[index] = deriv;
        self.se(&gradient)
    }

    /// Central-difference gradient of an arbitrary transform, for
    /// components without a convenient analytic derivative.
    pub fn numeric_gradient<F>(g: F, theta: &Array1<f64>) -> Array1<f64>
    where
        F: Fn(&Array1<f64>) -> f64,
    {
        let mut grad = Array1::zeros(theta.len());
        for k in 0..theta.len() {
            let h = 1e-6 * (1.0 + theta[k].abs());
            let mut plus = theta.clone();
            plus[k] += h;
            let mut minus = theta.clone();
            minus[k] -= h;
            grad[k] = (g(&plus) - g(&minus)) / (2.0 * h);
        }
        grad
    }
}

/// One natural-scale quantity with its delta-method standard error and
/// Wald confidence interval. Missing entries mean the optimizer's
/// covariance could not support them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEstimate {
    pub name: String,
    pub estimate: f64,
    pub std_error: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
}

/// Natural-scale random-effect components of one nesting level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelComponents {
    pub level: Level,
    pub intercept_variance: ComponentEstimate,
    pub slope_variance: Option<ComponentEstimate>,
    pub intercept_slope_correlation: Option<ComponentEstimate>,
}

/// Residual variance of one phase (a single pooled entry when the fit is
/// homoscedastic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResidual {
    pub phase: Phase,
    pub variance: ComponentEstimate,
}

/// The full natural-scale decomposition of one fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarianceComponents {
    pub levels: Vec<LevelComponents>,
    pub residual: Vec<PhaseResidual>,
    pub ar1: Option<ComponentEstimate>,
}

/// Maps a fit's internal parameterization back to interpretable variance
/// components with confidence intervals.
pub struct VarianceComponentExtractor;

impl VarianceComponentExtractor {
    /// Confidence level is two-sided (0.95 gives the usual Wald band).
    pub fn extract(fit: &ModelFit, confidence: f64) -> VarianceComponents {
        let delta = DeltaMethodEstimator::from_fit(fit);
        let z = normal_quantile(confidence);
        let theta = &fit.theta;
        let layout = &fit.layout;

        let levels = Level::ALL
            .iter()
            .map(|&level| {
                let range = layout.level_range(level);
                let log_sd_idx = range.start;
                let intercept_variance = monotone_estimate(
                    format!("{}_intercept_variance", level.label()),
                    theta[log_sd_idx],
                    log_sd_to_variance,
                    log_sd_to_variance_deriv,
                    delta.se_scalar(log_sd_idx, 1.0),
                    z,
                );
                let (slope_variance, intercept_slope_correlation) = if layout.with_slope {
                    let g = |t: &Array1<f64>| layout.level_matrix(t, level)[1][1];
                    let slope = composite_estimate(
                        format!("{}_slope_variance", level.label()),
                        g(theta),
                        delta.se(&DeltaMethodEstimator::numeric_gradient(g, theta)),
                        z,
                        Some((0.0, f64::INFINITY)),
                    );
                    let c = |t: &Array1<f64>| {
                        let m = layout.level_matrix(t, level);
                        let denom = (m[0][0] * m[1][1]).sqrt();
                        if denom > 0.0 { m[0][1] / denom } else { 0.0 }
                    };
                    let corr = composite_estimate(
                        format!("{}_intercept_slope_correlation", level.label()),
                        c(theta),
                        delta.se(&DeltaMethodEstimator::numeric_gradient(c, theta)),
                        z,
                        Some((-1.0, 1.0)),
                    );
                    (Some(slope), Some(corr))
                } else {
                    (None, None)
                };
                LevelComponents {
                    level,
                    intercept_variance,
                    slope_variance,
                    intercept_slope_correlation,
                }
            })
            .collect();

        let residual = fit
            .residual_variances
            .iter()
            .map(|&(phase, _)| {
                let g = |t: &Array1<f64>| layout.residual_variance(t, phase);
                let variance = composite_estimate(
                    format!("residual_variance_{}", phase.label()),
                    g(theta),
                    delta.se(&DeltaMethodEstimator::numeric_gradient(g, theta)),
                    z,
                    Some((0.0, f64::INFINITY)),
                );
                PhaseResidual { phase, variance }
            })
            .collect();

        let ar1 = layout.ar1.map(|idx| {
            monotone_estimate(
                "ar1_correlation".to_string(),
                theta[idx],
                z_to_correlation,
                z_to_correlation_deriv,
                delta.se_scalar(idx, 1.0),
                z,
            )
        });

        VarianceComponents {
            levels,
            residual,
            ar1,
        }
    }
}

fn normal_quantile(confidence: f64) -> f64 {
    let alpha = (1.0 - confidence.clamp(0.0, 0.9999)) / 2.0;
    // Normal::new(0, 1) cannot fail.
    Normal::new(0.0, 1.0)
        .map(|n| n.inverse_cdf(1.0 - alpha))
        .unwrap_or(1.96)
}

/// Estimate for a monotone single-parameter transform: the interval is the
/// transformed Wald interval on the unconstrained scale, and the standard
/// error is the analytic delta-method propagation.
fn monotone_estimate(
    name: String,
    x: f64,
    transform: fn(f64) -> f64,
    deriv: fn(f64) -> f64,
    se_x: Option<f64>,
    z: f64,
) -> ComponentEstimate {
    let estimate = transform(x);
    let std_error = se_x.map(|s| s * deriv(x).abs());
    let (ci_lower, ci_upper) = match se_x {
        Some(s) => {
            let (a, b) = (transform(x - z * s), transform(x + z * s));
            (Some(a.min(b)), Some(a.max(b)))
        }
        None => (None, None),
    };
    ComponentEstimate {
        name,
        estimate,
        std_error,
        ci_lower,
        ci_upper,
    }
}

/// Estimate for a composite quantity: natural-scale Wald interval, clamped
/// to the quantity's admissible range.
fn composite_estimate(
    name: String,
    estimate: f64,
    std_error: Option<f64>,
    z: f64,
    bounds: Option<(f64, f64)>,
) -> ComponentEstimate {
    let (ci_lower, ci_upper) = match std_error {
        Some(s) => {
            let (mut lo, mut hi) = (estimate - z * s, estimate + z * s);
            if let Some((min, max)) = bounds {
                lo = lo.clamp(min, max);
                hi = hi.clamp(min, max);
            }
            (Some(lo), Some(hi))
        }
        None => (None, None),
    };
    ComponentEstimate {
        name,
        estimate,
        std_error,
        ci_lower,
        ci_upper,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::fit;
    use crate::model::{FitOptions, FixedTerm, ModelSpecification, groups};
    use crate::testutil::{SimulationConfig, simulate};
    use approx::assert_relative_eq;

    #[test]
    fn analytic_and_numeric_gradients_agree_for_the_variance_transform() {
        // g(x) = exp(x)^2 over realistic log-standard-deviation values.
        for &x in &[-2.5, -1.0, -0.25, 0.0, 0.4, 1.3, 2.0] {
            let theta = ndarray::array![x];
            let numeric =
                DeltaMethodEstimator::numeric_gradient(|t| log_sd_to_variance(t[0]), &theta);
            assert_relative_eq!(
                numeric[0],
                log_sd_to_variance_deriv(x),
                max_relative = 1e-4
            );
        }
    }

    #[test]
    fn unreliable_covariance_withholds_standard_errors() {
        let data = simulate(&SimulationConfig::balanced(2, 2, 2, 12), 41);
        let mut fitted = fit(&data, ModelSpecification::null(), &FitOptions::default()).unwrap();
        fitted.theta_cov_reliable = false;
        let components = VarianceComponentExtractor::extract(&fitted, 0.95);
        for lvl in &components.levels {
            assert!(lvl.intercept_variance.std_error.is_none());
            assert!(lvl.intercept_variance.ci_lower.is_none());
        }
    }

    #[test]
    fn extraction_matches_the_fit_point_estimates() {
        let data = simulate(&SimulationConfig::balanced(2, 2, 2, 16), 13);
        let spec = ModelSpecification::ar1(vec![FixedTerm::new("level_AB", groups::LEVEL)]);
        let fitted = fit(&data, spec, &FitOptions::default()).unwrap();
        let components = VarianceComponentExtractor::extract(&fitted, 0.95);

        for (lvl, point) in components.levels.iter().zip(&fitted.level_variances) {
            assert_relative_eq!(
                lvl.intercept_variance.estimate,
                point.intercept_variance,
                max_relative = 1e-10
            );
        }
        let rho = components.ar1.as_ref().unwrap();
        assert_relative_eq!(rho.estimate, fitted.ar1.unwrap(), max_relative = 1e-10);
        assert!(rho.estimate.abs() < 1.0);

        // Confidence intervals bracket their point estimates when present.
        for res in &components.residual {
            if let (Some(lo), Some(hi)) = (res.variance.ci_lower, res.variance.ci_upper) {
                assert!(lo <= res.variance.estimate && res.variance.estimate <= hi);
            }
        }
    }
}
