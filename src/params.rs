//! # Unconstrained Variance Parameterization
//!
//! The optimizer searches over a numerically unconstrained transform of the
//! variance components. [`ParamLayout`] gives that vector an explicit tagged
//! structure with offsets fixed by the model specification, so optimizer
//! internals are never read back through magic indices:
//!
//! - per nesting level, either a log standard deviation (intercept only) or
//!   the log-Cholesky factor of the 2x2 intercept/slope covariance
//!   (`[log l11, l21, log l22]`, always positive definite, unconstrained);
//! - the log of the baseline residual standard deviation;
//! - when AR(1) is requested, a real `z` mapped to (-1, 1) via `tanh`;
//! - when variance is phase-heterogeneous, one log scale ratio per
//!   non-baseline phase present in the data.

use crate::data::Phase;
use crate::model::{
    CorrelationFamily, Level, LevelVariance, ModelSpecification, VarianceStructure,
};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Variance scale: `g(x) = exp(x)^2` for a log standard deviation.
pub fn log_sd_to_variance(x: f64) -> f64 {
    (2.0 * x).exp()
}

/// Inverse of [`log_sd_to_variance`].
pub fn variance_to_log_sd(v: f64) -> f64 {
    0.5 * v.ln()
}

/// Analytic derivative of [`log_sd_to_variance`].
pub fn log_sd_to_variance_deriv(x: f64) -> f64 {
    2.0 * (2.0 * x).exp()
}

/// Correlation link: unconstrained real to (-1, 1).
pub fn z_to_correlation(z: f64) -> f64 {
    z.tanh()
}

/// Inverse of [`z_to_correlation`].
pub fn correlation_to_z(rho: f64) -> f64 {
    rho.atanh()
}

/// Analytic derivative of [`z_to_correlation`].
pub fn z_to_correlation_deriv(z: f64) -> f64 {
    let t = z.tanh();
    1.0 - t * t
}

/// Named offsets into the optimizer's unconstrained parameter vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamLayout {
    /// Whether each level carries a random slope in addition to the
    /// intercept (2x2 log-Cholesky block instead of a single log sd).
    pub with_slope: bool,
    /// Offset of each level's block, in [study, cluster, case] order.
    pub level_offsets: [usize; 3],
    /// Offset of the baseline residual log standard deviation.
    pub resid_log_sd: usize,
    /// Offset of the AR(1) `z` parameter, when present.
    pub ar1: Option<usize>,
    /// Offsets of the per-phase log scale ratios, when heteroscedastic.
    pub phase_ratios: Vec<(Phase, usize)>,
    len: usize,
}

impl ParamLayout {
    /// Derives the layout from a specification and the phases actually
    /// observed in the dataset.
    pub fn new(spec: &ModelSpecification, phases_present: &[Phase]) -> Self {
        let with_slope = spec.random.slope_term.is_some();
        let level_len = if with_slope { 3 } else { 1 };
        let level_offsets = [0, level_len, 2 * level_len];
        let mut next = 3 * level_len;
        let resid_log_sd = next;
        next += 1;
        let ar1 = match spec.correlation {
            CorrelationFamily::Ar1 => {
                let off = next;
                next += 1;
                Some(off)
            }
            CorrelationFamily::Independent => None,
        };
        let mut phase_ratios = Vec::new();
        if spec.variance == VarianceStructure::ByPhase {
            for &phase in phases_present {
                if phase != Phase::Baseline {
                    phase_ratios.push((phase, next));
                    next += 1;
                }
            }
        }
        Self {
            with_slope,
            level_offsets,
            resid_log_sd,
            ar1,
            phase_ratios,
            len: next,
        }
    }

    /// Total number of unconstrained parameters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Parameter range of one level's block.
    pub fn level_range(&self, level: Level) -> Range<usize> {
        let width = if self.with_slope { 3 } else { 1 };
        let off = self.level_offsets[level_index(level)];
        off..off + width
    }

    /// The 2x2 random-effects covariance of one level on the natural scale
    /// (`[[g11, g21], [g21, g22]]`), or `[[g11, 0], [0, 0]]` when the level
    /// has an intercept only. Reconstructed as `G = L L'` from the
    /// log-Cholesky block.
    pub fn level_matrix(&self, theta: &Array1<f64>, level: Level) -> [[f64; 2]; 2] {
        let r = self.level_range(level);
        if self.with_slope {
            let l11 = theta[r.start].exp();
            let l21 = theta[r.start + 1];
            let l22 = theta[r.start + 2].exp();
            [
                [l11 * l11, l21 * l11],
                [l21 * l11, l21 * l21 + l22 * l22],
            ]
        } else {
            let sd = theta[r.start].exp();
            [[sd * sd, 0.0], [0.0, 0.0]]
        }
    }

    /// Natural-scale variance components of one level.
    pub fn level_variance(&self, theta: &Array1<f64>, level: Level) -> LevelVariance {
        let g = self.level_matrix(theta, level);
        LevelVariance {
            level,
            intercept_variance: g[0][0],
            slope_variance: self.with_slope.then_some(g[1][1]),
            covariance: self.with_slope.then_some(g[0][1]),
        }
    }

    /// Residual variance for one phase (baseline scale times that phase's
    /// ratio; the ratio is 1 for the baseline and for homoscedastic fits).
    pub fn residual_variance(&self, theta: &Array1<f64>, phase: Phase) -> f64 {
        log_sd_to_variance(theta[self.resid_log_sd]) * self.phase_ratio(theta, phase)
    }

    /// Phase scale ratio relative to baseline.
    pub fn phase_ratio(&self, theta: &Array1<f64>, phase: Phase) -> f64 {
        self.phase_ratios
            .iter()
            .find(|&&(p, _)| p == phase)
            .map_or(1.0, |&(_, off)| theta[off].exp())
    }

    /// AR(1) correlation on the natural scale, when the layout has one.
    pub fn rho(&self, theta: &Array1<f64>) -> Option<f64> {
        self.ar1.map(|off| z_to_correlation(theta[off]))
    }

    /// Builds the starting parameter vector. Variance starting values are
    /// split evenly across components from the outcome's marginal standard
    /// deviation; the AR(1) and phase-ratio starting values are explicit
    /// caller inputs, since they are part of the reproducible specification.
    pub fn initial_theta(
        &self,
        outcome_sd: f64,
        initial_ar1: f64,
        initial_phase_ratio: f64,
    ) -> Array1<f64> {
        let mut theta = Array1::zeros(self.len);
        // Four variance sources share the marginal variance at the start.
        let component_sd = (outcome_sd.max(1e-3)) / 2.0;
        let log_sd = component_sd.ln();
        for level in Level::ALL {
            let r = self.level_range(level);
            theta[r.start] = log_sd;
            if self.with_slope {
                theta[r.start + 1] = 0.0;
                theta[r.start + 2] = log_sd;
            }
        }
        theta[self.resid_log_sd] = log_sd;
        if let Some(off) = self.ar1 {
            theta[off] = correlation_to_z(initial_ar1.clamp(-0.99, 0.99));
        }
        for &(_, off) in &self.phase_ratios {
            theta[off] = initial_phase_ratio.max(1e-6).ln();
        }
        theta
    }
}

fn level_index(level: Level) -> usize {
    match level {
        Level::Study => 0,
        Level::Cluster => 1,
        Level::Case => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixedTerm, groups};
    use approx::assert_abs_diff_eq;

    fn het_spec() -> ModelSpecification {
        ModelSpecification::ar1_heteroscedastic(vec![
            FixedTerm::new("level_AB", groups::LEVEL),
            FixedTerm::new("trend_B", groups::TREND),
        ])
    }

    #[test]
    fn layout_offsets_cover_the_vector_exactly() {
        let phases = [Phase::Baseline, Phase::Intervention, Phase::Maintenance];
        let layout = ParamLayout::new(&het_spec(), &phases);
        // 3 levels x 3 chol params + resid + ar1 + 2 phase ratios.
        assert!(layout.with_slope);
        assert_eq!(layout.len(), 13);
        assert_eq!(layout.level_offsets, [0, 3, 6]);
        assert_eq!(layout.resid_log_sd, 9);
        assert_eq!(layout.ar1, Some(10));
        assert_eq!(layout.phase_ratios.len(), 2);

        let null = ParamLayout::new(&ModelSpecification::null(), &phases);
        assert_eq!(null.len(), 4);
        assert_eq!(null.ar1, None);
        assert!(null.phase_ratios.is_empty());
    }

    #[test]
    fn transforms_round_trip() {
        for &v in &[1e-4, 0.5, 1.0, 7.3, 250.0] {
            assert_abs_diff_eq!(
                log_sd_to_variance(variance_to_log_sd(v)),
                v,
                epsilon = 1e-12 * v
            );
        }
        for &rho in &[-0.95, -0.3, 0.0, 0.42, 0.9] {
            assert_abs_diff_eq!(
                z_to_correlation(correlation_to_z(rho)),
                rho,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn level_matrix_is_positive_definite_for_any_block() {
        let phases = [Phase::Baseline, Phase::Intervention];
        let layout = ParamLayout::new(&het_spec(), &phases);
        let mut theta = Array1::zeros(layout.len());
        // An arbitrary unconstrained point must map to a valid covariance.
        for (i, t) in theta.iter_mut().enumerate() {
            *t = (i as f64) * 0.37 - 1.1;
        }
        for level in Level::ALL {
            let g = layout.level_matrix(&theta, level);
            assert!(g[0][0] > 0.0);
            assert!(g[1][1] >= 0.0);
            let det = g[0][0] * g[1][1] - g[0][1] * g[0][1];
            assert!(det >= -1e-12);
            assert_abs_diff_eq!(g[0][1], g[1][0], epsilon = 1e-15);
        }
        assert!(layout.rho(&theta).unwrap().abs() < 1.0);
        assert!(layout.residual_variance(&theta, Phase::Intervention) > 0.0);
    }

    #[test]
    fn initial_theta_honors_explicit_starting_values() {
        let phases = [Phase::Baseline, Phase::Intervention];
        let layout = ParamLayout::new(&het_spec(), &phases);
        let theta = layout.initial_theta(4.0, 0.3, 1.5);
        assert_abs_diff_eq!(layout.rho(&theta).unwrap(), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(
            layout.phase_ratio(&theta, Phase::Intervention),
            1.5,
            epsilon = 1e-12
        );
    }
}
