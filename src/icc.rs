//! # Intraclass Correlation Decomposition
//!
//! Splits total outcome variance into the three random-intercept components
//! plus the (baseline) residual. ICC at a level is that level's share of
//! the four-way total; the residual share is reported for completeness but
//! is not itself an ICC. The four shares sum to 1 by construction.

use crate::model::{Level, ModelFit};
use serde::{Deserialize, Serialize};

/// Four-way variance decomposition of one fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IccDecomposition {
    pub total_variance: f64,
    pub study: f64,
    pub cluster: f64,
    pub case: f64,
    /// Residual share of total variance (not an ICC).
    pub residual: f64,
}

impl IccDecomposition {
    /// ICC for one nesting level, in descending hierarchy order.
    pub fn at(&self, level: Level) -> f64 {
        match level {
            Level::Study => self.study,
            Level::Cluster => self.cluster,
            Level::Case => self.case,
        }
    }
}

pub struct IccCalculator;

impl IccCalculator {
    /// Decomposes using the three random-intercept variances and the
    /// baseline residual variance. Returns `None` when the total is zero
    /// (an entirely degenerate fit).
    pub fn decompose(fit: &ModelFit) -> Option<IccDecomposition> {
        let study = fit.level_variance(Level::Study)?.intercept_variance;
        let cluster = fit.level_variance(Level::Cluster)?.intercept_variance;
        let case = fit.level_variance(Level::Case)?.intercept_variance;
        let residual = fit.baseline_residual_variance();
        let total = study + cluster + case + residual;
        if !(total.is_finite() && total > 0.0) {
            return None;
        }
        Some(IccDecomposition {
            total_variance: total,
            study: study / total,
            cluster: cluster / total,
            case: case / total,
            residual: residual / total,
        })
    }
}
