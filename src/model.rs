//! # Model Specification and Fit Artifacts
//!
//! The public blueprint of one model instantiation. A [`ModelSpecification`]
//! enumerates fixed-effect terms (each tagged with a term group used for
//! joint Wald tests), the three-level random-effects structure, the residual
//! correlation family, and the residual variance-heterogeneity grouping. It
//! is an explicit, serializable value: no formulas, no runtime expression
//! evaluation. Each of the four substantive models of an analysis is one
//! specification passed to the shared [`crate::estimate::fit`] pipeline.
//!
//! A [`ModelFit`] is created once per optimizer run and never mutated;
//! every downstream component (variance extraction, robust inference, Wald
//! tests, diagnostics) reads it immutably.

use crate::data::Phase;
use crate::params::ParamLayout;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use thiserror::Error;

/// Nesting level of a random effect, in descending hierarchy order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Study,
    Cluster,
    Case,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Study, Level::Cluster, Level::Case];

    pub fn label(self) -> &'static str {
        match self {
            Level::Study => "study",
            Level::Cluster => "cluster",
            Level::Case => "case",
        }
    }
}

/// Residual correlation structure within a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationFamily {
    /// Conditionally independent residuals.
    Independent,
    /// First-order autoregressive correlation over the session index.
    Ar1,
}

/// Residual variance-heterogeneity grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceStructure {
    /// One pooled residual variance.
    Homoscedastic,
    /// One residual variance per phase (baseline is the reference scale).
    ByPhase,
}

/// A fixed-effect term: a named covariate column plus the term group it
/// belongs to. Groups make Wald constraint selection structural instead of
/// string-matched ("level", "trend", "moderation", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTerm {
    pub name: String,
    pub group: String,
}

impl FixedTerm {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

/// Three-level random-effects structure. Random intercepts at every level
/// are always present; `slope_term` optionally adds a random slope on the
/// named AB-phase-transition indicator at each level, with unstructured
/// 2x2 covariance per level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomStructure {
    pub slope_term: Option<String>,
}

impl RandomStructure {
    pub fn intercept_only() -> Self {
        Self { slope_term: None }
    }

    pub fn with_slope(term: impl Into<String>) -> Self {
        Self {
            slope_term: Some(term.into()),
        }
    }
}

/// Immutable declaration of one model. Owned exclusively by the fit that
/// uses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpecification {
    /// Fixed-effect terms beyond the always-present intercept.
    pub fixed_terms: Vec<FixedTerm>,
    pub random: RandomStructure,
    pub correlation: CorrelationFamily,
    pub variance: VarianceStructure,
}

/// Canonical term group names used by the convenience constructors.
pub mod groups {
    pub const LEVEL: &str = "level";
    pub const TREND: &str = "trend";
    pub const MODERATION: &str = "moderation";
}

impl ModelSpecification {
    /// The unconditional (intercept-only) model: three random intercepts,
    /// independent homoscedastic residuals.
    pub fn null() -> Self {
        Self {
            fixed_terms: Vec::new(),
            random: RandomStructure::intercept_only(),
            correlation: CorrelationFamily::Independent,
            variance: VarianceStructure::Homoscedastic,
        }
    }

    /// AR(1) residuals, pooled residual variance. A random slope is placed
    /// on the first fixed term in the "level" group, if any.
    pub fn ar1(fixed_terms: Vec<FixedTerm>) -> Self {
        let random = Self::default_slope(&fixed_terms);
        Self {
            fixed_terms,
            random,
            correlation: CorrelationFamily::Ar1,
            variance: VarianceStructure::Homoscedastic,
        }
    }

    /// AR(1) residuals with one residual variance per phase.
    pub fn ar1_heteroscedastic(fixed_terms: Vec<FixedTerm>) -> Self {
        let mut spec = Self::ar1(fixed_terms);
        spec.variance = VarianceStructure::ByPhase;
        spec
    }

    /// The moderated model: the heteroscedastic AR(1) structure plus
    /// moderator-by-phase interaction terms (tagged with their own groups
    /// by the caller, conventionally [`groups::MODERATION`]).
    pub fn ar1_heteroscedastic_moderated(
        fixed_terms: Vec<FixedTerm>,
        moderators: Vec<FixedTerm>,
    ) -> Self {
        let mut spec = Self::ar1_heteroscedastic(fixed_terms);
        spec.fixed_terms.extend(moderators);
        spec
    }

    fn default_slope(fixed_terms: &[FixedTerm]) -> RandomStructure {
        match fixed_terms.iter().find(|t| t.group == groups::LEVEL) {
            Some(t) => RandomStructure::with_slope(t.name.clone()),
            None => RandomStructure::intercept_only(),
        }
    }

    /// Coefficient names in design-matrix order (intercept first).
    pub fn coefficient_names(&self) -> Vec<String> {
        let mut names = vec!["intercept".to_string()];
        names.extend(self.fixed_terms.iter().map(|t| t.name.clone()));
        names
    }

    /// Names of the terms in one group, for joint tests.
    pub fn terms_in_group(&self, group: &str) -> Vec<String> {
        self.fixed_terms
            .iter()
            .filter(|t| t.group == group)
            .map(|t| t.name.clone())
            .collect()
    }
}

/// Specification-level failures, detected before optimization begins.
#[derive(Error, Debug)]
pub enum SpecificationError {
    #[error("Fixed term '{0}' names a covariate column absent from the dataset.")]
    UnknownCovariate(String),
    #[error("Random slope term '{0}' names a covariate column absent from the dataset.")]
    UnknownSlopeTerm(String),
    #[error("Fixed term '{0}' is listed more than once.")]
    DuplicateTerm(String),
    #[error(
        "The fixed-effect design is rank deficient (rank {rank} of {cols} columns); \
         collinear or constant covariates prevent unique estimation."
    )]
    RankDeficientDesign { rank: usize, cols: usize },
}

/// Iteration caps, convergence tolerance, and explicit starting values.
/// Starting values are part of the reproducible specification: the same
/// options and dataset give the same optimization trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    /// Cap on the outer GLS/variance alternation.
    pub max_outer_iterations: usize,
    /// Cap on the inner unconstrained BFGS search.
    pub max_inner_iterations: usize,
    /// Relative restricted log-likelihood improvement below which the outer
    /// alternation is declared converged.
    pub tolerance: f64,
    /// Starting value for the AR(1) correlation coefficient.
    pub initial_ar1: f64,
    /// Starting value for each phase-specific residual variance ratio.
    pub initial_phase_ratio: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_outer_iterations: 100,
            max_inner_iterations: 100,
            tolerance: 1e-3,
            initial_ar1: 0.2,
            initial_phase_ratio: 1.0,
        }
    }
}

/// Natural-scale variance components of one nesting level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelVariance {
    pub level: Level,
    pub intercept_variance: f64,
    /// Present when the specification carries a random slope.
    pub slope_variance: Option<f64>,
    /// Intercept/slope covariance, when a slope is present.
    pub covariance: Option<f64>,
}

/// The immutable result of one REML optimizer run.
#[derive(Debug, Clone)]
pub struct ModelFit {
    pub spec: ModelSpecification,
    pub coefficient_names: Vec<String>,
    /// Fixed-effect estimates (GLS solution at the final theta).
    pub beta: Array1<f64>,
    /// Model-based (non-robust) covariance of `beta`.
    pub cov_beta_model: Array2<f64>,
    pub reml_log_likelihood: f64,
    /// The optimizer's internal unconstrained parameter vector at optimum.
    pub theta: Array1<f64>,
    /// Named offsets into `theta`, fixed by the specification.
    pub layout: ParamLayout,
    /// Asymptotic covariance of `theta` (inverse observed information).
    pub theta_cov: Array2<f64>,
    /// False when the observed information was not positive definite; the
    /// delta method then refuses to produce standard errors from it.
    pub theta_cov_reliable: bool,
    /// Natural-scale variance components per nesting level.
    pub level_variances: Vec<LevelVariance>,
    /// Residual variances: one entry when homoscedastic, one per phase
    /// otherwise.
    pub residual_variances: Vec<(Phase, f64)>,
    /// AR(1) correlation estimate, when the specification requests one.
    pub ar1: Option<f64>,
    pub converged: bool,
    /// Outer alternation iterations consumed.
    pub iterations: usize,
    // Fitted internals shared by the downstream inference components.
    pub(crate) x: Array2<f64>,
    pub(crate) v: Array2<f64>,
    pub(crate) residuals: Array1<f64>,
    pub(crate) study_rows: Vec<Range<usize>>,
    pub(crate) case_rows: Vec<Range<usize>>,
}

impl ModelFit {
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Marginal residuals `y - X beta`.
    pub fn residuals(&self) -> &Array1<f64> {
        &self.residuals
    }

    /// Baseline (reference-phase) residual variance.
    pub fn baseline_residual_variance(&self) -> f64 {
        self.residual_variances
            .iter()
            .find(|(p, _)| *p == Phase::Baseline)
            .or_else(|| self.residual_variances.first())
            .map(|&(_, v)| v)
            .unwrap_or(0.0)
    }

    pub fn level_variance(&self, level: Level) -> Option<&LevelVariance> {
        self.level_variances.iter().find(|lv| lv.level == level)
    }
}

/// Likelihood-ratio-style comparison of two fits of the same fixed-effect
/// structure with nested variance structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikelihoodRatioComparison {
    pub statistic: f64,
    pub df: usize,
    pub p_value: Option<f64>,
    pub favors_general: bool,
}

/// Compares a general variance structure against a nested restriction via
/// `2 * (llik_general - llik_nested)` on the REML scale. Only meaningful
/// when both fits share the same fixed-effect design.
pub fn compare_reml(general: &ModelFit, nested: &ModelFit) -> LikelihoodRatioComparison {
    let statistic = 2.0 * (general.reml_log_likelihood - nested.reml_log_likelihood);
    let df = general.theta.len().saturating_sub(nested.theta.len()).max(1);
    let p_value = if statistic > 0.0 {
        ChiSquared::new(df as f64)
            .ok()
            .map(|chi| 1.0 - chi.cdf(statistic))
    } else {
        Some(1.0)
    };
    LikelihoodRatioComparison {
        statistic,
        df,
        p_value,
        favors_general: statistic > 0.0,
    }
}
