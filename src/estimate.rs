//! # REML Estimation of the Hierarchical Mixed Model
//!
//! The numerical core. Fits fixed effects and variance components by
//! restricted maximum likelihood through a nested scheme:
//!
//! 1. **Outer alternation:** generalized least squares gives the fixed
//!    effects in closed form at the current variance parameters (the GLS
//!    solution is profiled into the REML criterion), and the alternation
//!    repeats the inner search until the restricted log-likelihood stops
//!    improving.
//! 2. **Inner loop (BFGS):** a quasi-Newton search over the unconstrained
//!    transform of the variance parameters (see [`crate::params`]),
//!    maximizing the restricted log-likelihood via the `wolfe_bfgs` solver.
//!
//! The marginal covariance is `V = sum_l Z_l G_l Z_l' + sigma^2 * Lambda`
//! with `Lambda` carrying the optional AR(1) correlation and per-phase scale
//! ratios within each case. On convergence the asymptotic covariance of the
//! transformed variance parameters is the inverse of the observed
//! information, obtained by numerically differencing the REML criterion.

use crate::data::{HierarchicalDataset, Phase};
use crate::model::{
    CorrelationFamily, FitOptions, Level, ModelFit, ModelSpecification, SpecificationError,
    VarianceStructure,
};
use crate::params::ParamLayout;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Eigh, Inverse, SVD, UPLO};
use rayon::prelude::*;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Model specification is invalid: {0}")]
    Specification(#[from] SpecificationError),

    #[error("A linear system solve failed. The marginal covariance may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error(
        "The GLS solve at the final variance parameters failed; the marginal covariance is singular."
    )]
    FinalSolveFailed,

    #[error(
        "The restricted log-likelihood is not finite at the starting values \
         (cost {0}); optimization cannot start."
    )]
    NonFiniteStart(f64),
}

/// The main entry point: fits one model specification to the dataset.
///
/// Non-convergence within the iteration caps is *not* an error; the
/// returned [`ModelFit`] carries a `converged` flag and the caller decides
/// whether to use the partial result.
pub fn fit(
    data: &HierarchicalDataset,
    spec: ModelSpecification,
    options: &FitOptions,
) -> Result<ModelFit, EstimationError> {
    let ctx = internal::DesignContext::build(data, &spec)?;
    log::info!(
        "Fitting model over {} observations ({} studies, {} clusters, {} cases), {} fixed terms, {} variance parameters.",
        data.n_obs(),
        data.n_studies(),
        data.n_clusters(),
        data.n_cases(),
        ctx.x.ncols(),
        ctx.layout.len()
    );
    warn_on_degenerate_grouping(data);

    let outcome_sd = sample_sd(&ctx.y);
    let mut theta = ctx
        .layout
        .initial_theta(outcome_sd, options.initial_ar1, options.initial_phase_ratio);

    let state = internal::RemlState::new(&ctx);
    let initial_cost = state.compute_cost(&theta);
    if !initial_cost.is_finite() {
        return Err(EstimationError::NonFiniteStart(initial_cost));
    }

    let mut last_cost = initial_cost;
    let mut converged = false;
    let mut iterations = 0;
    for outer in 1..=options.max_outer_iterations {
        iterations = outer;
        match state.run_bfgs(theta.clone(), options) {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations: inner,
                ..
            }) => {
                log::debug!(
                    "Outer iteration {outer}: inner BFGS took {inner} steps, cost {final_value:.6}."
                );
                theta = final_point;
                let rel_change = (last_cost - final_value).abs() / last_cost.abs().max(1.0);
                last_cost = final_value;
                if rel_change < options.tolerance {
                    converged = true;
                    break;
                }
            }
            Err(message) => {
                // A line-search failure leaves the best theta seen so far in
                // place; report a non-converged fit rather than raising.
                log::warn!("Inner BFGS failed at outer iteration {outer}: {message}");
                break;
            }
        }
    }
    if !converged {
        log::warn!(
            "REML did not meet the convergence tolerance within {} outer iterations.",
            options.max_outer_iterations
        );
    }

    internal::assemble_fit(&ctx, spec, theta, last_cost, converged, iterations, &state)
}

/// Fits several independent model instantiations in parallel. The dataset
/// is shared immutably; the fits have no ordering requirement.
pub fn fit_many(
    data: &HierarchicalDataset,
    specs: Vec<ModelSpecification>,
    options: &FitOptions,
) -> Vec<Result<ModelFit, EstimationError>> {
    specs
        .into_par_iter()
        .map(|spec| fit(data, spec, options))
        .collect()
}

fn warn_on_degenerate_grouping(data: &HierarchicalDataset) {
    if data.n_studies() < 2 {
        log::warn!(
            "Only one study: the study-level variance component is weakly identified and may be estimated at or near zero."
        );
    }
    if data.n_clusters() <= data.n_studies() {
        log::warn!(
            "At most one cluster per study: the cluster-level variance component is weakly identified and may be estimated at or near zero."
        );
    }
    if data.n_cases() <= data.n_clusters() {
        log::warn!(
            "At most one case per cluster: the case-level variance component is weakly identified and may be estimated at or near zero."
        );
    }
}

fn sample_sd(y: &Array1<f64>) -> f64 {
    let n = y.len() as f64;
    let mean = y.sum() / n;
    let ss = y.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
    (ss / (n - 1.0).max(1.0)).sqrt()
}

/// Internal module for estimation logic.
mod internal {
    use super::*;

    /// Cost returned when a trial theta produces an indefinite or otherwise
    /// unusable marginal covariance; large but finite so the line search can
    /// back off instead of crashing.
    const BAD_COST: f64 = 1e10;

    /// One-time design quantities shared by every cost evaluation.
    pub(super) struct DesignContext {
        pub x: Array2<f64>,
        pub y: Array1<f64>,
        /// Random-effect design row `[1, slope covariate]` per observation.
        pub z: Vec<[f64; 2]>,
        /// AR(1) time index per observation.
        pub times: Vec<f64>,
        pub phases: Vec<Phase>,
        pub layout: ParamLayout,
        pub study_rows: Vec<Range<usize>>,
        pub case_rows: Vec<Range<usize>>,
        /// Per-row unit indices, used for same-unit tests in V assembly.
        pub row_cluster: Vec<usize>,
        pub row_case: Vec<usize>,
    }

    impl DesignContext {
        pub(super) fn build(
            data: &HierarchicalDataset,
            spec: &ModelSpecification,
        ) -> Result<Self, EstimationError> {
            let n = data.n_obs();
            let p = 1 + spec.fixed_terms.len();

            for (i, term) in spec.fixed_terms.iter().enumerate() {
                if spec.fixed_terms[..i].iter().any(|t| t.name == term.name) {
                    return Err(SpecificationError::DuplicateTerm(term.name.clone()).into());
                }
            }

            let mut x = Array2::zeros((n, p));
            x.column_mut(0).fill(1.0);
            for (j, term) in spec.fixed_terms.iter().enumerate() {
                let col = data
                    .column(&term.name)
                    .ok_or_else(|| SpecificationError::UnknownCovariate(term.name.clone()))?;
                x.column_mut(j + 1).assign(&col);
            }
            check_full_rank(&x)?;

            let z = match &spec.random.slope_term {
                Some(name) => {
                    let col = data
                        .column(name)
                        .ok_or_else(|| SpecificationError::UnknownSlopeTerm(name.clone()))?;
                    col.iter().map(|&v| [1.0, v]).collect()
                }
                None => vec![[1.0, 0.0]; n],
            };

            let mut row_cluster = vec![0usize; n];
            let mut row_case = vec![0usize; n];
            for (k, block) in data.clusters().iter().enumerate() {
                for r in block.rows.clone() {
                    row_cluster[r] = k;
                }
            }
            for (k, block) in data.cases().iter().enumerate() {
                for r in block.rows.clone() {
                    row_case[r] = k;
                }
            }

            Ok(Self {
                x,
                y: data.outcome().to_owned(),
                z,
                times: data.sessions().iter().map(|&s| s as f64).collect(),
                phases: data.phases().to_vec(),
                layout: ParamLayout::new(spec, &data.phases_present()),
                study_rows: data.studies().iter().map(|b| b.rows.clone()).collect(),
                case_rows: data.cases().iter().map(|b| b.rows.clone()).collect(),
                row_cluster,
                row_case,
            })
        }

        /// Assembles the marginal covariance `V` at one theta. `V` is block
        /// diagonal by study, so only within-study entries are touched.
        pub(super) fn marginal_covariance(&self, theta: &Array1<f64>) -> Array2<f64> {
            let n = self.y.len();
            let g_study = self.layout.level_matrix(theta, Level::Study);
            let g_cluster = self.layout.level_matrix(theta, Level::Cluster);
            let g_case = self.layout.level_matrix(theta, Level::Case);
            let sigma2 = self.layout.residual_variance(theta, Phase::Baseline);
            let rho = self.layout.rho(theta).unwrap_or(0.0);

            // Per-row residual scale multiplier (phase heterogeneity).
            let scale: Vec<f64> = self
                .phases
                .iter()
                .map(|&p| self.layout.phase_ratio(theta, p).sqrt())
                .collect();

            let mut v = Array2::zeros((n, n));
            for block in &self.study_rows {
                for i in block.clone() {
                    for j in i..block.end {
                        let mut vij = quad(&g_study, self.z[i], self.z[j]);
                        if self.row_cluster[i] == self.row_cluster[j] {
                            vij += quad(&g_cluster, self.z[i], self.z[j]);
                        }
                        if self.row_case[i] == self.row_case[j] {
                            vij += quad(&g_case, self.z[i], self.z[j]);
                            let corr = if i == j {
                                1.0
                            } else if rho == 0.0 {
                                0.0
                            } else {
                                rho.powf((self.times[i] - self.times[j]).abs())
                            };
                            vij += sigma2 * scale[i] * scale[j] * corr;
                        }
                        v[[i, j]] = vij;
                        v[[j, i]] = vij;
                    }
                }
            }
            v
        }
    }

    fn quad(g: &[[f64; 2]; 2], zi: [f64; 2], zj: [f64; 2]) -> f64 {
        zi[0] * (g[0][0] * zj[0] + g[0][1] * zj[1]) + zi[1] * (g[1][0] * zj[0] + g[1][1] * zj[1])
    }

    /// Rank check on the fixed-effect design, reported as a specification
    /// error before any optimization starts.
    fn check_full_rank(x: &Array2<f64>) -> Result<(), EstimationError> {
        let (_, sv, _) = x
            .svd(false, false)
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        let smax = sv.iter().cloned().fold(0.0_f64, f64::max);
        let tol = smax * (x.nrows().max(x.ncols()) as f64) * f64::EPSILON * 1e2;
        let rank = sv.iter().filter(|&&s| s > tol).count();
        if rank < x.ncols() {
            return Err(SpecificationError::RankDeficientDesign {
                rank,
                cols: x.ncols(),
            }
            .into());
        }
        Ok(())
    }

    /// The GLS solution and the pieces of the REML criterion at one theta.
    pub(super) struct GlsSolution {
        pub beta: Array1<f64>,
        pub cov_beta: Array2<f64>,
        pub v: Array2<f64>,
        pub residuals: Array1<f64>,
        /// Negative restricted log-likelihood, constants dropped.
        pub cost: f64,
    }

    /// Holds the per-fit state for the outer REML optimization, caching
    /// cost evaluations keyed by the bit pattern of theta.
    pub(super) struct RemlState<'a> {
        ctx: &'a DesignContext,
        cache: RefCell<HashMap<Vec<u64>, f64>>,
    }

    impl<'a> RemlState<'a> {
        pub(super) fn new(ctx: &'a DesignContext) -> Self {
            Self {
                ctx,
                cache: RefCell::new(HashMap::new()),
            }
        }

        /// Full GLS + REML evaluation at one theta. Any linear-algebra
        /// failure (indefinite V at an extreme trial point) is surfaced as
        /// `None` so the caller can substitute a large finite cost.
        pub(super) fn solve_gls(&self, theta: &Array1<f64>) -> Option<GlsSolution> {
            let ctx = self.ctx;
            let v = ctx.marginal_covariance(theta);
            let chol = v.cholesky(UPLO::Lower).ok()?;
            let log_det_v = 2.0 * chol.diag().mapv(f64::ln).sum();

            let v_inv = v.inv().ok()?;
            let wx = v_inv.dot(&ctx.x);
            let xtvx = ctx.x.t().dot(&wx);
            let xtvy = wx.t().dot(&ctx.y);
            let xtvx_chol = xtvx.cholesky(UPLO::Lower).ok()?;
            let log_det_xtvx = 2.0 * xtvx_chol.diag().mapv(f64::ln).sum();
            let cov_beta = xtvx.inv().ok()?;
            let beta = cov_beta.dot(&xtvy);
            let residuals = &ctx.y - &ctx.x.dot(&beta);
            let quad_form = residuals.dot(&v_inv.dot(&residuals));

            let cost = 0.5 * (log_det_v + log_det_xtvx + quad_form);
            cost.is_finite().then_some(GlsSolution {
                beta,
                cov_beta,
                v,
                residuals,
                cost,
            })
        }

        /// Cached cost evaluation for the BFGS closure and the numeric
        /// derivatives.
        pub(super) fn compute_cost(&self, theta: &Array1<f64>) -> f64 {
            let key: Vec<u64> = theta.iter().map(|&v| v.to_bits()).collect();
            if let Some(&cached) = self.cache.borrow().get(&key) {
                return cached;
            }
            let cost = self.solve_gls(theta).map_or(BAD_COST, |g| g.cost);
            self.cache.borrow_mut().insert(key, cost);
            cost
        }

        /// Central-difference gradient of the REML cost.
        pub(super) fn compute_gradient(&self, theta: &Array1<f64>) -> Array1<f64> {
            let mut grad = Array1::zeros(theta.len());
            for k in 0..theta.len() {
                let h = 1e-5 * (1.0 + theta[k].abs());
                let mut plus = theta.clone();
                plus[k] += h;
                let mut minus = theta.clone();
                minus[k] -= h;
                grad[k] = (self.compute_cost(&plus) - self.compute_cost(&minus)) / (2.0 * h);
            }
            grad
        }

        /// One inner BFGS pass over theta.
        pub(super) fn run_bfgs(
            &self,
            start: Array1<f64>,
            options: &FitOptions,
        ) -> Result<BfgsSolution, String> {
            let cost_and_grad = |theta: &Array1<f64>| -> (f64, Array1<f64>) {
                // Extreme trial values destabilize the line search.
                let safe = theta.mapv(|v| v.clamp(-12.0, 12.0));
                let cost = self.compute_cost(&safe);
                let mut grad = self.compute_gradient(&safe);
                let norm = grad.dot(&grad).sqrt();
                if norm > 100.0 {
                    grad.mapv_inplace(|g| g * 100.0 / norm);
                }
                (cost, grad)
            };
            Bfgs::new(start, cost_and_grad)
                .with_tolerance(options.tolerance * 1e-2)
                .with_max_iterations(options.max_inner_iterations)
                .run()
                .map_err(|e| format!("{e:?}"))
        }

        /// Observed information of the cost at the optimum, by central
        /// second differences.
        pub(super) fn numeric_hessian(&self, theta: &Array1<f64>) -> Array2<f64> {
            let k = theta.len();
            let base = self.compute_cost(theta);
            let hs: Vec<f64> = theta.iter().map(|t| 1e-4 * (1.0 + t.abs())).collect();
            let mut hess = Array2::zeros((k, k));
            for i in 0..k {
                let mut tp = theta.clone();
                tp[i] += hs[i];
                let mut tm = theta.clone();
                tm[i] -= hs[i];
                hess[[i, i]] =
                    (self.compute_cost(&tp) - 2.0 * base + self.compute_cost(&tm)) / (hs[i] * hs[i]);
                for j in (i + 1)..k {
                    let mut pp = theta.clone();
                    pp[i] += hs[i];
                    pp[j] += hs[j];
                    let mut pm = theta.clone();
                    pm[i] += hs[i];
                    pm[j] -= hs[j];
                    let mut mp = theta.clone();
                    mp[i] -= hs[i];
                    mp[j] += hs[j];
                    let mut mm = theta.clone();
                    mm[i] -= hs[i];
                    mm[j] -= hs[j];
                    let d = (self.compute_cost(&pp) - self.compute_cost(&pm)
                        - self.compute_cost(&mp)
                        + self.compute_cost(&mm))
                        / (4.0 * hs[i] * hs[j]);
                    hess[[i, j]] = d;
                    hess[[j, i]] = d;
                }
            }
            hess
        }
    }

    /// Inverts the observed information by eigendecomposition, pseudo-
    /// inverting and flagging when it is not positive definite.
    fn invert_information(info: &Array2<f64>) -> (Array2<f64>, bool) {
        let k = info.nrows();
        match info.eigh(UPLO::Lower) {
            Ok((eigvals, eigvecs)) => {
                let max_eig = eigvals.iter().cloned().fold(0.0_f64, f64::max);
                let floor = max_eig.max(1.0) * 1e-10;
                let reliable = eigvals.iter().all(|&e| e > floor);
                let mut d_plus = Array1::zeros(k);
                for (i, &e) in eigvals.iter().enumerate() {
                    if e > floor {
                        d_plus[i] = 1.0 / e;
                    }
                }
                let cov = eigvecs.dot(&Array2::from_diag(&d_plus)).dot(&eigvecs.t());
                if !reliable {
                    log::warn!(
                        "Observed information is not positive definite; variance-parameter standard errors are marked unreliable."
                    );
                }
                (cov, reliable)
            }
            Err(_) => {
                log::warn!("Eigendecomposition of the observed information failed.");
                (Array2::zeros((k, k)), false)
            }
        }
    }

    /// Final GLS pass at the optimal theta and construction of the
    /// immutable fit artifact.
    pub(super) fn assemble_fit(
        ctx: &DesignContext,
        spec: ModelSpecification,
        theta: Array1<f64>,
        final_cost: f64,
        converged: bool,
        iterations: usize,
        state: &RemlState<'_>,
    ) -> Result<ModelFit, EstimationError> {
        let gls = state
            .solve_gls(&theta)
            .ok_or(EstimationError::FinalSolveFailed)?;

        let (theta_cov, theta_cov_reliable) = {
            let info = state.numeric_hessian(&theta);
            invert_information(&info)
        };

        let n = ctx.y.len() as f64;
        let p = ctx.x.ncols() as f64;
        let reml_log_likelihood = -final_cost - 0.5 * (n - p) * (2.0 * std::f64::consts::PI).ln();

        let level_variances = Level::ALL
            .iter()
            .map(|&level| ctx.layout.level_variance(&theta, level))
            .collect();
        let residual_variances = match spec.variance {
            VarianceStructure::Homoscedastic => vec![(
                Phase::Baseline,
                ctx.layout.residual_variance(&theta, Phase::Baseline),
            )],
            VarianceStructure::ByPhase => {
                let mut phases: Vec<Phase> = ctx.phases.clone();
                phases.sort();
                phases.dedup();
                phases
                    .into_iter()
                    .map(|ph| (ph, ctx.layout.residual_variance(&theta, ph)))
                    .collect()
            }
        };
        let ar1 = match spec.correlation {
            CorrelationFamily::Ar1 => ctx.layout.rho(&theta),
            CorrelationFamily::Independent => None,
        };

        let coefficient_names = spec.coefficient_names();
        Ok(ModelFit {
            spec,
            coefficient_names,
            beta: gls.beta,
            cov_beta_model: gls.cov_beta,
            reml_log_likelihood,
            theta,
            layout: ctx.layout.clone(),
            theta_cov,
            theta_cov_reliable,
            level_variances,
            residual_variances,
            ar1,
            converged,
            iterations,
            x: ctx.x.clone(),
            v: gls.v,
            residuals: gls.residuals,
            study_rows: ctx.study_rows.clone(),
            case_rows: ctx.case_rows.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixedTerm, groups};
    use crate::testutil::{SimulationConfig, simulate};

    #[test]
    fn null_model_recovers_the_grand_mean() {
        let data = simulate(&SimulationConfig::balanced(2, 2, 2, 20), 7);
        let fit = fit(&data, ModelSpecification::null(), &FitOptions::default()).unwrap();
        let grand_mean = data.outcome().sum() / data.n_obs() as f64;
        assert!(
            (fit.beta[0] - grand_mean).abs() < 0.8,
            "intercept {} vs grand mean {}",
            fit.beta[0],
            grand_mean
        );
        for lv in &fit.level_variances {
            assert!(lv.intercept_variance >= 0.0);
        }
        assert!(fit.baseline_residual_variance() > 0.0);
    }

    #[test]
    fn level_shift_is_recovered_by_the_ar1_model() {
        let mut config = SimulationConfig::balanced(2, 2, 2, 20);
        config.effect = 5.0;
        let data = simulate(&config, 11);
        let spec = ModelSpecification::ar1(vec![FixedTerm::new("level_AB", groups::LEVEL)]);
        let fit = fit(&data, spec, &FitOptions::default()).unwrap();
        let idx = fit.coefficient_index("level_AB").unwrap();
        assert!(
            (fit.beta[idx] - 5.0).abs() < 0.75,
            "level_AB estimate {} too far from 5",
            fit.beta[idx]
        );
    }

    #[test]
    fn exhausted_iteration_cap_yields_a_flagged_partial_fit() {
        let data = simulate(&SimulationConfig::balanced(2, 2, 2, 12), 29);
        let spec = ModelSpecification::ar1(vec![FixedTerm::new("level_AB", groups::LEVEL)]);
        let options = FitOptions {
            max_outer_iterations: 1,
            tolerance: 1e-12,
            ..FitOptions::default()
        };
        // One outer pass cannot meet the tolerance; the partial result must
        // come back flagged, not as an error.
        let fitted = fit(&data, spec, &options).unwrap();
        assert!(!fitted.converged);
        assert_eq!(fitted.iterations, 1);
        assert!(fitted.beta.iter().all(|b| b.is_finite()));
        for lv in &fitted.level_variances {
            assert!(lv.intercept_variance >= 0.0);
        }
        assert!(fitted.baseline_residual_variance() >= 0.0);
    }

    #[test]
    fn collinear_design_is_a_specification_error() {
        let mut config = SimulationConfig::balanced(1, 2, 2, 10);
        config.effect = 1.0;
        let data = simulate(&config, 3);
        // level_copy duplicates level_AB column for column collinearity.
        let spec = ModelSpecification::ar1(vec![
            FixedTerm::new("level_AB", groups::LEVEL),
            FixedTerm::new("level_copy", groups::LEVEL),
        ]);
        let err = fit(&data, spec, &FitOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Specification(SpecificationError::RankDeficientDesign { .. })
        ));
    }

    #[test]
    fn unknown_covariate_is_reported_before_fitting() {
        let data = simulate(&SimulationConfig::balanced(1, 1, 2, 8), 5);
        let spec = ModelSpecification::ar1(vec![FixedTerm::new("nope", groups::LEVEL)]);
        let err = fit(&data, spec, &FitOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Specification(SpecificationError::UnknownCovariate(_))
        ));
    }

    #[test]
    fn model_based_covariance_is_symmetric_positive() {
        let data = simulate(&SimulationConfig::balanced(2, 2, 2, 12), 19);
        let spec = ModelSpecification::ar1(vec![FixedTerm::new("level_AB", groups::LEVEL)]);
        let fit = fit(&data, spec, &FitOptions::default()).unwrap();
        let c = &fit.cov_beta_model;
        for i in 0..c.nrows() {
            assert!(c[[i, i]] > 0.0);
            for j in 0..c.ncols() {
                assert!((c[[i, j]] - c[[j, i]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn heteroscedastic_fit_dominates_homoscedastic_under_inflated_phase_noise() {
        let mut config = SimulationConfig::balanced(2, 2, 2, 20);
        config.effect = 2.0;
        config.intervention_noise_scale = 3.0;
        let data = simulate(&config, 23);
        let terms = vec![FixedTerm::new("level_AB", groups::LEVEL)];
        let hom = fit(
            &data,
            ModelSpecification::ar1(terms.clone()),
            &FitOptions::default(),
        )
        .unwrap();
        let het = fit(
            &data,
            ModelSpecification::ar1_heteroscedastic(terms),
            &FitOptions::default(),
        )
        .unwrap();
        assert!(
            het.reml_log_likelihood >= hom.reml_log_likelihood - 1e-3,
            "het {} < hom {}",
            het.reml_log_likelihood,
            hom.reml_log_likelihood
        );
        let comparison = crate::model::compare_reml(&het, &hom);
        assert!(comparison.favors_general);
    }
}
