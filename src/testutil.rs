//! Shared simulation fixtures for unit tests. Generates balanced SCD-style
//! datasets with known generating values so estimation accuracy can be
//! asserted against the truth.

use crate::data::{HierarchicalDataset, Observation, Phase};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

/// Generating values for one simulated dataset.
pub struct SimulationConfig {
    pub studies: usize,
    pub clusters_per_study: usize,
    pub cases_per_cluster: usize,
    pub sessions_per_case: usize,
    pub baseline_sessions: usize,
    /// Deterministic level shift applied from intervention onset.
    pub effect: f64,
    /// Residual AR(1) coefficient of the generating process.
    pub ar1: f64,
    pub noise_sd: f64,
    pub study_sd: f64,
    pub cluster_sd: f64,
    pub case_sd: f64,
    /// Multiplier on the residual sd during the intervention phase.
    pub intervention_noise_scale: f64,
    pub grand_mean: f64,
}

impl SimulationConfig {
    /// Balanced design, sessions split half baseline / half intervention.
    pub fn balanced(
        studies: usize,
        clusters_per_study: usize,
        cases_per_cluster: usize,
        sessions_per_case: usize,
    ) -> Self {
        Self {
            studies,
            clusters_per_study,
            cases_per_cluster,
            sessions_per_case,
            baseline_sessions: sessions_per_case / 2,
            effect: 0.0,
            ar1: 0.0,
            noise_sd: 1.0,
            study_sd: 0.5,
            cluster_sd: 0.5,
            case_sd: 0.5,
            intervention_noise_scale: 1.0,
            grand_mean: 10.0,
        }
    }
}

/// Simulates a dataset with the standard derived covariates: `level_AB`,
/// `level_copy` (an exact duplicate, for rank-deficiency tests), `trend_A`,
/// `trend_B`, `mod_x_level` (a case-alternating moderator dummy times the
/// level indicator), and `complexity_x_level` (a cluster-alternating dummy
/// times the level indicator, for joint moderator tests).
pub fn simulate(config: &SimulationConfig, seed: u64) -> HierarchicalDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let std_normal = Normal::new(0.0, 1.0).unwrap();
    let mut rows = Vec::new();
    let mut case_counter = 0usize;

    for s in 0..config.studies {
        let u_study = config.study_sd * std_normal.sample(&mut rng);
        for c in 0..config.clusters_per_study {
            let u_cluster = config.cluster_sd * std_normal.sample(&mut rng);
            for k in 0..config.cases_per_cluster {
                let u_case = config.case_sd * std_normal.sample(&mut rng);
                let moderator = (case_counter % 2) as f64;
                case_counter += 1;
                let mut prev_noise = 0.0;
                for t in 0..config.sessions_per_case {
                    let in_intervention = t >= config.baseline_sessions;
                    let phase = if in_intervention {
                        Phase::Intervention
                    } else {
                        Phase::Baseline
                    };
                    let sd = config.noise_sd
                        * if in_intervention {
                            config.intervention_noise_scale
                        } else {
                            1.0
                        };
                    let innovation = sd
                        * (1.0 - config.ar1 * config.ar1).sqrt()
                        * std_normal.sample(&mut rng);
                    let noise = if t == 0 {
                        sd * std_normal.sample(&mut rng)
                    } else {
                        config.ar1 * prev_noise + innovation
                    };
                    prev_noise = noise;

                    let level = if in_intervention { 1.0 } else { 0.0 };
                    let trend_b = if in_intervention {
                        (t - config.baseline_sessions) as f64
                    } else {
                        0.0
                    };
                    let mut covariates = HashMap::new();
                    covariates.insert("level_AB".to_string(), level);
                    covariates.insert("level_copy".to_string(), level);
                    covariates
                        .insert("trend_A".to_string(), t as f64 - config.baseline_sessions as f64);
                    covariates.insert("trend_B".to_string(), trend_b);
                    covariates.insert("mod_x_level".to_string(), moderator * level);
                    covariates
                        .insert("complexity_x_level".to_string(), (c % 2) as f64 * level);

                    rows.push(Observation {
                        study: format!("study_{s}"),
                        cluster: format!("cluster_{c}"),
                        case: format!("case_{k}"),
                        session: t,
                        outcome: config.grand_mean
                            + u_study
                            + u_cluster
                            + u_case
                            + config.effect * level
                            + noise,
                        phase,
                        covariates,
                    });
                }
            }
        }
    }

    HierarchicalDataset::from_observations(rows).unwrap()
}
