//! # Hierarchical Design Table
//!
//! In-memory representation of the cleaned, per-observation design table the
//! engine consumes. Rows are session-level observations nested case-within-
//! cluster-within-study. This module only models and validates that nesting;
//! raw file ingestion, dummy encoding, and time-centering are the job of an
//! upstream preprocessing step.
//!
//! Case identity is only unique within a cluster and cluster identity only
//! within a study, so grouping is done on composite keys throughout. Derived
//! covariates a case never has (e.g. maintenance-phase time for a case that
//! never reaches maintenance) are simply absent from the observation's
//! covariate map and materialize as 0 in the covariate matrix.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

/// Phase of a single-case design session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Baseline,
    Intervention,
    Maintenance,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Baseline => "baseline",
            Phase::Intervention => "intervention",
            Phase::Maintenance => "maintenance",
        }
    }
}

/// One session record, as produced by the external preprocessing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub study: String,
    pub cluster: String,
    pub case: String,
    /// Ordinal session index within the case; also the AR(1) time index.
    pub session: usize,
    pub outcome: f64,
    pub phase: Phase,
    /// Derived covariates by name (phase-relative time, level indicators,
    /// trend interactions, moderator dummies). Missing entries read as 0.
    pub covariates: HashMap<String, f64>,
}

/// A contiguous row range belonging to one grouping unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupBlock {
    pub id: String,
    /// Index of the parent unit one level up (study for clusters, cluster
    /// for cases). Studies have no parent and store `usize::MAX`.
    pub parent: usize,
    pub rows: Range<usize>,
}

/// Validation failures for the design table.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("The design table contains no observations.")]
    Empty,
    #[error(
        "Duplicate session {session} for case '{case}' (cluster '{cluster}', study '{study}')."
    )]
    DuplicateSession {
        study: String,
        cluster: String,
        case: String,
        session: usize,
    },
    #[error("Non-finite outcome at session {session} of case '{case}' (study '{study}').")]
    NonFiniteOutcome {
        study: String,
        case: String,
        session: usize,
    },
    #[error("Non-finite value for covariate '{name}' at session {session} of case '{case}'.")]
    NonFiniteCovariate {
        name: String,
        case: String,
        session: usize,
    },
}

/// The validated design table, sorted into contiguous study/cluster/case
/// blocks with flat column storage. Immutable once built; the four model
/// instantiations share one dataset by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalDataset {
    /// Outcome vector, one entry per observation.
    y: Array1<f64>,
    /// Session index per observation (AR(1) relative time).
    sessions: Vec<usize>,
    /// Phase label per observation.
    phases: Vec<Phase>,
    /// Covariate column names, in canonical (sorted) order.
    columns: Vec<String>,
    /// Covariate matrix, `n_obs x columns.len()`. Absent values are 0.
    values: Array2<f64>,
    studies: Vec<GroupBlock>,
    clusters: Vec<GroupBlock>,
    cases: Vec<GroupBlock>,
}

impl HierarchicalDataset {
    /// Builds the dataset from raw observations: validates values, sorts by
    /// composite key, and lays out contiguous grouping blocks.
    pub fn from_observations(mut obs: Vec<Observation>) -> Result<Self, DataError> {
        if obs.is_empty() {
            return Err(DataError::Empty);
        }
        for o in &obs {
            if !o.outcome.is_finite() {
                return Err(DataError::NonFiniteOutcome {
                    study: o.study.clone(),
                    case: o.case.clone(),
                    session: o.session,
                });
            }
            for (name, &v) in &o.covariates {
                if !v.is_finite() {
                    return Err(DataError::NonFiniteCovariate {
                        name: name.clone(),
                        case: o.case.clone(),
                        session: o.session,
                    });
                }
            }
        }

        obs.sort_by(|a, b| {
            (&a.study, &a.cluster, &a.case, a.session).cmp(&(
                &b.study,
                &b.cluster,
                &b.case,
                b.session,
            ))
        });
        for w in obs.windows(2) {
            let (a, b) = (&w[0], &w[1]);
            if a.study == b.study && a.cluster == b.cluster && a.case == b.case
                && a.session == b.session
            {
                return Err(DataError::DuplicateSession {
                    study: a.study.clone(),
                    cluster: a.cluster.clone(),
                    case: a.case.clone(),
                    session: a.session,
                });
            }
        }

        // Canonical column order: the sorted union of every covariate name.
        let mut columns: Vec<String> = obs
            .iter()
            .flat_map(|o| o.covariates.keys().cloned())
            .collect();
        columns.sort();
        columns.dedup();
        let col_index: HashMap<&str, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();

        let n = obs.len();
        let mut y = Array1::zeros(n);
        let mut values = Array2::zeros((n, columns.len()));
        let mut sessions = Vec::with_capacity(n);
        let mut phases = Vec::with_capacity(n);
        for (i, o) in obs.iter().enumerate() {
            y[i] = o.outcome;
            sessions.push(o.session);
            phases.push(o.phase);
            for (name, &v) in &o.covariates {
                values[[i, col_index[name.as_str()]]] = v;
            }
        }

        let mut studies: Vec<GroupBlock> = Vec::new();
        let mut clusters: Vec<GroupBlock> = Vec::new();
        let mut cases: Vec<GroupBlock> = Vec::new();
        for (i, o) in obs.iter().enumerate() {
            let new_study = studies.last().is_none_or(|s| s.id != o.study);
            if new_study {
                studies.push(GroupBlock {
                    id: o.study.clone(),
                    parent: usize::MAX,
                    rows: i..i,
                });
            }
            let study_idx = studies.len() - 1;
            let new_cluster = new_study
                || clusters
                    .last()
                    .is_none_or(|c| c.id != o.cluster || c.parent != study_idx);
            if new_cluster {
                clusters.push(GroupBlock {
                    id: o.cluster.clone(),
                    parent: study_idx,
                    rows: i..i,
                });
            }
            let cluster_idx = clusters.len() - 1;
            let new_case = new_cluster
                || cases
                    .last()
                    .is_none_or(|c| c.id != o.case || c.parent != cluster_idx);
            if new_case {
                cases.push(GroupBlock {
                    id: o.case.clone(),
                    parent: cluster_idx,
                    rows: i..i,
                });
            }
            studies[study_idx].rows.end = i + 1;
            clusters[cluster_idx].rows.end = i + 1;
            let case_idx = cases.len() - 1;
            cases[case_idx].rows.end = i + 1;
        }

        Ok(Self {
            y,
            sessions,
            phases,
            columns,
            values,
            studies,
            clusters,
            cases,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_studies(&self) -> usize {
        self.studies.len()
    }

    pub fn n_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn n_cases(&self) -> usize {
        self.cases.len()
    }

    pub fn outcome(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    pub fn sessions(&self) -> &[usize] {
        &self.sessions
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn studies(&self) -> &[GroupBlock] {
        &self.studies
    }

    pub fn clusters(&self) -> &[GroupBlock] {
        &self.clusters
    }

    pub fn cases(&self) -> &[GroupBlock] {
        &self.cases
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Covariate column by name; `None` when no observation carries it.
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.values.column(idx))
    }

    /// Phases that actually occur in the data, in canonical order.
    pub fn phases_present(&self) -> Vec<Phase> {
        let mut present: Vec<Phase> = self.phases.clone();
        present.sort();
        present.dedup();
        present
    }

    /// Counts of sessions per phase, for dataset summaries.
    pub fn phase_counts(&self) -> Vec<(Phase, usize)> {
        self.phases_present()
            .into_iter()
            .map(|p| (p, self.phases.iter().filter(|&&q| q == p).count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(study: &str, cluster: &str, case: &str, session: usize, y: f64) -> Observation {
        Observation {
            study: study.to_string(),
            cluster: cluster.to_string(),
            case: case.to_string(),
            session,
            outcome: y,
            phase: if session < 5 {
                Phase::Baseline
            } else {
                Phase::Intervention
            },
            covariates: HashMap::new(),
        }
    }

    #[test]
    fn grouping_uses_composite_keys() {
        // The same case id appears in two different clusters; they must be
        // distinct cases.
        let mut rows = Vec::new();
        for s in 0..10 {
            rows.push(obs("s1", "c1", "p1", s, s as f64));
            rows.push(obs("s1", "c2", "p1", s, s as f64));
        }
        let data = HierarchicalDataset::from_observations(rows).unwrap();
        assert_eq!(data.n_studies(), 1);
        assert_eq!(data.n_clusters(), 2);
        assert_eq!(data.n_cases(), 2);
        assert_eq!(data.n_obs(), 20);
        // Sessions 0..5 are baseline, 5..10 intervention, per case.
        assert_eq!(
            data.phase_counts(),
            vec![(Phase::Baseline, 10), (Phase::Intervention, 10)]
        );
    }

    #[test]
    fn missing_covariates_read_as_zero() {
        let mut a = obs("s1", "c1", "p1", 0, 1.0);
        a.covariates.insert("level_AB".to_string(), 1.0);
        let b = obs("s1", "c1", "p1", 1, 2.0);
        let data = HierarchicalDataset::from_observations(vec![a, b]).unwrap();
        let col = data.column("level_AB").unwrap();
        assert_eq!(col[0], 1.0);
        assert_eq!(col[1], 0.0);
    }

    #[test]
    fn duplicate_sessions_rejected() {
        let rows = vec![obs("s1", "c1", "p1", 0, 1.0), obs("s1", "c1", "p1", 0, 2.0)];
        let err = HierarchicalDataset::from_observations(rows).unwrap_err();
        assert!(matches!(err, DataError::DuplicateSession { .. }));
    }

    #[test]
    fn blocks_are_contiguous_and_nested() {
        let mut rows = Vec::new();
        for st in ["s1", "s2"] {
            for cl in ["c1", "c2"] {
                for ca in ["p1", "p2"] {
                    for s in 0..4 {
                        rows.push(obs(st, cl, ca, s, 0.0));
                    }
                }
            }
        }
        let data = HierarchicalDataset::from_observations(rows).unwrap();
        assert_eq!(data.n_studies(), 2);
        assert_eq!(data.n_clusters(), 4);
        assert_eq!(data.n_cases(), 8);
        for case in data.cases() {
            let cluster = &data.clusters()[case.parent];
            assert!(cluster.rows.start <= case.rows.start && case.rows.end <= cluster.rows.end);
            let study = &data.studies()[cluster.parent];
            assert!(study.rows.start <= cluster.rows.start && cluster.rows.end <= study.rows.end);
        }
    }
}
