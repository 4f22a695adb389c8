#![deny(dead_code)]
#![deny(unused_imports)]

//! # scdmeta
//!
//! A statistical estimation engine for meta-analyzing single-case
//! experimental design studies via four-level hierarchical linear
//! mixed-effects models (sessions within cases within clusters within
//! studies).
//!
//! The pipeline: a [`data::HierarchicalDataset`] plus a
//! [`model::ModelSpecification`] go through [`estimate::fit`] (REML with an
//! unconstrained variance parameterization and a BFGS inner loop) to a
//! [`model::ModelFit`]; from the fit, [`variance`] derives natural-scale
//! variance components with delta-method standard errors, [`robust`] and
//! [`wald`] derive cluster-robust fixed-effect inference, and [`icc`] and
//! [`diagnostics`] derive descriptive decompositions. The engine consumes
//! an already-cleaned design table and returns structured numeric results;
//! it does no I/O and renders nothing.

pub mod data;
pub mod diagnostics;
pub mod estimate;
pub mod icc;
pub mod model;
pub mod params;
pub mod robust;
pub mod variance;
pub mod wald;

#[cfg(test)]
pub(crate) mod testutil;
