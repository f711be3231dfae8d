#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Internal-external cross-validation (IECV) of penalized Cox risk models.
//!
//! A cohort spread over several clusters (regions, practices, hospitals) is
//! validated by holding out one cluster at a time: each fold imputes, encodes
//! and fits on the remaining clusters only, then reports discrimination,
//! calibration, Brier score and decision-curve net benefit on the held-out
//! cluster. A final model is fitted on every subject for deployment.

pub mod config;
pub mod data;
pub mod decision;
pub mod encoder;
pub mod error;
pub mod impute;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod projector;
pub mod records;
pub mod report;
pub mod survival;
pub mod trainer;

pub use config::IecvConfig;
pub use error::IecvError;
pub use orchestrator::{IecvReport, run_iecv};
