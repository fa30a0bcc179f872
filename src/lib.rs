//! Utilities to schedule PMU events onto hardware counters and compute metrics from their values.
//!
//! A [`pmu::loader::Session`] is built once from the platform's event catalogs and metric
//! library. Its counter groups are handed to the collector, and every collected
//! [`pmu::EventFrame`] is turned into a [`pmu::MetricFrame`].

#![deny(missing_docs, missing_debug_implementations)]

mod errors;
pub use errors::{Error, Result};

pub mod config;
pub mod metadata;
pub mod pmu;
