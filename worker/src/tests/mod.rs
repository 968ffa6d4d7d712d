//! Test modules for the worker crate

mod metrics_tests;
mod registry_tests;
mod transport_tests;
