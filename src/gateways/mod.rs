//! Gateway implementations - pluggable provider adapters

pub mod simulated;

pub use simulated::SimulatedGateway;

/// Kind name the simulated gateway registers under
pub const SIMULATED_KIND: &str = "simulated";
