//! Per-connection registries.

pub mod flows;

pub use flows::FlowRegistry;
