//! GridLab Core: tiered acquisition of tabular sports statistics.
//!
//! This crate contains the data plane consumed by feature and query layers:
//! - Dataset registry with declarative filename extractors
//! - Release-index manifest discovery and source resolution
//! - Retrying, concurrency-governed HTTP transport
//! - Batch and streaming CSV decoding with BLAKE3 checksums
//! - Single-flight result caching with FIFO bounds
//! - Secondary-provider fallback with endpoint probing
//!
//! [`data::AcquisitionService`] wires these together behind
//! `load_dataset` and `load_merged_by_key`.

pub mod config;
pub mod data;

pub use config::AcquisitionConfig;
pub use data::{AcquisitionService, DataError, Dataset, Row, Value};
