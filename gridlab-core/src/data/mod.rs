//! Tiered data acquisition: discovery, resolution, transport, decoding and caching.

pub mod alternate;
pub mod cache;
pub mod combinators;
pub mod decoder;
pub mod governor;
pub mod manifest;
pub mod mock;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod sanity;
pub mod service;
pub mod transport;

pub use alternate::{AlternateHit, AlternateProvider, Sourced};
pub use cache::ResultCache;
pub use combinators::{first_non_empty, first_present};
pub use decoder::{decode, DecodedTable, StreamFilter, TableDecoder};
pub use governor::ConcurrencyGovernor;
pub use manifest::{Manifest, ManifestDiscovery, ManifestEntry};
pub use provider::{season_label, DataError, Dataset, ResolvedSource, Row, SourceOrigin, Value};
pub use registry::{DatasetClass, DatasetRegistry, DatasetSpec, DecodeMode};
pub use resolver::{Freshness, SourceResolver, StalenessPolicy};
pub use sanity::SanityPolicy;
pub use service::{merge_by_key, merge_key, AcquisitionService};
pub use transport::{HttpTransport, RequestOptions, RetryPolicy, RetryingTransport, Transport};
