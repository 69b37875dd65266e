//! The acquisition service: one constructed object owning every cache and
//! wiring the pipeline.
//!
//! A `load_dataset(name, season)` call either joins the cached (ready or
//! in-flight) result for that key or runs:
//!
//! 1. the alternate provider, when enabled for the season;
//! 2. the resolver's candidate chain, first non-empty candidate wins,
//!    NotFound moves on to the next;
//! 3. fetch and decode (batch or streaming per dataset);
//! 4. for schedules, the staleness policy, which may swap in the live feed;
//! 5. the sanity gate.
//!
//! Failures are returned to every waiter and never cached.

use super::alternate::{AlternateProvider, Sourced};
use super::cache::ResultCache;
use super::combinators::{first_non_empty, first_present, tolerate_not_found};
use super::decoder::{DecodedTable, StreamFilter, TableDecoder};
use super::governor::ConcurrencyGovernor;
use super::manifest::{Manifest, ManifestDiscovery};
use super::provider::{season_label, DataError, Dataset, ResolvedSource, Row, SourceOrigin};
use super::registry::{DatasetClass, DatasetRegistry, DatasetSpec, DecodeMode};
use super::resolver::{Freshness, SourceResolver, StalenessPolicy};
use super::sanity::SanityPolicy;
use super::transport::{RetryingTransport, Transport};
use crate::config::{AcquisitionConfig, SeasonConfig};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Column synonyms for the team component of a merge key, in preference order.
pub const TEAM_COLUMNS: &[&str] = &["team", "team_abbr", "recent_team", "posteam"];

/// Per-dataset result cache keyed by season (`None` = ALL).
pub type DatasetCache = ResultCache<Option<i32>, Dataset>;

/// Everything a load needs, cheap to clone into a cached future.
#[derive(Clone)]
struct Pipeline {
    resolver: SourceResolver,
    decoder: TableDecoder,
    staleness: StalenessPolicy,
    season: SeasonConfig,
    sanity: SanityPolicy,
    alternate: AlternateProvider,
}

impl Pipeline {
    async fn load(&self, spec: &DatasetSpec, season: Option<i32>) -> Result<Dataset, DataError> {
        let secondary = {
            let alternate = self.alternate.clone();
            let spec = spec.clone();
            move || async move { alternate.fetch_dataset(&spec, season).await }
        };

        let dataset = match self
            .alternate
            .with_fallback(&spec.name, season, || self.load_primary(spec, season), secondary)
            .await?
        {
            Sourced::Primary(dataset) => dataset,
            Sourced::Alternate(hit) => Dataset {
                name: spec.name.clone(),
                season,
                checksum: rows_checksum(&hit.url, &hit.rows)?,
                source: ResolvedSource {
                    url: hit.url,
                    name: spec.name.clone(),
                    season,
                    origin: SourceOrigin::Alternate,
                },
                rows: hit.rows,
            },
        };

        self.sanity.check(spec, season, dataset.len())?;
        info!(
            dataset = %spec.name,
            season = %season_label(season),
            rows = dataset.len(),
            origin = ?dataset.source.origin,
            url = %dataset.source.url,
            "dataset loaded"
        );
        Ok(dataset)
    }

    async fn load_primary(&self, spec: &DatasetSpec, season: Option<i32>) -> Result<Dataset, DataError> {
        let candidates = self.resolver.candidates(spec, season).await;
        let found = first_non_empty(
            candidates
                .into_iter()
                .map(|source| self.fetch_candidate(spec, season, source)),
            tolerate_not_found,
        )
        .await?;

        let dataset = found.ok_or_else(|| DataError::NoSource {
            dataset: spec.name.clone(),
            season: season_label(season),
        })?;

        if spec.class == DatasetClass::Schedule && self.season.is_current(season) {
            return Ok(self.enforce_freshness(spec, season, dataset).await);
        }
        Ok(dataset)
    }

    /// Replace a lagging manifest snapshot with the live feed when the live
    /// feed has rows; otherwise keep the snapshot.
    async fn enforce_freshness(&self, spec: &DatasetSpec, season: Option<i32>, dataset: Dataset) -> Dataset {
        let Freshness::Stale { max_completed_week } = self.staleness.assess(&dataset.rows, dataset.source.origin)
        else {
            return dataset;
        };
        warn!(
            dataset = %spec.name,
            season = %season_label(season),
            max_completed_week = ?max_completed_week,
            expected = self.staleness.expected_completed_week(),
            url = %dataset.source.url,
            "stale snapshot; trying live feed"
        );

        let Some(live) = self.resolver.live(spec, season) else {
            return dataset;
        };
        if live.url == dataset.source.url {
            return dataset;
        }
        match self.fetch_candidate(spec, season, live).await {
            Ok(fresh) if !fresh.is_empty() => {
                info!(dataset = %spec.name, rows = fresh.len(), url = %fresh.source.url, "adopted live feed");
                fresh
            }
            Ok(_) => {
                warn!(dataset = %spec.name, "live feed empty; keeping snapshot");
                dataset
            }
            Err(e) => {
                warn!(dataset = %spec.name, error = %e, "live feed failed; keeping snapshot");
                dataset
            }
        }
    }

    async fn fetch_candidate(
        &self,
        spec: &DatasetSpec,
        season: Option<i32>,
        source: ResolvedSource,
    ) -> Result<Dataset, DataError> {
        // Files already segmented by the requested season need no row filter.
        let filter_season = season.filter(|_| source.season != season);

        let table = match &spec.decode {
            DecodeMode::Batch => {
                let table = self.decoder.fetch_and_decode(&source.url).await?;
                match filter_season {
                    Some(_) => DecodedTable {
                        rows: StreamFilter::season(spec.season_column.clone(), filter_season).apply(table.rows),
                        checksum: table.checksum,
                    },
                    None => table,
                }
            }
            DecodeMode::Streaming { columns } => {
                let filter = StreamFilter {
                    season_column: spec.season_column.clone(),
                    season: filter_season,
                    columns: columns.clone(),
                };
                self.decoder.decode_streaming(&source.url, filter).await?
            }
        };

        info!(
            dataset = %spec.name,
            season = %season_label(season),
            url = %source.url,
            origin = ?source.origin,
            rows = table.rows.len(),
            "candidate decoded"
        );
        Ok(Dataset {
            name: spec.name.clone(),
            season,
            rows: table.rows,
            checksum: table.checksum,
            source,
        })
    }
}

fn rows_checksum(url: &str, rows: &[Row]) -> Result<String, DataError> {
    let bytes = serde_json::to_vec(rows).map_err(|e| DataError::Parse {
        url: url.to_string(),
        reason: format!("cannot fingerprint rows: {e}"),
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Loads, validates and caches datasets.
pub struct AcquisitionService {
    registry: Arc<DatasetRegistry>,
    governor: ConcurrencyGovernor,
    pipeline: Pipeline,
    caches: HashMap<String, DatasetCache>,
}

impl AcquisitionService {
    /// Service over the built-in dataset table.
    pub fn new(config: AcquisitionConfig, transport: Arc<dyn Transport>) -> Result<Self, DataError> {
        Self::with_registry(config, transport, DatasetRegistry::builtin()?)
    }

    pub fn with_registry(
        config: AcquisitionConfig,
        transport: Arc<dyn Transport>,
        registry: DatasetRegistry,
    ) -> Result<Self, DataError> {
        config.validate()?;

        let governor = ConcurrencyGovernor::new(config.max_in_flight);
        let transport = RetryingTransport::new(transport, config.retry.clone(), governor.clone());
        let pipeline = Pipeline {
            resolver: SourceResolver::new(ManifestDiscovery::new(transport.clone(), config.listing.clone())),
            decoder: TableDecoder::new(transport.clone()),
            staleness: StalenessPolicy::from_season(&config.season),
            season: config.season.clone(),
            sanity: SanityPolicy::new(config.season.clone(), &config.sanity),
            alternate: AlternateProvider::new(config.alternate.clone(), transport),
        };

        let caches: HashMap<String, DatasetCache> = registry
            .specs()
            .map(|spec| {
                let cap = config.cache_caps.get(&spec.name).copied().or(spec.cache_cap);
                (spec.name.clone(), ResultCache::with_cap(spec.name.clone(), cap))
            })
            .collect();

        info!(
            datasets = caches.len(),
            max_in_flight = config.max_in_flight,
            current_season = config.season.current_season,
            expected_completed_week = config.season.expected_completed_week(),
            alternate = config.alternate.enabled,
            "acquisition service ready"
        );

        Ok(Self {
            registry: Arc::new(registry),
            governor,
            pipeline,
            caches,
        })
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn cache(&self, name: &str) -> Result<&DatasetCache, DataError> {
        self.caches
            .get(name)
            .ok_or_else(|| DataError::UnknownDataset(name.to_string()))
    }

    /// Discovered manifest for a dataset.
    pub async fn manifest(&self, name: &str) -> Result<Arc<Manifest>, DataError> {
        let spec = self.registry.get(name)?;
        Ok(self.pipeline.resolver.manifest(spec).await)
    }

    /// Candidate chain the next uncached load would try.
    pub async fn candidates(&self, name: &str, season: Option<i32>) -> Result<Vec<ResolvedSource>, DataError> {
        let spec = self.registry.get(name)?;
        Ok(self.pipeline.resolver.candidates(spec, season).await)
    }

    /// Rows for one (dataset, season). Concurrent calls for the same key share one load.
    pub async fn load_dataset(&self, name: &str, season: Option<i32>) -> Result<Arc<Dataset>, DataError> {
        let spec = self.registry.get(name)?.clone();
        let cache = self.cache(name)?;
        let pipeline = self.pipeline.clone();
        cache
            .get_or_load(season, move || async move { pipeline.load(&spec, season).await })
            .await
    }

    /// Load every member of a merge group concurrently and join rows on
    /// `season|week|team`. A plain dataset name is a group of one.
    pub async fn load_merged_by_key(&self, group: &str, season: Option<i32>) -> Result<BTreeMap<String, Row>, DataError> {
        let members: Vec<String> = match self.registry.merge_group(group) {
            Ok(members) => members.to_vec(),
            Err(e) => match self.registry.get(group) {
                Ok(_) => vec![group.to_string()],
                Err(_) => return Err(e),
            },
        };

        let datasets = try_join_all(members.iter().map(|name| self.load_dataset(name, season))).await?;
        let merged = merge_by_key(&datasets);
        info!(group, season = %season_label(season), datasets = datasets.len(), keys = merged.len(), "merged datasets");
        Ok(merged)
    }
}

/// `season|week|team` for a row, if all three parts are present.
pub fn merge_key(row: &Row) -> Option<String> {
    let season = first_present(row, &["season"])?;
    let week = first_present(row, &["week"])?;
    let team = first_present(row, TEAM_COLUMNS)?;
    Some(format!("{season}|{week}|{team}"))
}

/// Join rows by [`merge_key`]. On a column present in several datasets the
/// earliest non-null value wins; rows without a complete key are skipped.
pub fn merge_by_key(datasets: &[Arc<Dataset>]) -> BTreeMap<String, Row> {
    let mut merged: BTreeMap<String, Row> = BTreeMap::new();
    for dataset in datasets {
        for row in &dataset.rows {
            let Some(key) = merge_key(row) else {
                continue;
            };
            let target = merged.entry(key).or_default();
            for (column, value) in row {
                match target.get(column) {
                    Some(existing) if !existing.is_null() => {}
                    _ => {
                        target.insert(column.clone(), value.clone());
                    }
                }
            }
        }
    }
    merged
}
