//! Source selection: which URL to fetch for a (dataset, season).
//!
//! Candidates are produced in preference order:
//!
//! 1. **Manifest**: the entry for the requested season with the most recent
//!    `updated_at`. On a timestamp tie the `.gz` asset wins. That tie-break
//!    assumes the publisher uploads the compressed and plain variants
//!    together and the compressed one is authoritative; it is a publishing
//!    convention, not something the listing guarantees.
//! 2. **ManifestLatest**: with no season match, the manifest's last entry
//!    (typically an aggregate file covering every season).
//! 3. **Static**: the dataset's URL template. Always last. It is the only
//!    candidate when the manifest is empty or unavailable.
//!
//! The [`StalenessPolicy`] judges decoded schedule rows against the season
//! clock; the service uses it to swap a lagging snapshot for the live feed.

use super::combinators::first_present;
use super::manifest::{Manifest, ManifestDiscovery, ManifestEntry};
use super::provider::{season_label, DataError, ResolvedSource, Row, SourceOrigin};
use super::registry::DatasetSpec;
use crate::config::SeasonConfig;
use std::sync::Arc;
use tracing::debug;

/// Builds candidate chains from discovered manifests.
#[derive(Clone)]
pub struct SourceResolver {
    discovery: ManifestDiscovery,
}

impl SourceResolver {
    pub fn new(discovery: ManifestDiscovery) -> Self {
        Self { discovery }
    }

    pub async fn manifest(&self, spec: &DatasetSpec) -> Arc<Manifest> {
        self.discovery.discover(spec).await
    }

    /// Ordered, URL-distinct candidates for `season`.
    pub async fn candidates(&self, spec: &DatasetSpec, season: Option<i32>) -> Vec<ResolvedSource> {
        let manifest = self.manifest(spec).await;
        let chain = candidate_chain(spec, &manifest, season);
        debug!(
            dataset = %spec.name,
            season = %season_label(season),
            candidates = chain.len(),
            "resolved candidates"
        );
        chain
    }

    /// Head of the candidate chain.
    pub async fn resolve(&self, spec: &DatasetSpec, season: Option<i32>) -> Result<ResolvedSource, DataError> {
        self.candidates(spec, season)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| DataError::NoSource {
                dataset: spec.name.clone(),
                season: season_label(season),
            })
    }

    /// The live endpoint, bypassing the manifest.
    pub fn live(&self, spec: &DatasetSpec, season: Option<i32>) -> Option<ResolvedSource> {
        static_source(spec, season)
    }
}

/// Candidate chain for an already-discovered manifest.
pub fn candidate_chain(spec: &DatasetSpec, manifest: &Manifest, season: Option<i32>) -> Vec<ResolvedSource> {
    let mut chain = Vec::with_capacity(2);

    let matches = manifest.for_season(season);
    if let Some(entry) = select_entry(&matches) {
        chain.push(from_entry(entry, SourceOrigin::Manifest));
    } else if let Some(entry) = manifest.latest() {
        chain.push(from_entry(entry, SourceOrigin::ManifestLatest));
    }

    if let Some(fallback) = static_source(spec, season) {
        if chain.iter().all(|c| c.url != fallback.url) {
            chain.push(fallback);
        }
    }
    chain
}

/// Most recently updated entry; `.gz` wins a timestamp tie.
pub fn select_entry<'a>(entries: &[&'a ManifestEntry]) -> Option<&'a ManifestEntry> {
    entries
        .iter()
        .copied()
        .max_by_key(|e| (e.updated_at, e.is_compressed()))
}

fn from_entry(entry: &ManifestEntry, origin: SourceOrigin) -> ResolvedSource {
    ResolvedSource {
        url: entry.url.clone(),
        name: entry.name.clone(),
        season: entry.season,
        origin,
    }
}

/// A template without a season placeholder serves an aggregate file.
fn static_source(spec: &DatasetSpec, season: Option<i32>) -> Option<ResolvedSource> {
    let url = spec.static_url(season)?;
    let name = url.rsplit('/').next().unwrap_or(&url).to_string();
    Some(ResolvedSource {
        url,
        name,
        season: season.filter(|_| spec.url_template.contains("{season}")),
        origin: SourceOrigin::Static,
    })
}

/// Verdict on a decoded schedule candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Empty,
    /// Finalized games stop short of the expected week.
    Stale { max_completed_week: Option<u32> },
}

/// Detects manifest snapshots lagging behind completed games.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    expected_completed_week: u32,
}

impl StalenessPolicy {
    pub fn new(expected_completed_week: u32) -> Self {
        Self {
            expected_completed_week,
        }
    }

    pub fn from_season(season: &SeasonConfig) -> Self {
        Self::new(season.expected_completed_week())
    }

    pub fn expected_completed_week(&self) -> u32 {
        self.expected_completed_week
    }

    /// Highest week with both scores recorded.
    pub fn max_completed_week(rows: &[Row]) -> Option<u32> {
        rows.iter()
            .filter(|row| {
                let home = first_present(row, &["home_score"]);
                let away = first_present(row, &["away_score"]);
                home.is_some() && away.is_some()
            })
            .filter_map(|row| first_present(row, &["week"]).and_then(|w| w.as_i64()))
            .filter_map(|w| u32::try_from(w).ok())
            .max()
    }

    /// Only manifest-sourced rows can be stale; the live feed is authoritative.
    pub fn assess(&self, rows: &[Row], origin: SourceOrigin) -> Freshness {
        if rows.is_empty() {
            return Freshness::Empty;
        }
        if !origin.is_manifest() {
            return Freshness::Fresh;
        }
        let max_completed_week = Self::max_completed_week(rows);
        if max_completed_week.unwrap_or(0) < self.expected_completed_week {
            Freshness::Stale { max_completed_week }
        } else {
            Freshness::Fresh
        }
    }
}
