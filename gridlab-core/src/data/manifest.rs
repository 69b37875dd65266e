//! Manifest discovery over a provider's release index.
//!
//! For a dataset, discovery looks up the release named by its provider tag,
//! runs every asset name through the dataset's filename extractors and keeps
//! the matches as [`ManifestEntry`]s. The raw release listing is memoized
//! per tag (datasets may share a tag); the extracted manifest is memoized per
//! dataset. Both live for the process lifetime.
//!
//! Discovery never fails: an unreachable, missing or truncated listing yields
//! an empty manifest with `error` set, and callers fall back to static URLs.

use super::cache::ResultCache;
use super::provider::{season_label, DataError};
use super::registry::DatasetSpec;
use super::transport::{RequestOptions, RetryingTransport};
use crate::config::ListingConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// One downloadable asset recognised for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `None` for an unsegmented aggregate file.
    pub season: Option<i32>,
    pub url: String,
    pub name: String,
    pub size: u64,
    pub updated_at: DateTime<Utc>,
    pub content_type: String,
}

impl ManifestEntry {
    pub fn is_compressed(&self) -> bool {
        self.name.ends_with(".gz")
    }
}

/// Discovered index of a dataset's files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub dataset: String,
    pub tag: String,
    /// Sorted by (season, name); no duplicate (season, name) pairs.
    pub entries: Vec<ManifestEntry>,
    pub discovered_at: DateTime<Utc>,
    /// Listing URL the entries came from.
    pub source: String,
    pub error: Option<String>,
}

impl Manifest {
    /// Build from unordered entries, enforcing ordering and uniqueness.
    pub fn new(dataset: &str, tag: &str, source: &str, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| (a.season, &a.name).cmp(&(b.season, &b.name)));
        entries.dedup_by(|a, b| a.season == b.season && a.name == b.name);
        Self {
            dataset: dataset.to_string(),
            tag: tag.to_string(),
            entries,
            discovered_at: Utc::now(),
            source: source.to_string(),
            error: None,
        }
    }

    pub fn unavailable(dataset: &str, tag: &str, source: &str, error: &DataError) -> Self {
        Self {
            dataset: dataset.to_string(),
            tag: tag.to_string(),
            entries: Vec::new(),
            discovered_at: Utc::now(),
            source: source.to_string(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.entries.is_empty()
    }

    /// Entries for a season; every entry for the ALL key.
    pub fn for_season(&self, season: Option<i32>) -> Vec<&ManifestEntry> {
        match season {
            Some(_) => self.entries.iter().filter(|e| e.season == season).collect(),
            None => self.entries.iter().collect(),
        }
    }

    /// Highest-season entry.
    pub fn latest(&self) -> Option<&ManifestEntry> {
        self.entries.last()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    content_type: Option<String>,
}

/// Outcome of looking up one release tag. Failures are kept as values so
/// they are memoized like successes.
#[derive(Debug)]
struct ReleaseLookup {
    source: String,
    outcome: Result<Release, DataError>,
}

/// Release-index client with per-tag and per-dataset memoization.
#[derive(Clone)]
pub struct ManifestDiscovery {
    transport: RetryingTransport,
    listing: ListingConfig,
    releases: ResultCache<String, ReleaseLookup>,
    manifests: ResultCache<String, Manifest>,
}

impl ManifestDiscovery {
    pub fn new(transport: RetryingTransport, listing: ListingConfig) -> Self {
        Self {
            transport,
            listing,
            releases: ResultCache::new("releases"),
            manifests: ResultCache::new("manifests"),
        }
    }

    /// Manifest for a dataset, discovered at most once per process.
    pub async fn discover(&self, spec: &DatasetSpec) -> Arc<Manifest> {
        let this = self.clone();
        let spec_owned = spec.clone();
        let loaded = self
            .manifests
            .get_or_load(spec.name.clone(), move || async move {
                Ok(this.build_manifest(&spec_owned).await)
            })
            .await;
        match loaded {
            Ok(manifest) => manifest,
            // The loader above is infallible.
            Err(e) => Arc::new(Manifest::unavailable(
                &spec.name,
                &spec.provider_tag,
                &self.tag_url(&spec.provider_tag),
                &e,
            )),
        }
    }

    /// Number of distinct tags looked up so far.
    pub fn tags_discovered(&self) -> usize {
        self.releases.len()
    }

    async fn build_manifest(&self, spec: &DatasetSpec) -> Manifest {
        let lookup = self.release(&spec.provider_tag).await;
        let release = match &lookup.outcome {
            Ok(release) => release,
            Err(e) => {
                warn!(dataset = %spec.name, tag = %spec.provider_tag, error = %e, "manifest unavailable");
                return Manifest::unavailable(&spec.name, &spec.provider_tag, &lookup.source, e);
            }
        };

        let entries: Vec<ManifestEntry> = release
            .assets
            .iter()
            .filter_map(|asset| {
                let season = spec.match_asset(&asset.name)?;
                Some(ManifestEntry {
                    season,
                    url: asset.browser_download_url.clone(),
                    name: asset.name.clone(),
                    size: asset.size,
                    updated_at: asset.updated_at,
                    content_type: asset
                        .content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                })
            })
            .collect();

        let manifest = Manifest::new(&spec.name, &spec.provider_tag, &lookup.source, entries);
        info!(
            dataset = %spec.name,
            tag = %spec.provider_tag,
            assets = release.assets.len(),
            entries = manifest.entries.len(),
            latest = %season_label(manifest.latest().and_then(|e| e.season)),
            "manifest discovered"
        );
        manifest
    }

    async fn release(&self, tag: &str) -> Arc<ReleaseLookup> {
        let this = self.clone();
        let tag_owned = tag.to_string();
        let loaded = self
            .releases
            .get_or_load(tag.to_string(), move || async move {
                let source = this.tag_url(&tag_owned);
                let outcome = this.fetch_release(&tag_owned).await;
                Ok(ReleaseLookup { source, outcome })
            })
            .await;
        loaded.unwrap_or_else(|e| {
            Arc::new(ReleaseLookup {
                source: self.tag_url(tag),
                outcome: Err(e),
            })
        })
    }

    fn tag_url(&self, tag: &str) -> String {
        format!(
            "{}/repos/{}/releases/tags/{tag}",
            self.listing.api_base.trim_end_matches('/'),
            self.listing.repository
        )
    }

    fn list_url(&self) -> String {
        format!(
            "{}/repos/{}/releases?per_page=100",
            self.listing.api_base.trim_end_matches('/'),
            self.listing.repository
        )
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions::default()
            .with_bearer(self.listing.bearer_token.clone())
            .with_header("Accept", "application/vnd.github+json")
    }

    async fn fetch_release(&self, tag: &str) -> Result<Release, DataError> {
        let opts = self.request_options();
        let url = self.tag_url(tag);
        let release = match self.transport.fetch_json(&url, &opts).await {
            Ok(json) => parse_json::<Release>(&url, json)?,
            Err(e) if e.is_not_found() => {
                // Some releases are only reachable by display name.
                let list_url = self.list_url();
                let json = self.transport.fetch_json(&list_url, &opts).await?;
                let releases = parse_json::<Vec<Release>>(&list_url, json)?;
                releases
                    .into_iter()
                    .find(|r| r.tag_name == tag || r.name.as_deref() == Some(tag))
                    .ok_or_else(|| DataError::ManifestUnavailable {
                        tag: tag.to_string(),
                        reason: "no release with this tag or name".into(),
                    })?
            }
            Err(e) => return Err(e),
        };

        if release.assets.len() >= self.listing.asset_limit {
            return Err(DataError::ManifestUnavailable {
                tag: tag.to_string(),
                reason: format!(
                    "asset listing truncated at {} entries",
                    release.assets.len()
                ),
            });
        }
        Ok(release)
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(url: &str, json: serde_json::Value) -> Result<T, DataError> {
    serde_json::from_value(json).map_err(|e| DataError::Parse {
        url: url.to_string(),
        reason: format!("unexpected release listing shape: {e}"),
    })
}
