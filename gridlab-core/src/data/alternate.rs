//! Secondary-provider fallback.
//!
//! When enabled for a season, a dataset is first sought from a JSON REST
//! provider. Its endpoints are probed in order until one returns a non-empty
//! array; if every bulk endpoint is empty, each configured entity (team) is
//! queried separately and the results concatenated. The outcome is memoized
//! for the process lifetime, including a [`AlternateMemo::NoData`] sentinel,
//! so a provider that had nothing is not asked again. Failures are not
//! memoized.

use super::cache::ResultCache;
use super::combinators::{first_non_empty, tolerate_all, Emptiness};
use super::provider::{season_label, DataError, Row, Value};
use super::registry::DatasetSpec;
use super::transport::{RequestOptions, RetryingTransport};
use crate::config::AlternateConfig;
use futures::future::join_all;
use std::future::Future;
use tracing::{debug, info, warn};

/// Rows obtained from the secondary provider.
#[derive(Debug, Clone, PartialEq)]
pub struct AlternateHit {
    /// Endpoint that produced the rows.
    pub url: String,
    pub rows: Vec<Row>,
}

impl Emptiness for AlternateHit {
    fn is_empty_result(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlternateMemo {
    Rows(AlternateHit),
    NoData,
}

/// Which path produced a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Sourced<T> {
    Alternate(AlternateHit),
    Primary(T),
}

#[derive(Clone)]
pub struct AlternateProvider {
    config: AlternateConfig,
    transport: RetryingTransport,
    memo: ResultCache<(String, Option<i32>), AlternateMemo>,
}

impl AlternateProvider {
    pub fn new(config: AlternateConfig, transport: RetryingTransport) -> Self {
        Self {
            config,
            transport,
            memo: ResultCache::new("alternate"),
        }
    }

    pub fn config(&self) -> &AlternateConfig {
        &self.config
    }

    /// Try `secondary` once per (dataset, season), falling through to `primary`.
    ///
    /// Rows and the empty outcome are memoized. A failing secondary is never
    /// surfaced and not memoized either, so the next call asks again.
    /// Errors from `primary` propagate unchanged.
    pub async fn with_fallback<T, P, PFut, S, SFut>(
        &self,
        dataset: &str,
        season: Option<i32>,
        primary: P,
        secondary: S,
    ) -> Result<Sourced<T>, DataError>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, DataError>>,
        S: FnOnce() -> SFut,
        SFut: Future<Output = Result<AlternateHit, DataError>> + Send + 'static,
    {
        if !self.config.allows(season) {
            return primary().await.map(Sourced::Primary);
        }

        let name = dataset.to_string();
        let memo = self
            .memo
            .get_or_load((dataset.to_string(), season), move || {
                let attempt = secondary();
                async move {
                    let label = season_label(season);
                    let hit = attempt.await?;
                    if hit.rows.is_empty() {
                        info!(dataset = %name, season = %label, "alternate provider returned no rows");
                        Ok::<_, DataError>(AlternateMemo::NoData)
                    } else {
                        info!(dataset = %name, season = %label, rows = hit.rows.len(), url = %hit.url, "alternate provider hit");
                        Ok(AlternateMemo::Rows(hit))
                    }
                }
            })
            .await;

        match memo.as_deref() {
            Ok(AlternateMemo::Rows(hit)) => Ok(Sourced::Alternate(hit.clone())),
            Ok(AlternateMemo::NoData) => {
                debug!(dataset, season = %season_label(season), "alternate memo is NoData; using primary");
                primary().await.map(Sourced::Primary)
            }
            Err(e) => {
                warn!(dataset, season = %season_label(season), error = %e, "alternate provider failed; using primary");
                primary().await.map(Sourced::Primary)
            }
        }
    }

    /// Query the configured endpoints for a dataset.
    pub async fn fetch_dataset(&self, spec: &DatasetSpec, season: Option<i32>) -> Result<AlternateHit, DataError> {
        let season_text = season.map(|s| s.to_string()).unwrap_or_default();
        let Some(alternate) = &spec.alternate else {
            return Ok(AlternateHit {
                url: self.config.base_url.clone(),
                rows: Vec::new(),
            });
        };

        let urls: Vec<String> = alternate
            .candidates
            .iter()
            .map(|template| self.endpoint(template, &season_text, ""))
            .collect();
        if let Some(hit) = self.probe_candidates(&urls).await? {
            return Ok(hit);
        }

        match &alternate.per_entity {
            Some(template) if !self.config.entities.is_empty() => {
                Ok(self.per_entity(template, &season_text).await)
            }
            _ => Ok(AlternateHit {
                url: urls.last().cloned().unwrap_or_default(),
                rows: Vec::new(),
            }),
        }
    }

    /// First candidate yielding a non-empty array; later candidates are not requested.
    pub async fn probe_candidates(&self, urls: &[String]) -> Result<Option<AlternateHit>, DataError> {
        let requests: Vec<_> = urls.iter().map(|url| self.fetch_rows(url)).collect();
        first_non_empty(requests, tolerate_all).await
    }

    async fn per_entity(&self, template: &str, season: &str) -> AlternateHit {
        let requests = self.config.entities.iter().map(|entity| {
            let url = self.endpoint(template, season, entity);
            async move {
                match self.fetch_rows(&url).await {
                    Ok(hit) => hit.rows,
                    Err(e) => {
                        warn!(entity = %entity, url = %url, error = %e, "alternate entity request failed");
                        Vec::new()
                    }
                }
            }
        });
        let rows = join_all(requests).await.into_iter().flatten().collect();
        AlternateHit {
            url: self.endpoint(template, season, "{entity}"),
            rows,
        }
    }

    async fn fetch_rows(&self, url: &str) -> Result<AlternateHit, DataError> {
        let json = self.transport.fetch_json(url, &self.request_options()).await?;
        let rows = first_array(&json)
            .map(|items| items.iter().filter_map(flatten_record).collect())
            .unwrap_or_default();
        Ok(AlternateHit {
            url: url.to_string(),
            rows,
        })
    }

    fn endpoint(&self, template: &str, season: &str, entity: &str) -> String {
        let path = template.replace("{season}", season).replace("{entity}", entity);
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request_options(&self) -> RequestOptions {
        let opts = RequestOptions::default().with_timeout(self.config.timeout());
        match &self.config.api_key {
            Some(key) => opts.with_header(self.config.api_key_header.clone(), key.clone()),
            None => opts,
        }
    }
}

/// Depth-first search for the first array, visiting object members in
/// document order.
pub fn first_array(value: &serde_json::Value) -> Option<&Vec<serde_json::Value>> {
    match value {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(map) => map.values().find_map(first_array),
        _ => None,
    }
}

/// Flatten one array element into a row of scalars.
///
/// Nested objects become dotted column names; nested arrays are dropped.
/// A bare scalar becomes a single `value` column; `null` yields no row.
pub fn flatten_record(value: &serde_json::Value) -> Option<Row> {
    match value {
        serde_json::Value::Object(map) => {
            let mut row = Row::new();
            flatten_into(&mut row, "", map);
            Some(row)
        }
        serde_json::Value::Null | serde_json::Value::Array(_) => None,
        scalar => Value::from_json(scalar).map(|v| Row::from([("value".to_string(), v)])),
    }
}

fn flatten_into(row: &mut Row, prefix: &str, map: &serde_json::Map<String, serde_json::Value>) {
    for (key, value) in map {
        let column = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            serde_json::Value::Object(inner) => flatten_into(row, &column, inner),
            serde_json::Value::Array(_) => {}
            scalar => {
                if let Some(v) = Value::from_json(scalar) {
                    row.insert(column, v);
                }
            }
        }
    }
}
