//! Serializable acquisition configuration.
//!
//! Loaded from TOML with every field defaulted, then overlaid with
//! environment variables:
//! - `GITHUB_TOKEN`: bearer credential for release listings
//! - `GRIDLAB_EXPECTED_COMPLETED_WEEK`: staleness threshold override
//! - `GRIDLAB_ALTERNATE`: enable the secondary provider (`1`/`true`/`yes`)
//! - `GRIDLAB_ALTERNATE_KEY`: secondary provider API key

use crate::data::provider::DataError;
use crate::data::transport::RetryPolicy;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const ENV_BEARER_TOKEN: &str = "GITHUB_TOKEN";
pub const ENV_EXPECTED_COMPLETED_WEEK: &str = "GRIDLAB_EXPECTED_COMPLETED_WEEK";
pub const ENV_ALTERNATE: &str = "GRIDLAB_ALTERNATE";
pub const ENV_ALTERNATE_KEY: &str = "GRIDLAB_ALTERNATE_KEY";

/// Top-level configuration for an [`AcquisitionService`](crate::data::AcquisitionService).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub retry: RetryPolicy,

    /// Global cap on concurrent outbound requests.
    pub max_in_flight: usize,

    pub listing: ListingConfig,

    pub season: SeasonConfig,

    pub sanity: SanityConfig,

    pub alternate: AlternateConfig,

    /// Per-dataset cache caps, overriding the registry's.
    pub cache_caps: BTreeMap<String, usize>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_in_flight: 4,
            listing: ListingConfig::default(),
            season: SeasonConfig::default(),
            sanity: SanityConfig::default(),
            alternate: AlternateConfig::default(),
            cache_caps: BTreeMap::new(),
        }
    }
}

impl AcquisitionConfig {
    pub fn from_toml(text: &str) -> Result<Self, DataError> {
        toml::from_str(text).map_err(|e| DataError::Config(format!("invalid config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DataError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Overlay process environment variables.
    pub fn apply_env(&mut self) -> Result<(), DataError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), DataError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = get(ENV_BEARER_TOKEN) {
            self.listing.bearer_token = Some(token);
        }
        if let Some(week) = get(ENV_EXPECTED_COMPLETED_WEEK) {
            let week = week.parse::<u32>().map_err(|_| {
                DataError::Config(format!("{ENV_EXPECTED_COMPLETED_WEEK} must be a week number, got '{week}'"))
            })?;
            self.season.expected_completed_week = Some(week);
        }
        if let Some(flag) = get(ENV_ALTERNATE) {
            self.alternate.enabled = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(key) = get(ENV_ALTERNATE_KEY) {
            self.alternate.api_key = Some(key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.retry.attempts == 0 {
            return Err(DataError::Config("retry.attempts must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(DataError::Config("max_in_flight must be at least 1".into()));
        }
        if self.listing.asset_limit == 0 {
            return Err(DataError::Config("listing.asset_limit must be at least 1".into()));
        }
        if self.season.season_weeks == 0 {
            return Err(DataError::Config("season.season_weeks must be at least 1".into()));
        }
        if let Some((name, _)) = self.cache_caps.iter().find(|(_, cap)| **cap == 0) {
            return Err(DataError::Config(format!("cache_caps.{name} must be at least 1")));
        }
        if self.alternate.enabled && self.alternate.base_url.trim().is_empty() {
            return Err(DataError::Config("alternate.base_url is required when alternate.enabled".into()));
        }
        Ok(())
    }
}

/// Release-index listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListingConfig {
    pub api_base: String,

    /// `owner/repo` publishing the dataset releases.
    pub repository: String,

    /// A listing with this many assets is assumed truncated.
    pub asset_limit: usize,

    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            repository: "nflverse/nflverse-data".to_string(),
            asset_limit: 1000,
            bearer_token: None,
        }
    }
}

/// Season clock used by the staleness and sanity policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SeasonConfig {
    pub current_season: i32,

    /// Week whose games are about to be played.
    pub target_week: u32,

    /// Regular-season length.
    pub season_weeks: u32,

    /// Overrides `target_week - 1` as the last week expected to be final.
    pub expected_completed_week: Option<u32>,
}

impl Default for SeasonConfig {
    fn default() -> Self {
        let today = Utc::now().date_naive();
        // A season runs September to February, so January dates belong to last year's.
        let current_season = if today.month() >= 3 { today.year() } else { today.year() - 1 };
        Self {
            current_season,
            target_week: 1,
            season_weeks: 18,
            expected_completed_week: None,
        }
    }
}

impl SeasonConfig {
    pub fn expected_completed_week(&self) -> u32 {
        self.expected_completed_week
            .unwrap_or_else(|| self.target_week.saturating_sub(1))
    }

    /// Completed weeks of the current season, capped at the season length.
    pub fn elapsed_weeks(&self) -> u32 {
        self.expected_completed_week().min(self.season_weeks)
    }

    pub fn is_current(&self, season: Option<i32>) -> bool {
        season == Some(self.current_season)
    }
}

/// Overrides for the registry's per-dataset row minimums.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SanityConfig {
    pub min_rows: BTreeMap<String, usize>,
}

/// Secondary provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlternateConfig {
    pub enabled: bool,

    /// Seasons the secondary provider is consulted for; empty means all.
    pub seasons: Vec<i32>,

    pub base_url: String,

    pub timeout_ms: u64,

    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Header carrying `api_key`.
    pub api_key_header: String,

    /// Entities (teams) queried one by one when bulk endpoints come back empty.
    pub entities: Vec<String>,
}

impl Default for AlternateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            seasons: Vec::new(),
            base_url: String::new(),
            timeout_ms: 10_000,
            api_key: None,
            api_key_header: "X-Api-Key".to_string(),
            entities: Vec::new(),
        }
    }
}

impl AlternateConfig {
    pub fn allows(&self, season: Option<i32>) -> bool {
        if !self.enabled {
            return false;
        }
        match season {
            Some(s) => self.seasons.is_empty() || self.seasons.contains(&s),
            None => self.seasons.is_empty(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AcquisitionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.backoff_ms, 500);
        assert_eq!(config.retry.timeout_ms, 45_000);
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.listing.asset_limit, 1000);
        assert_eq!(config.season.season_weeks, 18);
        assert!(!config.alternate.enabled);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AcquisitionConfig::from_toml(
            r#"
            max_in_flight = 8

            [retry]
            attempts = 5

            [season]
            current_season = 2024
            target_week = 11

            [cache_caps]
            playByPlay = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.backoff_ms, 500);
        assert_eq!(config.season.expected_completed_week(), 10);
        assert_eq!(config.cache_caps.get("playByPlay"), Some(&2));
        assert_eq!(config.listing.repository, "nflverse/nflverse-data");
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = AcquisitionConfig::from_toml("max_in_flight = \"many\"").unwrap_err();
        assert!(matches!(err, DataError::Config(_)));
    }

    #[test]
    fn validate_rejects_zeroes() {
        let mut config = AcquisitionConfig::default();
        config.retry.attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AcquisitionConfig::default();
        config.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides() {
        let mut config = AcquisitionConfig::default();
        config.season.target_week = 6;
        config
            .apply_env_from(env(&[
                (ENV_BEARER_TOKEN, "ghp_abc"),
                (ENV_EXPECTED_COMPLETED_WEEK, " 4 "),
                (ENV_ALTERNATE, "TRUE"),
                (ENV_ALTERNATE_KEY, "k"),
            ]))
            .unwrap();
        assert_eq!(config.listing.bearer_token.as_deref(), Some("ghp_abc"));
        assert_eq!(config.season.expected_completed_week(), 4);
        assert!(config.alternate.enabled);
        assert_eq!(config.alternate.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = AcquisitionConfig::default();
        config.apply_env_from(env(&[(ENV_BEARER_TOKEN, "  ")])).unwrap();
        assert_eq!(config.listing.bearer_token, None);
    }

    #[test]
    fn bad_week_override_is_rejected() {
        let mut config = AcquisitionConfig::default();
        let err = config
            .apply_env_from(env(&[(ENV_EXPECTED_COMPLETED_WEEK, "late")]))
            .unwrap_err();
        assert!(matches!(err, DataError::Config(_)));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = AcquisitionConfig::default();
        config.listing.bearer_token = Some("ghp_secret".into());
        config.alternate.api_key = Some("alt_secret".into());
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn alternate_season_allow_list() {
        let mut alt = AlternateConfig::default();
        assert!(!alt.allows(Some(2024)));
        alt.enabled = true;
        assert!(alt.allows(Some(2024)));
        alt.seasons = vec![2024];
        assert!(alt.allows(Some(2024)));
        assert!(!alt.allows(Some(2023)));
        assert!(!alt.allows(None));
    }

    #[test]
    fn expected_week_saturates_before_season() {
        let season = SeasonConfig {
            current_season: 2024,
            target_week: 0,
            season_weeks: 18,
            expected_completed_week: None,
        };
        assert_eq!(season.expected_completed_week(), 0);
        let late = SeasonConfig {
            target_week: 25,
            ..season
        };
        assert_eq!(late.elapsed_weeks(), 18);
    }
}
