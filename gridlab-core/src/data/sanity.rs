//! Row-count sanity gate applied to every decoded dataset.

use super::provider::{season_label, DataError};
use super::registry::DatasetSpec;
use crate::config::{SanityConfig, SeasonConfig};
use std::collections::BTreeMap;
use tracing::debug;

/// Per-dataset minimum row counts.
///
/// Datasets that grow week by week are held to a prorated minimum during the
/// current season: `round(min × elapsed_weeks / season_weeks)`. A count equal
/// to the threshold passes.
#[derive(Debug, Clone)]
pub struct SanityPolicy {
    season: SeasonConfig,
    overrides: BTreeMap<String, usize>,
}

impl SanityPolicy {
    pub fn new(season: SeasonConfig, sanity: &SanityConfig) -> Self {
        Self {
            season,
            overrides: sanity.min_rows.clone(),
        }
    }

    pub fn minimum(&self, spec: &DatasetSpec) -> usize {
        self.overrides.get(&spec.name).copied().unwrap_or(spec.min_rows)
    }

    pub fn threshold(&self, spec: &DatasetSpec, season: Option<i32>) -> usize {
        let min = self.minimum(spec);
        if !(spec.growing && self.season.is_current(season)) {
            return min;
        }
        let weeks = self.season.season_weeks.max(1) as f64;
        let elapsed = self.season.elapsed_weeks() as f64;
        (min as f64 * elapsed / weeks).round() as usize
    }

    pub fn check(&self, spec: &DatasetSpec, season: Option<i32>, rows: usize) -> Result<(), DataError> {
        let threshold = self.threshold(spec, season);
        if rows < threshold {
            return Err(DataError::SanityCheckFailed {
                dataset: spec.name.clone(),
                season: season_label(season),
                rows,
                threshold,
            });
        }
        debug!(dataset = %spec.name, season = %season_label(season), rows, threshold, "sanity check passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::registry::DatasetRegistry;

    fn season(current: i32, target_week: u32) -> SeasonConfig {
        SeasonConfig {
            current_season: current,
            target_week,
            season_weeks: 18,
            expected_completed_week: None,
        }
    }

    fn spec(name: &str) -> DatasetSpec {
        DatasetRegistry::builtin().unwrap().get(name).unwrap().clone()
    }

    #[test]
    fn below_minimum_fails_at_minimum_passes() {
        let mut roster = spec("rosters");
        roster.min_rows = 50;
        let policy = SanityPolicy::new(season(2024, 11), &SanityConfig::default());

        let err = policy.check(&roster, Some(2023), 3).unwrap_err();
        assert_eq!(
            err,
            DataError::SanityCheckFailed {
                dataset: "rosters".into(),
                season: "2023".into(),
                rows: 3,
                threshold: 50,
            }
        );
        policy.check(&roster, Some(2023), 50).unwrap();
    }

    #[test]
    fn growing_dataset_is_prorated_in_current_season() {
        let policy = SanityPolicy::new(season(2024, 11), &SanityConfig::default());
        let team = spec("teamWeekly");

        // 504 × 10 / 18
        assert_eq!(policy.threshold(&team, Some(2024)), 280);
        policy.check(&team, Some(2024), 280).unwrap();
        assert!(policy.check(&team, Some(2024), 279).is_err());

        // Past seasons are complete.
        assert_eq!(policy.threshold(&team, Some(2023)), 504);
    }

    #[test]
    fn non_growing_dataset_is_not_prorated() {
        let policy = SanityPolicy::new(season(2024, 3), &SanityConfig::default());
        assert_eq!(policy.threshold(&spec("rosters"), Some(2024)), 1500);
    }

    #[test]
    fn configured_minimum_overrides_registry() {
        let config = SanityConfig {
            min_rows: BTreeMap::from([("teamWeekly".to_string(), 36)]),
        };
        let policy = SanityPolicy::new(season(2024, 10), &config);
        // round(36 × 9 / 18)
        assert_eq!(policy.threshold(&spec("teamWeekly"), Some(2024)), 18);
    }
}
