//! Dataset registry: the declarative table of everything the data plane can load.
//!
//! Each dataset names its provider release tag, the ordered filename
//! extractors used to recognise its assets in a manifest, a static URL
//! template, and the policies that apply to it (staleness class, decode
//! mode, sanity minimum, alternate-provider candidates, cache cap).
//! Filename parsing is one generic matcher over this table; there is no
//! per-dataset parsing code.

use super::provider::DataError;
use regex::Regex;
use std::collections::BTreeMap;

/// Live schedule feed, updated as games finish.
pub const LIVE_SCHEDULE_URL: &str = "https://raw.githubusercontent.com/nflverse/nfldata/master/data/games.csv";

/// Whether a dataset is subject to the staleness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetClass {
    Standard,
    /// Game schedule with results; manifest snapshots may lag completed games.
    Schedule,
}

/// How a dataset's table is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeMode {
    /// Whole body in memory, then parse.
    Batch,
    /// Incremental parse with per-record projection and season filtering.
    /// An empty column list keeps every column.
    Streaming { columns: Vec<String> },
}

/// One filename pattern. A named `season` capture group yields the season;
/// a pattern without one marks an unsegmented aggregate file.
#[derive(Debug, Clone)]
pub struct FilenameExtractor {
    pattern: Regex,
}

impl FilenameExtractor {
    pub fn new(pattern: &str) -> Result<Self, DataError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| DataError::Config(format!("bad filename pattern '{pattern}': {e}")))?;
        Ok(Self { pattern })
    }

    /// `None` if the name does not match; `Some(season)` otherwise.
    pub fn extract(&self, name: &str) -> Option<Option<i32>> {
        let caps = self.pattern.captures(name)?;
        let season = caps.name("season").and_then(|m| m.as_str().parse().ok());
        Some(season)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Secondary-provider endpoints for a dataset, relative to the configured base URL.
///
/// Templates may use `{season}`; the per-entity template also uses `{entity}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateSpec {
    pub candidates: Vec<String>,
    pub per_entity: Option<String>,
}

/// Immutable description of one dataset.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub name: String,
    pub provider_tag: String,
    pub extractors: Vec<FilenameExtractor>,
    pub url_template: String,
    pub class: DatasetClass,
    pub decode: DecodeMode,
    /// Column holding the season, used to filter aggregate files.
    pub season_column: Option<String>,
    /// Grows week by week during a season; the sanity minimum is scaled.
    pub growing: bool,
    pub min_rows: usize,
    pub alternate: Option<AlternateSpec>,
    /// Maximum resident seasons in the result cache.
    pub cache_cap: Option<usize>,
}

impl DatasetSpec {
    /// Run the ordered extractors; the first match wins.
    pub fn match_asset(&self, name: &str) -> Option<Option<i32>> {
        self.extractors.iter().find_map(|x| x.extract(name))
    }

    /// Static URL for a season. Templates with a `{season}` placeholder have
    /// no static URL for the ALL key.
    pub fn static_url(&self, season: Option<i32>) -> Option<String> {
        match season {
            Some(s) => Some(self.url_template.replace("{season}", &s.to_string())),
            None if self.url_template.contains("{season}") => None,
            None => Some(self.url_template.clone()),
        }
    }
}

struct Descriptor {
    name: &'static str,
    tag: &'static str,
    patterns: &'static [&'static str],
    template: &'static str,
    class: DatasetClass,
    growing: bool,
    min_rows: usize,
    streaming: Option<&'static [&'static str]>,
    cache_cap: Option<usize>,
    alternate: Option<(&'static [&'static str], Option<&'static str>)>,
}

const PBP_COLUMNS: &[&str] = &[
    "game_id", "play_id", "season", "week", "posteam", "defteam", "play_type", "down", "ydstogo",
    "yards_gained", "epa", "wpa", "success", "pass", "rush", "home_team", "away_team",
];

const BUILTIN: &[Descriptor] = &[
    Descriptor {
        name: "schedules",
        tag: "schedules",
        patterns: &[r"^games\.csv(\.gz)?$"],
        template: LIVE_SCHEDULE_URL,
        class: DatasetClass::Schedule,
        growing: false,
        min_rows: 256,
        streaming: None,
        cache_cap: None,
        alternate: Some((
            &["/schedule?season={season}", "/scoreboard?season={season}&limit=1000"],
            Some("/teams/{entity}/schedule?season={season}"),
        )),
    },
    Descriptor {
        name: "teamWeekly",
        tag: "stats_team",
        patterns: &[r"^stats_team_week_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/stats_team/stats_team_week_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 504,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "playerWeekly",
        tag: "stats_player",
        patterns: &[
            r"^stats_player_week_(?P<season>\d{4})\.csv(\.gz)?$",
            r"^player_stats_(?P<season>\d{4})\.csv(\.gz)?$",
        ],
        template: "https://github.com/nflverse/nflverse-data/releases/download/stats_player/stats_player_week_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 4000,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "playByPlay",
        tag: "pbp",
        patterns: &[r"^play_by_play_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/pbp/play_by_play_{season}.csv.gz",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 40_000,
        streaming: Some(PBP_COLUMNS),
        cache_cap: Some(3),
        alternate: None,
    },
    Descriptor {
        name: "rosters",
        tag: "rosters",
        patterns: &[r"^roster_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/rosters/roster_{season}.csv",
        class: DatasetClass::Standard,
        growing: false,
        min_rows: 1500,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "injuries",
        tag: "injuries",
        patterns: &[r"^injuries_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/injuries/injuries_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 500,
        streaming: None,
        cache_cap: None,
        alternate: Some((
            &["/injuries?season={season}", "/injuries?season={season}&seasontype=2"],
            Some("/teams/{entity}/injuries?season={season}"),
        )),
    },
    Descriptor {
        name: "snapCounts",
        tag: "snap_counts",
        patterns: &[r"^snap_counts_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/snap_counts/snap_counts_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 1000,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "pfrPass",
        tag: "pfr_advstats",
        patterns: &[r"^advstats_week_pass_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/pfr_advstats/advstats_week_pass_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 100,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "pfrRush",
        tag: "pfr_advstats",
        patterns: &[r"^advstats_week_rush_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/pfr_advstats/advstats_week_rush_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 100,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "pfrRec",
        tag: "pfr_advstats",
        patterns: &[r"^advstats_week_rec_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/pfr_advstats/advstats_week_rec_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 100,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
    Descriptor {
        name: "pfrDef",
        tag: "pfr_advstats",
        patterns: &[r"^advstats_week_def_(?P<season>\d{4})\.csv(\.gz)?$"],
        template: "https://github.com/nflverse/nflverse-data/releases/download/pfr_advstats/advstats_week_def_{season}.csv",
        class: DatasetClass::Standard,
        growing: true,
        min_rows: 100,
        streaming: None,
        cache_cap: None,
        alternate: None,
    },
];

const MERGE_GROUPS: &[(&str, &[&str])] = &[("pfrAdvanced", &["pfrPass", "pfrRush", "pfrRec", "pfrDef"])];

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Descriptor {
    fn build(&self) -> Result<DatasetSpec, DataError> {
        let extractors = self
            .patterns
            .iter()
            .map(|p| FilenameExtractor::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DatasetSpec {
            name: self.name.to_string(),
            provider_tag: self.tag.to_string(),
            extractors,
            url_template: self.template.to_string(),
            class: self.class,
            decode: match self.streaming {
                Some(cols) => DecodeMode::Streaming {
                    columns: to_strings(cols),
                },
                None => DecodeMode::Batch,
            },
            season_column: Some("season".to_string()),
            growing: self.growing,
            min_rows: self.min_rows,
            alternate: self.alternate.map(|(candidates, per_entity)| AlternateSpec {
                candidates: to_strings(candidates),
                per_entity: per_entity.map(str::to_string),
            }),
            cache_cap: self.cache_cap,
        })
    }
}

/// Lookup table of dataset specs and merge groups.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, DatasetSpec>,
    merge_groups: BTreeMap<String, Vec<String>>,
}

impl DatasetRegistry {
    /// The built-in table.
    pub fn builtin() -> Result<Self, DataError> {
        let mut registry = Self::default();
        for descriptor in BUILTIN {
            registry.insert(descriptor.build()?);
        }
        for (group, members) in MERGE_GROUPS {
            registry.insert_merge_group(group, to_strings(members))?;
        }
        Ok(registry)
    }

    /// Add or replace a dataset.
    pub fn insert(&mut self, spec: DatasetSpec) {
        self.datasets.insert(spec.name.clone(), spec);
    }

    /// Register a merge group. Every member must already be registered.
    pub fn insert_merge_group(&mut self, name: &str, members: Vec<String>) -> Result<(), DataError> {
        if let Some(missing) = members.iter().find(|m| !self.datasets.contains_key(*m)) {
            return Err(DataError::Config(format!(
                "merge group '{name}' references unknown dataset '{missing}'"
            )));
        }
        self.merge_groups.insert(name.to_string(), members);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&DatasetSpec, DataError> {
        self.datasets
            .get(name)
            .ok_or_else(|| DataError::UnknownDataset(name.to_string()))
    }

    pub fn merge_group(&self, name: &str) -> Result<&[String], DataError> {
        self.merge_groups
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| DataError::UnknownDataset(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(|s| s.as_str())
    }

    pub fn specs(&self) -> impl Iterator<Item = &DatasetSpec> {
        self.datasets.values()
    }

    pub fn merge_group_names(&self) -> impl Iterator<Item = &str> {
        self.merge_groups.keys().map(|s| s.as_str())
    }

    /// Datasets published under a provider tag.
    pub fn by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a DatasetSpec> + 'a {
        self.datasets.values().filter(move |s| s.provider_tag == tag)
    }
}
