//! End-to-end acquisition scenarios over the scripted transport.

use chrono::{Duration, Utc};
use gridlab_core::config::SeasonConfig;
use gridlab_core::data::mock::{MockResponse, MockTransport};
use gridlab_core::data::registry::LIVE_SCHEDULE_URL;
use gridlab_core::data::{RetryPolicy, SourceOrigin, Value};
use gridlab_core::{AcquisitionConfig, AcquisitionService, DataError};
use serde_json::json;
use std::sync::Arc;

const API: &str = "https://api.test/repos/nflverse/nflverse-data/releases";
const TEAMS: [&str; 32] = [
    "ARI", "ATL", "BAL", "BUF", "CAR", "CHI", "CIN", "CLE", "DAL", "DEN", "DET", "GB", "HOU", "IND", "JAX", "KC",
    "LA", "LAC", "LV", "MIA", "MIN", "NE", "NO", "NYG", "NYJ", "PHI", "PIT", "SEA", "SF", "TB", "TEN", "WAS",
];

fn config(target_week: u32) -> AcquisitionConfig {
    let mut config = AcquisitionConfig::default();
    config.retry = RetryPolicy {
        attempts: 1,
        ..RetryPolicy::default()
    };
    config.listing.api_base = "https://api.test".into();
    config.season = SeasonConfig {
        current_season: 2024,
        target_week,
        season_weeks: 18,
        expected_completed_week: None,
    };
    config.sanity.min_rows.insert("schedules".into(), 10);
    config
}

fn tag_url(tag: &str) -> String {
    format!("{API}/tags/{tag}")
}

fn asset(tag: &str, name: &str, updated_at: chrono::DateTime<Utc>) -> serde_json::Value {
    json!({
        "name": name,
        "browser_download_url": format!("https://dl.test/{tag}/{name}"),
        "size": 4096,
        "updated_at": updated_at.to_rfc3339(),
        "content_type": "application/octet-stream"
    })
}

fn team_week_csv(season: i32, weeks: u32) -> String {
    let mut csv = String::from("season,week,team,points_for,points_against\n");
    for week in 1..=weeks {
        for (i, team) in TEAMS.iter().enumerate() {
            csv.push_str(&format!("{season},{week},{team},{},{}\n", 10 + i, 20 + week));
        }
    }
    csv
}

#[tokio::test]
async fn team_weekly_current_season_end_to_end() {
    let mock = Arc::new(MockTransport::new());
    let now = Utc::now();
    mock.respond(
        &tag_url("stats_team"),
        MockResponse::json(&json!({
            "tag_name": "stats_team",
            "assets": [
                asset("stats_team", "stats_team_week_2023.csv", now - Duration::days(200)),
                asset("stats_team", "stats_team_week_2024.csv", now - Duration::days(2)),
                asset("stats_team", "stats_team_week_2024.csv.gz", now - Duration::hours(3)),
            ]
        })),
    );
    let gz_url = "https://dl.test/stats_team/stats_team_week_2024.csv.gz";
    let plain = team_week_csv(2024, 17);
    mock.respond(gz_url, MockResponse::gzip(&plain));

    let service = AcquisitionService::new(config(11), mock.clone()).unwrap();
    let (first, second) = tokio::join!(
        service.load_dataset("teamWeekly", Some(2024)),
        service.load_dataset("teamWeekly", Some(2024)),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 544);
    assert_eq!(first.source.origin, SourceOrigin::Manifest);
    assert_eq!(first.source.name, "stats_team_week_2024.csv.gz");
    assert_eq!(first.checksum, blake3::hash(plain.as_bytes()).to_hex().to_string());
    assert_eq!(mock.calls(gz_url), 1);
    assert_eq!(mock.calls(&tag_url("stats_team")), 1);

    // Ready entries are served without touching the network.
    service.load_dataset("teamWeekly", Some(2024)).await.unwrap();
    assert_eq!(mock.calls(gz_url), 1);
}

#[tokio::test]
async fn prorated_threshold_rejects_thin_current_season() {
    let mock = Arc::new(MockTransport::new());
    let url = "https://github.com/nflverse/nflverse-data/releases/download/stats_team/stats_team_week_2024.csv";
    // 8 weeks × 32 teams = 256 rows, below round(504 × 10 / 18) = 280.
    mock.respond(url, MockResponse::body(&team_week_csv(2024, 8)));

    let service = AcquisitionService::new(config(11), mock.clone()).unwrap();
    let err = service.load_dataset("teamWeekly", Some(2024)).await.unwrap_err();
    assert_eq!(
        err,
        DataError::SanityCheckFailed {
            dataset: "teamWeekly".into(),
            season: "2024".into(),
            rows: 256,
            threshold: 280,
        }
    );
}

fn schedule_csv(scored_through: u32, scheduled_through: u32) -> String {
    let mut csv = String::from("game_id,season,week,home_team,away_team,home_score,away_score\n");
    csv.push_str("2023_18_KC_LV,2023,18,KC,LV,13,31\n");
    for week in 1..=scheduled_through {
        for (home, away) in [("KC", "BUF"), ("DAL", "PHI")] {
            let (h, a) = if week <= scored_through {
                ("24".to_string(), "17".to_string())
            } else {
                ("NA".to_string(), String::new())
            };
            csv.push_str(&format!("2024_{week:02}_{away}_{home},2024,{week},{home},{away},{h},{a}\n"));
        }
    }
    csv
}

fn schedule_mock() -> Arc<MockTransport> {
    let mock = Arc::new(MockTransport::new());
    mock.respond(
        &tag_url("schedules"),
        MockResponse::json(&json!({
            "tag_name": "schedules",
            "assets": [asset("schedules", "games.csv", Utc::now() - Duration::days(9))]
        })),
    );
    mock.respond("https://dl.test/schedules/games.csv", MockResponse::body(&schedule_csv(4, 18)));
    mock.respond(LIVE_SCHEDULE_URL, MockResponse::body(&schedule_csv(5, 18)));
    mock
}

#[tokio::test]
async fn stale_schedule_snapshot_is_replaced_by_live_feed() {
    let mock = schedule_mock();
    let service = AcquisitionService::new(config(6), mock.clone()).unwrap();

    let schedule = service.load_dataset("schedules", Some(2024)).await.unwrap();

    assert_eq!(schedule.source.origin, SourceOrigin::Static);
    assert_eq!(schedule.source.url, LIVE_SCHEDULE_URL);
    assert_eq!(schedule.len(), 36);
    assert!(schedule.rows.iter().all(|r| r["season"] == Value::Number(2024.0)));
    assert_eq!(mock.calls("https://dl.test/schedules/games.csv"), 1);
    assert_eq!(mock.calls(LIVE_SCHEDULE_URL), 1);
}

#[tokio::test]
async fn fresh_schedule_snapshot_is_kept() {
    let mock = schedule_mock();
    let service = AcquisitionService::new(config(5), mock.clone()).unwrap();

    let schedule = service.load_dataset("schedules", Some(2024)).await.unwrap();

    assert_eq!(schedule.source.origin, SourceOrigin::ManifestLatest);
    assert_eq!(mock.calls(LIVE_SCHEDULE_URL), 0);
}

#[tokio::test]
async fn expected_week_override_from_environment_lookup() {
    let mock = schedule_mock();
    let mut cfg = config(5);
    cfg.apply_env_from(|key| (key == "GRIDLAB_EXPECTED_COMPLETED_WEEK").then(|| "5".to_string()))
        .unwrap();
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    let schedule = service.load_dataset("schedules", Some(2024)).await.unwrap();
    assert_eq!(schedule.source.url, LIVE_SCHEDULE_URL);
}

#[tokio::test]
async fn alternate_provider_is_preferred_when_enabled() {
    let mock = Arc::new(MockTransport::new());
    let bulk = "https://alt.test/injuries?season=2024";
    mock.respond(
        bulk,
        MockResponse::json(&json!({"season": 2024, "data": {"injuries": [
            {"player": "A", "team": "KC", "status": "Out"},
            {"player": "B", "team": "BUF", "status": "Questionable"},
            {"player": "C", "team": "DAL", "status": "Out"}
        ]}})),
    );
    let static_url = "https://github.com/nflverse/nflverse-data/releases/download/injuries/injuries_2024.csv";

    let mut cfg = config(11);
    cfg.alternate.enabled = true;
    cfg.alternate.base_url = "https://alt.test".into();
    cfg.sanity.min_rows.insert("injuries".into(), 3);
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    let injuries = service.load_dataset("injuries", Some(2024)).await.unwrap();
    assert_eq!(injuries.source.origin, SourceOrigin::Alternate);
    assert_eq!(injuries.source.url, bulk);
    assert_eq!(injuries.len(), 3);
    assert_eq!(injuries.checksum.len(), 64);
    assert_eq!(mock.calls(static_url), 0);
    assert_eq!(mock.calls(&tag_url("injuries")), 0);
}

#[tokio::test]
async fn empty_alternate_falls_through_to_primary() {
    let mock = Arc::new(MockTransport::new());
    let static_url = "https://github.com/nflverse/nflverse-data/releases/download/injuries/injuries_2023.csv";
    mock.respond(
        static_url,
        MockResponse::body("season,week,team,player\n2023,1,KC,A\n2023,1,KC,B\n"),
    );

    let mut cfg = config(11);
    cfg.alternate.enabled = true;
    cfg.alternate.base_url = "https://alt.test".into();
    cfg.alternate.seasons = vec![2023];
    cfg.sanity.min_rows.insert("injuries".into(), 2);
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    let injuries = service.load_dataset("injuries", Some(2023)).await.unwrap();
    assert_eq!(injuries.source.origin, SourceOrigin::Static);
    // Both bulk candidates were probed (and 404ed); no entities configured.
    assert_eq!(mock.calls("https://alt.test/injuries?season=2023"), 1);
    assert_eq!(mock.calls("https://alt.test/injuries?season=2023&seasontype=2"), 1);
}

#[tokio::test]
async fn play_by_play_streams_projected_rows_into_bounded_cache() {
    let mock = Arc::new(MockTransport::new().with_chunk_size(7));
    let url = |season: i32| {
        format!("https://github.com/nflverse/nflverse-data/releases/download/pbp/play_by_play_{season}.csv.gz")
    };
    for season in 2019..=2022 {
        let csv = format!(
            "game_id,play_id,season,week,posteam,desc,epa\n\
             {season}_01_KC_DET,1,{season},1,KC,\"Mahomes pass, short left\",0.4\n\
             {season}_01_KC_DET,2,{season},1,DET,run middle,-0.2\n"
        );
        mock.respond(&url(season), MockResponse::gzip(&csv));
    }

    let mut cfg = config(11);
    cfg.sanity.min_rows.insert("playByPlay".into(), 2);
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    for season in 2019..=2022 {
        let pbp = service.load_dataset("playByPlay", Some(season)).await.unwrap();
        assert_eq!(pbp.len(), 2);
        assert!(pbp.rows.iter().all(|r| !r.contains_key("desc")));
        assert_eq!(pbp.rows[0]["epa"], Value::Number(0.4));
    }

    let cache = service.cache("playByPlay").unwrap();
    assert_eq!(cache.keys(), vec![Some(2020), Some(2021), Some(2022)]);

    // The evicted season is fetched again.
    service.load_dataset("playByPlay", Some(2019)).await.unwrap();
    assert_eq!(mock.calls(&url(2019)), 2);
    assert_eq!(service.governor().in_flight(), 0);
}

#[tokio::test]
async fn merge_group_joins_on_season_week_team() {
    let mock = Arc::new(MockTransport::new());
    let updated = Utc::now() - Duration::days(30);
    mock.respond(
        &tag_url("pfr_advstats"),
        MockResponse::json(&json!({
            "tag_name": "pfr_advstats",
            "assets": [
                asset("pfr_advstats", "advstats_week_pass_2023.csv", updated),
                asset("pfr_advstats", "advstats_week_rush_2023.csv", updated),
                asset("pfr_advstats", "advstats_week_rec_2023.csv", updated),
                asset("pfr_advstats", "advstats_week_def_2023.csv", updated),
            ]
        })),
    );
    let file = |kind: &str| format!("https://dl.test/pfr_advstats/advstats_week_{kind}_2023.csv");
    mock.respond(
        &file("pass"),
        MockResponse::body("season,week,team,pass_yds\n2023,1,KC,226\n2023,1,DET,253\n"),
    );
    mock.respond(
        &file("rush"),
        MockResponse::body("season,week,team,rush_yds,pass_yds\n2023,1,KC,118,999\n"),
    );
    mock.respond(
        &file("rec"),
        MockResponse::body("season,week,recent_team,rec_yds\n2023,1,KC,226\n2023,1,,12\n"),
    );
    mock.respond(&file("def"), MockResponse::body("season,week,team_abbr,sacks\n2023,1,DET,3\n"));

    let mut cfg = config(11);
    for name in ["pfrPass", "pfrRush", "pfrRec", "pfrDef"] {
        cfg.sanity.min_rows.insert(name.into(), 1);
    }
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    let merged = service.load_merged_by_key("pfrAdvanced", Some(2023)).await.unwrap();

    assert_eq!(merged.len(), 2);
    let kc = &merged["2023|1|KC"];
    assert_eq!(kc["pass_yds"], Value::Number(226.0));
    assert_eq!(kc["rush_yds"], Value::Number(118.0));
    assert_eq!(kc["rec_yds"], Value::Number(226.0));
    assert_eq!(merged["2023|1|DET"]["sacks"], Value::Number(3.0));
    // Four datasets share one release tag: listed once.
    assert_eq!(mock.calls(&tag_url("pfr_advstats")), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_then_cleared() {
    let mock = Arc::new(MockTransport::new());
    let url = "https://github.com/nflverse/nflverse-data/releases/download/rosters/roster_2022.csv";
    mock.respond_sequence(
        url,
        vec![
            MockResponse::Status(503),
            MockResponse::body("season,team,player\n2022,KC,A\n2022,KC,B\n"),
        ],
    );

    let mut cfg = config(11);
    cfg.retry = RetryPolicy {
        attempts: 1,
        backoff_ms: 1,
        timeout_ms: 1_000,
    };
    cfg.sanity.min_rows.insert("rosters".into(), 2);
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    let err = service.load_dataset("rosters", Some(2022)).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(!service.cache("rosters").unwrap().contains(&Some(2022)));

    let roster = service.load_dataset("rosters", Some(2022)).await.unwrap();
    assert_eq!(roster.len(), 2);
}

#[tokio::test]
async fn streamed_loads_survive_resets_and_never_hang_on_stalls() {
    let mock = Arc::new(MockTransport::new());
    let url = |season: i32| {
        format!("https://github.com/nflverse/nflverse-data/releases/download/pbp/play_by_play_{season}.csv.gz")
    };
    let csv = "game_id,play_id,season,week,posteam,epa\n\
               2021_01_KC_CLE,1,2021,1,KC,0.4\n\
               2021_01_KC_CLE,2,2021,1,CLE,-0.2\n";
    mock.respond_sequence(
        &url(2021),
        vec![MockResponse::ResetAfter(bytes::Bytes::new()), MockResponse::gzip(csv)],
    );
    mock.respond(&url(2020), MockResponse::StallAfter(bytes::Bytes::new()));

    let mut cfg = config(11);
    cfg.retry = RetryPolicy {
        attempts: 2,
        backoff_ms: 1,
        timeout_ms: 200,
    };
    cfg.sanity.min_rows.insert("playByPlay".into(), 2);
    let service = AcquisitionService::new(cfg, mock.clone()).unwrap();

    let pbp = service.load_dataset("playByPlay", Some(2021)).await.unwrap();
    assert_eq!(pbp.len(), 2);
    assert_eq!(mock.calls(&url(2021)), 2);

    let err = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        service.load_dataset("playByPlay", Some(2020)),
    )
    .await
    .expect("a stalled body must end the load")
    .unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");
    assert_eq!(mock.calls(&url(2020)), 2);
    assert!(!service.cache("playByPlay").unwrap().contains(&Some(2020)));
    assert_eq!(service.governor().in_flight(), 0);
}
