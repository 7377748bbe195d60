//! Upstream payload types and normalization.
//!
//! The provider returns loosely shaped JSON. Everything is funneled through
//! the tagged types below at the client boundary: mandatory fields are
//! enforced by the serde derives (a missing one fails the payload), unknown
//! fields are ignored, and nothing upstream-shaped leaks past this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::models::{EventTick, Fixture, FixtureStatus, OddsTick, PrematchOdd, StatTick};
use crate::upstream::error::UpstreamError;

/// Common response envelope: `{get, parameters, errors, results, paging, response}`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub paging: Option<Paging>,
    pub response: Vec<T>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub total: u32,
}

// ---------------------------------------------------------------------------
// /fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureRecord {
    pub fixture: FixtureCore,
    pub league: LeagueBlock,
    pub teams: TeamsBlock,
    #[serde(default)]
    pub goals: GoalsBlock,
    #[serde(default)]
    pub score: ScoreBlock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureCore {
    pub id: i64,
    #[serde(default)]
    pub referee: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub date: DateTime<Utc>,
    pub status: StatusBlock,
    #[serde(default)]
    pub venue: Option<VenueBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusBlock {
    pub short: String,
    #[serde(default)]
    pub long: Option<String>,
    #[serde(default)]
    pub elapsed: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeagueBlock {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    pub season: i32,
    #[serde(default)]
    pub round: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueBlock {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamsBlock {
    pub home: TeamRef,
    pub away: TeamRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamRef {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GoalsBlock {
    #[serde(default)]
    pub home: Option<i32>,
    #[serde(default)]
    pub away: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ScoreBlock {
    #[serde(default)]
    pub halftime: GoalsBlock,
    #[serde(default)]
    pub extratime: GoalsBlock,
    #[serde(default)]
    pub penalty: GoalsBlock,
}

impl FixtureRecord {
    /// Normalize into the fixture row. Fails on a status outside the closed set.
    pub fn into_fixture(self) -> Result<Fixture, UpstreamError> {
        let status = FixtureStatus::parse(&self.fixture.status.short).ok_or_else(|| {
            UpstreamError::Malformed(format!(
                "unknown fixture status {:?} for fixture {}",
                self.fixture.status.short, self.fixture.id
            ))
        })?;

        Ok(Fixture {
            id: self.fixture.id,
            date: self.fixture.date,
            timezone: self.fixture.timezone,
            referee: self.fixture.referee,
            league_id: self.league.id,
            season_year: self.league.season,
            round: self.league.round,
            venue_id: self.fixture.venue.and_then(|v| v.id),
            home_team_id: self.teams.home.id,
            away_team_id: self.teams.away.id,
            status,
            status_long: self.fixture.status.long,
            status_elapsed: self.fixture.status.elapsed,
            home_goals: self.goals.home.unwrap_or(0),
            away_goals: self.goals.away.unwrap_or(0),
            home_goals_ht: self.score.halftime.home.unwrap_or(0),
            away_goals_ht: self.score.halftime.away.unwrap_or(0),
            home_goals_et: self.score.extratime.home.unwrap_or(0),
            away_goals_et: self.score.extratime.away.unwrap_or(0),
            home_goals_pen: self.score.penalty.home.unwrap_or(0),
            away_goals_pen: self.score.penalty.away.unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// /odds/live and /odds
// ---------------------------------------------------------------------------

/// Live odds entry: one bookmaker with its open bets.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveOddsRecord {
    pub bookmaker: IdName,
    #[serde(default)]
    pub bets: Vec<BetBlock>,
}

/// Prematch odds entry: all bookmakers for one fixture.
#[derive(Debug, Clone, Deserialize)]
pub struct PrematchOddsRecord {
    #[serde(default)]
    pub bookmakers: Vec<BookmakerBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookmakerBlock {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bets: Vec<BetBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdName {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BetBlock {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub values: Vec<BetValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BetValue {
    pub value: FlexString,
    #[serde(deserialize_with = "de_price")]
    pub odd: f64,
}

/// Outcome labels arrive as strings or bare numbers depending on the market.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlexString {
    Text(String),
    Number(f64),
}

impl FlexString {
    pub fn into_string(self) -> String {
        match self {
            FlexString::Text(s) => s,
            FlexString::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", n as i64)
                } else {
                    format!("{n}")
                }
            }
        }
    }
}

/// Prices arrive as `"2.10"` strings or raw numbers.
fn de_price<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    match FlexString::deserialize(de)? {
        FlexString::Number(n) => Ok(n),
        FlexString::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("unparseable odd price {s:?}"))),
    }
}

/// Flatten one live-odds response into tick rows, all stamped with the pull
/// instant. Row order follows payload order so per-key instants stay
/// appended in sequence.
pub fn normalize_live_odds(
    fixture_id: i64,
    records: Vec<LiveOddsRecord>,
    ts: DateTime<Utc>,
    match_minute: Option<i32>,
) -> Vec<OddsTick> {
    let mut ticks = Vec::new();
    for record in records {
        for bet in record.bets {
            for value in bet.values {
                let outcome = value.value.into_string();
                ticks.push(OddsTick {
                    fixture_id,
                    bookmaker_id: record.bookmaker.id,
                    bet_market_id: bet.id,
                    bet_value: outcome,
                    odd_value: value.odd,
                    ts,
                    match_minute,
                });
            }
        }
    }
    ticks
}

/// Flatten a prematch odds response, keeping the first price seen per
/// (bookmaker, market, outcome).
pub fn normalize_prematch_odds(
    fixture_id: i64,
    records: Vec<PrematchOddsRecord>,
    snapshot_ts: DateTime<Utc>,
    kickoff: DateTime<Utc>,
) -> Vec<PrematchOdd> {
    let hours_before_match = (kickoff - snapshot_ts).num_hours().max(0) as i32;
    let mut seen = std::collections::HashSet::new();
    let mut rows = Vec::new();
    for record in records {
        for bookmaker in record.bookmakers {
            for bet in bookmaker.bets {
                for value in bet.values {
                    let outcome = value.value.into_string();
                    if !seen.insert((bookmaker.id, bet.id, outcome.clone())) {
                        continue;
                    }
                    rows.push(PrematchOdd {
                        fixture_id,
                        bookmaker_id: bookmaker.id,
                        bet_market_id: bet.id,
                        bet_value: outcome,
                        odd_value: value.odd,
                        snapshot_ts,
                        hours_before_match,
                    });
                }
            }
        }
    }
    rows
}

// ---------------------------------------------------------------------------
// /fixtures/events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EventRecord {
    pub time: EventTime,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub team: Option<MaybeIdName>,
    #[serde(default)]
    pub player: Option<MaybeIdName>,
    #[serde(default)]
    pub assist: Option<MaybeIdName>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventTime {
    #[serde(default)]
    pub elapsed: Option<i32>,
    #[serde(default)]
    pub extra: Option<i32>,
}

/// Team/player/assist blocks may carry a null id.
#[derive(Debug, Clone, Deserialize)]
pub struct MaybeIdName {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

pub fn normalize_events(
    fixture_id: i64,
    records: Vec<EventRecord>,
    ts: DateTime<Utc>,
) -> Vec<EventTick> {
    records
        .into_iter()
        .map(|record| EventTick {
            fixture_id,
            ts,
            match_minute: record.time.elapsed,
            match_minute_extra: record.time.extra,
            event_type: record.event_type,
            event_detail: record.detail,
            team_id: record.team.and_then(|t| t.id),
            player_id: record.player.and_then(|p| p.id),
            assist_player_id: record.assist.and_then(|a| a.id),
            comments: record.comments,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// /fixtures/statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StatsRecord {
    pub team: IdName,
    #[serde(default)]
    pub statistics: Vec<StatEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatEntry {
    #[serde(rename = "type")]
    pub stat_type: String,
    #[serde(default)]
    pub value: StatValue,
}

/// Stat values arrive as numbers, `"57%"` strings or null.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    #[default]
    Missing,
    Int(i64),
    Float(f64),
    Text(String),
}

impl StatValue {
    /// Percent strings are stripped, nulls collapse to zero.
    fn as_i32(&self) -> i32 {
        match self {
            StatValue::Missing => 0,
            StatValue::Int(n) => *n as i32,
            StatValue::Float(f) => f.round() as i32,
            StatValue::Text(s) => s.trim().trim_end_matches('%').parse().unwrap_or(0),
        }
    }
}

pub fn normalize_stats(
    fixture_id: i64,
    records: Vec<StatsRecord>,
    ts: DateTime<Utc>,
) -> Vec<StatTick> {
    records
        .into_iter()
        .map(|record| {
            let mut tick = StatTick {
                fixture_id,
                team_id: record.team.id,
                ts,
                ..Default::default()
            };
            for entry in record.statistics {
                let v = entry.value.as_i32();
                match entry.stat_type.to_lowercase().replace(' ', "_").as_str() {
                    "shots_on_goal" => tick.shots_on_goal = v,
                    "shots_off_goal" => tick.shots_off_goal = v,
                    "total_shots" => tick.total_shots = v,
                    "blocked_shots" => tick.blocked_shots = v,
                    "shots_insidebox" | "shots_inside_box" => tick.shots_inside_box = v,
                    "shots_outsidebox" | "shots_outside_box" => tick.shots_outside_box = v,
                    "fouls" => tick.fouls = v,
                    "corner_kicks" => tick.corner_kicks = v,
                    "offsides" => tick.offsides = v,
                    "ball_possession" => tick.ball_possession = v,
                    "yellow_cards" => tick.yellow_cards = v,
                    "red_cards" => tick.red_cards = v,
                    "goalkeeper_saves" => tick.goalkeeper_saves = v,
                    "total_passes" => tick.total_passes = v,
                    "passes_accurate" => tick.passes_accurate = v,
                    "passes_%" | "passes_percentage" => tick.passes_percentage = v,
                    _ => {}
                }
            }
            tick
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 14, 19, 30, 0).unwrap()
    }

    #[test]
    fn fixture_record_normalizes() {
        let raw = serde_json::json!({
            "fixture": {
                "id": 1000,
                "referee": "M. Oliver",
                "timezone": "UTC",
                "date": "2024-09-14T19:00:00+00:00",
                "timestamp": 1726340400,
                "venue": {"id": 556, "name": "Old Trafford", "city": "Manchester"},
                "status": {"long": "First Half", "short": "1H", "elapsed": 23}
            },
            "league": {"id": 39, "name": "Premier League", "country": "England",
                       "season": 2024, "round": "Regular Season - 4"},
            "teams": {"home": {"id": 33, "name": "Manchester United"},
                      "away": {"id": 40, "name": "Liverpool"}},
            "goals": {"home": 1, "away": 0},
            "score": {"halftime": {"home": null, "away": null},
                      "fulltime": {"home": null, "away": null},
                      "extratime": {"home": null, "away": null},
                      "penalty": {"home": null, "away": null}}
        });
        let record: FixtureRecord = serde_json::from_value(raw).unwrap();
        let fixture = record.into_fixture().unwrap();
        assert_eq!(fixture.id, 1000);
        assert_eq!(fixture.status, FixtureStatus::FirstHalf);
        assert_eq!(fixture.status_elapsed, Some(23));
        assert_eq!(fixture.league_id, 39);
        assert_eq!(fixture.home_team_id, 33);
        assert_eq!(fixture.home_goals, 1);
    }

    #[test]
    fn unknown_status_is_malformed() {
        let raw = serde_json::json!({
            "fixture": {"id": 1, "date": "2024-09-14T19:00:00+00:00",
                        "status": {"short": "XX"}},
            "league": {"id": 39, "season": 2024},
            "teams": {"home": {"id": 1}, "away": {"id": 2}}
        });
        let record: FixtureRecord = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            record.into_fixture(),
            Err(UpstreamError::Malformed(_))
        ));
    }

    #[test]
    fn missing_mandatory_field_fails_parse() {
        // No teams block.
        let raw = serde_json::json!({
            "fixture": {"id": 1, "date": "2024-09-14T19:00:00+00:00",
                        "status": {"short": "NS"}},
            "league": {"id": 39, "season": 2024}
        });
        assert!(serde_json::from_value::<FixtureRecord>(raw).is_err());
    }

    #[test]
    fn live_odds_flatten_with_string_prices() {
        let raw = serde_json::json!([{
            "bookmaker": {"id": 8, "name": "Bet365"},
            "bets": [{
                "id": 1,
                "name": "Match Winner",
                "values": [
                    {"value": "1", "odd": "2.10"},
                    {"value": "X", "odd": "3.40"},
                    {"value": "2", "odd": 3.20}
                ]
            }]
        }]);
        let records: Vec<LiveOddsRecord> = serde_json::from_value(raw).unwrap();
        let ticks = normalize_live_odds(1000, records, ts(), Some(23));
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0].bookmaker_id, 8);
        assert_eq!(ticks[0].bet_value, "1");
        assert!((ticks[0].odd_value - 2.10).abs() < 1e-9);
        assert!((ticks[2].odd_value - 3.20).abs() < 1e-9);
    }

    #[test]
    fn prematch_keeps_first_price_per_outcome() {
        let raw = serde_json::json!([{
            "bookmakers": [{
                "id": 6,
                "name": "Bwin",
                "bets": [{
                    "id": 1,
                    "name": "Match Winner",
                    "values": [
                        {"value": "Home", "odd": "1.90"},
                        {"value": "Home", "odd": "1.95"}
                    ]
                }]
            }]
        }]);
        let records: Vec<PrematchOddsRecord> = serde_json::from_value(raw).unwrap();
        let kickoff = ts() + chrono::Duration::hours(20);
        let rows = normalize_prematch_odds(1000, records, ts(), kickoff);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].odd_value - 1.90).abs() < 1e-9);
        assert_eq!(rows[0].hours_before_match, 20);
    }

    #[test]
    fn events_carry_nullable_players() {
        let raw = serde_json::json!([{
            "time": {"elapsed": 27, "extra": null},
            "team": {"id": 33, "name": "Manchester United"},
            "player": {"id": 874, "name": "B. Fernandes"},
            "assist": {"id": null, "name": null},
            "type": "Goal",
            "detail": "Normal Goal",
            "comments": null
        }]);
        let records: Vec<EventRecord> = serde_json::from_value(raw).unwrap();
        let ticks = normalize_events(1000, records, ts());
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].event_type, "Goal");
        assert_eq!(ticks[0].match_minute, Some(27));
        assert_eq!(ticks[0].player_id, Some(874));
        assert_eq!(ticks[0].assist_player_id, None);
    }

    #[test]
    fn stats_strip_percent_and_collapse_nulls() {
        let raw = serde_json::json!([{
            "team": {"id": 33, "name": "Manchester United"},
            "statistics": [
                {"type": "Shots on Goal", "value": 5},
                {"type": "Ball Possession", "value": "57%"},
                {"type": "Passes %", "value": "83%"},
                {"type": "Corner Kicks", "value": null},
                {"type": "expected_goals", "value": "1.42"}
            ]
        }]);
        let records: Vec<StatsRecord> = serde_json::from_value(raw).unwrap();
        let ticks = normalize_stats(1000, records, ts());
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].shots_on_goal, 5);
        assert_eq!(ticks[0].ball_possession, 57);
        assert_eq!(ticks[0].passes_percentage, 83);
        assert_eq!(ticks[0].corner_kicks, 0);
    }
}
