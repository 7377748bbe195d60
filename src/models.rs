use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of provider fixture statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixtureStatus {
    #[serde(rename = "TBD")]
    Tbd,
    #[serde(rename = "NS")]
    NotStarted,
    #[serde(rename = "1H")]
    FirstHalf,
    #[serde(rename = "HT")]
    HalfTime,
    #[serde(rename = "2H")]
    SecondHalf,
    #[serde(rename = "ET")]
    ExtraTime,
    #[serde(rename = "BT")]
    BreakTime,
    #[serde(rename = "P")]
    Penalties,
    #[serde(rename = "SUSP")]
    Suspended,
    #[serde(rename = "INT")]
    Interrupted,
    #[serde(rename = "FT")]
    FullTime,
    #[serde(rename = "AET")]
    AfterExtraTime,
    #[serde(rename = "PEN")]
    PenaltyShootout,
    #[serde(rename = "PST")]
    Postponed,
    #[serde(rename = "CANC")]
    Cancelled,
    #[serde(rename = "ABD")]
    Abandoned,
    #[serde(rename = "AWD")]
    Awarded,
    #[serde(rename = "WO")]
    Walkover,
}

impl FixtureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixtureStatus::Tbd => "TBD",
            FixtureStatus::NotStarted => "NS",
            FixtureStatus::FirstHalf => "1H",
            FixtureStatus::HalfTime => "HT",
            FixtureStatus::SecondHalf => "2H",
            FixtureStatus::ExtraTime => "ET",
            FixtureStatus::BreakTime => "BT",
            FixtureStatus::Penalties => "P",
            FixtureStatus::Suspended => "SUSP",
            FixtureStatus::Interrupted => "INT",
            FixtureStatus::FullTime => "FT",
            FixtureStatus::AfterExtraTime => "AET",
            FixtureStatus::PenaltyShootout => "PEN",
            FixtureStatus::Postponed => "PST",
            FixtureStatus::Cancelled => "CANC",
            FixtureStatus::Abandoned => "ABD",
            FixtureStatus::Awarded => "AWD",
            FixtureStatus::Walkover => "WO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TBD" => FixtureStatus::Tbd,
            "NS" => FixtureStatus::NotStarted,
            "1H" => FixtureStatus::FirstHalf,
            "HT" => FixtureStatus::HalfTime,
            "2H" => FixtureStatus::SecondHalf,
            "ET" => FixtureStatus::ExtraTime,
            "BT" => FixtureStatus::BreakTime,
            "P" => FixtureStatus::Penalties,
            "SUSP" => FixtureStatus::Suspended,
            "INT" => FixtureStatus::Interrupted,
            "FT" => FixtureStatus::FullTime,
            "AET" => FixtureStatus::AfterExtraTime,
            "PEN" => FixtureStatus::PenaltyShootout,
            "PST" => FixtureStatus::Postponed,
            "CANC" => FixtureStatus::Cancelled,
            "ABD" => FixtureStatus::Abandoned,
            "AWD" => FixtureStatus::Awarded,
            "WO" => FixtureStatus::Walkover,
            _ => return None,
        })
    }

    /// In-play subset: the fixture is currently receiving ticks.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            FixtureStatus::FirstHalf
                | FixtureStatus::HalfTime
                | FixtureStatus::SecondHalf
                | FixtureStatus::ExtraTime
                | FixtureStatus::BreakTime
                | FixtureStatus::Penalties
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            FixtureStatus::FullTime
                | FixtureStatus::AfterExtraTime
                | FixtureStatus::PenaltyShootout
                | FixtureStatus::Awarded
                | FixtureStatus::Walkover
        )
    }

    /// Finished or dead: no further ticks of any kind are accepted.
    pub fn is_terminal_inactive(&self) -> bool {
        self.is_finished()
            || matches!(
                self,
                FixtureStatus::Postponed | FixtureStatus::Cancelled | FixtureStatus::Abandoned
            )
    }
}

/// A scheduled match. Created by the fixture poll, mutated by the live loop
/// and the finalizer, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub timezone: Option<String>,
    pub referee: Option<String>,
    pub league_id: i64,
    pub season_year: i32,
    pub round: Option<String>,
    pub venue_id: Option<i64>,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub status: FixtureStatus,
    pub status_long: Option<String>,
    pub status_elapsed: Option<i32>,
    pub home_goals: i32,
    pub away_goals: i32,
    pub home_goals_ht: i32,
    pub away_goals_ht: i32,
    pub home_goals_et: i32,
    pub away_goals_et: i32,
    pub home_goals_pen: i32,
    pub away_goals_pen: i32,
}

/// One observation of one outcome's price at one bookmaker at one instant.
/// Natural key: (fixture, bookmaker, market, outcome value, instant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsTick {
    pub fixture_id: i64,
    pub bookmaker_id: i64,
    pub bet_market_id: i64,
    pub bet_value: String,
    pub odd_value: f64,
    pub ts: DateTime<Utc>,
    pub match_minute: Option<i32>,
}

/// One observation of one in-match event (goal, card, substitution, VAR...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTick {
    pub fixture_id: i64,
    pub ts: DateTime<Utc>,
    pub match_minute: Option<i32>,
    pub match_minute_extra: Option<i32>,
    pub event_type: String,
    pub event_detail: Option<String>,
    pub team_id: Option<i64>,
    pub player_id: Option<i64>,
    pub assist_player_id: Option<i64>,
    pub comments: Option<String>,
}

/// One snapshot of a team's cumulative match statistics at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatTick {
    pub fixture_id: i64,
    pub team_id: i64,
    pub ts: DateTime<Utc>,
    pub shots_on_goal: i32,
    pub shots_off_goal: i32,
    pub total_shots: i32,
    pub blocked_shots: i32,
    pub shots_inside_box: i32,
    pub shots_outside_box: i32,
    pub fouls: i32,
    pub corner_kicks: i32,
    pub offsides: i32,
    pub ball_possession: i32,
    pub yellow_cards: i32,
    pub red_cards: i32,
    pub goalkeeper_saves: i32,
    pub total_passes: i32,
    pub passes_accurate: i32,
    pub passes_percentage: i32,
}

/// One bookmaker's price for one outcome sampled before kickoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrematchOdd {
    pub fixture_id: i64,
    pub bookmaker_id: i64,
    pub bet_market_id: i64,
    pub bet_value: String,
    pub odd_value: f64,
    pub snapshot_ts: DateTime<Utc>,
    pub hours_before_match: i32,
}

/// Per-(fixture, 1-minute bucket) derived row. Every column is a pure
/// function of the window's ticks and the fixture row, so re-materializing
/// the same bucket always yields an identical row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveFrame {
    pub fixture_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub status: FixtureStatus,
    pub status_elapsed: Option<i32>,
    pub home_goals: i32,
    pub away_goals: i32,
    pub avg_home_odd: Option<f64>,
    pub avg_draw_odd: Option<f64>,
    pub avg_away_odd: Option<f64>,
    pub home_odd_delta: Option<f64>,
    pub away_odd_delta: Option<f64>,
    pub goals_in_bucket: i32,
    pub cards_in_bucket: i32,
    pub subs_in_bucket: i32,
    pub odds_ticks_in_bucket: i32,
    pub event_ticks_in_bucket: i32,
}

/// Tick kinds the live loop pulls per fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullKind {
    Odds,
    Events,
    Stats,
}

impl PullKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullKind::Odds => "odds",
            PullKind::Events => "events",
            PullKind::Stats => "stats",
        }
    }
}

/// Message types carried on per-fixture topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMessageType {
    OddsUpdate,
    EventUpdate,
    StatsUpdate,
    FixtureClosed,
}

impl BridgeMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeMessageType::OddsUpdate => "odds_update",
            BridgeMessageType::EventUpdate => "event_update",
            BridgeMessageType::StatsUpdate => "stats_update",
            BridgeMessageType::FixtureClosed => "fixture_closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "odds_update" => BridgeMessageType::OddsUpdate,
            "event_update" => BridgeMessageType::EventUpdate,
            "stats_update" => BridgeMessageType::StatsUpdate,
            "fixture_closed" => BridgeMessageType::FixtureClosed,
            _ => return None,
        })
    }
}

/// One change notification. `seq` is monotonically increasing per
/// (fixture, type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    #[serde(rename = "type")]
    pub msg_type: BridgeMessageType,
    pub fixture_id: i64,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            "TBD", "NS", "1H", "HT", "2H", "ET", "BT", "P", "SUSP", "INT", "FT", "AET", "PEN",
            "PST", "CANC", "ABD", "AWD", "WO",
        ] {
            let parsed = FixtureStatus::parse(s).expect("known status");
            assert_eq!(parsed.as_str(), s);
        }
        assert!(FixtureStatus::parse("LIVE").is_none());
    }

    #[test]
    fn status_subsets() {
        assert!(FixtureStatus::FirstHalf.is_live());
        assert!(FixtureStatus::HalfTime.is_live());
        assert!(!FixtureStatus::FullTime.is_live());

        assert!(FixtureStatus::FullTime.is_finished());
        assert!(FixtureStatus::Walkover.is_finished());
        assert!(!FixtureStatus::Postponed.is_finished());

        assert!(FixtureStatus::Postponed.is_terminal_inactive());
        assert!(FixtureStatus::Abandoned.is_terminal_inactive());
        assert!(FixtureStatus::FullTime.is_terminal_inactive());
        assert!(!FixtureStatus::Suspended.is_terminal_inactive());
    }

    #[test]
    fn bridge_message_serializes_with_type_field() {
        let msg = BridgeMessage {
            msg_type: BridgeMessageType::OddsUpdate,
            fixture_id: 1000,
            seq: 1,
            timestamp: Utc::now(),
            payload: serde_json::json!({"rows": 1}),
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "odds_update");
        assert_eq!(v["fixture_id"], 1000);
        assert_eq!(v["seq"], 1);
    }
}
