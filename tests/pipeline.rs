//! End-to-end pipeline scenarios: mock provider → upstream client → live
//! loop → tick store → outbox → fan-out bridge → WebSocket subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use footybrain_backend::api::{self, AppState, HealthFlag};
use footybrain_backend::bridge::Bridge;
use footybrain_backend::config::{AppConfig, IngestSettings, RateLimits, RetryPolicy, SettingsHandle};
use footybrain_backend::live::LiveLoop;
use footybrain_backend::metrics::Metrics;
use footybrain_backend::models::{Fixture, FixtureStatus};
use footybrain_backend::scheduler::{JobContext, Scheduler};
use footybrain_backend::store::{FrameAggregator, TickStore};
use footybrain_backend::upstream::{ApiFootballClient, RateGovernor};

#[derive(Clone, Default)]
struct MockFeed {
    live_fixtures: Arc<Mutex<serde_json::Value>>,
    odds: Arc<Mutex<serde_json::Value>>,
    calls: Arc<Mutex<HashMap<&'static str, u32>>>,
}

fn envelope(response: serde_json::Value) -> Json<serde_json::Value> {
    Json(json!({
        "results": response.as_array().map(|a| a.len()).unwrap_or(0),
        "paging": {"current": 1, "total": 1},
        "response": response
    }))
}

async fn spawn_provider(feed: MockFeed) -> String {
    let f1 = feed.clone();
    let f2 = feed.clone();
    let f3 = feed.clone();
    let f4 = feed;
    let app = Router::new()
        .route(
            "/fixtures",
            get(move || {
                let feed = f1.clone();
                async move {
                    *feed.calls.lock().entry("fixtures").or_insert(0) += 1;
                    envelope(feed.live_fixtures.lock().clone())
                }
            }),
        )
        .route(
            "/odds/live",
            get(move || {
                let feed = f2.clone();
                async move {
                    *feed.calls.lock().entry("odds").or_insert(0) += 1;
                    envelope(feed.odds.lock().clone())
                }
            }),
        )
        .route(
            "/fixtures/events",
            get(move || {
                let feed = f3.clone();
                async move {
                    *feed.calls.lock().entry("events").or_insert(0) += 1;
                    envelope(json!([]))
                }
            }),
        )
        .route(
            "/fixtures/statistics",
            get(move || {
                let feed = f4.clone();
                async move {
                    *feed.calls.lock().entry("stats").or_insert(0) += 1;
                    envelope(json!([]))
                }
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    live: Arc<LiveLoop>,
    store: Arc<TickStore>,
    ws_url: String,
    _shutdown: watch::Sender<bool>,
}

async fn spawn_pipeline(provider_url: String) -> Harness {
    let mut cfg = AppConfig::from_env().unwrap();
    cfg.upstream_base_url = provider_url;
    cfg.upstream_key = "integration-test".to_string();
    cfg.retry = RetryPolicy {
        attempts: 2,
        base_delay: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    };

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(TickStore::new(":memory:", metrics.clone()).unwrap());
    store.seed_jobs_if_missing().unwrap();
    // The harness drives triggers by hand; keep the dispatcher quiet.
    for job in store.list_jobs().unwrap() {
        store.update_job(&job.name, Some(false), None).unwrap();
    }

    let governor = RateGovernor::new(RateLimits {
        max_rps: 100,
        max_rpm: 10_000,
        max_rpd: 100_000,
        burst: 0,
        permit_timeout: Duration::from_secs(5),
    });
    let client = ApiFootballClient::new(&cfg, governor.clone(), metrics.clone()).unwrap();
    let settings = SettingsHandle::new(IngestSettings::default());
    let live = Arc::new(LiveLoop::new(
        &cfg,
        store.clone(),
        client.clone(),
        settings.clone(),
        metrics.clone(),
    ));
    let frames = Arc::new(FrameAggregator::new(store.clone(), metrics.clone()));
    let bridge = Bridge::new(store.clone(), metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(bridge.clone().run(shutdown_rx.clone()));

    let ctx = Arc::new(JobContext::new(
        store.clone(),
        live.clone(),
        frames,
        client,
        settings.clone(),
    ));
    let scheduler = Scheduler::spawn(store.clone(), ctx, metrics.clone(), shutdown_rx);

    let state = AppState {
        store: store.clone(),
        metrics,
        governor,
        settings,
        scheduler,
        bridge,
        health: Arc::new(HealthFlag::default()),
    };
    let app = api::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        live,
        store,
        ws_url: format!("ws://{addr}/ws"),
        _shutdown: shutdown_tx,
    }
}

fn in_play_fixture(id: i64) -> Fixture {
    Fixture {
        id,
        date: Utc::now() - chrono::Duration::minutes(30),
        timezone: Some("UTC".to_string()),
        referee: None,
        league_id: 39,
        season_year: 2024,
        round: None,
        venue_id: None,
        home_team_id: 33,
        away_team_id: 40,
        status: FixtureStatus::FirstHalf,
        status_long: None,
        status_elapsed: Some(23),
        home_goals: 0,
        away_goals: 0,
        home_goals_ht: 0,
        away_goals_ht: 0,
        home_goals_et: 0,
        away_goals_et: 0,
        home_goals_pen: 0,
        away_goals_pen: 0,
    }
}

fn live_fixture_json(id: i64, status: &str) -> serde_json::Value {
    json!({
        "fixture": {"id": id,
                    "date": (Utc::now() - chrono::Duration::minutes(30)).to_rfc3339(),
                    "status": {"short": status, "elapsed": 23}},
        "league": {"id": 39, "season": 2024},
        "teams": {"home": {"id": 33}, "away": {"id": 40}},
        "goals": {"home": 0, "away": 0}
    })
}

fn odds_payload(price: &str) -> serde_json::Value {
    json!([{
        "bookmaker": {"id": 8, "name": "Bet365"},
        "bets": [{"id": 1, "name": "Match Winner", "values": [
            {"value": "1", "odd": price}
        ]}]
    }])
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn ws_send(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(WsMessage::Text(value.to_string())).await.unwrap();
}

/// Next JSON frame within a bounded wait.
async fn ws_next(ws: &mut WsStream) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("ws message expected")
        .expect("stream open")
        .expect("frame ok");
    match frame {
        WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected ws frame {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s1_single_live_odd_propagates_to_subscriber() {
    let feed = MockFeed::default();
    *feed.live_fixtures.lock() = json!([live_fixture_json(1000, "1H")]);
    *feed.odds.lock() = odds_payload("2.10");
    let provider = spawn_provider(feed).await;
    let harness = spawn_pipeline(provider).await;
    harness.store.upsert_fixture(&in_play_fixture(1000)).unwrap();

    let mut ws = ws_connect(&harness.ws_url).await;
    ws_send(&mut ws, json!({"action": "subscribe", "fixture_id": 1000})).await;
    let ack = ws_next(&mut ws).await;
    assert_eq!(ack["type"], "ack");

    harness.live.trigger().await.unwrap();

    // Exactly one stored tick with the quoted fields.
    let ticks = harness
        .store
        .odds_ticks_between(
            1000,
            Utc::now() - chrono::Duration::minutes(1),
            Utc::now() + chrono::Duration::minutes(1),
        )
        .unwrap();
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].bookmaker_id, 8);
    assert_eq!(ticks[0].bet_market_id, 1);
    assert_eq!(ticks[0].bet_value, "1");
    assert!((ticks[0].odd_value - 2.10).abs() < 1e-9);

    // Exactly one odds_update with seq 1 reaches the subscriber.
    let msg = ws_next(&mut ws).await;
    assert_eq!(msg["type"], "odds_update");
    assert_eq!(msg["fixture_id"], 1000);
    assert_eq!(msg["seq"], 1);
    assert_eq!(msg["payload"]["count"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s3_status_transition_closes_ingestion() {
    let feed = MockFeed::default();
    *feed.live_fixtures.lock() = json!([live_fixture_json(1000, "1H")]);
    *feed.odds.lock() = odds_payload("2.10");
    let provider = spawn_provider(feed.clone()).await;
    let harness = spawn_pipeline(provider).await;
    harness.store.upsert_fixture(&in_play_fixture(1000)).unwrap();

    let mut ws = ws_connect(&harness.ws_url).await;
    ws_send(&mut ws, json!({"action": "subscribe", "fixture_id": 1000})).await;
    let _ack = ws_next(&mut ws).await;

    harness.live.trigger().await.unwrap();
    let _first_odds = ws_next(&mut ws).await;

    // Upstream now reports FT.
    *feed.live_fixtures.lock() = json!([live_fixture_json(1000, "FT")]);
    let report = harness.live.trigger().await.unwrap();
    assert_eq!(report.fixtures_closed, 1);
    assert_eq!(report.live_fixtures, 0);

    let closed = ws_next(&mut ws).await;
    assert_eq!(closed["type"], "fixture_closed");
    assert_eq!(closed["fixture_id"], 1000);
    assert_eq!(closed["payload"]["status"], "FT");

    let stored = harness.store.fixture(1000).unwrap().unwrap();
    assert_eq!(stored.status, FixtureStatus::FullTime);

    // The next trigger schedules nothing for the closed fixture.
    let odds_calls_before = *feed.calls.lock().get("odds").unwrap_or(&0);
    let report = harness.live.trigger().await.unwrap();
    assert_eq!(report.pulls_submitted, 0);
    assert_eq!(*feed.calls.lock().get("odds").unwrap_or(&0), odds_calls_before);

    // And ticks for it are refused outright.
    let refused = harness
        .store
        .insert_odds_ticks(&[footybrain_backend::models::OddsTick {
            fixture_id: 1000,
            bookmaker_id: 8,
            bet_market_id: 1,
            bet_value: "1".to_string(),
            odd_value: 2.0,
            ts: Utc::now(),
            match_minute: None,
        }])
        .unwrap();
    assert_eq!(refused.dropped, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s6_subscriber_catches_up_then_resumes_live() {
    let feed = MockFeed::default();
    *feed.live_fixtures.lock() = json!([]);
    let provider = spawn_provider(feed).await;
    let harness = spawn_pipeline(provider).await;
    harness.store.upsert_fixture(&in_play_fixture(1000)).unwrap();

    // Ten odds updates before the subscriber arrives.
    for i in 0..10 {
        harness
            .store
            .insert_odds_ticks(&[footybrain_backend::models::OddsTick {
                fixture_id: 1000,
                bookmaker_id: 8,
                bet_market_id: 1,
                bet_value: "1".to_string(),
                odd_value: 2.0 + i as f64 * 0.01,
                ts: Utc::now() + chrono::Duration::milliseconds(i),
                match_minute: None,
            }])
            .unwrap();
    }

    let mut ws = ws_connect(&harness.ws_url).await;
    ws_send(
        &mut ws,
        json!({"action": "catchup", "fixture_id": 1000, "from_seq": 4}),
    )
    .await;
    for expected_seq in 5..=10u64 {
        let msg = ws_next(&mut ws).await;
        assert_eq!(msg["type"], "odds_update");
        assert_eq!(msg["seq"], expected_seq);
    }

    // Live flow resumes at seq 11.
    harness
        .store
        .insert_odds_ticks(&[footybrain_backend::models::OddsTick {
            fixture_id: 1000,
            bookmaker_id: 8,
            bet_market_id: 1,
            bet_value: "1".to_string(),
            odd_value: 2.2,
            ts: Utc::now() + chrono::Duration::seconds(1),
            match_minute: None,
        }])
        .unwrap();
    let live_msg = ws_next(&mut ws).await;
    assert_eq!(live_msg["seq"], 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_probe_reports_budget_and_queues() {
    let feed = MockFeed::default();
    *feed.live_fixtures.lock() = json!([]);
    let provider = spawn_provider(feed).await;
    let harness = spawn_pipeline(provider).await;

    let http_url = harness.ws_url.replace("ws://", "http://").replace("/ws", "/health");
    let body: serde_json::Value = reqwest::get(&http_url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["rate_budget"]["per_day_remaining"].as_u64().unwrap() > 0);
    assert!(body["queues"].as_object().unwrap().contains_key("live"));
    assert_eq!(body["store_pool"]["size"], 1);
}
