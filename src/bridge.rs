//! Fan-out bridge: relays committed change notes to live subscribers.
//!
//! The write path appends notes to the outbox inside the tick batch
//! transaction; this module tails the outbox in row-id order (which implies
//! per-(fixture, type) seq order), keeps a short per-topic ring for
//! catch-up, and multicasts to bounded per-connection buffers. A buffer
//! that stays full past the slow-consumer grace is disconnected; the
//! subscriber is expected to come back through catch-up.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::models::{BridgeMessage, BridgeMessageType};
use crate::store::TickStore;

/// Messages kept per topic for in-memory catch-up.
const RING_CAPACITY: usize = 256;
/// How long a subscriber's buffer may stay full before disconnect.
const SLOW_AFTER: Duration = Duration::from_secs(10);
/// Per-connection send buffer depth.
pub const SUBSCRIBER_BUFFER: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatchupError {
    /// The requested seq lies behind the retention horizon.
    #[error("catchup unavailable: requested history is beyond the horizon")]
    Unavailable,
}

struct ConnectionSlot {
    tx: mpsc::Sender<BridgeMessage>,
    full_since: Option<Instant>,
}

#[derive(Default)]
struct TopicState {
    ring: VecDeque<BridgeMessage>,
    subscribers: HashSet<u64>,
}

pub struct Bridge {
    store: Arc<TickStore>,
    metrics: Arc<Metrics>,
    topics: Mutex<HashMap<i64, TopicState>>,
    connections: Mutex<HashMap<u64, ConnectionSlot>>,
    next_connection_id: AtomicU64,
}

impl Bridge {
    pub fn new(store: Arc<TickStore>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            store,
            metrics,
            topics: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Register a connection's send channel. The bridge owns the only
    /// sender: dropping the slot closes the subscriber's stream.
    pub fn register(&self, tx: mpsc::Sender<BridgeMessage>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(
            id,
            ConnectionSlot {
                tx,
                full_since: None,
            },
        );
        id
    }

    pub fn subscribe(&self, connection_id: u64, fixture_id: i64) {
        let mut topics = self.topics.lock();
        topics
            .entry(fixture_id)
            .or_default()
            .subscribers
            .insert(connection_id);
        debug!(connection_id, fixture_id, "subscribed");
    }

    pub fn unsubscribe(&self, connection_id: u64, fixture_id: i64) {
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get_mut(&fixture_id) {
            topic.subscribers.remove(&connection_id);
        }
    }

    /// Remove a connection everywhere. Called when the subscriber handle is
    /// dropped; delivery stops with the removal.
    pub fn drop_connection(&self, connection_id: u64) {
        {
            let mut topics = self.topics.lock();
            for topic in topics.values_mut() {
                topic.subscribers.remove(&connection_id);
            }
        }
        self.connections.lock().remove(&connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Serve missed messages with per-type seq above `from_seq`: from the
    /// ring when it reaches back far enough, else from the outbox. A gap
    /// behind the outbox horizon is unservable.
    pub fn catchup(
        &self,
        fixture_id: i64,
        from_seq: u64,
    ) -> Result<Vec<BridgeMessage>, CatchupError> {
        let current = self.store.current_seqs(fixture_id).unwrap_or_default();
        let needed: Vec<BridgeMessageType> = current
            .iter()
            .filter(|(_, seq)| *seq > from_seq)
            .map(|(t, _)| *t)
            .collect();
        if needed.is_empty() {
            return Ok(Vec::new());
        }

        // Ring first: complete iff it still holds from_seq + 1 for every
        // type that moved past from_seq.
        {
            let topics = self.topics.lock();
            if let Some(topic) = topics.get(&fixture_id) {
                let complete = needed.iter().all(|t| {
                    topic
                        .ring
                        .iter()
                        .filter(|m| m.msg_type == *t)
                        .map(|m| m.seq)
                        .min()
                        .is_some_and(|min| min <= from_seq + 1)
                });
                if complete {
                    return Ok(topic
                        .ring
                        .iter()
                        .filter(|m| m.seq > from_seq)
                        .cloned()
                        .collect());
                }
            }
        }

        let rows = self
            .store
            .outbox_catchup(fixture_id, from_seq)
            .map_err(|_| CatchupError::Unavailable)?;
        for t in &needed {
            let first = rows.iter().filter(|m| m.msg_type == *t).map(|m| m.seq).min();
            if first != Some(from_seq + 1) {
                self.metrics
                    .catchup_unavailable
                    .fetch_add(1, Ordering::Relaxed);
                return Err(CatchupError::Unavailable);
            }
        }
        Ok(rows)
    }

    /// Tail the outbox and multicast. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut cursor = self.store.outbox_max_id().unwrap_or(0);
        info!(cursor, "fan-out bridge started");
        loop {
            tokio::select! {
                _ = self.store.outbox_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = shutdown.changed() => {
                    info!("fan-out bridge stopping");
                    return;
                }
            }
            loop {
                let rows = match self.store.outbox_after(cursor, 256) {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(error = %e, "outbox read failed");
                        break;
                    }
                };
                if rows.is_empty() {
                    break;
                }
                for (id, msg) in rows {
                    cursor = id;
                    self.deliver(msg);
                }
            }
        }
    }

    fn deliver(&self, msg: BridgeMessage) {
        let fixture_id = msg.fixture_id;
        let subscribers: Vec<u64> = {
            let mut topics = self.topics.lock();
            let topic = topics.entry(fixture_id).or_default();
            topic.ring.push_back(msg.clone());
            while topic.ring.len() > RING_CAPACITY {
                topic.ring.pop_front();
            }
            topic.subscribers.iter().copied().collect()
        };

        if subscribers.is_empty() {
            return;
        }

        let mut slow: Vec<u64> = Vec::new();
        {
            let mut connections = self.connections.lock();
            for id in subscribers {
                let Some(slot) = connections.get_mut(&id) else {
                    continue;
                };
                match slot.tx.try_send(msg.clone()) {
                    Ok(()) => slot.full_since = None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let since = *slot.full_since.get_or_insert_with(Instant::now);
                        if since.elapsed() > SLOW_AFTER {
                            slow.push(id);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => slow.push(id),
                }
            }
        }
        for id in slow {
            warn!(connection_id = id, fixture_id, "dropping slow consumer");
            self.metrics
                .slow_consumers_dropped
                .fetch_add(1, Ordering::Relaxed);
            self.drop_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::store::test_support::*;
    use crate::store::TickStore;
    use chrono::Utc;

    fn note(store: &TickStore, fixture_id: i64, msg_type: BridgeMessageType) -> u64 {
        store
            .with_txn(|conn| {
                TickStore::append_note(
                    conn,
                    fixture_id,
                    msg_type,
                    Utc::now(),
                    &serde_json::json!({"n": 1}),
                )
            })
            .unwrap()
    }

    fn bridge_with_store() -> (Arc<Bridge>, Arc<TickStore>) {
        let store = memory_store();
        let bridge = Bridge::new(store.clone(), Arc::new(Metrics::new()));
        (bridge, store)
    }

    async fn drain_pending(bridge: &Arc<Bridge>, cursor: &mut i64) {
        let rows = bridge.store.outbox_after(*cursor, 256).unwrap();
        for (id, msg) in rows {
            *cursor = id;
            bridge.deliver(msg);
        }
    }

    #[tokio::test]
    async fn subscriber_sees_seq_in_order() {
        let (bridge, store) = bridge_with_store();
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let conn = bridge.register(tx);
        bridge.subscribe(conn, 1000);

        let mut cursor = 0i64;
        for _ in 0..5 {
            note(&store, 1000, BridgeMessageType::OddsUpdate);
        }
        drain_pending(&bridge, &mut cursor).await;

        let mut seqs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            seqs.push(msg.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn messages_for_other_fixtures_are_not_delivered() {
        let (bridge, store) = bridge_with_store();
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let conn = bridge.register(tx);
        bridge.subscribe(conn, 1000);

        let mut cursor = 0i64;
        note(&store, 2000, BridgeMessageType::OddsUpdate);
        drain_pending(&bridge, &mut cursor).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn catchup_from_ring_returns_missing_then_empty_when_current() {
        let (bridge, store) = bridge_with_store();
        let mut cursor = 0i64;
        for _ in 0..10 {
            note(&store, 1000, BridgeMessageType::OddsUpdate);
        }
        drain_pending(&bridge, &mut cursor).await;

        let missed = bridge.catchup(1000, 4).unwrap();
        assert_eq!(missed.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![5, 6, 7, 8, 9, 10]);

        assert!(bridge.catchup(1000, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn catchup_falls_back_to_outbox_when_ring_rolled() {
        let (bridge, store) = bridge_with_store();
        let mut cursor = 0i64;
        // More than RING_CAPACITY messages so seq 1 leaves the ring.
        for _ in 0..(RING_CAPACITY + 20) {
            note(&store, 1000, BridgeMessageType::OddsUpdate);
        }
        drain_pending(&bridge, &mut cursor).await;

        let missed = bridge.catchup(1000, 0).unwrap();
        assert_eq!(missed.len(), RING_CAPACITY + 20);
        assert_eq!(missed[0].seq, 1);
    }

    #[tokio::test]
    async fn catchup_behind_horizon_is_unavailable() {
        let (bridge, store) = bridge_with_store();
        let mut cursor = 0i64;
        for _ in 0..5 {
            note(&store, 1000, BridgeMessageType::OddsUpdate);
        }
        drain_pending(&bridge, &mut cursor).await;

        // Outbox trimmed past those rows and ring cleared, as after restart.
        store.run_retention(Utc::now() + chrono::Duration::hours(3)).unwrap();
        bridge.topics.lock().clear();

        assert_eq!(bridge.catchup(1000, 2), Err(CatchupError::Unavailable));
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected_after_grace() {
        let (bridge, store) = bridge_with_store();
        // Tiny buffer fills immediately.
        let (tx, rx) = mpsc::channel(1);
        let conn = bridge.register(tx);
        bridge.subscribe(conn, 1000);

        let mut cursor = 0i64;
        note(&store, 1000, BridgeMessageType::OddsUpdate);
        note(&store, 1000, BridgeMessageType::OddsUpdate);
        drain_pending(&bridge, &mut cursor).await;
        assert_eq!(bridge.connection_count(), 1, "inside the grace window");

        // Pretend the buffer has been full past the grace.
        bridge
            .connections
            .lock()
            .get_mut(&conn)
            .unwrap()
            .full_since = Some(Instant::now() - SLOW_AFTER - Duration::from_secs(1));
        note(&store, 1000, BridgeMessageType::OddsUpdate);
        drain_pending(&bridge, &mut cursor).await;
        assert_eq!(bridge.connection_count(), 0, "slow consumer dropped");
        drop(rx);
    }

    #[tokio::test]
    async fn dropped_connection_receives_nothing_further() {
        let (bridge, store) = bridge_with_store();
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let conn = bridge.register(tx);
        bridge.subscribe(conn, 1000);
        bridge.drop_connection(conn);

        let mut cursor = 0i64;
        note(&store, 1000, BridgeMessageType::OddsUpdate);
        drain_pending(&bridge, &mut cursor).await;
        assert!(rx.try_recv().is_err());
    }
}
