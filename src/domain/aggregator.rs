use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::StatusRecord;
use crate::domain::payload::{self, ParseError};
use crate::domain::topics::{self, TopicKind};

pub const EVENT_LOG_CAPACITY: usize = 50;

/// Consecutive full-queue skips after which a viewer is considered abandoned
/// and removed from the registry.
pub const STALLED_VIEWER_DROP_LIMIT: u32 = 32;

/// One bus message as forwarded to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub source_topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub chargers: BTreeMap<String, StatusRecord>,
    pub events: Vec<Envelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(Uuid);

impl ViewerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ViewerId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim()).map(Self)
    }
}

/// Handed to a newly connected viewer: the state at connect time plus a
/// queue carrying everything ingested afterwards.
#[derive(Debug)]
pub struct ViewerConnection {
    pub id: ViewerId,
    pub snapshot: Snapshot,
    pub feed: Receiver<Envelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanOutReport {
    pub delivered: usize,
    /// Viewer queue was full; the envelope was skipped for that viewer only.
    pub dropped: usize,
    /// Viewer hung up and was removed from the registry.
    pub disconnected: usize,
    /// Viewer hit the stall limit and was removed from the registry.
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub kind: TopicKind,
    pub evicted: bool,
    pub fan_out: FanOutReport,
}

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("unrecognised topic: {0}")]
    UnknownTopic(String),
    #[error("malformed payload on {topic}: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: ParseError,
    },
}

#[derive(Debug)]
pub struct EventAggregator {
    log_capacity: usize,
    viewer_queue_capacity: usize,
    statuses: BTreeMap<String, StatusRecord>,
    events: VecDeque<Envelope>,
    stall_limit: u32,
    viewers: HashMap<ViewerId, ViewerSlot>,
}

#[derive(Debug)]
struct ViewerSlot {
    sender: SyncSender<Envelope>,
    consecutive_drops: u32,
}

impl EventAggregator {
    pub fn new(viewer_queue_capacity: usize) -> Self {
        Self::with_log_capacity(EVENT_LOG_CAPACITY, viewer_queue_capacity)
    }

    pub fn with_log_capacity(log_capacity: usize, viewer_queue_capacity: usize) -> Self {
        Self {
            log_capacity: log_capacity.max(1),
            viewer_queue_capacity: viewer_queue_capacity.max(1),
            statuses: BTreeMap::new(),
            events: VecDeque::with_capacity(log_capacity.max(1)),
            stall_limit: STALLED_VIEWER_DROP_LIMIT,
            viewers: HashMap::new(),
        }
    }

    pub fn with_stall_limit(mut self, stall_limit: u32) -> Self {
        self.stall_limit = stall_limit.max(1);
        self
    }

    pub fn ingest(&mut self, topic: &str, raw: &str) -> Result<IngestReport, IngestError> {
        let kind =
            topics::classify(topic).ok_or_else(|| IngestError::UnknownTopic(topic.to_string()))?;
        let malformed = |source| IngestError::Malformed {
            topic: topic.to_string(),
            source,
        };

        match kind {
            TopicKind::StationStatus => {
                let status = payload::parse_status(raw).map_err(malformed)?;
                self.statuses.insert(status.charger_id.clone(), status);
            }
            TopicKind::StationEvents => {
                payload::parse_event(raw).map_err(malformed)?;
            }
            TopicKind::Transactions => {
                payload::parse_transaction(raw).map_err(malformed)?;
            }
        }

        let payload: Value = serde_json::from_str(raw)
            .map_err(|error| malformed(ParseError::InvalidJson(error.to_string())))?;
        let envelope = Envelope {
            source_topic: topic.to_string(),
            payload,
        };

        let evicted = kind != TopicKind::StationStatus && self.append_to_log(envelope.clone());

        Ok(IngestReport {
            kind,
            evicted,
            fan_out: self.fan_out(&envelope),
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            chargers: self.statuses.clone(),
            events: self.events.iter().cloned().collect(),
        }
    }

    pub fn connect_viewer(&mut self) -> ViewerConnection {
        let (sender, feed) = mpsc::sync_channel(self.viewer_queue_capacity);
        let id = ViewerId::new();
        self.viewers.insert(
            id,
            ViewerSlot {
                sender,
                consecutive_drops: 0,
            },
        );

        ViewerConnection {
            id,
            snapshot: self.snapshot(),
            feed,
        }
    }

    pub fn disconnect_viewer(&mut self, id: ViewerId) -> bool {
        self.viewers.remove(&id).is_some()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    fn append_to_log(&mut self, envelope: Envelope) -> bool {
        self.events.push_back(envelope);
        if self.events.len() > self.log_capacity {
            self.events.pop_front();
            return true;
        }
        false
    }

    // try_send never blocks, so a stalled viewer cannot hold up bus ingestion.
    // A viewer that never drains is dropped once it reaches the stall limit.
    fn fan_out(&mut self, envelope: &Envelope) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut gone = Vec::new();
        let mut stalled = Vec::new();

        for (id, slot) in &mut self.viewers {
            match slot.sender.try_send(envelope.clone()) {
                Ok(()) => {
                    slot.consecutive_drops = 0;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    slot.consecutive_drops += 1;
                    report.dropped += 1;
                    tracing::debug!(viewer_id = %id, "viewer queue full, envelope skipped");
                    if slot.consecutive_drops >= self.stall_limit {
                        stalled.push(*id);
                    }
                }
                Err(TrySendError::Disconnected(_)) => gone.push(*id),
            }
        }

        for id in gone {
            self.viewers.remove(&id);
            report.disconnected += 1;
            tracing::info!(viewer_id = %id, "viewer disconnected");
        }

        for id in stalled {
            self.viewers.remove(&id);
            report.evicted += 1;
            tracing::warn!(
                viewer_id = %id,
                stall_limit = self.stall_limit,
                "viewer stopped draining its queue; evicted"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::models::OperationalState;
    use crate::domain::topics::TopicKind;

    use super::{EVENT_LOG_CAPACITY, EventAggregator, IngestError, ViewerId};

    fn start_event(car: &str, ts: u64) -> String {
        format!(
            r#"{{"actor_id":"A","action":"session_started","car_id":"{car}","charger_id":"A","logical_timestamp":{ts}}}"#
        )
    }

    #[test]
    fn keeps_only_the_last_fifty_events() {
        let mut aggregator = EventAggregator::new(8);

        for index in 1..=51_u64 {
            aggregator
                .ingest("charging/A/events", &start_event(&format!("C{index}"), index))
                .expect("event should be ingested");
        }

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.events.len(), EVENT_LOG_CAPACITY);
        assert_eq!(snapshot.events[0].payload["car_id"], "C2");
        assert_eq!(snapshot.events[49].payload["car_id"], "C51");
    }

    #[test]
    fn reports_eviction_only_on_overflow() {
        let mut aggregator = EventAggregator::with_log_capacity(2, 4);

        let first = aggregator
            .ingest("charging/A/events", &start_event("C1", 1))
            .expect("event should be ingested");
        aggregator
            .ingest("charging/A/events", &start_event("C2", 2))
            .expect("event should be ingested");
        let third = aggregator
            .ingest("charging/A/events", &start_event("C3", 3))
            .expect("event should be ingested");

        assert!(!first.evicted);
        assert!(third.evicted);
    }

    #[test]
    fn latest_status_wins_and_offline_overrides() {
        let mut aggregator = EventAggregator::new(8);

        aggregator
            .ingest(
                "charging/A/status",
                r#"{"charger_id":"A","state":"busy","car_id":"C1","energy_kwh":1.5}"#,
            )
            .expect("status should be ingested");
        aggregator
            .ingest(
                "charging/A/status",
                r#"{"charger_id":"A","state":"offline","car_id":null,"energy_kwh":0}"#,
            )
            .expect("status should be ingested");

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.chargers.len(), 1);
        assert_eq!(snapshot.chargers["A"].state, OperationalState::Offline);
        assert!(snapshot.events.is_empty());
    }

    #[test]
    fn transactions_enter_the_event_log() {
        let mut aggregator = EventAggregator::new(8);

        let report = aggregator
            .ingest(
                "billing/transactions",
                r#"{"car_id":"C1","charger_id":"A","energy_kwh":3.4,"cost":2.55,"logical_timestamp":3}"#,
            )
            .expect("transaction should be ingested");

        assert_eq!(report.kind, TopicKind::Transactions);
        assert_eq!(
            aggregator.snapshot().events[0].source_topic,
            "billing/transactions"
        );
    }

    #[test]
    fn malformed_and_unknown_messages_are_rejected_without_state_change() {
        let mut aggregator = EventAggregator::new(8);

        assert!(matches!(
            aggregator.ingest("charging/A/events", r#"{"action":"session_started"}"#),
            Err(IngestError::Malformed { .. })
        ));
        assert!(matches!(
            aggregator.ingest("weather/today", "{}"),
            Err(IngestError::UnknownTopic(_))
        ));
        assert!(aggregator.snapshot().events.is_empty());
    }

    #[test]
    fn connected_viewers_receive_every_envelope() {
        let mut aggregator = EventAggregator::new(8);
        let first = aggregator.connect_viewer();
        let second = aggregator.connect_viewer();

        let report = aggregator
            .ingest("charging/A/events", &start_event("C1", 1))
            .expect("event should be ingested");

        assert_eq!(report.fan_out.delivered, 2);
        let received = first.feed.try_recv().expect("first viewer gets envelope");
        assert_eq!(received.source_topic, "charging/A/events");
        assert_eq!(received.payload["car_id"], "C1");
        assert!(second.feed.try_recv().is_ok());
    }

    #[test]
    fn new_viewer_gets_snapshot_of_prior_state() {
        let mut aggregator = EventAggregator::new(8);
        aggregator
            .ingest("charging/A/events", &start_event("C1", 1))
            .expect("event should be ingested");

        let viewer = aggregator.connect_viewer();

        assert_eq!(viewer.snapshot.events.len(), 1);
        assert!(viewer.feed.try_recv().is_err());
    }

    #[test]
    fn dropped_viewer_does_not_block_others() {
        let mut aggregator = EventAggregator::new(8);
        let gone = aggregator.connect_viewer();
        let alive = aggregator.connect_viewer();
        drop(gone.feed);

        let report = aggregator
            .ingest("charging/A/events", &start_event("C1", 1))
            .expect("event should be ingested");

        assert_eq!(report.fan_out.delivered, 1);
        assert_eq!(report.fan_out.disconnected, 1);
        assert_eq!(aggregator.viewer_count(), 1);
        assert!(alive.feed.try_recv().is_ok());
    }

    #[test]
    fn full_viewer_queue_skips_only_that_viewer() {
        let mut aggregator = EventAggregator::new(1);
        let stalled = aggregator.connect_viewer();
        let draining = aggregator.connect_viewer();

        aggregator
            .ingest("charging/A/events", &start_event("C1", 1))
            .expect("event should be ingested");
        draining.feed.try_recv().expect("draining viewer gets first");

        let report = aggregator
            .ingest("charging/A/events", &start_event("C2", 2))
            .expect("event should be ingested");

        assert_eq!(report.fan_out.dropped, 1);
        assert_eq!(report.fan_out.delivered, 1);
        assert_eq!(aggregator.viewer_count(), 2);
        assert_eq!(
            stalled.feed.try_recv().expect("stalled keeps oldest").payload["car_id"],
            "C1"
        );
        assert_eq!(
            draining.feed.try_recv().expect("draining gets second").payload["car_id"],
            "C2"
        );
    }

    #[test]
    fn viewer_that_never_drains_is_evicted_at_stall_limit() {
        let mut aggregator = EventAggregator::new(2).with_stall_limit(3);
        let abandoned = aggregator.connect_viewer();
        let active = aggregator.connect_viewer();

        let mut evicted = 0;
        for index in 1..=5_u64 {
            let report = aggregator
                .ingest("charging/A/events", &start_event(&format!("C{index}"), index))
                .expect("event should be ingested");
            evicted += report.fan_out.evicted;
            while active.feed.try_recv().is_ok() {}
        }

        // Two envelopes fill the queue, the next three are skipped.
        assert_eq!(evicted, 1);
        assert_eq!(aggregator.viewer_count(), 1);
        assert_eq!(abandoned.feed.try_iter().count(), 2);
        assert!(abandoned.feed.try_recv().is_err());
    }

    #[test]
    fn draining_resets_the_stall_count() {
        let mut aggregator = EventAggregator::new(1).with_stall_limit(2);
        let slow = aggregator.connect_viewer();

        for index in 1..=10_u64 {
            aggregator
                .ingest("charging/A/events", &start_event(&format!("C{index}"), index))
                .expect("event should be ingested");
            if index % 2 == 0 {
                slow.feed.try_recv().expect("queued envelope should be readable");
            }
        }

        assert_eq!(aggregator.viewer_count(), 1);
    }

    #[test]
    fn disconnect_removes_viewer_and_ids_round_trip_through_text() {
        let mut aggregator = EventAggregator::new(8);
        let viewer = aggregator.connect_viewer();

        let parsed: ViewerId = viewer.id.to_string().parse().expect("id should parse");

        assert!(aggregator.disconnect_viewer(parsed));
        assert!(!aggregator.disconnect_viewer(parsed));
        assert_eq!(aggregator.viewer_count(), 0);
    }
}
