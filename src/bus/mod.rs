//! Per-workflow ordered event pub/sub with bounded replay.
//!
//! One bus exists process-wide; internally it maps workflow ids to
//! independent channels. Publication assigns a gap-free sequence number,
//! appends to a bounded replay ring, and fans out to subscribers through
//! a broadcast channel. A slow subscriber never blocks the publisher: its
//! queue drops oldest entries and the subscriber observes a
//! [`BusItem::Lagged`] marker instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Replay ring capacity per workflow.
pub const REPLAY_RING_CAPACITY: usize = 1024;

/// Outgoing queue capacity per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Closed set of event kinds observable on a workflow stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A phase began.
    #[serde(rename = "phase:start")]
    PhaseStart,
    /// A phase ended; payload carries the findings summary and advance decision.
    #[serde(rename = "phase:complete")]
    PhaseComplete,
    /// An invocation was accepted by the engine.
    #[serde(rename = "invocation:start")]
    InvocationStart,
    /// Incremental invocation progress (per-element fan-out steps).
    #[serde(rename = "invocation:progress")]
    InvocationProgress,
    /// An invocation settled; payload carries the full invocation record.
    #[serde(rename = "invocation:complete")]
    InvocationComplete,
    /// The planner produced a strategy for the current phase.
    #[serde(rename = "planner:strategy")]
    PlannerStrategy,
    /// The restraint evaluator decided a disposition.
    #[serde(rename = "restraint:decision")]
    RestraintDecision,
    /// A human approval is required to continue.
    #[serde(rename = "approval:request")]
    ApprovalRequest,
    /// A pending approval was approved, denied, or expired.
    #[serde(rename = "approval:resolved")]
    ApprovalResolved,
    /// Workflow status changed; terminal statuses end the stream.
    #[serde(rename = "workflow:status")]
    WorkflowStatus,
    /// A recoverable or fatal error was observed.
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PhaseStart => "phase:start",
            Self::PhaseComplete => "phase:complete",
            Self::InvocationStart => "invocation:start",
            Self::InvocationProgress => "invocation:progress",
            Self::InvocationComplete => "invocation:complete",
            Self::PlannerStrategy => "planner:strategy",
            Self::RestraintDecision => "restraint:decision",
            Self::ApprovalRequest => "approval:request",
            Self::ApprovalResolved => "approval:resolved",
            Self::WorkflowStatus => "workflow:status",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// A tagged record on the bus.
///
/// Serializes to the wire format consumed by monitors:
/// `{ type, workflowId, seq, timestamp, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub workflow_id: Uuid,
    /// Monotonic per-workflow sequence number, starting at 1, gap-free.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// One item observed by a subscriber.
#[derive(Debug, Clone)]
pub enum BusItem {
    /// An event, in sequence order.
    Event(Event),
    /// The subscriber's queue overflowed; `n` events were dropped.
    Lagged(u64),
}

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The workflow's channel was closed by a terminal event.
    #[error("event channel for workflow {0} is closed")]
    Closed(Uuid),
}

struct ChannelState {
    next_seq: u64,
    ring: VecDeque<Event>,
    ring_capacity: usize,
    /// `None` once the channel is closed; dropping the sender ends live
    /// subscriber streams after they drain.
    sender: Option<broadcast::Sender<Event>>,
}

impl ChannelState {
    fn new(ring_capacity: usize, queue_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(queue_capacity);
        Self {
            next_seq: 1,
            ring: VecDeque::with_capacity(ring_capacity.min(64)),
            ring_capacity,
            sender: Some(sender),
        }
    }
}

/// Process-wide event bus; one ordered channel per workflow.
pub struct EventBus {
    channels: Mutex<HashMap<Uuid, Arc<Mutex<ChannelState>>>>,
    ring_capacity: usize,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with the default ring and subscriber queue capacities.
    pub fn new() -> Self {
        Self::with_capacities(REPLAY_RING_CAPACITY, SUBSCRIBER_QUEUE_CAPACITY)
    }

    /// Bus with explicit capacities (small values make overflow testable).
    pub fn with_capacities(ring_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    async fn channel(&self, workflow_id: Uuid) -> Arc<Mutex<ChannelState>> {
        let mut channels = self.channels.lock().await;
        Arc::clone(channels.entry(workflow_id).or_insert_with(|| {
            Arc::new(Mutex::new(ChannelState::new(
                self.ring_capacity,
                self.queue_capacity,
            )))
        }))
    }

    /// Publish an event, assigning the next sequence number atomically.
    ///
    /// Returns the assigned sequence number. Never blocks on slow
    /// subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] when a terminal event has already
    /// closed this workflow's channel.
    pub async fn publish(
        &self,
        workflow_id: Uuid,
        kind: EventKind,
        data: serde_json::Value,
    ) -> Result<u64, BusError> {
        let channel = self.channel(workflow_id).await;
        let mut state = channel.lock().await;

        let Some(sender) = &state.sender else {
            return Err(BusError::Closed(workflow_id));
        };

        let seq = state.next_seq;
        let event = Event {
            kind,
            workflow_id,
            seq,
            timestamp: Utc::now(),
            data,
        };

        // A send error only means no live subscriber; the ring still
        // retains the event for replay.
        let _ = sender.send(event.clone());

        state.next_seq = state.next_seq.saturating_add(1);
        if state.ring.len() >= state.ring_capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(event);

        Ok(seq)
    }

    /// Subscribe to a workflow's stream.
    ///
    /// The subscription first yields every event currently in the replay
    /// ring, in order, then live events as they arrive. The replay
    /// snapshot and the live receiver are taken under one lock, so no
    /// event is ever missed or duplicated at the seam.
    pub async fn subscribe(&self, workflow_id: Uuid) -> Subscription {
        let channel = self.channel(workflow_id).await;
        let state = channel.lock().await;
        Subscription {
            replay: state.ring.iter().cloned().collect(),
            live: state.sender.as_ref().map(broadcast::Sender::subscribe),
        }
    }

    /// Close a workflow's channel after its terminal event.
    ///
    /// Live subscribers drain their queues and then end; late joiners
    /// receive only the replay ring. Closing twice is a no-op.
    pub async fn close(&self, workflow_id: Uuid) {
        let channel = self.channel(workflow_id).await;
        let mut state = channel.lock().await;
        state.sender = None;
    }

    /// Drop a workflow's channel entirely (retention sweep).
    pub async fn remove(&self, workflow_id: Uuid) {
        let mut channels = self.channels.lock().await;
        channels.remove(&workflow_id);
    }
}

/// Single-consumer stream of one workflow's events.
pub struct Subscription {
    replay: VecDeque<Event>,
    live: Option<broadcast::Receiver<Event>>,
}

impl Subscription {
    /// Next item, or `None` at end-of-stream.
    ///
    /// Queue overflow on this subscriber surfaces as
    /// [`BusItem::Lagged`] carrying the number of dropped events; the
    /// stream then continues from the oldest retained event.
    pub async fn recv(&mut self) -> Option<BusItem> {
        if let Some(event) = self.replay.pop_front() {
            return Some(BusItem::Event(event));
        }
        let received = match self.live.as_mut() {
            Some(live) => live.recv().await,
            None => return None,
        };
        match received {
            Ok(event) => Some(BusItem::Event(event)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(BusItem::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => {
                self.live = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wid() -> Uuid {
        Uuid::new_v4()
    }

    async fn drain(sub: &mut Subscription, max: usize) -> Vec<BusItem> {
        let mut items = Vec::new();
        for _ in 0..max {
            match sub.recv().await {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    fn seqs(items: &[BusItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|item| match item {
                BusItem::Event(e) => Some(e.seq),
                BusItem::Lagged(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sequence_numbers_gap_free() {
        let bus = EventBus::new();
        let id = wid();

        for expected in 1..=5u64 {
            let seq = bus
                .publish(id, EventKind::InvocationProgress, json!({"n": expected}))
                .await
                .expect("publish");
            assert_eq!(seq, expected);
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_replay_then_live() {
        let bus = EventBus::new();
        let id = wid();

        bus.publish(id, EventKind::PhaseStart, json!({"phase": "recon"}))
            .await
            .expect("publish");
        bus.publish(id, EventKind::InvocationStart, json!({}))
            .await
            .expect("publish");

        let mut sub = bus.subscribe(id).await;

        bus.publish(id, EventKind::InvocationComplete, json!({}))
            .await
            .expect("publish");
        bus.close(id).await;

        let items = drain(&mut sub, 10).await;
        assert_eq!(seqs(&items), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_replay_ring_drops_oldest() {
        let bus = EventBus::with_capacities(4, 256);
        let id = wid();

        for n in 0..10 {
            bus.publish(id, EventKind::InvocationProgress, json!({"n": n}))
                .await
                .expect("publish");
        }
        bus.close(id).await;

        let mut sub = bus.subscribe(id).await;
        let items = drain(&mut sub, 20).await;
        // Only the last 4 of 10 survive in the ring.
        assert_eq!(seqs(&items), vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking_publisher() {
        let bus = EventBus::with_capacities(1024, 8);
        let id = wid();

        let mut sub = bus.subscribe(id).await;

        // Publisher keeps going regardless of the stalled subscriber.
        for n in 0..100u64 {
            bus.publish(id, EventKind::InvocationProgress, json!({"n": n}))
                .await
                .expect("publish never blocks");
        }
        bus.close(id).await;

        let items = drain(&mut sub, 200).await;
        let lagged: u64 = items
            .iter()
            .filter_map(|item| match item {
                BusItem::Lagged(n) => Some(*n),
                BusItem::Event(_) => None,
            })
            .sum();
        assert!(
            lagged >= 100 - 8,
            "expected at least {} dropped, got {lagged}",
            100 - 8
        );

        // Whatever survived is still in order.
        let observed = seqs(&items);
        let mut sorted = observed.clone();
        sorted.sort_unstable();
        assert_eq!(observed, sorted, "surviving events must stay ordered");
        assert_eq!(observed.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_fast_subscriber_unaffected_by_slow_one() {
        let bus = EventBus::with_capacities(1024, 8);
        let id = wid();

        let mut slow = bus.subscribe(id).await;
        let mut fast = bus.subscribe(id).await;

        let mut fast_seen = Vec::new();
        for n in 0..50u64 {
            bus.publish(id, EventKind::InvocationProgress, json!({"n": n}))
                .await
                .expect("publish");
            // Fast subscriber keeps up one-for-one.
            if let Some(BusItem::Event(e)) = fast.recv().await {
                fast_seen.push(e.seq);
            }
        }
        bus.close(id).await;

        assert_eq!(fast_seen, (1..=50).collect::<Vec<u64>>());

        let slow_items = drain(&mut slow, 100).await;
        assert!(
            slow_items
                .iter()
                .any(|item| matches!(item, BusItem::Lagged(_))),
            "slow subscriber should observe a lag marker"
        );
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let bus = EventBus::new();
        let id = wid();

        bus.publish(id, EventKind::WorkflowStatus, json!({"status": "completed"}))
            .await
            .expect("publish");
        bus.close(id).await;

        let result = bus.publish(id, EventKind::Error, json!({})).await;
        assert!(matches!(result, Err(BusError::Closed(_))));
    }

    #[tokio::test]
    async fn test_late_join_after_close_gets_replay_then_end() {
        let bus = EventBus::new();
        let id = wid();

        bus.publish(id, EventKind::PhaseStart, json!({}))
            .await
            .expect("publish");
        bus.publish(id, EventKind::WorkflowStatus, json!({"status": "completed"}))
            .await
            .expect("publish");
        bus.close(id).await;

        let mut sub = bus.subscribe(id).await;
        let items = drain(&mut sub, 10).await;
        assert_eq!(seqs(&items), vec![1, 2]);
        assert!(sub.recv().await.is_none(), "stream must end after replay");
    }

    #[tokio::test]
    async fn test_independent_workflows() {
        let bus = EventBus::new();
        let (a, b) = (wid(), wid());

        bus.publish(a, EventKind::PhaseStart, json!({}))
            .await
            .expect("publish");
        let seq_b = bus
            .publish(b, EventKind::PhaseStart, json!({}))
            .await
            .expect("publish");
        // Each workflow numbers from 1 independently.
        assert_eq!(seq_b, 1);
    }

    #[tokio::test]
    async fn test_wire_format() {
        let bus = EventBus::new();
        let id = wid();
        bus.publish(id, EventKind::PhaseStart, json!({"phase": "recon"}))
            .await
            .expect("publish");
        bus.close(id).await;

        let mut sub = bus.subscribe(id).await;
        let Some(BusItem::Event(event)) = sub.recv().await else {
            panic!("expected event");
        };
        let wire = serde_json::to_value(&event).expect("serialize");
        assert_eq!(wire["type"], "phase:start");
        assert_eq!(wire["seq"], 1);
        assert!(wire["workflowId"].is_string());
        assert!(wire["timestamp"].is_string());
        assert_eq!(wire["data"]["phase"], "recon");
    }

    #[tokio::test]
    async fn test_remove_forgets_history() {
        let bus = EventBus::new();
        let id = wid();
        bus.publish(id, EventKind::PhaseStart, json!({}))
            .await
            .expect("publish");
        bus.remove(id).await;

        // A fresh channel numbers from 1 again.
        let seq = bus
            .publish(id, EventKind::PhaseStart, json!({}))
            .await
            .expect("publish");
        assert_eq!(seq, 1);
    }
}
