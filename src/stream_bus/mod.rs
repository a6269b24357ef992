//! Per-run ordered chunk delivery plus scheduler-level lifecycle events.
//!
//! One broadcast channel per run for chunks, so a slow subscriber on run A
//! can never affect delivery to a subscriber on run B; a separate shared
//! channel carries lifecycle events independent of any chunk subscription.

mod hub;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use hub::{EventStream, RunStream};
use hub::{Hub, HubInner};

/// One ordered fragment of a run's output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub run_id: String,
    pub content: String,
    /// Monotonically increasing per run, starting at 0.
    pub chunk_index: u64,
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

/// What a [`RunStream`] subscriber actually observes: chunks in order, with
/// loss made visible rather than silently skipped.
#[derive(Clone, Debug)]
pub enum StreamItem {
    Chunk(StreamChunk),
    /// The subscriber's buffer overflowed; `missed` chunks were not delivered.
    /// Every index the subscriber observes afterward is still strictly greater
    /// than the last one it saw.
    Dropped { missed: u64 },
}

/// Lifecycle notification delivered on the event bus.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueueEventType {
    RunSubmitted,
    RunStarted,
    RunOutput,
    RunCompleted,
    RunFailed,
    RunCancelled,
    RunRetried,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEvent {
    pub event_type: QueueEventType,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl QueueEvent {
    #[must_use]
    pub fn new(event_type: QueueEventType, run_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            run_id: run_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Facade over per-run chunk channels and the shared event channel.
///
/// Cheaply cloneable (an `Arc` internally); the scheduler holds one instance
/// and hands clones to executor-invocation tasks.
#[derive(Clone, Default)]
pub struct StreamBus {
    hub: Hub,
}

impl StreamBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: std::sync::Arc::new(HubInner::default()),
        }
    }

    /// Producer side: publish a chunk. Never blocks beyond the per-run bounded
    /// buffer; a full buffer causes the *next* lagging receiver to observe a
    /// [`StreamItem::Dropped`] marker rather than stalling this call.
    pub fn emit_chunk(&self, chunk: StreamChunk) {
        self.hub.runs.emit(chunk);
    }

    /// Producer side: publish a lifecycle event, best-effort, in submission order.
    pub fn emit_event(&self, event: QueueEvent) {
        self.hub.events.emit(event);
    }

    /// Subscribe to a specific run's chunk stream. A subscriber that registers
    /// mid-run receives only chunks produced after this call — no replay.
    #[must_use]
    pub fn subscribe_run(&self, run_id: &str) -> RunStream {
        RunStream::new(self.hub.runs.subscribe(run_id))
    }

    /// Subscribe to the scheduler-wide lifecycle event stream.
    #[must_use]
    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.hub.events.subscribe())
    }

    /// Drop the channel for a finished run. Called by the scheduler once the
    /// final chunk (`is_final = true`) has been emitted; already-subscribed
    /// receivers still drain any chunks buffered before this call.
    pub fn close_run(&self, run_id: &str) {
        self.hub.runs.close_run(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(run_id: &str, index: u64, is_final: bool) -> StreamChunk {
        StreamChunk {
            run_id: run_id.to_string(),
            content: format!("chunk-{index}"),
            chunk_index: index,
            is_final,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_chunks_in_order_with_final_marker() {
        let bus = StreamBus::new();
        let mut stream = bus.subscribe_run("r1");

        bus.emit_chunk(chunk("r1", 0, false));
        bus.emit_chunk(chunk("r1", 1, false));
        bus.emit_chunk(chunk("r1", 2, true));

        let mut seen_indices = Vec::new();
        let mut saw_final = false;
        for _ in 0..3 {
            match stream.next().await.unwrap() {
                StreamItem::Chunk(c) => {
                    seen_indices.push(c.chunk_index);
                    if c.is_final {
                        saw_final = true;
                    }
                }
                StreamItem::Dropped { .. } => panic!("unexpected drop"),
            }
        }
        assert_eq!(seen_indices, vec![0, 1, 2]);
        assert!(saw_final);
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_chunks() {
        let bus = StreamBus::new();
        bus.emit_chunk(chunk("r1", 0, false));

        let mut stream = bus.subscribe_run("r1");
        bus.emit_chunk(chunk("r1", 1, false));

        let item = stream.next().await.unwrap();
        match item {
            StreamItem::Chunk(c) => assert_eq!(c.chunk_index, 1),
            StreamItem::Dropped { .. } => panic!("unexpected drop"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_sees_dropped_marker_not_a_stall() {
        let bus = StreamBus::new();
        let mut stream = bus.subscribe_run("r1");

        // RUN_CHANNEL_CAPACITY is 64; overflow it well past that without the
        // subscriber consuming anything.
        for i in 0..100 {
            bus.emit_chunk(chunk("r1", i, false));
        }

        let mut last_index: Option<u64> = None;
        let mut saw_drop = false;
        loop {
            match stream.next().await {
                Some(StreamItem::Chunk(c)) => {
                    if let Some(last) = last_index {
                        assert!(c.chunk_index > last);
                    }
                    last_index = Some(c.chunk_index);
                }
                Some(StreamItem::Dropped { missed }) => {
                    assert!(missed > 0);
                    saw_drop = true;
                }
                None => break,
            }
            if last_index == Some(99) {
                break;
            }
        }
        assert!(saw_drop);
    }

    #[tokio::test]
    async fn events_are_independent_of_chunk_subscribers() {
        let bus = StreamBus::new();
        let mut events = bus.subscribe_events();
        bus.emit_event(QueueEvent::new(
            QueueEventType::RunSubmitted,
            "r1",
            serde_json::json!({}),
        ));
        let event = events.next().await.unwrap();
        assert_eq!(event.run_id, "r1");
        assert_eq!(event.event_type, QueueEventType::RunSubmitted);
    }
}
