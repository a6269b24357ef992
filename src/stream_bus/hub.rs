//! Broadcast-channel plumbing behind [`super::StreamBus`]: one `tokio::sync::broadcast`
//! channel per run for chunks, one shared channel for lifecycle events.
//!
//! `RecvError::Lagged(n)` is translated into an explicit [`super::StreamItem::Dropped`]
//! marker, so the *subscriber* sees the loss rather than only an aggregate metric.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use super::{QueueEvent, StreamChunk, StreamItem};

const RUN_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
pub(super) struct RunChannels {
    senders: Mutex<FxHashMap<String, broadcast::Sender<StreamChunk>>>,
}

impl RunChannels {
    fn sender_for(&self, run_id: &str) -> broadcast::Sender<StreamChunk> {
        let mut senders = self.senders.lock();
        senders
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(RUN_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub(super) fn emit(&self, chunk: StreamChunk) {
        let sender = self.sender_for(&chunk.run_id);
        // No receivers yet is not an error: chunks produced before any
        // subscriber registers are simply not replayed (per contract).
        let _ = sender.send(chunk);
    }

    pub(super) fn subscribe(&self, run_id: &str) -> broadcast::Receiver<StreamChunk> {
        self.sender_for(run_id).subscribe()
    }

    /// Drop the sender for a finished run so the channel map does not grow
    /// without bound across a long-lived process. Receivers already
    /// subscribed keep draining any buffered chunks first.
    pub(super) fn close_run(&self, run_id: &str) {
        self.senders.lock().remove(run_id);
    }
}

/// A per-run stream of [`StreamItem`]s: chunks in order, with lag made visible
/// via [`StreamItem::Dropped`] rather than silently skipped.
pub struct RunStream {
    receiver: broadcast::Receiver<StreamChunk>,
}

impl RunStream {
    pub(super) fn new(receiver: broadcast::Receiver<StreamChunk>) -> Self {
        Self { receiver }
    }

    /// Await the next item. Returns `None` once the run's channel has closed
    /// and every buffered chunk has been drained.
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            match self.receiver.recv().await {
                Ok(chunk) => return Some(StreamItem::Chunk(chunk)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "stream subscriber lagged; chunks dropped");
                    return Some(StreamItem::Dropped { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A stream of [`QueueEvent`]s, independent of any particular run's chunk stream.
pub struct EventStream {
    receiver: broadcast::Receiver<QueueEvent>,
}

impl EventStream {
    pub(super) fn new(receiver: broadcast::Receiver<QueueEvent>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<QueueEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged; events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub(super) struct EventChannel {
    sender: broadcast::Sender<QueueEvent>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self {
            sender: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }
}

impl EventChannel {
    pub(super) fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

/// The two channel groups a [`super::StreamBus`] owns, wrapped in `Arc` so the
/// facade can be cheaply cloned into the scheduler's dispatch task.
#[derive(Default)]
pub(super) struct HubInner {
    pub(super) runs: RunChannels,
    pub(super) events: EventChannel,
}

pub(super) type Hub = Arc<HubInner>;
