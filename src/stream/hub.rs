// =============================================================================
// Event Hub — per-process fan-out of stream events
// =============================================================================
//
// Live subscribers (WebSocket, SSE) read from a `tokio::sync::broadcast`
// channel. Long-poll clients read from a bounded, sequenced replay log and
// park on a `Notify` until something newer than their cursor arrives.
//
// The log is a convenience for pollers, not a durability layer: a cursor
// that has fallen off the front simply resumes at the oldest retained event.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};

use super::events::StreamEvent;

const CHANNEL_CAPACITY: usize = 256;

/// An event tagged with its position in the hub's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced {
    pub seq: u64,
    pub event: StreamEvent,
}

/// Response body of one long-poll round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollBatch {
    /// Cursor to send on the next poll.
    pub cursor: u64,
    pub events: Vec<StreamEvent>,
}

struct ReplayLog {
    entries: VecDeque<Sequenced>,
    next_seq: u64,
}

pub struct EventHub {
    tx: broadcast::Sender<Sequenced>,
    log: RwLock<ReplayLog>,
    capacity: usize,
    notify: Notify,
}

impl EventHub {
    pub fn new(replay_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let capacity = replay_capacity.max(1);
        Self {
            tx,
            log: RwLock::new(ReplayLog {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Publish an event to every live subscriber and the replay log.
    /// Returns the sequence number assigned to it.
    pub fn publish(&self, event: StreamEvent) -> u64 {
        let item = {
            let mut log = self.log.write();
            let item = Sequenced {
                seq: log.next_seq,
                event,
            };
            log.next_seq += 1;
            log.entries.push_back(item.clone());
            while log.entries.len() > self.capacity {
                log.entries.pop_front();
            }
            item
        };
        let seq = item.seq;

        // No receivers is fine; pollers still see the log.
        let _ = self.tx.send(item);
        self.notify.notify_waiters();
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Sequenced> {
        self.tx.subscribe()
    }

    /// Sequence number of the newest published event (0 when none yet).
    pub fn latest_seq(&self) -> u64 {
        self.log.read().next_seq - 1
    }

    /// Events strictly after `cursor`, and the cursor to resume from.
    pub fn since(&self, cursor: u64) -> PollBatch {
        let log = self.log.read();
        let events: Vec<StreamEvent> = log
            .entries
            .iter()
            .filter(|s| s.seq > cursor)
            .map(|s| s.event.clone())
            .collect();
        PollBatch {
            cursor: log.next_seq - 1,
            events,
        }
    }

    /// Long-poll: return immediately if anything is newer than `cursor`,
    /// otherwise wait up to `wait` for the next publish.
    pub async fn wait_since(&self, cursor: u64, wait: Duration) -> PollBatch {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let batch = self.since(cursor);
        if !batch.events.is_empty() || wait.is_zero() {
            return batch;
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.since(cursor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
