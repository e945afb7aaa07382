//! A priority queue of items keyed by the time they become ready.
//!
//! Items added in any order come back in non-decreasing ready-time
//! order, never before their ready time, and only when the consumer
//! asks. A single worker task owns the heap and serializes timer and
//! enqueue events; consumers request delivery with a oneshot reply
//! slot, so an item is popped only at the instant it can actually be
//! handed over. A late-arriving item with an earlier ready time
//! therefore always wins while the consumer is busy — a stuck device
//! can't starve whatever was queued behind it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Handle to a timed heap worker. Cheap to clone; dropping every handle
/// (or calling [`TimedHeap::stop`]) shuts the worker down and discards
/// anything still queued.
#[derive(Debug, Clone)]
pub struct TimedHeap<T> {
    cmd_tx: mpsc::UnboundedSender<Command<T>>,
}

enum Command<T> {
    Add { item: T, ready_at: Instant },
    Next { reply: oneshot::Sender<T> },
    Stop,
}

struct Entry<T> {
    item: T,
    ready_at: Instant,
    seq: u64,
}

// BinaryHeap is a max-heap; invert so the earliest ready time (then the
// earliest insertion) pops first.
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then(other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T: Send + 'static> TimedHeap<T> {
    /// Create the heap and spawn its worker task.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(cmd_rx));
        TimedHeap { cmd_tx }
    }

    /// Add an item to be delivered at or after `ready_at`. A ready time
    /// in the past is valid; the item becomes deliverable immediately.
    /// Never blocks on delivery.
    pub fn add(&self, item: T, ready_at: Instant) {
        // If the worker is gone the item is discarded, matching stop().
        let _ = self.cmd_tx.send(Command::Add { item, ready_at });
    }

    /// Wait for the next ready item. Returns `None` once the heap has
    /// been stopped.
    pub async fn next(&self) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Next { reply }).ok()?;
        rx.await.ok()
    }

    /// Shut down the worker. Outstanding items are discarded and any
    /// pending `next()` calls resolve to `None`.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }
}

impl<T: Send + 'static> Default for TimedHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker<T>(mut cmd_rx: mpsc::UnboundedReceiver<Command<T>>) {
    let mut heap: BinaryHeap<Entry<T>> = BinaryHeap::new();
    let mut waiting: VecDeque<oneshot::Sender<T>> = VecDeque::new();
    let mut seq = 0u64;

    loop {
        // Only arm the timer when there's both an item and a consumer;
        // otherwise new commands are the only thing worth waking for.
        let next_ready = if waiting.is_empty() {
            None
        } else {
            heap.peek().map(|e| e.ready_at)
        };

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Add { item, ready_at }) => {
                        heap.push(Entry { item, ready_at, seq });
                        seq += 1;
                    }
                    Some(Command::Next { reply }) => {
                        waiting.push_back(reply);
                    }
                    Some(Command::Stop) | None => return,
                }
            }
            _ = sleep_until_opt(next_ready), if next_ready.is_some() => {
                let entry = heap.pop().expect("timer armed with empty heap");
                // Skip consumers that gave up waiting. If every waiter
                // is gone, the item goes back on the heap (keeping its
                // original position) until someone asks again.
                let mut item = Some(entry.item);
                let mut delivered = false;
                while let Some(reply) = waiting.pop_front() {
                    match reply.send(item.take().expect("item present while looping")) {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(returned) => item = Some(returned),
                    }
                }
                if !delivered {
                    heap.push(Entry { item: item.expect("item present when undelivered"), ready_at: entry.ready_at, seq: entry.seq });
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}
