//! ProgressBroadcaster - per-task pub/sub for live progress observers.
//!
//! Each task gets one channel entry holding its status, its full event
//! history and the senders of its current subscribers. A subscriber receives
//! the history as a backlog, then live events through a bounded `mpsc`
//! channel.
//!
//! Delivery policy: `publish` never blocks. When a subscriber's channel is
//! full the event is dropped for that subscriber only and counted in
//! `dropped()`. The history is unaffected, so `snapshot` stays complete.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{TaskEvent, TaskId, TaskStatus};

struct TaskChannel {
    status: TaskStatus,
    history: Vec<TaskEvent>,
    subscribers: Vec<mpsc::Sender<TaskEvent>>,
    closed: bool,
}

/// Point-in-time view of a task's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub status: TaskStatus,
    pub events: Vec<TaskEvent>,
}

/// Receiving end of a subscription: backlog first, then live events.
///
/// `recv` returns `None` once the task has reached a terminal status and
/// everything buffered has been consumed.
#[derive(Debug)]
pub struct Subscription {
    backlog: VecDeque<TaskEvent>,
    rx: mpsc::Receiver<TaskEvent>,
}

impl Subscription {
    /// A subscription that replays `events` and then ends.
    pub fn replay(events: Vec<TaskEvent>) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            backlog: events.into(),
            rx,
        }
    }

    pub async fn recv(&mut self) -> Option<TaskEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Drain everything until end-of-stream.
    pub async fn collect(mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

pub struct ProgressBroadcaster {
    buffer: usize,
    channels: Mutex<HashMap<TaskId, TaskChannel>>,
    dropped: AtomicU64,
}

impl ProgressBroadcaster {
    /// `buffer` is the capacity of each subscriber channel (min 1).
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            channels: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<TaskId, TaskChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the channel for a task. Re-opening an existing task is a no-op.
    pub fn open(&self, task_id: TaskId, status: TaskStatus) {
        self.channels().entry(task_id).or_insert_with(|| TaskChannel {
            status,
            history: Vec::new(),
            subscribers: Vec::new(),
            closed: status.is_terminal(),
        });
    }

    /// Subscribe to a task. The backlog and the live channel are taken under
    /// one lock, so no event is missed or duplicated.
    ///
    /// On a closed task the subscription yields the backlog and then ends.
    /// Returns `None` for a task this broadcaster has never seen.
    pub fn subscribe(&self, task_id: TaskId) -> Option<Subscription> {
        let mut channels = self.channels();
        let channel = channels.get_mut(&task_id)?;

        let (tx, rx) = mpsc::channel(self.buffer);
        if !channel.closed {
            channel.subscribers.push(tx);
        }
        debug!(task_id = %task_id, backlog = channel.history.len(), "subscriber attached");
        Some(Subscription {
            backlog: channel.history.iter().cloned().collect(),
            rx,
        })
    }

    /// Record `event` and fan it out to current subscribers.
    pub fn publish(&self, event: &TaskEvent) {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&event.task_id) else {
            debug!(task_id = %event.task_id, "publish for unknown task ignored");
            return;
        };
        if channel.closed {
            debug!(task_id = %event.task_id, kind = %event.kind, "publish after close ignored");
            return;
        }

        channel.history.push(event.clone());
        channel.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %event.task_id, seq = event.seq, "subscriber full; event dropped");
                true
            }
            // Receiver went away.
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Track a non-terminal status change.
    pub fn set_status(&self, task_id: TaskId, status: TaskStatus) {
        if let Some(channel) = self.channels().get_mut(&task_id) {
            if !channel.closed {
                channel.status = status;
            }
        }
    }

    /// Record the terminal status and end every subscriber's stream.
    /// History stays available until `forget`.
    pub fn close(&self, task_id: TaskId, status: TaskStatus) {
        if let Some(channel) = self.channels().get_mut(&task_id) {
            channel.status = status;
            channel.closed = true;
            channel.subscribers.clear();
        }
    }

    pub fn snapshot(&self, task_id: TaskId) -> Option<Snapshot> {
        self.channels().get(&task_id).map(|channel| Snapshot {
            status: channel.status,
            events: channel.history.clone(),
        })
    }

    /// Drop everything held for a task.
    pub fn forget(&self, task_id: TaskId) -> bool {
        self.channels().remove(&task_id).is_some()
    }

    /// Events dropped on full subscriber channels since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
