//! In-process status broadcaster backed by a `tokio::sync::broadcast` channel.
//!
//! Publishing never blocks and never fails: with no subscribers the event
//! is dropped, and slow subscribers skip ahead with a warning instead of
//! back-pressuring the dispatcher or monitors.
//!
//! The WebSocket layer holds a single [`StatusBroadcaster::subscribe_all`]
//! receiver and applies each client's job filter itself, so one socket
//! scoped to a job costs no extra channel receiver. [`JobSubscription`]
//! is for in-process consumers that follow one job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use forgefleet_core::types::DbId;
use forgefleet_db::models::job::Job;

// ---------------------------------------------------------------------------
// StatusEvent
// ---------------------------------------------------------------------------

/// A message pushed to status subscribers.
///
/// Serialized with a `type` discriminator matching
/// [`forgefleet_core::job_events`]: `job_update` carries the full record,
/// `job_progress` carries an ephemeral percentage and preview reference.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    JobUpdate {
        job: Job,
        timestamp: DateTime<Utc>,
    },
    JobProgress {
        job_id: DbId,
        percent: i16,
        preview: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl StatusEvent {
    /// The job this event refers to.
    pub fn job_id(&self) -> DbId {
        match self {
            StatusEvent::JobUpdate { job, .. } => job.id,
            StatusEvent::JobProgress { job_id, .. } => *job_id,
        }
    }

    /// The `type` discriminator this event serializes with.
    pub fn message_type(&self) -> &'static str {
        match self {
            StatusEvent::JobUpdate { .. } => forgefleet_core::job_events::MSG_TYPE_JOB_UPDATE,
            StatusEvent::JobProgress { .. } => forgefleet_core::job_events::MSG_TYPE_JOB_PROGRESS,
        }
    }
}

// ---------------------------------------------------------------------------
// StatusBroadcaster
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out hub for job status events.
///
/// Shared via `Arc<StatusBroadcaster>` between the engine (publisher) and
/// the WebSocket forwarder (subscriber).
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    /// Create a broadcaster with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish the current state of a job record.
    pub fn publish_job_update(&self, job: &Job) {
        self.publish(StatusEvent::JobUpdate {
            job: job.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Publish a progress tick. Not persisted; may be synthetic.
    pub fn publish_progress(&self, job_id: DbId, percent: i16, preview: Option<String>) {
        self.publish(StatusEvent::JobProgress {
            job_id,
            percent,
            preview,
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: StatusEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events for a single job.
    ///
    /// Every subscription is a full channel receiver that discards other
    /// jobs' events, so socket clients are scoped by the WebSocket
    /// manager instead.
    pub fn subscribe_job(&self, job_id: DbId) -> JobSubscription {
        JobSubscription {
            job_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// JobSubscription
// ---------------------------------------------------------------------------

/// A receiver that only yields events for one job.
pub struct JobSubscription {
    job_id: DbId,
    receiver: broadcast::Receiver<StatusEvent>,
}

impl JobSubscription {
    pub fn job_id(&self) -> DbId {
        self.job_id
    }

    /// Wait for the next event for this job.
    ///
    /// Returns `None` once the broadcaster is dropped. Lag is logged and
    /// skipped.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.job_id() == self.job_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        job_id = self.job_id,
                        skipped = n,
                        "Job subscription lagged, some status events were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
