//! Change notifications for real-time subscribers.
//!
//! The delivery layer (websockets, SSE, a message bus) lives outside this
//! crate; it plugs in through [`ChangePublisher`].

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::model::{EntityId, VoteCounts};

/// Something subscribers care about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    VoteChanged {
        entity_id: EntityId,
        upvotes: u64,
        downvotes: u64,
    },
    ScoreChanged {
        entity_id: EntityId,
        total_score: f64,
    },
}

impl ChangeEvent {
    #[must_use]
    pub const fn vote_changed(entity_id: EntityId, counts: VoteCounts) -> Self {
        Self::VoteChanged {
            entity_id,
            upvotes: counts.upvotes,
            downvotes: counts.downvotes,
        }
    }

    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        match self {
            Self::VoteChanged { entity_id, .. } | Self::ScoreChanged { entity_id, .. } => {
                *entity_id
            }
        }
    }
}

/// Outbound publish seam. Publishing never fails the caller.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// In-process fan-out over `std::sync::mpsc` channels.
///
/// Subscribers that hang up are pruned on the next publish.
#[derive(Debug, Default)]
pub struct ChannelPublisher {
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
}

impl ChannelPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map_or_else(|poisoned| poisoned.into_inner().len(), |s| s.len())
    }
}

impl ChangePublisher for ChannelPublisher {
    fn publish(&self, event: ChangeEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("subscriber list lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Writes every event to the log. Used by the CLI, which has no subscribers.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl ChangePublisher for LogPublisher {
    fn publish(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::VoteChanged {
                entity_id,
                upvotes,
                downvotes,
            } => info!(entity_id, upvotes, downvotes, "vote changed"),
            ChangeEvent::ScoreChanged {
                entity_id,
                total_score,
            } => info!(entity_id, total_score, "score changed"),
        }
    }
}
