//! Notification channel.
//!
//! Every state change, position confirmation and operation end is published
//! on one tokio broadcast channel. Subscribers that fall behind lose the
//! oldest events (`RecvError::Lagged`), the engine never blocks on them.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::element::{ElementId, GroupId};
use crate::state::ElementState;

/// Event published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// An element changed state.
    ElementStateChanged {
        /// Element concerned.
        element: ElementId,
        /// State before.
        old: ElementState,
        /// State after.
        new: ElementState,
    },
    /// `position` carries the read error text when the read failed.
    /// `forced` marks the final read of an operation, sent even when unchanged.
    ElementPositionChanged {
        /// Element read.
        element: ElementId,
        /// Value read, or the error text.
        position: Result<f64, String>,
        /// Final read of the operation.
        forced: bool,
    },
    /// A group changed state.
    GroupStateChanged {
        /// Group concerned.
        group: GroupId,
        /// State before.
        old: ElementState,
        /// State after.
        new: ElementState,
    },
    /// User vector of a group, once every element was read.
    GroupPositionChanged {
        /// Group concerned.
        group: GroupId,
        /// One value per user slot.
        positions: Vec<f64>,
    },
    /// Last event of a monitored operation.
    GroupOperationEnded {
        /// Group concerned.
        group: GroupId,
    },
}

/// Broadcast sender shared by every session.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Channel keeping at most `capacity` unread events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver; sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Send one event.
    pub fn publish(&self, event: PoolEvent) {
        tracing::trace!(?event, "publish");
        // no subscriber is fine
        let _ = self.tx.send(event);
    }

    /// Send events in order.
    pub fn publish_all(&self, events: impl IntoIterator<Item = PoolEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}
