//! Event types for the Trayve event system
//!
//! Provides the shared event definitions and the EventBus used to push
//! incremental generation progress to subscribers (SSE clients, tests).
//! Events are a notification side-channel only; the database rows remain the
//! source of truth for status polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Trayve event types
///
/// Serialized with a `type` tag for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrayveEvent {
    /// Execution accepted, credits debited, background work queued
    ExecutionStarted {
        execution_id: Uuid,
        project_id: Uuid,
        user_id: String,
        pose_count: usize,
        credits_reserved: i64,
        timestamp: DateTime<Utc>,
    },

    /// One pose produced a final image
    PoseCompleted {
        execution_id: Uuid,
        result_id: Uuid,
        pose_id: String,
        final_image_url: String,
        timestamp: DateTime<Utc>,
    },

    /// One pose failed (try-on produced nothing)
    PoseFailed {
        execution_id: Uuid,
        result_id: Uuid,
        pose_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Execution progress changed
    ExecutionProgress {
        execution_id: Uuid,
        /// Percentage complete (0-100)
        progress: i64,
        completed_poses: usize,
        failed_poses: usize,
        total_poses: usize,
        timestamp: DateTime<Utc>,
    },

    /// Execution finished with at least one pose completed
    ExecutionCompleted {
        execution_id: Uuid,
        completed_poses: usize,
        failed_poses: usize,
        credits_used: i64,
        duration_seconds: u64,
        timestamp: DateTime<Utc>,
    },

    /// Execution finished with every pose failed, or could not be paid for
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Execution cancelled by the merchant
    ExecutionCancelled {
        execution_id: Uuid,
        credits_refunded: i64,
        timestamp: DateTime<Utc>,
    },

    /// Compensating refund applied to the credit ledger
    CreditsRefunded {
        execution_id: Uuid,
        user_id: String,
        amount: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Compensating refund could not be applied and needs manual adjustment
    RefundFailed {
        execution_id: Uuid,
        user_id: String,
        amount: i64,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl TrayveEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            TrayveEvent::ExecutionStarted { .. } => "ExecutionStarted",
            TrayveEvent::PoseCompleted { .. } => "PoseCompleted",
            TrayveEvent::PoseFailed { .. } => "PoseFailed",
            TrayveEvent::ExecutionProgress { .. } => "ExecutionProgress",
            TrayveEvent::ExecutionCompleted { .. } => "ExecutionCompleted",
            TrayveEvent::ExecutionFailed { .. } => "ExecutionFailed",
            TrayveEvent::ExecutionCancelled { .. } => "ExecutionCancelled",
            TrayveEvent::CreditsRefunded { .. } => "CreditsRefunded",
            TrayveEvent::RefundFailed { .. } => "RefundFailed",
        }
    }

    /// Execution the event belongs to
    pub fn execution_id(&self) -> Uuid {
        match self {
            TrayveEvent::ExecutionStarted { execution_id, .. }
            | TrayveEvent::PoseCompleted { execution_id, .. }
            | TrayveEvent::PoseFailed { execution_id, .. }
            | TrayveEvent::ExecutionProgress { execution_id, .. }
            | TrayveEvent::ExecutionCompleted { execution_id, .. }
            | TrayveEvent::ExecutionFailed { execution_id, .. }
            | TrayveEvent::ExecutionCancelled { execution_id, .. }
            | TrayveEvent::CreditsRefunded { execution_id, .. }
            | TrayveEvent::RefundFailed { execution_id, .. } => *execution_id,
        }
    }
}

/// Broadcast bus for TrayveEvents
///
/// Subscribers only receive events emitted after they subscribed. Slow
/// subscribers lose the oldest events once `capacity` is exceeded.
///
/// # Examples
///
/// ```
/// use trayve_common::events::EventBus;
///
/// let event_bus = EventBus::new(100);
/// let _rx = event_bus.subscribe();
/// assert_eq!(event_bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrayveEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<TrayveEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: TrayveEvent,
    ) -> Result<usize, broadcast::error::SendError<TrayveEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: TrayveEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let execution_id = Uuid::new_v4();
        let event = TrayveEvent::ExecutionCancelled {
            execution_id,
            credits_refunded: 2000,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ExecutionCancelled");
        assert_eq!(json["credits_refunded"], 2000);
        assert_eq!(event.event_type(), "ExecutionCancelled");
        assert_eq!(event.execution_id(), execution_id);
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let execution_id = Uuid::new_v4();

        bus.emit(TrayveEvent::ExecutionFailed {
            execution_id,
            error: "all poses failed".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.execution_id(), execution_id);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        let event = TrayveEvent::ExecutionFailed {
            execution_id: Uuid::new_v4(),
            error: "x".to_string(),
            timestamp: Utc::now(),
        };

        assert!(bus.emit(event.clone()).is_err());
        // Lossy variant never fails
        bus.emit_lossy(event);
        assert_eq!(bus.capacity(), 10);
    }
}
