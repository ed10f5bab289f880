//! Renewal events published to external collaborators.
//!
//! Subscription changes (a user subscribing, or an automatic renewal) are
//! published on a broadcast channel. The payment and analytics collaborators
//! subscribe to it; a [`RenewalHook`] can additionally veto a change before it
//! is committed.
//!
//! ```text
//! ┌──────────────────────┐     ┌──────────────────┐     ┌────────────────┐
//! │ BillingPeriodManager │────>│ RenewalEventBus  │────>│ Collaborators  │
//! │ (subscribe, renew)   │     │   (broadcast)    │     │ (payment, ...) │
//! └──────────────────────┘     └──────────────────┘     └────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{BillingCycle, RenewalType, UsageSnapshot};

/// Default channel capacity for the event bus.
/// Slow receivers start lagging once this many events are buffered.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A subscription change, either committed or about to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalEvent {
    pub user_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub tier_rank: i32,
    pub previous_plan_id: Option<String>,
    pub renewal_type: RenewalType,
    pub billing_cycle: BillingCycle,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Usage of the period being closed, `None` when there was none.
    pub usage_before_renewal: Option<UsageSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// Failure reported by a [`RenewalHook`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HookError {
    pub message: String,
    /// Whether the caller may retry the subscription change.
    pub retry_suggested: bool,
}

impl HookError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_suggested: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_suggested: false,
        }
    }
}

/// Consulted before a subscription change is committed.
///
/// Returning an error aborts the change; nothing is written.
#[async_trait]
pub trait RenewalHook: Send + Sync {
    async fn before_commit(&self, event: &RenewalEvent) -> Result<(), HookError>;
}

/// Broadcast bus for [`RenewalEvent`]s.
#[derive(Debug)]
pub struct RenewalEventBus {
    sender: broadcast::Sender<RenewalEvent>,
    /// Counter for total events published (for metrics)
    events_published: AtomicU64,
    /// Counter for events dropped due to no subscribers
    events_dropped: AtomicU64,
}

impl RenewalEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: RenewalEvent) -> usize {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                // No active subscribers, event is dropped
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// A receiver sees every event published after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<RenewalEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

impl Default for RenewalEventBus {
    fn default() -> Self {
        Self::new()
    }
}
