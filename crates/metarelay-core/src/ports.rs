//! Port traits wiring the runtime to its adapters.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{CloudError, StoreError};
use crate::models::{DispatchRecord, Event, HandlerConfig};

/// Durable per-repo cursor, dedup log, and dispatch-result log.
///
/// All operations are safe under concurrent invocation; the implementation
/// serializes writes internally. Every write is durable before the call
/// returns.
pub trait EventStore: Send + Sync {
    fn get_cursor(&self, repo: &str) -> Result<Option<i64>, StoreError>;

    /// Advances the cursor. Equal values are a no-op; smaller values fail
    /// with [`StoreError::StaleCursor`].
    fn set_cursor(&self, repo: &str, remote_id: i64) -> Result<(), StoreError>;

    /// Atomically claims an event for processing. Returns `true` iff this
    /// call inserted the claim; `false` is a dedup hit.
    fn try_claim(&self, event: &Event) -> Result<bool, StoreError>;

    /// Records the outcome of one handler execution. Idempotent on
    /// `(remote_id, handler_name)`.
    fn record_dispatch(&self, record: &DispatchRecord) -> Result<(), StoreError>;

    fn list_cursors(&self) -> Result<Vec<(String, i64)>, StoreError>;

    /// True when some claimed event of `repo` has `low < remote_id < high`.
    /// Used by the live path to decide whether a gap needs catch-up.
    fn any_claimed_between(&self, repo: &str, low: i64, high: i64) -> Result<bool, StoreError>;
}

/// The remote event source: paginated catch-up plus a live subscription.
#[async_trait]
pub trait CloudEvents: Send + Sync {
    /// Events of `repo` with id strictly greater than `after_id`, ordered
    /// ascending, at most `limit` rows.
    async fn fetch_since(
        &self,
        repo: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, CloudError>;

    /// Opens a live stream of newly ingested events for `repo`, in arrival
    /// order. The stream ends on disconnect; the caller falls back to
    /// catch-up and re-subscribes.
    async fn subscribe(&self, repo: &str) -> Result<EventSubscription, CloudError>;
}

/// A live event stream. Yields `None` on end-of-stream.
pub struct EventSubscription {
    receiver: mpsc::Receiver<Event>,
}

impl EventSubscription {
    pub fn new(receiver: mpsc::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Builds a subscription fed by the returned sender; dropping the
    /// sender ends the stream. Test stubs use this directly.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver })
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

/// Executes one handler for one event, records the outcome, and returns
/// the record.
///
/// Execution problems — launch errors, timeouts, nonzero exits — are
/// outcomes, not errors. The only error a dispatcher can return is a
/// storage failure while recording the result, which is fatal for the
/// daemon.
#[async_trait]
pub trait HandlerDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        handler: &HandlerConfig,
        event: &Event,
    ) -> Result<DispatchRecord, StoreError>;
}
