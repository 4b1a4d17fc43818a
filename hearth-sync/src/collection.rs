//! Public handle to one subscription: synchronous reads from the replica,
//! mutations through the coordinator, status from the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::context::RequestContext;
use crate::feed::{Cursor, RowKey, TxMarker};
use crate::mutation::{Change, MutationCoordinator, MutationError, Reconciliation};
use crate::policy::Table;
use crate::replica::{Replica, ReplicaEvent, ReplicaRow};
use crate::stream::{ChangeStream, CloseReason, StreamStatus, SubscriptionId};

struct Inner {
    replica: Arc<Replica>,
    stream: ChangeStream,
    coordinator: MutationCoordinator,
    row_ttl: Option<Duration>,
}

/// A live, row-filtered view of one table. Cheap to clone.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Inner>,
}

impl Collection {
    pub(crate) fn new(
        replica: Arc<Replica>,
        stream: ChangeStream,
        coordinator: MutationCoordinator,
        row_ttl: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                replica,
                stream,
                coordinator,
                row_ttl,
            }),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.inner.stream.subscription()
    }

    pub fn table(&self) -> Table {
        self.inner.replica.table()
    }

    pub fn get(&self, key: &RowKey) -> Option<ReplicaRow> {
        self.inner.replica.get(key)
    }

    pub fn list(&self, filter: Option<&dyn Fn(&ReplicaRow) -> bool>) -> Vec<ReplicaRow> {
        self.inner.replica.list(filter)
    }

    pub fn len(&self) -> usize {
        self.inner.replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.replica.is_empty()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.inner.replica.cursor()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.inner.replica.is_up_to_date()
    }

    /// Applied, optimistic, reconciled and rolled-back rows, in order.
    pub fn changes(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.inner.replica.subscribe()
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.stream.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<StreamStatus> {
        self.inner.stream.watch()
    }

    /// Apply `change` optimistically and wait until the stream confirms it.
    pub async fn mutate(
        &self,
        ctx: &RequestContext,
        key: impl Into<RowKey>,
        change: Change,
    ) -> Result<TxMarker, MutationError> {
        self.inner.coordinator.mutate(ctx, key.into(), change).await
    }

    /// Like [`mutate`](Self::mutate) but returns as soon as the server has
    /// accepted the write.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        key: impl Into<RowKey>,
        change: Change,
    ) -> Result<Reconciliation, MutationError> {
        self.inner.coordinator.submit(ctx, key.into(), change).await
    }

    /// Stop syncing. Reads keep returning the last state; no further
    /// stream events are applied once this returns.
    pub fn unsubscribe(&self) -> bool {
        self.inner.stream.close(CloseReason::Unsubscribed)
    }

    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        self.inner.stream.close(reason)
    }

    pub(crate) fn retry_now(&self) -> bool {
        self.inner.stream.retry_now()
    }

    /// Evict idle confirmed rows when a row TTL is configured.
    pub fn gc(&self) -> usize {
        self.inner
            .row_ttl
            .map_or(0, |ttl| self.inner.replica.gc(ttl))
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.id())
            .field("table", &self.table())
            .field("rows", &self.len())
            .field("state", &self.status().state)
            .finish()
    }
}
