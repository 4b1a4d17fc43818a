//! Local replica of one subscription.
//!
//! ```text
//!   change stream ──apply()──►┌──────────────────────────┐◄──begin()/rollback()── coordinator
//!                             │ key ─► confirmed (+ tx)  │◄──acknowledge(tx)───┘
//!                             │     └► overlay (optimistic, awaiting tx)
//!   readers ◄──get()/list()───└──────────────────────────┘
//! ```
//!
//! Every write goes through one `RwLock`, so stream-applied and optimistic
//! writes to the same key are serialized. Reads take the shared side and
//! never wait on I/O.
//!
//! A key with an overlay shows the overlay. Stream events for that key
//! still update the confirmed row underneath, and the overlay is only
//! discarded by an event whose transaction marker reaches the one the
//! server returned for the pending mutation.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use crate::feed::{ChangeEvent, ChangeOp, Cursor, RowKey, TxMarker};
use crate::mutation::Change;
use crate::policy::Table;
use crate::store::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Confirmed,
    Optimistic,
}

/// A row as readers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaRow {
    pub key: RowKey,
    pub data: Row,
    pub sync_state: SyncState,
}

/// What happened to the replica, in apply order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    Applied(ChangeEvent),
    Optimistic { key: RowKey },
    Reconciled { key: RowKey, tx: TxMarker },
    RolledBack { key: RowKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Cursor at or behind the last applied one.
    Duplicate,
    /// Confirmed state updated underneath a pending overlay.
    Deferred,
    /// The event confirmed a pending overlay.
    Reconciled,
    Closed,
}

/// Result of recording the server's marker for a pending mutation.
#[derive(Debug)]
pub enum Acknowledgement {
    /// Resolves once the stream confirms the marker.
    Pending(oneshot::Receiver<()>),
    /// The stream had already delivered the marker.
    AlreadyConfirmed,
    Closed,
}

/// Replica has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaClosed;

/// Overlay state as it was before a mutation began, for rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorOverlay(Option<(Option<Row>, Option<TxMarker>)>);

#[derive(Debug)]
struct Overlay {
    /// `None` is an optimistic delete.
    value: Option<Row>,
    awaiting: Option<TxMarker>,
    waiter: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Entry {
    confirmed: Option<Row>,
    confirmed_tx: Option<TxMarker>,
    overlay: Option<Overlay>,
    touched_at: Instant,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            confirmed: None,
            confirmed_tx: None,
            overlay: None,
            touched_at: now,
        }
    }

    fn visible(&self) -> Option<(&Row, SyncState)> {
        match &self.overlay {
            Some(overlay) => overlay.value.as_ref().map(|row| (row, SyncState::Optimistic)),
            None => self.confirmed.as_ref().map(|row| (row, SyncState::Confirmed)),
        }
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.overlay.is_none()
    }

    fn confirms(&self, tx: TxMarker) -> bool {
        self.confirmed_tx.is_some_and(|confirmed| confirmed >= tx)
    }
}

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<RowKey, Entry>,
    cursor: Option<Cursor>,
    up_to_date: bool,
    closed: bool,
}

/// In-memory keyed store kept consistent with one change stream.
#[derive(Debug)]
pub struct Replica {
    table: Table,
    state: RwLock<State>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl Replica {
    pub fn new(table: Table, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            table,
            state: RwLock::new(State::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ReplicaEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn get(&self, key: &RowKey) -> Option<ReplicaRow> {
        let state = self.read();
        let (data, sync_state) = state.rows.get(key)?.visible()?;
        Some(ReplicaRow {
            key: key.clone(),
            data: data.clone(),
            sync_state,
        })
    }

    /// Visible rows in key order, optionally filtered.
    pub fn list(&self, filter: Option<&dyn Fn(&ReplicaRow) -> bool>) -> Vec<ReplicaRow> {
        let state = self.read();
        state
            .rows
            .iter()
            .filter_map(|(key, entry)| {
                entry.visible().map(|(data, sync_state)| ReplicaRow {
                    key: key.clone(),
                    data: data.clone(),
                    sync_state,
                })
            })
            .filter(|row| filter.map_or(true, |f| f(row)))
            .collect()
    }

    /// Number of visible rows.
    pub fn len(&self) -> usize {
        self.read()
            .rows
            .values()
            .filter(|entry| entry.visible().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resume point: last applied cursor.
    pub fn cursor(&self) -> Option<Cursor> {
        self.read().cursor
    }

    pub fn is_up_to_date(&self) -> bool {
        self.read().up_to_date
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    /// Apply one stream event. Only the change stream calls this.
    pub(crate) fn apply(&self, event: &ChangeEvent) -> ApplyOutcome {
        let mut state = self.write();
        if state.closed {
            return ApplyOutcome::Closed;
        }
        if state.cursor.is_some_and(|last| event.cursor <= last) {
            return ApplyOutcome::Duplicate;
        }
        state.cursor = Some(event.cursor);

        let now = Instant::now();
        let entry = state
            .rows
            .entry(event.key.clone())
            .or_insert_with(|| Entry::new(now));
        entry.touched_at = now;
        entry.confirmed = match event.op {
            ChangeOp::Delete => None,
            ChangeOp::Insert | ChangeOp::Update => event.row.clone(),
        };
        if event.tx.is_some() {
            entry.confirmed_tx = event.tx;
        }

        let outcome = match &entry.overlay {
            None => ApplyOutcome::Applied,
            Some(overlay) => match (overlay.awaiting, event.tx) {
                (Some(awaiting), Some(tx)) if tx >= awaiting => ApplyOutcome::Reconciled,
                _ => ApplyOutcome::Deferred,
            },
        };

        let mut reconciled = None;
        if outcome == ApplyOutcome::Reconciled {
            if let Some(mut overlay) = entry.overlay.take() {
                if let Some(waiter) = overlay.waiter.take() {
                    let _ = waiter.send(());
                }
                reconciled = overlay.awaiting;
            }
        }
        if entry.is_empty() {
            state.rows.remove(&event.key);
        }

        log::trace!(
            "{} {:?} {} @{} -> {:?}",
            self.table,
            event.op,
            event.key,
            event.cursor,
            outcome
        );
        self.publish(ReplicaEvent::Applied(event.clone()));
        if let Some(tx) = reconciled {
            self.publish(ReplicaEvent::Reconciled {
                key: event.key.clone(),
                tx,
            });
        }
        outcome
    }

    /// The server has sent everything up to `cursor`.
    pub(crate) fn note_up_to_date(&self, cursor: Cursor) {
        let mut state = self.write();
        if state.closed {
            return;
        }
        state.up_to_date = true;
        if state.cursor.map_or(true, |last| cursor > last) {
            state.cursor = Some(cursor);
        }
    }

    /// Apply `change` to `key` as an optimistic overlay. Returns what the
    /// overlay looked like before, for [`rollback`](Self::rollback).
    pub(crate) fn begin(&self, key: &RowKey, change: &Change) -> Result<PriorOverlay, ReplicaClosed> {
        let mut state = self.write();
        if state.closed {
            return Err(ReplicaClosed);
        }
        let now = Instant::now();
        let entry = state
            .rows
            .entry(key.clone())
            .or_insert_with(|| Entry::new(now));
        entry.touched_at = now;

        let prior = PriorOverlay(
            entry
                .overlay
                .as_ref()
                .map(|overlay| (overlay.value.clone(), overlay.awaiting)),
        );
        let value = match change {
            Change::Insert(row) => Some(row.clone()),
            Change::Update(patch) => {
                let mut row = entry.visible().map(|(row, _)| row.clone()).unwrap_or_default();
                row.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(row)
            }
            Change::Delete => None,
        };
        entry.overlay = Some(Overlay {
            value,
            awaiting: None,
            waiter: None,
        });
        self.publish(ReplicaEvent::Optimistic { key: key.clone() });
        Ok(prior)
    }

    /// Record the server's marker for the overlay on `key`.
    pub(crate) fn acknowledge(&self, key: &RowKey, tx: TxMarker) -> Acknowledgement {
        let mut state = self.write();
        if state.closed {
            return Acknowledgement::Closed;
        }
        let Some(entry) = state.rows.get_mut(key) else {
            return Acknowledgement::AlreadyConfirmed;
        };
        if entry.confirms(tx) {
            entry.overlay = None;
            if entry.is_empty() {
                state.rows.remove(key);
            }
            self.publish(ReplicaEvent::Reconciled {
                key: key.clone(),
                tx,
            });
            return Acknowledgement::AlreadyConfirmed;
        }
        match entry.overlay.as_mut() {
            Some(overlay) => {
                let (waiter, rx) = oneshot::channel();
                overlay.awaiting = Some(tx);
                overlay.waiter = Some(waiter);
                Acknowledgement::Pending(rx)
            }
            None => Acknowledgement::AlreadyConfirmed,
        }
    }

    /// Restore the overlay captured by [`begin`](Self::begin).
    pub(crate) fn rollback(&self, key: &RowKey, prior: PriorOverlay) {
        let mut state = self.write();
        let Some(entry) = state.rows.get_mut(key) else {
            return;
        };
        // A restored overlay whose marker the stream delivered meanwhile is
        // already confirmed.
        let mut reconciled = None;
        entry.overlay = match prior.0 {
            Some((_, Some(tx))) if entry.confirms(tx) => {
                reconciled = Some(tx);
                None
            }
            prior => prior.map(|(value, awaiting)| Overlay {
                value,
                awaiting,
                waiter: None,
            }),
        };
        if entry.is_empty() {
            state.rows.remove(key);
        }
        self.publish(ReplicaEvent::RolledBack { key: key.clone() });
        if let Some(tx) = reconciled {
            self.publish(ReplicaEvent::Reconciled {
                key: key.clone(),
                tx,
            });
        }
    }

    /// Stop accepting writes and cancel every reconciliation wait.
    /// Returns whether this call closed the replica.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.write();
        if state.closed {
            return false;
        }
        state.closed = true;
        for entry in state.rows.values_mut() {
            if let Some(overlay) = entry.overlay.as_mut() {
                overlay.waiter = None;
            }
        }
        true
    }

    /// Evict confirmed rows untouched for `ttl`. Rows with an overlay stay.
    pub fn gc(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.write();
        let before = state.rows.len();
        state.rows.retain(|_, entry| {
            entry.overlay.is_some() || now.duration_since(entry.touched_at) < ttl
        });
        let evicted = before - state.rows.len();
        if evicted > 0 {
            log::debug!("{}: evicted {evicted} idle rows", self.table);
        }
        evicted
    }
}
