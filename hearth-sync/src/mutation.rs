//! Optimistic mutations.
//!
//! Per key, one mutation at a time:
//!
//! ```text
//!   lock key (FIFO) ─► overlay row ─► send ──Ok(tx)──► await stream marker >= tx ─► unlock
//!                                      │ rejected            │ timeout: row stays optimistic
//!                                      ▼                     │ replica closed: Cancelled
//!                                   rollback                 ▼
//! ```
//!
//! A send that cannot reach the server keeps the overlay and is retried
//! when the change stream reconnects or after a backoff delay, whichever
//! comes first. Rejections are never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex as KeyLock, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::backoff::{Backoff, Jitter};
use crate::config::{BackoffConfig, MutationConfig};
use crate::context::RequestContext;
use crate::feed::{RowKey, TxMarker};
use crate::policy::Table;
use crate::replica::{Acknowledgement, Replica};
use crate::store::Row;
use crate::stream::StreamStatus;

/// A write to one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "row", rename_all = "snake_case")]
pub enum Change {
    Insert(Row),
    /// Fields to merge into the current row.
    Update(Row),
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub table: Table,
    pub key: RowKey,
    pub change: Change,
}

/// What the server said about a send.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Server side of mutations: accept and return the commit marker.
#[async_trait]
pub trait MutationSink: Send + Sync {
    async fn send(&self, ctx: &RequestContext, mutation: &Mutation) -> Result<TxMarker, SendError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    /// Rolled back.
    #[error("mutation on {key} rejected: {reason}")]
    Rejected { key: RowKey, reason: String },
    /// Rolled back after the send retry limit.
    #[error("mutation on {key} not delivered after {attempts} attempts: {reason}")]
    Unavailable {
        key: RowKey,
        attempts: u32,
        reason: String,
    },
    /// Accepted but not yet seen on the stream; the row stays optimistic.
    #[error("mutation on {key} accepted as {tx} but not confirmed in time")]
    ReconciliationTimeout { key: RowKey, tx: TxMarker },
    #[error("mutation on {key} cancelled by shutdown")]
    Cancelled { key: RowKey },
}

impl MutationError {
    pub fn key(&self) -> &RowKey {
        match self {
            Self::Rejected { key, .. }
            | Self::Unavailable { key, .. }
            | Self::ReconciliationTimeout { key, .. }
            | Self::Cancelled { key } => key,
        }
    }

    /// Whether the optimistic row was removed.
    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Unavailable { .. })
    }
}

/// Pending confirmation of an accepted mutation. Holds the key's queue
/// slot until it is awaited or dropped.
#[derive(Debug)]
pub struct Reconciliation {
    key: RowKey,
    tx: TxMarker,
    pending: Option<oneshot::Receiver<()>>,
    deadline: Instant,
    cid: Uuid,
    _slot: OwnedMutexGuard<()>,
}

impl Reconciliation {
    pub fn tx(&self) -> TxMarker {
        self.tx
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn is_confirmed(&self) -> bool {
        self.pending.is_none()
    }

    /// Wait for the stream to confirm the marker.
    pub async fn wait(self) -> Result<TxMarker, MutationError> {
        let Some(pending) = self.pending else {
            return Ok(self.tx);
        };
        match tokio::time::timeout_at(self.deadline, pending).await {
            Ok(Ok(())) => {
                log::debug!("[cid={}] {} reconciled at {}", self.cid, self.key, self.tx);
                Ok(self.tx)
            }
            Ok(Err(_)) => Err(MutationError::Cancelled { key: self.key }),
            Err(_) => {
                log::warn!(
                    "[cid={}] {} accepted as {} but not confirmed before timeout",
                    self.cid,
                    self.key,
                    self.tx
                );
                Err(MutationError::ReconciliationTimeout {
                    key: self.key,
                    tx: self.tx,
                })
            }
        }
    }
}

/// Applies, sends and reconciles mutations for one replica.
pub struct MutationCoordinator {
    table: Table,
    replica: Arc<Replica>,
    sink: Arc<dyn MutationSink>,
    config: MutationConfig,
    backoff: BackoffConfig,
    jitter: Arc<dyn Jitter>,
    stream_status: watch::Receiver<StreamStatus>,
    slots: Mutex<HashMap<RowKey, Arc<KeyLock<()>>>>,
}

impl MutationCoordinator {
    pub fn new(
        replica: Arc<Replica>,
        sink: Arc<dyn MutationSink>,
        config: MutationConfig,
        backoff: BackoffConfig,
        jitter: Arc<dyn Jitter>,
        stream_status: watch::Receiver<StreamStatus>,
    ) -> Self {
        Self {
            table: replica.table(),
            replica,
            sink,
            config,
            backoff: BackoffConfig {
                max_attempts: None,
                ..backoff
            },
            jitter,
            stream_status,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Apply, send, and return once the server has accepted the write.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        key: RowKey,
        change: Change,
    ) -> Result<Reconciliation, MutationError> {
        let slot = self.acquire(&key).await;
        let cid = ctx.correlation_id();

        let prior = self
            .replica
            .begin(&key, &change)
            .map_err(|_| MutationError::Cancelled { key: key.clone() })?;
        let mutation = Mutation {
            table: self.table,
            key,
            change,
        };

        let tx = match self.send(ctx, &mutation).await {
            Ok(tx) => tx,
            Err(error) => {
                self.replica.rollback(&mutation.key, prior);
                log::warn!("[cid={cid}] {}: {error}; rolled back", self.table);
                return Err(error);
            }
        };
        log::debug!("[cid={cid}] {}/{} accepted as {tx}", self.table, mutation.key);

        let pending = match self.replica.acknowledge(&mutation.key, tx) {
            Acknowledgement::Pending(rx) => Some(rx),
            Acknowledgement::AlreadyConfirmed => None,
            Acknowledgement::Closed => {
                return Err(MutationError::Cancelled { key: mutation.key });
            }
        };
        Ok(Reconciliation {
            key: mutation.key,
            tx,
            pending,
            deadline: Instant::now() + self.config.reconcile_timeout(),
            cid,
            _slot: slot,
        })
    }

    /// [`submit`](Self::submit), then wait for reconciliation.
    pub async fn mutate(
        &self,
        ctx: &RequestContext,
        key: RowKey,
        change: Change,
    ) -> Result<TxMarker, MutationError> {
        self.submit(ctx, key, change).await?.wait().await
    }

    /// Keys with a queued or in-flight mutation.
    pub fn pending_keys(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots.len()
    }

    async fn acquire(&self, key: &RowKey) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(key.clone()).or_default().clone()
        };
        // tokio's mutex is fair, so waiters acquire in arrival order.
        slot.lock_owned().await
    }

    async fn send(&self, ctx: &RequestContext, mutation: &Mutation) -> Result<TxMarker, MutationError> {
        let cid = ctx.correlation_id();
        let key = &mutation.key;
        let mut backoff = Backoff::new(self.backoff.clone(), self.jitter.clone());
        let mut attempts = 0u32;

        loop {
            if self.replica.is_closed() {
                return Err(MutationError::Cancelled { key: key.clone() });
            }
            attempts += 1;
            let epoch = self.stream_status.borrow().connection_epoch;

            let reason =
                match tokio::time::timeout(self.config.send_timeout(), self.sink.send(ctx, mutation))
                    .await
                {
                    Ok(Ok(tx)) => return Ok(tx),
                    Ok(Err(SendError::Rejected(reason))) => {
                        return Err(MutationError::Rejected {
                            key: key.clone(),
                            reason,
                        })
                    }
                    Ok(Err(SendError::Unavailable(reason))) => reason,
                    Err(_) => format!("no response within {:?}", self.config.send_timeout()),
                };

            if self.config.max_send_attempts.is_some_and(|max| attempts >= max) {
                return Err(MutationError::Unavailable {
                    key: key.clone(),
                    attempts,
                    reason,
                });
            }
            let delay = backoff
                .next_delay(Instant::now())
                .map(|step| step.delay)
                .unwrap_or_else(|| self.backoff.max_delay());
            log::warn!(
                "[cid={cid}] {}/{key}: send attempt {attempts} failed: {reason}; retrying within {delay:?}",
                self.table
            );

            let mut status = self.stream_status.clone();
            let reconnected = async move {
                let changed = status
                    .wait_for(|s| s.connection_epoch > epoch || s.is_closed())
                    .await
                    .is_ok();
                if !changed {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = reconnected => {}
            }
        }
    }
}
