//! Change stream client: one task per subscription.
//!
//! ```text
//!   Idle ──► Connecting ──first record──► Streaming
//!               ▲                            │ transport error / bad status /
//!               │ delay elapsed or           │ malformed record / server close
//!               │ retry_now()                ▼
//!               └─────────────────────── Backoff
//!
//!   any ──close() / 401 / 403 / attempts exhausted──► Closed
//! ```
//!
//! Every reconnect re-issues the same request with the replica's last
//! applied cursor. Status changes go out twice: on a `watch` channel for
//! the owning [`Collection`](crate::collection::Collection), and as a
//! [`StreamReport`] to the supervisor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::feed::{FeedDecoder, FeedRecord};
use crate::policy::Table;
use crate::replica::{ApplyOutcome, Replica};
use crate::transport::{FeedRequest, FeedTransport, StreamError};

/// Identifies one subscription within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Unsubscribed,
    /// The feed rejected the credentials (401/403).
    AuthRejected,
    AttemptsExhausted,
    /// Another subscription's credentials were rejected.
    SessionExpired,
}

/// Observable state of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub state: StreamState,
    /// Attempts since the last backoff reset.
    pub attempt: u32,
    pub total_reconnects: u64,
    pub last_error: Option<StreamError>,
    /// Jittered delay of the pending retry while in `Backoff`.
    pub next_retry_in: Option<Duration>,
    /// Unjittered delay of the pending retry while in `Backoff`.
    pub retry_base: Option<Duration>,
    pub close_reason: Option<CloseReason>,
    /// Bumped every time the stream reaches `Streaming`.
    pub connection_epoch: u64,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self {
            state: StreamState::Idle,
            attempt: 0,
            total_reconnects: 0,
            last_error: None,
            next_retry_in: None,
            retry_base: None,
            close_reason: None,
            connection_epoch: 0,
        }
    }
}

impl StreamStatus {
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Degraded: backing off, or closed for any reason but unsubscribe.
    pub fn is_degraded(&self) -> bool {
        match self.state {
            StreamState::Backoff => true,
            StreamState::Closed => self.close_reason != Some(CloseReason::Unsubscribed),
            _ => false,
        }
    }
}

/// State change sent to the supervisor.
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub subscription: SubscriptionId,
    pub table: Table,
    pub status: StreamStatus,
}

/// Everything a stream task needs.
pub struct StreamParams {
    pub subscription: SubscriptionId,
    pub request: FeedRequest,
    pub transport: Arc<dyn FeedTransport>,
    pub replica: Arc<Replica>,
    pub backoff: Backoff,
    pub required_fields: Vec<String>,
    pub reports: mpsc::UnboundedSender<StreamReport>,
    pub correlation_id: Uuid,
}

struct StreamControl {
    subscription: SubscriptionId,
    table: Table,
    replica: Arc<Replica>,
    shutdown: watch::Sender<bool>,
    retry_now: Notify,
    status: watch::Sender<StreamStatus>,
    reports: mpsc::UnboundedSender<StreamReport>,
}

impl StreamControl {
    fn update(&self, f: impl FnOnce(&mut StreamStatus)) {
        let mut transitioned = None;
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            if status.state != before.state {
                transitioned = Some(status.clone());
            }
            *status != before
        });
        if let Some(status) = transitioned {
            let _ = self.reports.send(StreamReport {
                subscription: self.subscription,
                table: self.table,
                status,
            });
        }
    }

    /// Closed is terminal; later closes keep the first reason.
    fn close(&self, reason: CloseReason, error: Option<StreamError>) -> bool {
        self.replica.close();
        self.shutdown.send_replace(true);
        let mut closed = false;
        self.update(|status| {
            if status.state != StreamState::Closed {
                status.state = StreamState::Closed;
                status.close_reason = Some(reason);
                status.next_retry_in = None;
                status.retry_base = None;
                if error.is_some() {
                    status.last_error = error;
                }
                closed = true;
            }
        });
        closed
    }
}

/// Handle to a running change stream.
pub struct ChangeStream {
    control: Arc<StreamControl>,
    status: watch::Receiver<StreamStatus>,
}

impl ChangeStream {
    /// Start the stream task. Must be called inside a tokio runtime.
    pub fn spawn(params: StreamParams) -> Self {
        let (status_tx, status) = watch::channel(StreamStatus::default());
        let (shutdown, _) = watch::channel(false);
        let control = Arc::new(StreamControl {
            subscription: params.subscription,
            table: params.request.table,
            replica: params.replica.clone(),
            shutdown,
            retry_now: Notify::new(),
            status: status_tx,
            reports: params.reports,
        });

        let task = StreamTask {
            control: control.clone(),
            request: params.request,
            transport: params.transport,
            replica: params.replica,
            backoff: params.backoff,
            required_fields: params.required_fields,
            cid: params.correlation_id,
        };
        tokio::spawn(task.run());

        Self { control, status }
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.control.subscription
    }

    pub fn table(&self) -> Table {
        self.control.table
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Skip the rest of the current backoff delay. Returns `false` unless
    /// the stream is backing off.
    pub fn retry_now(&self) -> bool {
        if self.status.borrow().state != StreamState::Backoff {
            return false;
        }
        self.control.retry_now.notify_one();
        true
    }

    /// Stop the stream. No event reaches the replica after this returns,
    /// even though the connection itself closes asynchronously. Safe from
    /// any state; returns whether this call did the closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.control.close(reason, None)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.control.close(CloseReason::Unsubscribed, None);
    }
}

struct StreamTask {
    control: Arc<StreamControl>,
    request: FeedRequest,
    transport: Arc<dyn FeedTransport>,
    replica: Arc<Replica>,
    backoff: Backoff,
    required_fields: Vec<String>,
    cid: Uuid,
}

impl StreamTask {
    async fn run(mut self) {
        let mut shutdown = self.control.shutdown.subscribe();
        let table = self.request.table;
        let sub = self.control.subscription;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            self.control.update(|status| {
                status.state = StreamState::Connecting;
                status.next_retry_in = None;
                status.retry_base = None;
            });
            let mut request = self.request.clone();
            request.cursor = self.replica.cursor();
            log::debug!(
                "[cid={}] {sub} connecting to {table} cursor={:?}",
                self.cid,
                request.cursor
            );

            let error = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.session(&request) => match result {
                    Ok(()) => StreamError::Ended,
                    Err(e) => e,
                },
            };
            if *shutdown.borrow() {
                break;
            }

            if error.is_auth() {
                log::warn!(
                    "[cid={}] {sub} on {table}: {error}; closing, session needs reauthentication",
                    self.cid
                );
                self.control.close(CloseReason::AuthRejected, Some(error));
                break;
            }

            let Some(step) = self.backoff.next_delay(Instant::now()) else {
                log::error!(
                    "[cid={}] {sub} on {table}: giving up after {} attempts: {error}",
                    self.cid,
                    self.backoff.attempt()
                );
                self.control.close(CloseReason::AttemptsExhausted, Some(error));
                break;
            };
            log::warn!(
                "[cid={}] {sub} on {table}: {error}; retry {} in {:?}",
                self.cid,
                step.attempt,
                step.delay
            );
            self.control.update(|status| {
                status.state = StreamState::Backoff;
                status.attempt = step.attempt;
                status.total_reconnects += 1;
                status.last_error = Some(error);
                status.next_retry_in = Some(step.delay);
                status.retry_base = Some(step.base);
            });

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(step.delay) => {}
                _ = self.control.retry_now.notified() => {
                    log::info!("[cid={}] {sub} on {table}: retrying now", self.cid);
                }
            }
        }
        log::debug!("[cid={}] {sub} on {table}: stream task finished", self.cid);
    }

    /// One connection. Returns `Ok` when the server ends the stream.
    async fn session(&mut self, request: &FeedRequest) -> Result<(), StreamError> {
        let mut chunks = self.transport.open(request).await?;
        let mut decoder = FeedDecoder::new();
        let mut streaming = false;

        while let Some(chunk) = chunks.next().await {
            let records = decoder
                .push(&chunk?)
                .map_err(|e| StreamError::Malformed(e.to_string()))?;
            for record in records {
                record
                    .validate(request.table, &self.required_fields)
                    .map_err(|e| StreamError::Malformed(e.to_string()))?;
                if !streaming {
                    streaming = true;
                    self.on_streaming();
                }
                match record {
                    FeedRecord::Change(event) => {
                        if self.replica.apply(&event) == ApplyOutcome::Closed {
                            return Ok(());
                        }
                    }
                    FeedRecord::UpToDate { cursor } => self.replica.note_up_to_date(cursor),
                }
            }
        }
        Ok(())
    }

    fn on_streaming(&mut self) {
        self.backoff.on_streaming(Instant::now());
        let attempt = self.backoff.attempt();
        self.control.update(|status| {
            status.state = StreamState::Streaming;
            status.attempt = attempt;
            status.last_error = None;
            status.connection_epoch += 1;
        });
        log::info!(
            "[cid={}] {} streaming {}",
            self.cid,
            self.control.subscription,
            self.request.table
        );
    }
}
