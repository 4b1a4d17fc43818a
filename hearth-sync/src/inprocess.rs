//! In-process change feed.
//!
//! [`InProcessFeed`] implements [`FeedTransport`] without a network hop;
//! its [`FeedServer`] handle plays the server: it pushes records to the
//! open connections of a table, ends or fails connections, makes the next
//! connection attempts fail, and keeps a log of every request it received
//! so resume cursors can be checked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::feed::{FeedError, FeedRecord};
use crate::policy::Table;
use crate::transport::{FeedRequest, FeedStream, FeedTransport, StreamError};

type Chunk = Result<String, StreamError>;

struct Connection {
    table: Table,
    tx: mpsc::UnboundedSender<Chunk>,
}

#[derive(Default)]
struct ServerState {
    connections: Vec<Connection>,
    failures: VecDeque<StreamError>,
    requests: Vec<FeedRequest>,
}

struct Shared {
    state: Mutex<ServerState>,
    opened: watch::Sender<usize>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client half: hand this to the sync supervisor.
#[derive(Clone)]
pub struct InProcessFeed {
    shared: Arc<Shared>,
}

/// Server half: drives what the client sees.
#[derive(Clone)]
pub struct FeedServer {
    shared: Arc<Shared>,
}

/// Create a connected client/server pair.
pub fn in_process_feed() -> (InProcessFeed, FeedServer) {
    let (opened, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        state: Mutex::new(ServerState::default()),
        opened,
    });
    (
        InProcessFeed {
            shared: shared.clone(),
        },
        FeedServer { shared },
    )
}

#[async_trait]
impl FeedTransport for InProcessFeed {
    async fn open(&self, request: &FeedRequest) -> Result<FeedStream, StreamError> {
        let rx = {
            let mut state = self.shared.state();
            state.requests.push(request.clone());
            if let Some(error) = state.failures.pop_front() {
                self.shared.opened.send_modify(|n| *n += 1);
                return Err(error);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.connections.push(Connection {
                table: request.table,
                tx,
            });
            rx
        };
        self.shared.opened.send_modify(|n| *n += 1);

        let chunks = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Ok(chunks.boxed())
    }
}

impl FeedServer {
    /// Send a record to every open connection of its table. Returns the
    /// number of connections reached.
    pub fn push(&self, record: &FeedRecord) -> Result<usize, FeedError> {
        let table = match record {
            FeedRecord::Change(event) => Some(event.table),
            FeedRecord::UpToDate { .. } => None,
        };
        let line = record.to_line()?;
        Ok(self.send(|conn| table.map_or(true, |t| t == conn.table), Ok(line)))
    }

    /// Send a control record to the connections of one table.
    pub fn push_to(&self, table: Table, record: &FeedRecord) -> Result<usize, FeedError> {
        let line = record.to_line()?;
        Ok(self.send(|conn| conn.table == table, Ok(line)))
    }

    /// Send raw text, which need not be a whole line.
    pub fn push_raw(&self, table: Table, chunk: &str) -> usize {
        self.send(|conn| conn.table == table, Ok(chunk.to_string()))
    }

    /// Fail every open connection with `error` and drop it.
    pub fn fail_connections(&self, error: StreamError) -> usize {
        let mut state = self.shared.state();
        let connections = std::mem::take(&mut state.connections);
        connections
            .into_iter()
            .filter(|conn| conn.tx.send(Err(error.clone())).is_ok())
            .count()
    }

    /// End every open connection cleanly.
    pub fn disconnect_all(&self) -> usize {
        let mut state = self.shared.state();
        let open = state.connections.iter().filter(|c| !c.tx.is_closed()).count();
        state.connections.clear();
        open
    }

    /// Make the next `count` connection attempts fail with `error`.
    pub fn fail_next_opens(&self, error: StreamError, count: usize) {
        let mut state = self.shared.state();
        state.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<FeedRequest> {
        self.shared.state().requests.clone()
    }

    /// Connection attempts so far, failed ones included.
    pub fn open_count(&self) -> usize {
        *self.shared.opened.borrow()
    }

    /// Open connections that still have a live reader.
    pub fn live_connections(&self, table: Table) -> usize {
        let mut state = self.shared.state();
        state.connections.retain(|conn| !conn.tx.is_closed());
        state.connections.iter().filter(|conn| conn.table == table).count()
    }

    /// Wait until at least `count` connection attempts have been made.
    pub async fn wait_for_opens(&self, count: usize) {
        let mut opened = self.shared.opened.subscribe();
        // The sender lives in `self`, so this only ends once the count is reached.
        let _ = opened.wait_for(|n| *n >= count).await;
    }

    fn send(&self, filter: impl Fn(&Connection) -> bool, chunk: Chunk) -> usize {
        let mut state = self.shared.state();
        state.connections.retain(|conn| !conn.tx.is_closed());
        state
            .connections
            .iter()
            .filter(|conn| filter(conn))
            .filter(|conn| conn.tx.send(chunk.clone()).is_ok())
            .count()
    }
}
