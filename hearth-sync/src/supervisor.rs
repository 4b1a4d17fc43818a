//! Sync supervisor.
//!
//! Owns every subscription of a process:
//!
//! ```text
//!   subscribe(ctx, "messages")
//!     │ allow-list ──► access-context cache ──► policy compiler
//!     ▼
//!   ┌──────────── Collection (sub-N) ────────────┐
//!   │ ChangeStream task ─► Replica ◄─ Mutations  │──StreamReport──┐
//!   └────────────────────────────────────────────┘                │
//!                                                                 ▼
//!   health() / clear_error() / events()  ◄──────────  reports task (one per supervisor)
//! ```
//!
//! A 401/403 on any subscription is turned into one `SessionExpired`
//! event, and the remaining subscriptions are closed instead of each
//! hitting the same rejection on its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::backoff::{Backoff, Jitter, UniformJitter};
use crate::cache::{AccessContextCache, SharedCache};
use crate::collection::Collection;
use crate::config::{ConfigError, SyncConfig};
use crate::context::{IdentityKey, RequestContext};
use crate::error::SyncError;
use crate::mutation::{MutationCoordinator, MutationSink};
use crate::policy::{AllowList, PolicyCompiler, Table};
use crate::replica::Replica;
use crate::store::AccessLookup;
use crate::stream::{
    ChangeStream, CloseReason, StreamParams, StreamReport, StreamState, StreamStatus,
    SubscriptionId,
};
use crate::transport::{FeedRequest, FeedTransport, StreamError};

/// Published on every subscription state change and once per expired
/// session.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged {
        subscription: SubscriptionId,
        table: Table,
        state: StreamState,
        attempt: u32,
        error: Option<StreamError>,
    },
    SessionExpired,
}

/// Health of one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionHealth {
    pub id: SubscriptionId,
    pub table: Table,
    pub identity: IdentityKey,
    pub status: StreamStatus,
}

/// Aggregate health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncHealth {
    pub subscriptions: usize,
    pub streaming: usize,
    pub degraded: usize,
    pub total_reconnects: u64,
    pub session_expired: bool,
}

struct Subscription {
    table: Table,
    identity: IdentityKey,
    collection: Collection,
}

struct SupervisorShared {
    subscriptions: Mutex<BTreeMap<SubscriptionId, Subscription>>,
    session_expired: AtomicBool,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorShared {
    fn subscriptions(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn handle(&self, report: StreamReport) {
        let StreamReport {
            subscription,
            table,
            status,
        } = report;
        match status.state {
            StreamState::Backoff => log::warn!(
                "{subscription} ({table}) degraded: attempt {} in {:?}",
                status.attempt,
                status.next_retry_in
            ),
            StreamState::Streaming => log::info!("{subscription} ({table}) streaming"),
            StreamState::Closed => log::info!(
                "{subscription} ({table}) closed: {:?}",
                status.close_reason
            ),
            StreamState::Idle | StreamState::Connecting => {
                log::debug!("{subscription} ({table}) {}", status.state)
            }
        }

        self.publish(SupervisorEvent::StateChanged {
            subscription,
            table,
            state: status.state,
            attempt: status.attempt,
            error: status.last_error.clone(),
        });

        if status.state != StreamState::Closed {
            return;
        }
        match status.close_reason {
            Some(CloseReason::AuthRejected) => self.expire_session(subscription),
            Some(CloseReason::Unsubscribed) => {
                self.subscriptions().remove(&subscription);
            }
            _ => {}
        }
    }

    fn expire_session(&self, origin: SubscriptionId) {
        if self.session_expired.swap(true, Ordering::AcqRel) {
            return;
        }
        log::warn!("session expired ({origin} was rejected); closing all subscriptions");
        self.publish(SupervisorEvent::SessionExpired);

        let others: Vec<Collection> = self
            .subscriptions()
            .iter()
            .filter(|(id, _)| **id != origin)
            .map(|(_, sub)| sub.collection.clone())
            .collect();
        for collection in others {
            collection.close(CloseReason::SessionExpired);
        }
    }
}

/// Owns subscriptions and their shared collaborators.
pub struct SyncSupervisor {
    config: SyncConfig,
    compiler: PolicyCompiler,
    cache: AccessContextCache,
    transport: Arc<dyn FeedTransport>,
    sink: Arc<dyn MutationSink>,
    jitter: Arc<dyn Jitter>,
    shared: Arc<SupervisorShared>,
    reports: mpsc::UnboundedSender<StreamReport>,
    next_id: AtomicU64,
}

impl SyncSupervisor {
    /// Validate `config` and start the report loop. Must be called inside
    /// a tokio runtime.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn FeedTransport>,
        sink: Arc<dyn MutationSink>,
        lookup: Arc<dyn AccessLookup>,
        shared_cache: Arc<dyn SharedCache>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let allow_list = AllowList::from_entries(config.allow_list.clone())?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(SupervisorShared {
            subscriptions: Mutex::new(BTreeMap::new()),
            session_expired: AtomicBool::new(false),
            events,
        });

        let (reports, mut reports_rx) = mpsc::unbounded_channel::<StreamReport>();
        let weak: Weak<SupervisorShared> = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(report) = reports_rx.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.handle(report);
            }
        });

        log::info!(
            "sync supervisor ready: {} tables allow-listed, feed {}",
            allow_list.tables().count(),
            config.feed_url
        );
        Ok(Self {
            cache: AccessContextCache::new(config.cache.clone(), shared_cache, lookup),
            compiler: PolicyCompiler::new(allow_list),
            config,
            transport,
            sink,
            jitter: Arc::new(UniformJitter),
            shared,
            reports,
            next_id: AtomicU64::new(1),
        })
    }

    /// Replace the reconnect jitter for subscriptions created afterwards.
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Open a filtered, live view of `table` for the caller.
    pub async fn subscribe(&self, ctx: &RequestContext, table: &str) -> Result<Collection, SyncError> {
        let cid = ctx.correlation_id();
        if self.shared.session_expired.load(Ordering::Acquire) {
            return Err(SyncError::SessionExpired);
        }
        let table = self.compiler.allow_list().resolve(table).inspect_err(|e| {
            log::warn!("[cid={cid}] subscribe denied: {e}");
        })?;
        let access = self.cache.get(ctx).await?;
        let predicate = self.compiler.compile(table, ctx.identity(), &access)?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let replica = Arc::new(Replica::new(table, self.config.event_capacity));
        let mut request = FeedRequest::new(table, predicate);
        request.bearer = ctx.credential().cloned();

        let stream = ChangeStream::spawn(StreamParams {
            subscription: id,
            request,
            transport: self.transport.clone(),
            replica: replica.clone(),
            backoff: Backoff::new(self.config.backoff.clone(), self.jitter.clone()),
            required_fields: self.compiler.allow_list().required_fields(table).to_vec(),
            reports: self.reports.clone(),
            correlation_id: cid,
        });
        let coordinator = MutationCoordinator::new(
            replica.clone(),
            self.sink.clone(),
            self.config.mutation.clone(),
            self.config.backoff.clone(),
            self.jitter.clone(),
            stream.watch(),
        );
        let collection = Collection::new(replica, stream, coordinator, self.config.replica.row_ttl());

        self.shared.subscriptions().insert(
            id,
            Subscription {
                table,
                identity: ctx.identity().key(),
                collection: collection.clone(),
            },
        );
        log::info!("[cid={cid}] {id} subscribed {} to {table}", ctx.identity().key());
        Ok(collection)
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<Collection> {
        self.shared
            .subscriptions()
            .get(&id)
            .map(|sub| sub.collection.clone())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionHealth> {
        self.shared
            .subscriptions()
            .iter()
            .map(|(id, sub)| SubscriptionHealth {
                id: *id,
                table: sub.table,
                identity: sub.identity,
                status: sub.collection.status(),
            })
            .collect()
    }

    pub fn health(&self) -> SyncHealth {
        let subscriptions = self.subscriptions();
        SyncHealth {
            subscriptions: subscriptions.len(),
            streaming: subscriptions
                .iter()
                .filter(|s| s.status.state == StreamState::Streaming)
                .count(),
            degraded: subscriptions.iter().filter(|s| s.status.is_degraded()).count(),
            total_reconnects: subscriptions.iter().map(|s| s.status.total_reconnects).sum(),
            session_expired: self.is_session_expired(),
        }
    }

    /// Retry `id` now instead of waiting out its backoff. Returns `false`
    /// when the subscription is unknown or not backing off.
    pub fn clear_error(&self, id: SubscriptionId) -> bool {
        let Some(collection) = self.subscription(id) else {
            return false;
        };
        let retried = collection.retry_now();
        if retried {
            log::info!("{id}: retry requested");
        }
        retried
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_session_expired(&self) -> bool {
        self.shared.session_expired.load(Ordering::Acquire)
    }

    /// Re-arm after the embedder has reauthenticated. Subscriptions closed
    /// by the expiry stay closed; subscribe again with the new context.
    pub fn reset_session(&self) -> bool {
        let was_expired = self.shared.session_expired.swap(false, Ordering::AcqRel);
        if was_expired {
            self.shared
                .subscriptions()
                .retain(|_, sub| !sub.collection.status().is_closed());
            log::info!("session re-armed");
        }
        was_expired
    }

    /// Drop cached access for `key`, e.g. after a bot's integrations
    /// change. Existing subscriptions keep their compiled predicate.
    pub async fn invalidate_access(&self, key: &IdentityKey) {
        self.cache.invalidate(key).await;
    }

    pub fn cache(&self) -> &AccessContextCache {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Close every subscription.
    pub fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.shared.subscriptions());
        let count = drained.len();
        for sub in drained.into_values() {
            sub.collection.close(CloseReason::Unsubscribed);
        }
        if count > 0 {
            log::info!("sync supervisor shut down {count} subscriptions");
        }
    }
}

impl Drop for SyncSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySharedCache;
    use crate::context::Identity;
    use crate::feed::TxMarker;
    use crate::inprocess::in_process_feed;
    use crate::mutation::{Mutation, SendError};
    use crate::policy::AccessContext;
    use crate::store::LookupError;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct OrgLookup;

    #[async_trait]
    impl AccessLookup for OrgLookup {
        async fn lookup(&self, _key: IdentityKey) -> Result<AccessContext, LookupError> {
            Ok(AccessContext::User {
                org_ids: [Uuid::nil()].into_iter().collect(),
            })
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl MutationSink for AcceptAll {
        async fn send(&self, _ctx: &RequestContext, _m: &Mutation) -> Result<TxMarker, SendError> {
            Ok(TxMarker(1))
        }
    }

    fn supervisor(config: SyncConfig) -> (SyncSupervisor, crate::inprocess::FeedServer) {
        let (feed, server) = in_process_feed();
        let supervisor = SyncSupervisor::new(
            config,
            Arc::new(feed),
            Arc::new(AcceptAll),
            Arc::new(OrgLookup),
            Arc::new(InMemorySharedCache::new()),
        )
        .unwrap();
        (supervisor, server)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Identity::user(Uuid::new_v4(), [Uuid::nil()]))
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_startup() {
        let (feed, _server) = in_process_feed();
        let mut config = SyncConfig::default();
        config.allow_list.push(crate::policy::AllowListEntry::new("secrets", &[]));
        let result = SyncSupervisor::new(
            config,
            Arc::new(feed),
            Arc::new(AcceptAll),
            Arc::new(OrgLookup),
            Arc::new(InMemorySharedCache::new()),
        );
        assert!(matches!(result, Err(ConfigError::MissingPolicy { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_registers_and_unsubscribe_removes() {
        let (supervisor, server) = supervisor(SyncConfig::default());
        let collection = supervisor.subscribe(&ctx(), "messages").await.unwrap();
        server.wait_for_opens(1).await;

        assert_eq!(supervisor.health().subscriptions, 1);
        assert!(supervisor.subscription(collection.id()).is_some());

        let mut events = supervisor.events();
        assert!(collection.unsubscribe());
        loop {
            if let SupervisorEvent::StateChanged {
                state: StreamState::Closed,
                ..
            } = events.recv().await.unwrap()
            {
                break;
            }
        }
        tokio::task::yield_now().await;
        assert_eq!(supervisor.health().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_request_carries_compiled_predicate() {
        let (supervisor, server) = supervisor(SyncConfig::default());
        let _c = supervisor.subscribe(&ctx(), "channels").await.unwrap();
        server.wait_for_opens(1).await;

        let request = &server.requests()[0];
        assert_eq!(request.table, Table::Channels);
        assert_eq!(request.predicate.sql, "organization_id = ANY($1)");
        assert_eq!(request.cursor, None);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (supervisor, server) = supervisor(SyncConfig::default());
        let a = supervisor.subscribe(&ctx(), "messages").await.unwrap();
        let b = supervisor.subscribe(&ctx(), "channels").await.unwrap();
        server.wait_for_opens(2).await;

        supervisor.shutdown();
        assert!(a.status().is_closed());
        assert!(b.status().is_closed());
        assert_eq!(supervisor.health().subscriptions, 0);
    }
}
