//! # hearth-sync — Row-filtered real-time sync core
//!
//! Keeps in-memory replicas of server tables consistent with a resumable
//! change feed, showing each caller only the rows its identity may see,
//! and applies local writes optimistically until the feed confirms them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  allow-list  ┌───────────────┐  miss   ┌─────────────┐
//! │SyncSupervisor│─────────────►│AccessContext  │────────►│ Store       │
//! │ subscribe()  │              │Cache (2 tiers)│ 1 query │ (lookup)    │
//! └──────┬───────┘              └───────┬───────┘         └─────────────┘
//!        │                              ▼
//!        │                      ┌───────────────┐
//!        │                      │PolicyCompiler │  predicate + bound params
//!        │                      └───────┬───────┘
//!        ▼                              ▼
//! ┌──────────────┐   cursor    ┌───────────────┐  NDJSON   ┌─────────────┐
//! │ Collection   │◄────────────│ ChangeStream  │◄──────────│ Change feed │
//! │  Replica     │   apply()   │ (task, backoff│           │ (WebSocket) │
//! │  Mutations ──┼──send()──┐  └───────────────┘           └─────────────┘
//! └──────────────┘          ▼
//!                    ┌─────────────┐
//!                    │MutationSink │  returns TxMarker
//!                    └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`context`] — Identity and the explicit per-request context
//! - [`policy`] — Allow-list and per-table row-visibility predicates
//! - [`store`] — Store port and access-context derivation
//! - [`cache`] — Two-tier, single-flight access-context cache
//! - [`feed`] — Change-feed records and the NDJSON decoder
//! - [`transport`] — Feed transport port and the WebSocket client
//! - [`inprocess`] — In-process feed for embedding and tests
//! - [`backoff`] — Reconnect delays with jitter
//! - [`stream`] — Per-subscription change stream task
//! - [`replica`] — Local replica with optimistic overlays
//! - [`mutation`] — Optimistic mutation coordinator
//! - [`collection`] — Public per-subscription handle
//! - [`supervisor`] — Subscription owner, health and session signal
//! - [`config`] — Runtime configuration
//! - [`error`] — Crate-level error

pub mod backoff;
pub mod cache;
pub mod collection;
pub mod config;
pub mod context;
pub mod error;
pub mod feed;
pub mod inprocess;
pub mod mutation;
pub mod policy;
pub mod replica;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use backoff::{Backoff, BackoffStep, Jitter, NoJitter, UniformJitter};
pub use cache::{AccessContextCache, CacheStats, InMemorySharedCache, SharedCache, SharedCacheError};
pub use collection::Collection;
pub use config::{
    BackoffConfig, CacheConfig, ConfigError, MutationConfig, ReplicaConfig, SyncConfig,
};
pub use context::{
    AuthError, ChannelId, Credential, Identity, IdentityKey, IdentityKind, IdentityResolver,
    OrgId, RequestContext,
};
pub use error::SyncError;
pub use feed::{ChangeEvent, ChangeOp, Cursor, FeedDecoder, FeedError, FeedRecord, RowKey, TxMarker};
pub use inprocess::{in_process_feed, FeedServer, InProcessFeed};
pub use mutation::{
    Change, Mutation, MutationCoordinator, MutationError, MutationSink, Reconciliation, SendError,
};
pub use policy::{
    AccessContext, AllowList, AllowListEntry, PolicyCompiler, PolicyDenied, Predicate, SqlParam,
    Table,
};
pub use replica::{ReplicaEvent, ReplicaRow, SyncState};
pub use store::{AccessLookup, DatabaseError, LookupError, Row, Store, StoreAccessLookup};
pub use stream::{CloseReason, StreamState, StreamStatus, SubscriptionId};
pub use supervisor::{SubscriptionHealth, SupervisorEvent, SyncHealth, SyncSupervisor};
pub use transport::{FeedRequest, FeedStream, FeedTransport, StreamError, WsFeedTransport};
