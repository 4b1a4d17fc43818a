//! Relational store port and access-context derivation.
//!
//! The store is a black box that executes one parameterized statement and
//! returns rows. [`StoreAccessLookup`] is the only code in the crate that
//! talks to it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{IdentityKey, IdentityKind};
use crate::policy::{AccessContext, SqlParam};

/// A row as returned by the store or carried by the change feed.
pub type Row = serde_json::Map<String, Value>;

/// Failure reported by the store collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("database error: {message}")]
pub struct DatabaseError {
    message: String,
}

impl DatabaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Store collaborator: execute one statement, return its rows.
#[async_trait]
pub trait Store: Send + Sync {
    async fn execute(&self, query: &str, params: &[SqlParam]) -> Result<Vec<Row>, DatabaseError>;
}

/// Access-context derivation failed. Never cached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("access lookup for {key} failed: {source}")]
    Database {
        key: IdentityKey,
        #[source]
        source: DatabaseError,
    },
    #[error("access lookup for {key} returned a malformed row: {reason}")]
    MalformedRow { key: IdentityKey, reason: String },
}

/// Derives an [`AccessContext`] for an identity.
#[async_trait]
pub trait AccessLookup: Send + Sync {
    async fn lookup(&self, key: IdentityKey) -> Result<AccessContext, LookupError>;
}

pub(crate) const USER_ORGS_QUERY: &str =
    "SELECT organization_id FROM organization_members WHERE user_id = $1";
pub(crate) const BOT_CHANNELS_QUERY: &str =
    "SELECT i.channel_id FROM integrations i \
     JOIN bots b ON b.integration_id = i.id \
     WHERE b.id = $1 AND i.channel_id IS NOT NULL";

/// [`AccessLookup`] backed by membership tables in the store.
pub struct StoreAccessLookup {
    store: Arc<dyn Store>,
}

impl StoreAccessLookup {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn id_column(
        &self,
        key: IdentityKey,
        query: &str,
        column: &str,
    ) -> Result<BTreeSet<Uuid>, LookupError> {
        let rows = self
            .store
            .execute(query, &[SqlParam::Uuid(key.id)])
            .await
            .map_err(|source| LookupError::Database { key, source })?;

        rows.iter()
            .map(|row| {
                row.get(column)
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| LookupError::MalformedRow {
                        key,
                        reason: format!("missing or invalid uuid column {column:?}"),
                    })
            })
            .collect()
    }
}

#[async_trait]
impl AccessLookup for StoreAccessLookup {
    async fn lookup(&self, key: IdentityKey) -> Result<AccessContext, LookupError> {
        match key.kind {
            IdentityKind::User => {
                let org_ids = self
                    .id_column(key, USER_ORGS_QUERY, "organization_id")
                    .await?;
                Ok(AccessContext::User { org_ids })
            }
            IdentityKind::Bot => {
                let channel_ids = self.id_column(key, BOT_CHANNELS_QUERY, "channel_id").await?;
                Ok(AccessContext::Bot { channel_ids })
            }
        }
    }
}
