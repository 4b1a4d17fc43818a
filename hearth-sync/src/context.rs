//! Caller identity and the explicit per-request context.
//!
//! Identities come from the session collaborator through
//! [`IdentityResolver`]; the sync core never parses raw tokens. Every
//! operation that acts on behalf of a caller takes a [`RequestContext`]
//! so the correlation id travels with the call instead of living in
//! ambient state.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Organization identifier.
pub type OrgId = Uuid;

/// Channel identifier.
pub type ChannelId = Uuid;

/// What kind of principal a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    User,
    Bot,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }
}

/// An authenticated principal. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub kind: IdentityKind,
    pub org_memberships: BTreeSet<OrgId>,
}

impl Identity {
    /// A user belonging to the given organizations.
    pub fn user(id: Uuid, orgs: impl IntoIterator<Item = OrgId>) -> Self {
        Self {
            id,
            kind: IdentityKind::User,
            org_memberships: orgs.into_iter().collect(),
        }
    }

    /// A bot. Its reach is derived from its channel integrations, not
    /// from organization membership.
    pub fn bot(id: Uuid) -> Self {
        Self {
            id,
            kind: IdentityKind::Bot,
            org_memberships: BTreeSet::new(),
        }
    }

    /// Cache key for everything derived from this identity.
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            kind: self.kind,
            id: self.id,
        }
    }
}

/// Stable key identifying a principal across caches and processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub kind: IdentityKind,
    pub id: Uuid,
}

impl IdentityKey {
    pub fn new(kind: IdentityKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Opaque session credential, forwarded to collaborators untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Failures reported by the session collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential rejected")]
    Rejected,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Session collaborator: resolves a credential to an identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &Credential) -> Result<Identity, AuthError>;
}

/// Identity plus correlation id, passed explicitly through every call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    identity: Arc<Identity>,
    correlation_id: Uuid,
    credential: Option<Credential>,
}

impl RequestContext {
    /// Context with a fresh correlation id.
    pub fn new(identity: Identity) -> Self {
        Self::with_correlation_id(identity, Uuid::new_v4())
    }

    pub fn with_correlation_id(identity: Identity, correlation_id: Uuid) -> Self {
        Self {
            identity: Arc::new(identity),
            correlation_id,
            credential: None,
        }
    }

    /// Resolve `credential` and build a context that forwards it to the
    /// change feed.
    pub async fn authenticate(
        resolver: &dyn IdentityResolver,
        credential: Credential,
    ) -> Result<Self, AuthError> {
        let identity = resolver.resolve(&credential).await?;
        Ok(Self::new(identity).with_credential(credential))
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}
