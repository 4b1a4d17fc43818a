//! Row-visibility policy: table allow-list and predicate compilation.
//!
//! ```text
//! table name ──► AllowList::resolve ──► Table ──┐
//!                    │ unknown                  │
//!                    ▼                          ▼
//!              PolicyDenied        PolicyCompiler::compile(identity, AccessContext)
//!                                               │
//!                                               ▼
//!                                  Predicate { sql: "... = ANY($1)", params }
//! ```
//!
//! Compilation is pure: everything a rule needs is already in the
//! [`AccessContext`]. Identity-derived values are always bound as
//! parameters, never spliced into the SQL text.
//!
//! [`Table`] is a closed enum and every rule is a `match` arm, so a table
//! without a rule does not build. The configured allow-list may only
//! name tables that have a rule; anything else is rejected at startup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::context::{ChannelId, Identity, IdentityKind, OrgId};

/// Every table the sync core knows how to filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Organizations,
    OrganizationMembers,
    Channels,
    ChannelMembers,
    Messages,
    Users,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Organizations,
        Table::OrganizationMembers,
        Table::Channels,
        Table::ChannelMembers,
        Table::Messages,
        Table::Users,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Organizations => "organizations",
            Self::OrganizationMembers => "organization_members",
            Self::Channels => "channels",
            Self::ChannelMembers => "channel_members",
            Self::Messages => "messages",
            Self::Users => "users",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.name() == name)
    }

    /// Fields a row of this table must carry when none are configured.
    pub fn default_required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Organizations => &["id", "name"],
            Self::OrganizationMembers => &["id", "organization_id", "user_id"],
            Self::Channels => &["id", "organization_id", "name"],
            Self::ChannelMembers => &["id", "channel_id", "user_id"],
            Self::Messages => &["id", "channel_id", "author_id", "content"],
            Self::Users => &["id", "display_name"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configured allow-list entry, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListEntry {
    pub table: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl AllowListEntry {
    pub fn new(table: impl Into<String>, required_fields: &[&str]) -> Self {
        Self {
            table: table.into(),
            required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Closed set of tables reachable through sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    tables: BTreeMap<Table, Vec<String>>,
}

impl AllowList {
    /// Validate configured entries. Fails on names without a policy rule
    /// and on duplicates.
    pub fn from_entries(
        entries: impl IntoIterator<Item = AllowListEntry>,
    ) -> Result<Self, ConfigError> {
        let mut tables = BTreeMap::new();
        for entry in entries {
            let table = Table::from_name(&entry.table).ok_or_else(|| {
                ConfigError::MissingPolicy {
                    table: entry.table.clone(),
                }
            })?;
            let fields = if entry.required_fields.is_empty() {
                table
                    .default_required_fields()
                    .iter()
                    .map(|f| f.to_string())
                    .collect()
            } else {
                entry.required_fields
            };
            if tables.insert(table, fields).is_some() {
                return Err(ConfigError::DuplicateTable {
                    table: entry.table,
                });
            }
        }
        Ok(Self { tables })
    }

    /// Every table with its default required fields.
    pub fn standard() -> Self {
        Self {
            tables: Table::ALL
                .into_iter()
                .map(|table| {
                    let fields = table
                        .default_required_fields()
                        .iter()
                        .map(|f| f.to_string())
                        .collect();
                    (table, fields)
                })
                .collect(),
        }
    }

    pub fn standard_entries() -> Vec<AllowListEntry> {
        Table::ALL
            .into_iter()
            .map(|table| AllowListEntry::new(table.name(), table.default_required_fields()))
            .collect()
    }

    /// Map a requested table name to an allowed table.
    pub fn resolve(&self, name: &str) -> Result<Table, PolicyDenied> {
        Table::from_name(name)
            .filter(|table| self.tables.contains_key(table))
            .ok_or_else(|| PolicyDenied::UnknownTable(name.to_string()))
    }

    pub fn contains(&self, table: Table) -> bool {
        self.tables.contains_key(&table)
    }

    pub fn required_fields(&self, table: Table) -> &[String] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = Table> + '_ {
        self.tables.keys().copied()
    }
}

/// Derived authorization facts for one identity.
///
/// Always re-derivable from the store; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessContext {
    User { org_ids: BTreeSet<OrgId> },
    Bot { channel_ids: BTreeSet<ChannelId> },
}

impl AccessContext {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::User { .. } => IdentityKind::User,
            Self::Bot { .. } => IdentityKind::Bot,
        }
    }
}

/// A value bound to a predicate placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Uuid(Uuid),
    UuidList(Vec<Uuid>),
    Text(String),
    Int(i64),
}

/// Backend filter expression with positional (`$n`) parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

#[derive(Default)]
struct PredicateBuilder {
    params: Vec<SqlParam>,
}

impl PredicateBuilder {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn bind_ids(&mut self, ids: &BTreeSet<Uuid>) -> String {
        self.bind(SqlParam::UuidList(ids.iter().copied().collect()))
    }

    fn finish(self, sql: String) -> Predicate {
        Predicate {
            sql,
            params: self.params,
        }
    }
}

/// Why a table was not made visible.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyDenied {
    #[error("table {0:?} is not in the sync allow-list")]
    UnknownTable(String),
    #[error("{kind:?} identities may not read {table}")]
    IdentityLacksAccess { table: Table, kind: IdentityKind },
    #[error("access context for a {context:?} does not match a {identity:?} identity")]
    ContextMismatch {
        identity: IdentityKind,
        context: IdentityKind,
    },
}

/// Compiles row-visibility predicates for allow-listed tables.
#[derive(Debug, Clone)]
pub struct PolicyCompiler {
    allow_list: AllowList,
}

impl PolicyCompiler {
    pub fn new(allow_list: AllowList) -> Self {
        Self { allow_list }
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Resolve `name` against the allow-list, then compile.
    pub fn compile_named(
        &self,
        name: &str,
        identity: &Identity,
        access: &AccessContext,
    ) -> Result<Predicate, PolicyDenied> {
        let table = self.allow_list.resolve(name)?;
        self.compile(table, identity, access)
    }

    pub fn compile(
        &self,
        table: Table,
        identity: &Identity,
        access: &AccessContext,
    ) -> Result<Predicate, PolicyDenied> {
        if !self.allow_list.contains(table) {
            return Err(PolicyDenied::UnknownTable(table.name().to_string()));
        }
        if identity.kind != access.kind() {
            return Err(PolicyDenied::ContextMismatch {
                identity: identity.kind,
                context: access.kind(),
            });
        }

        let mut b = PredicateBuilder::default();
        let sql = match (table, access) {
            (Table::Organizations, AccessContext::User { org_ids }) => {
                format!("id = ANY({})", b.bind_ids(org_ids))
            }
            (Table::OrganizationMembers, AccessContext::User { org_ids })
            | (Table::Channels, AccessContext::User { org_ids }) => {
                format!("organization_id = ANY({})", b.bind_ids(org_ids))
            }
            (Table::Channels, AccessContext::Bot { channel_ids }) => {
                format!("id = ANY({})", b.bind_ids(channel_ids))
            }
            (Table::ChannelMembers, AccessContext::User { org_ids })
            | (Table::Messages, AccessContext::User { org_ids }) => format!(
                "channel_id IN (SELECT id FROM channels WHERE organization_id = ANY({}))",
                b.bind_ids(org_ids)
            ),
            (Table::ChannelMembers, AccessContext::Bot { channel_ids })
            | (Table::Messages, AccessContext::Bot { channel_ids }) => {
                format!("channel_id = ANY({})", b.bind_ids(channel_ids))
            }
            (Table::Users, AccessContext::User { org_ids }) => {
                let own = b.bind(SqlParam::Uuid(identity.id));
                let orgs = b.bind_ids(org_ids);
                format!(
                    "id = {own} OR id IN (SELECT user_id FROM organization_members \
                     WHERE organization_id = ANY({orgs}))"
                )
            }
            (Table::Users, AccessContext::Bot { channel_ids }) => format!(
                "id IN (SELECT user_id FROM channel_members WHERE channel_id = ANY({}))",
                b.bind_ids(channel_ids)
            ),
            (Table::Organizations, AccessContext::Bot { .. })
            | (Table::OrganizationMembers, AccessContext::Bot { .. }) => {
                return Err(PolicyDenied::IdentityLacksAccess {
                    table,
                    kind: IdentityKind::Bot,
                });
            }
        };
        Ok(b.finish(sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_orgs(orgs: &[OrgId]) -> (Identity, AccessContext) {
        let identity = Identity::user(Uuid::new_v4(), orgs.iter().copied());
        let access = AccessContext::User {
            org_ids: orgs.iter().copied().collect(),
        };
        (identity, access)
    }

    fn bot_with_channels(channels: &[ChannelId]) -> (Identity, AccessContext) {
        let identity = Identity::bot(Uuid::new_v4());
        let access = AccessContext::Bot {
            channel_ids: channels.iter().copied().collect(),
        };
        (identity, access)
    }

    #[test]
    fn test_table_names_roundtrip() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()), Some(table));
        }
        assert_eq!(Table::from_name("secrets"), None);
    }

    #[test]
    fn test_unknown_table_denied_for_every_identity() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let everything: Vec<OrgId> = (0..16).map(|_| Uuid::new_v4()).collect();
        let (user, user_access) = user_with_orgs(&everything);
        let (bot, bot_access) = bot_with_channels(&everything);

        for name in ["secrets", "pg_authid", "messages; DROP TABLE users", ""] {
            assert_eq!(
                compiler.compile_named(name, &user, &user_access),
                Err(PolicyDenied::UnknownTable(name.to_string()))
            );
            assert_eq!(
                compiler.compile_named(name, &bot, &bot_access),
                Err(PolicyDenied::UnknownTable(name.to_string()))
            );
        }
    }

    #[test]
    fn test_table_outside_configured_allow_list_denied() {
        let allow = AllowList::from_entries([AllowListEntry::new("messages", &[])]).unwrap();
        let compiler = PolicyCompiler::new(allow);
        let (user, access) = user_with_orgs(&[Uuid::new_v4()]);

        assert!(compiler.compile(Table::Messages, &user, &access).is_ok());
        assert_eq!(
            compiler.compile(Table::Channels, &user, &access),
            Err(PolicyDenied::UnknownTable("channels".into()))
        );
    }

    #[test]
    fn test_allow_list_rejects_table_without_rule() {
        let result = AllowList::from_entries([
            AllowListEntry::new("messages", &[]),
            AllowListEntry::new("webhooks", &["id"]),
        ]);
        assert_eq!(
            result,
            Err(ConfigError::MissingPolicy {
                table: "webhooks".into()
            })
        );
    }

    #[test]
    fn test_allow_list_rejects_duplicates() {
        let result = AllowList::from_entries([
            AllowListEntry::new("messages", &[]),
            AllowListEntry::new("messages", &["id"]),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicateTable { .. })));
    }

    #[test]
    fn test_allow_list_defaults_required_fields() {
        let allow = AllowList::from_entries([
            AllowListEntry::new("messages", &[]),
            AllowListEntry::new("channels", &["id"]),
        ])
        .unwrap();
        assert_eq!(
            allow.required_fields(Table::Messages),
            ["id", "channel_id", "author_id", "content"]
        );
        assert_eq!(allow.required_fields(Table::Channels), ["id"]);
    }

    #[test]
    fn test_every_table_compiles_for_users() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let (user, access) = user_with_orgs(&[Uuid::new_v4()]);
        for table in Table::ALL {
            let predicate = compiler.compile(table, &user, &access).unwrap();
            assert!(predicate.sql.contains("$1"), "{table}: {}", predicate.sql);
        }
    }

    #[test]
    fn test_messages_predicate_binds_channel_ids() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let channel = Uuid::new_v4();
        let (bot, access) = bot_with_channels(&[channel]);

        let predicate = compiler.compile(Table::Messages, &bot, &access).unwrap();

        assert_eq!(predicate.sql, "channel_id = ANY($1)");
        assert_eq!(predicate.params, vec![SqlParam::UuidList(vec![channel])]);
    }

    #[test]
    fn test_identity_values_never_appear_in_sql_text() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let org = Uuid::new_v4();
        let (user, access) = user_with_orgs(&[org]);
        for table in Table::ALL {
            let predicate = compiler.compile(table, &user, &access).unwrap();
            assert!(!predicate.sql.contains(&org.to_string()));
            assert!(!predicate.sql.contains(&user.id.to_string()));
        }
    }

    #[test]
    fn test_users_predicate_includes_self() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let (user, access) = user_with_orgs(&[Uuid::new_v4()]);
        let predicate = compiler.compile(Table::Users, &user, &access).unwrap();
        assert_eq!(predicate.params[0], SqlParam::Uuid(user.id));
        assert!(predicate.sql.starts_with("id = $1 OR"));
    }

    #[test]
    fn test_bot_denied_organization_tables() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let (bot, access) = bot_with_channels(&[Uuid::new_v4()]);
        for table in [Table::Organizations, Table::OrganizationMembers] {
            assert_eq!(
                compiler.compile(table, &bot, &access),
                Err(PolicyDenied::IdentityLacksAccess {
                    table,
                    kind: IdentityKind::Bot
                })
            );
        }
    }

    #[test]
    fn test_context_kind_mismatch_denied() {
        let compiler = PolicyCompiler::new(AllowList::standard());
        let (user, _) = user_with_orgs(&[]);
        let (_, bot_access) = bot_with_channels(&[Uuid::new_v4()]);
        assert!(matches!(
            compiler.compile(Table::Messages, &user, &bot_access),
            Err(PolicyDenied::ContextMismatch { .. })
        ));
    }

    #[test]
    fn test_predicate_params_serialize_as_plain_values() {
        let id = Uuid::nil();
        let json = serde_json::to_string(&vec![
            SqlParam::Uuid(id),
            SqlParam::UuidList(vec![id]),
        ])
        .unwrap();
        assert_eq!(
            json,
            "[\"00000000-0000-0000-0000-000000000000\",[\"00000000-0000-0000-0000-000000000000\"]]"
        );
    }
}
