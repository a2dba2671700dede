//! Data models
//!
//! Rust structs representing database rows plus the relations the
//! store hydrates onto them. All models use ULID for IDs and chrono
//! for timestamps.
//!
//! Relation fields are `#[sqlx(skip)]`: they are never persisted and
//! start out empty when a row is scanned.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use sqlx::Sqlite;
use sqlx::types::Json;

use super::query::Model;
use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// ULIDs sort lexicographically in creation order, so comparing two
/// IDs as strings also compares their age.
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Generate a ULID for the given creation time
    pub fn at(time: DateTime<Utc>) -> Self {
        Self(ulid::Ulid::from_datetime(time.into()).to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Account
// =============================================================================

/// A local or remote account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    pub username: String,
    /// None for local accounts
    pub domain: Option<String>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountColumn {
    Uri,
    Username,
    Domain,
    DisplayName,
    CreatedAt,
    UpdatedAt,
}

impl Model for Account {
    type Column = AccountColumn;

    const ALL: &'static [AccountColumn] = &[
        AccountColumn::Uri,
        AccountColumn::Username,
        AccountColumn::Domain,
        AccountColumn::DisplayName,
        AccountColumn::CreatedAt,
        AccountColumn::UpdatedAt,
    ];
    const UPDATED_AT: Option<AccountColumn> = Some(AccountColumn::UpdatedAt);
    const KEY_COLUMNS: &'static [&'static str] = &["id"];

    fn table(&self) -> &'static str {
        "accounts"
    }

    fn column_name(column: AccountColumn) -> &'static str {
        match column {
            AccountColumn::Uri => "uri",
            AccountColumn::Username => "username",
            AccountColumn::Domain => "domain",
            AccountColumn::DisplayName => "display_name",
            AccountColumn::CreatedAt => "created_at",
            AccountColumn::UpdatedAt => "updated_at",
        }
    }

    fn push_column<'a>(&'a self, column: AccountColumn, qb: &mut QueryBuilder<'a, Sqlite>) {
        match column {
            AccountColumn::Uri => qb.push_bind(self.uri.as_str()),
            AccountColumn::Username => qb.push_bind(self.username.as_str()),
            AccountColumn::Domain => qb.push_bind(self.domain.as_deref()),
            AccountColumn::DisplayName => qb.push_bind(self.display_name.as_deref()),
            AccountColumn::CreatedAt => qb.push_bind(self.created_at),
            AccountColumn::UpdatedAt => qb.push_bind(self.updated_at),
        };
    }

    fn push_key<'a>(&'a self, _index: usize, qb: &mut QueryBuilder<'a, Sqlite>) {
        qb.push_bind(self.id.as_str());
    }

    fn set_updated_at(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

// =============================================================================
// Status
// =============================================================================

/// A post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    /// Author
    pub account_id: String,
    pub in_reply_to_id: Option<String>,
    pub boost_of_id: Option<String>,
    pub thread_id: Option<String>,
    /// HTML content
    pub content: String,
    /// Visibility: public, unlisted, private, direct
    pub visibility: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[sqlx(skip)]
    #[serde(skip)]
    pub account: Option<Account>,
    #[sqlx(skip)]
    #[serde(skip)]
    pub in_reply_to: Option<Box<Status>>,
    #[sqlx(skip)]
    #[serde(skip)]
    pub boost_of: Option<Box<Status>>,
}

impl Status {
    /// Copy without any hydrated relations
    pub fn barebones(&self) -> Self {
        Self {
            account: None,
            in_reply_to: None,
            boost_of: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColumn {
    Uri,
    AccountId,
    InReplyToId,
    BoostOfId,
    ThreadId,
    Content,
    Visibility,
    CreatedAt,
    UpdatedAt,
}

impl Model for Status {
    type Column = StatusColumn;

    const ALL: &'static [StatusColumn] = &[
        StatusColumn::Uri,
        StatusColumn::AccountId,
        StatusColumn::InReplyToId,
        StatusColumn::BoostOfId,
        StatusColumn::ThreadId,
        StatusColumn::Content,
        StatusColumn::Visibility,
        StatusColumn::CreatedAt,
        StatusColumn::UpdatedAt,
    ];
    const UPDATED_AT: Option<StatusColumn> = Some(StatusColumn::UpdatedAt);
    const KEY_COLUMNS: &'static [&'static str] = &["id"];

    fn table(&self) -> &'static str {
        "statuses"
    }

    fn column_name(column: StatusColumn) -> &'static str {
        match column {
            StatusColumn::Uri => "uri",
            StatusColumn::AccountId => "account_id",
            StatusColumn::InReplyToId => "in_reply_to_id",
            StatusColumn::BoostOfId => "boost_of_id",
            StatusColumn::ThreadId => "thread_id",
            StatusColumn::Content => "content",
            StatusColumn::Visibility => "visibility",
            StatusColumn::CreatedAt => "created_at",
            StatusColumn::UpdatedAt => "updated_at",
        }
    }

    fn push_column<'a>(&'a self, column: StatusColumn, qb: &mut QueryBuilder<'a, Sqlite>) {
        match column {
            StatusColumn::Uri => qb.push_bind(self.uri.as_str()),
            StatusColumn::AccountId => qb.push_bind(self.account_id.as_str()),
            StatusColumn::InReplyToId => qb.push_bind(self.in_reply_to_id.as_deref()),
            StatusColumn::BoostOfId => qb.push_bind(self.boost_of_id.as_deref()),
            StatusColumn::ThreadId => qb.push_bind(self.thread_id.as_deref()),
            StatusColumn::Content => qb.push_bind(self.content.as_str()),
            StatusColumn::Visibility => qb.push_bind(self.visibility.as_str()),
            StatusColumn::CreatedAt => qb.push_bind(self.created_at),
            StatusColumn::UpdatedAt => qb.push_bind(self.updated_at),
        };
    }

    fn push_key<'a>(&'a self, _index: usize, qb: &mut QueryBuilder<'a, Sqlite>) {
        qb.push_bind(self.id.as_str());
    }

    fn set_updated_at(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// A direct-message conversation as seen by one local account
///
/// `last_status_id` always points at the most recently created status
/// still linked to the conversation. A conversation with no linked
/// statuses is deleted rather than left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    /// Local owner
    pub account_id: String,
    /// Everyone else taking part
    #[sqlx(json)]
    pub other_account_ids: Vec<String>,
    /// Canonical form of `other_account_ids`, see [`other_accounts_key`]
    pub other_accounts_key: String,
    pub thread_id: String,
    pub last_status_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[sqlx(skip)]
    #[serde(skip)]
    pub account: Option<Account>,
    #[sqlx(skip)]
    #[serde(skip)]
    pub other_accounts: Option<Vec<Account>>,
    #[sqlx(skip)]
    #[serde(skip)]
    pub last_status: Option<Box<Status>>,
}

impl Conversation {
    /// New, unread, statusless conversation
    pub fn new(account_id: impl Into<String>, thread_id: impl Into<String>, other_account_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            account_id: account_id.into(),
            other_accounts_key: other_accounts_key(&other_account_ids),
            other_account_ids,
            thread_id: thread_id.into(),
            last_status_id: None,
            read: false,
            created_at: now,
            updated_at: now,
            account: None,
            other_accounts: None,
            last_status: None,
        }
    }

    /// Copy without any hydrated relations
    pub fn barebones(&self) -> Self {
        Self {
            account: None,
            other_accounts: None,
            last_status: None,
            ..self.clone()
        }
    }
}

/// Participant IDs sorted, de-duplicated and comma-joined
///
/// Two conversations in the same thread with the same owner are the
/// same conversation iff their keys match.
pub fn other_accounts_key(other_account_ids: &[String]) -> String {
    let mut ids: Vec<&str> = other_account_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationColumn {
    AccountId,
    OtherAccountIds,
    OtherAccountsKey,
    ThreadId,
    LastStatusId,
    Read,
    CreatedAt,
    UpdatedAt,
}

impl Model for Conversation {
    type Column = ConversationColumn;

    const ALL: &'static [ConversationColumn] = &[
        ConversationColumn::AccountId,
        ConversationColumn::OtherAccountIds,
        ConversationColumn::OtherAccountsKey,
        ConversationColumn::ThreadId,
        ConversationColumn::LastStatusId,
        ConversationColumn::Read,
        ConversationColumn::CreatedAt,
        ConversationColumn::UpdatedAt,
    ];
    const UPDATED_AT: Option<ConversationColumn> = Some(ConversationColumn::UpdatedAt);
    const KEY_COLUMNS: &'static [&'static str] = &["id"];

    fn table(&self) -> &'static str {
        "conversations"
    }

    fn column_name(column: ConversationColumn) -> &'static str {
        match column {
            ConversationColumn::AccountId => "account_id",
            ConversationColumn::OtherAccountIds => "other_account_ids",
            ConversationColumn::OtherAccountsKey => "other_accounts_key",
            ConversationColumn::ThreadId => "thread_id",
            ConversationColumn::LastStatusId => "last_status_id",
            ConversationColumn::Read => "read",
            ConversationColumn::CreatedAt => "created_at",
            ConversationColumn::UpdatedAt => "updated_at",
        }
    }

    fn push_column<'a>(&'a self, column: ConversationColumn, qb: &mut QueryBuilder<'a, Sqlite>) {
        match column {
            ConversationColumn::AccountId => qb.push_bind(self.account_id.as_str()),
            ConversationColumn::OtherAccountIds => qb.push_bind(Json(&self.other_account_ids)),
            ConversationColumn::OtherAccountsKey => qb.push_bind(self.other_accounts_key.as_str()),
            ConversationColumn::ThreadId => qb.push_bind(self.thread_id.as_str()),
            ConversationColumn::LastStatusId => qb.push_bind(self.last_status_id.as_deref()),
            ConversationColumn::Read => qb.push_bind(self.read),
            ConversationColumn::CreatedAt => qb.push_bind(self.created_at),
            ConversationColumn::UpdatedAt => qb.push_bind(self.updated_at),
        };
    }

    fn push_key<'a>(&'a self, _index: usize, qb: &mut QueryBuilder<'a, Sqlite>) {
        qb.push_bind(self.id.as_str());
    }

    fn set_updated_at(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Membership of a status in a conversation
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ConversationToStatus {
    pub conversation_id: String,
    pub status_id: String,
}

// =============================================================================
// Domain permissions
// =============================================================================

/// Which of the two permission lists a row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainPermissionKind {
    Block,
    Allow,
}

impl DomainPermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Allow => "allow",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Block => "domain_blocks",
            Self::Allow => "domain_allows",
        }
    }
}

/// Type-level [`DomainPermissionKind`]
pub trait PermissionKind:
    fmt::Debug + Clone + Copy + Default + PartialEq + Send + Sync + Unpin + 'static
{
    const KIND: DomainPermissionKind;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Block;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allow;

impl PermissionKind for Block {
    const KIND: DomainPermissionKind = DomainPermissionKind::Block;
}

impl PermissionKind for Allow {
    const KIND: DomainPermissionKind = DomainPermissionKind::Allow;
}

/// An explicit block or allow of a domain and all its subdomains
///
/// `domain` is stored normalized: lowercase punycode, no trailing dot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainPermission<K: PermissionKind> {
    pub id: String,
    pub domain: String,
    pub created_by_account_id: Option<String>,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
    pub obfuscate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[sqlx(skip)]
    #[serde(skip)]
    pub kind: PhantomData<K>,
}

pub type DomainBlock = DomainPermission<Block>;
pub type DomainAllow = DomainPermission<Allow>;

impl<K: PermissionKind> DomainPermission<K> {
    pub fn new(domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            domain: domain.into(),
            created_by_account_id: None,
            private_comment: None,
            public_comment: None,
            obfuscate: false,
            created_at: now,
            updated_at: now,
            kind: PhantomData,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainPermissionColumn {
    Domain,
    CreatedByAccountId,
    PrivateComment,
    PublicComment,
    Obfuscate,
    CreatedAt,
    UpdatedAt,
}

impl<K: PermissionKind> Model for DomainPermission<K> {
    type Column = DomainPermissionColumn;

    const ALL: &'static [DomainPermissionColumn] = &[
        DomainPermissionColumn::Domain,
        DomainPermissionColumn::CreatedByAccountId,
        DomainPermissionColumn::PrivateComment,
        DomainPermissionColumn::PublicComment,
        DomainPermissionColumn::Obfuscate,
        DomainPermissionColumn::CreatedAt,
        DomainPermissionColumn::UpdatedAt,
    ];
    const UPDATED_AT: Option<DomainPermissionColumn> = Some(DomainPermissionColumn::UpdatedAt);
    const KEY_COLUMNS: &'static [&'static str] = &["id"];

    fn table(&self) -> &'static str {
        K::KIND.table()
    }

    fn column_name(column: DomainPermissionColumn) -> &'static str {
        match column {
            DomainPermissionColumn::Domain => "domain",
            DomainPermissionColumn::CreatedByAccountId => "created_by_account_id",
            DomainPermissionColumn::PrivateComment => "private_comment",
            DomainPermissionColumn::PublicComment => "public_comment",
            DomainPermissionColumn::Obfuscate => "obfuscate",
            DomainPermissionColumn::CreatedAt => "created_at",
            DomainPermissionColumn::UpdatedAt => "updated_at",
        }
    }

    fn push_column<'a>(&'a self, column: DomainPermissionColumn, qb: &mut QueryBuilder<'a, Sqlite>) {
        match column {
            DomainPermissionColumn::Domain => qb.push_bind(self.domain.as_str()),
            DomainPermissionColumn::CreatedByAccountId => {
                qb.push_bind(self.created_by_account_id.as_deref())
            }
            DomainPermissionColumn::PrivateComment => qb.push_bind(self.private_comment.as_deref()),
            DomainPermissionColumn::PublicComment => qb.push_bind(self.public_comment.as_deref()),
            DomainPermissionColumn::Obfuscate => qb.push_bind(self.obfuscate),
            DomainPermissionColumn::CreatedAt => qb.push_bind(self.created_at),
            DomainPermissionColumn::UpdatedAt => qb.push_bind(self.updated_at),
        };
    }

    fn push_key<'a>(&'a self, _index: usize, qb: &mut QueryBuilder<'a, Sqlite>) {
        qb.push_bind(self.id.as_str());
    }

    fn set_updated_at(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

// =============================================================================
// Marker
// =============================================================================

/// Timeline a marker tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MarkerName {
    Home,
    Notifications,
}

impl MarkerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Notifications => "notifications",
        }
    }
}

impl fmt::Display for MarkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(Self::Home),
            "notifications" => Ok(Self::Notifications),
            other => Err(AppError::Invariant(format!("unknown marker name: {other}"))),
        }
    }
}

/// Read position of one account in one timeline
///
/// `version` increments by exactly one per successful update and
/// guards against lost updates from racing writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Marker {
    pub account_id: String,
    pub name: MarkerName,
    pub last_read_id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Marker {
    pub fn new(account_id: impl Into<String>, name: MarkerName, last_read_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            name,
            last_read_id: last_read_id.into(),
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerColumn {
    LastReadId,
    Version,
    UpdatedAt,
}

impl Model for Marker {
    type Column = MarkerColumn;

    const ALL: &'static [MarkerColumn] = &[
        MarkerColumn::LastReadId,
        MarkerColumn::Version,
        MarkerColumn::UpdatedAt,
    ];
    const UPDATED_AT: Option<MarkerColumn> = Some(MarkerColumn::UpdatedAt);
    const KEY_COLUMNS: &'static [&'static str] = &["account_id", "name"];

    fn table(&self) -> &'static str {
        "markers"
    }

    fn column_name(column: MarkerColumn) -> &'static str {
        match column {
            MarkerColumn::LastReadId => "last_read_id",
            MarkerColumn::Version => "version",
            MarkerColumn::UpdatedAt => "updated_at",
        }
    }

    fn push_column<'a>(&'a self, column: MarkerColumn, qb: &mut QueryBuilder<'a, Sqlite>) {
        match column {
            MarkerColumn::LastReadId => qb.push_bind(self.last_read_id.as_str()),
            MarkerColumn::Version => qb.push_bind(self.version),
            MarkerColumn::UpdatedAt => qb.push_bind(self.updated_at),
        };
    }

    fn push_key<'a>(&'a self, index: usize, qb: &mut QueryBuilder<'a, Sqlite>) {
        match index {
            0 => qb.push_bind(self.account_id.as_str()),
            _ => qb.push_bind(self.name),
        };
    }

    fn set_updated_at(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

// =============================================================================
// Instance key
// =============================================================================

/// The instance's signing key pair (singleton row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InstanceKey {
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format)
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}
