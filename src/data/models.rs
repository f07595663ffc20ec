//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// ULIDs sort lexicographically in creation order, which is what the
/// outbox cursors rely on.
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

lazy_static::lazy_static! {
    static ref ID_GENERATOR: Mutex<ulid::Generator> = Mutex::new(ulid::Generator::new());
}

impl EntityId {
    /// Generate a new ULID
    ///
    /// IDs generated by this process are strictly increasing, even within
    /// the same millisecond.
    pub fn new() -> Self {
        let mut generator = ID_GENERATOR
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ulid = generator.generate().unwrap_or_else(|_| ulid::Ulid::new());
        Self(ulid.to_string())
    }

    /// Parse and canonicalize an existing ULID string
    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s)
            .ok()
            .map(|ulid| Self(ulid.to_string()))
    }

    /// The smallest possible id, used as the start of the forward walk
    pub fn zero() -> Self {
        Self(ulid::Ulid::nil().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local users
// =============================================================================

/// Username of the aggregate actor whose outbox re-announces all public local notes
pub const EVERYONE_USERNAME: &str = "everyone";

/// A user hosted on this server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalUser {
    pub id: String,
    pub username: String,
    pub username_lower: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub is_bot: bool,
    pub is_locked: bool,
    pub is_deleted: bool,
    pub is_suspended: bool,
    pub no_federation: bool,
    pub notes_count: i64,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

impl LocalUser {
    pub fn is_everyone(&self) -> bool {
        self.username_lower == EVERYONE_USERNAME
    }

    /// Whether remote servers may see this user at all
    pub fn is_federated(&self) -> bool {
        !self.is_deleted && !self.is_suspended && !self.no_federation
    }
}

// =============================================================================
// Remote actors
// =============================================================================

/// Local projection of a foreign identity
///
/// Unique by `uri`, by (`username_lower`, `host`) and by `public_key_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    pub id: String,
    pub uri: String,
    pub username: String,
    pub username_lower: String,
    pub host: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
    pub last_communicated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notes
// =============================================================================

/// Note visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Home,
    Followers,
    Specified,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Home => "home",
            Self::Followers => "followers",
            Self::Specified => "specified",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "home" => Ok(Self::Home),
            "followers" => Ok(Self::Followers),
            "specified" => Ok(Self::Specified),
            other => Err(format!("unknown visibility: {}", other)),
        }
    }
}

/// A post, local or remote
///
/// Local notes have `user_host = None` and `uri = None`; remote notes carry
/// the canonical URI they were fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    pub user_id: String,
    pub user_host: Option<String>,
    pub uri: Option<String>,
    pub text: Option<String>,
    pub cw: Option<String>,
    pub renote_id: Option<String>,
    pub reply_id: Option<String>,
    pub has_poll: bool,
    pub file_count: i64,
    /// public, home, followers, specified
    pub visibility: String,
    pub local_only: bool,
    pub created_at: DateTime<Utc>,
}

impl Note {
    /// A renote with no content of its own
    pub fn is_pure_renote(&self) -> bool {
        self.renote_id.is_some()
            && self.text.as_deref().is_none_or(str::is_empty)
            && !self.has_poll
            && self.file_count == 0
    }

    pub fn is_local(&self) -> bool {
        self.user_host.is_none()
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Per-remote-host trust and liveness record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub host: String,
    pub is_blocked: bool,
    pub latest_request_received_at: Option<DateTime<Utc>>,
    pub last_communicated_at: Option<DateTime<Utc>>,
    pub is_not_responding: bool,
    /// Detected remote implementation (misskey, mastodon, ...)
    pub system: Option<String>,
    pub caught_at: DateTime<Utc>,
}

/// Telemetry fields written after a verified delivery
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub latest_request_received_at: Option<DateTime<Utc>>,
    pub last_communicated_at: Option<DateTime<Utc>>,
    pub is_not_responding: Option<bool>,
    pub system: Option<String>,
    pub is_blocked: Option<bool>,
}
