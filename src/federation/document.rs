//! ActivityPub document helpers
//!
//! Inbound activities are kept as raw JSON plus a typed [`ActivityKind`].
//! Unknown activity types are preserved as [`ActivityKind::Other`] so host
//! validation and logging still see every field.

use crate::error::FederationError;
use serde_json::Value;
use std::fmt;

/// The public addressing collection
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Namespace declared by Mastodon's extension context
const MASTODON_NAMESPACE: &str = "http://joinmastodon.org/ns#";

/// Actor document types accepted when creating remote actors
pub const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Group", "Organization", "Application"];

/// ActivityPub activity types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Block,
    Add,
    Remove,
    Move,
    Flag,
    Read,
    /// Any type this server does not interpret
    Other(String),
}

impl ActivityKind {
    pub fn from_type(s: &str) -> Self {
        match s {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Block" => Self::Block,
            "Add" => Self::Add,
            "Remove" => Self::Remove,
            "Move" => Self::Move,
            "Flag" => Self::Flag,
            "Read" => Self::Read,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Move => "Move",
            Self::Flag => "Flag",
            Self::Read => "Read",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound activity
#[derive(Debug, Clone)]
pub struct Activity {
    kind: ActivityKind,
    raw: Value,
}

impl Activity {
    /// Wrap a JSON document, requiring an object with a string `type`
    pub fn from_value(raw: Value) -> Result<Self, FederationError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .map(ActivityKind::from_type)
            .ok_or_else(|| FederationError::InvalidActivity("missing type".to_string()))?;
        Ok(Self { kind, raw })
    }

    pub fn kind(&self) -> &ActivityKind {
        &self.kind
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// `id`, when it is a string
    pub fn id(&self) -> Option<&str> {
        self.raw.get("id").and_then(Value::as_str)
    }

    /// Identifier of the `actor`, whether referenced or embedded
    pub fn actor_id(&self) -> Option<&str> {
        self.raw.get("actor").and_then(ap_id)
    }

    pub fn object(&self) -> Option<&Value> {
        self.raw.get("object")
    }

    /// Identifier of the `object`, whether referenced or embedded
    pub fn object_id(&self) -> Option<&str> {
        self.object().and_then(ap_id)
    }

    /// The `object` when it is embedded rather than referenced
    pub fn embedded_object(&self) -> Option<&Value> {
        self.object().filter(|o| o.is_object())
    }

    /// Whether the activity carries a Linked Data Signature
    ///
    /// Such activities were forwarded by a third party; this server does
    /// not verify LD signatures.
    pub fn has_ld_signature(&self) -> bool {
        self.raw
            .get("signature")
            .and_then(|s| s.get("type"))
            .is_some()
    }

    /// Copy of the document without `@context` and `signature`, for logs
    pub fn summary(&self) -> Value {
        let mut summary = self.raw.clone();
        if let Some(map) = summary.as_object_mut() {
            map.remove("@context");
            map.remove("signature");
        }
        summary
    }
}

/// The identifier of an ActivityPub value
///
/// Strings are identifiers themselves; objects carry theirs in `id`.
pub fn ap_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// The `type` of an ActivityPub value
pub fn ap_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// True if a scalar or array field is or contains `needle`
pub fn field_contains(value: Option<&Value>, needle: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == needle,
        Some(Value::Array(items)) => items.iter().any(|item| ap_id(item) == Some(needle)),
        Some(other) => ap_id(other) == Some(needle),
        None => false,
    }
}

/// Whether the document's `@context` declares `namespace`
///
/// The context may be a string, an array of strings and objects, or an
/// object. Only string entries count as declarations.
pub fn context_includes(document: &Value, namespace: &str) -> bool {
    match document.get("@context") {
        Some(Value::String(s)) => s == namespace,
        Some(Value::Array(entries)) => entries.iter().any(|e| e.as_str() == Some(namespace)),
        _ => false,
    }
}

/// Guess the remote software from an activity's shape
///
/// Misskey adds `_misskey_*` fields to its notes, Mastodon declares its own
/// namespace, and Pleroma links a `/schemas/litepub` context.
pub fn detect_system(activity: &Value) -> Option<&'static str> {
    let misskey_field = |v: &Value| {
        v.as_object()
            .is_some_and(|map| map.keys().any(|k| k.starts_with("_misskey_")))
    };
    if misskey_field(activity) || activity.get("object").is_some_and(misskey_field) {
        return Some("misskey");
    }

    let context_strings: Vec<&str> = match activity.get("@context") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(entries)) => entries
            .iter()
            .flat_map(|e| match e {
                Value::String(s) => vec![s.as_str()],
                Value::Object(map) => map.values().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            })
            .collect(),
        _ => Vec::new(),
    };

    if context_strings.contains(&MASTODON_NAMESPACE) {
        Some("mastodon")
    } else if context_strings
        .iter()
        .any(|s| s.ends_with("/schemas/litepub-0.1.jsonld") || s.contains("/schemas/litepub"))
    {
        Some("pleroma")
    } else {
        None
    }
}
