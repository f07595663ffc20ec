//! Host normalization and signer identity
//!
//! Hosts are compared in their lowercase ASCII (punycode) form, without
//! port or trailing dot.

use super::document::{Activity, ActivityKind, ap_id};
use crate::error::FederationError;
use serde_json::Value;

/// Normalize a bare host name
pub fn normalize_host(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_end_matches('.');
    if trimmed.is_empty() || trimmed.contains(['/', '?', '#', '@']) {
        return None;
    }

    url::Url::parse(&format!("https://{trimmed}/"))
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
}

/// The normalized host of an absolute URI
pub fn host_of(uri: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
        .filter(|h| !h.is_empty())
}

/// Split `user@host` (optionally prefixed with `@`) into its parts
pub fn parse_acct(acct: &str) -> (&str, Option<&str>) {
    let acct = acct.strip_prefix('@').unwrap_or(acct);
    match acct.split_once('@') {
        Some((username, host)) if !host.is_empty() => (username, Some(host)),
        Some((username, _)) => (username, None),
        None => (acct, None),
    }
}

/// Who an inbound delivery claims to be signed by
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerIdentity {
    /// `acct:user@host` key id; looked up by lowercased handle
    Handle { username: String, host: String },
    /// Key URI; looked up by public key id
    Key { key_id: String, host: String },
}

impl SignerIdentity {
    /// Derive the signer and its claimed host from a signature `keyId`
    pub fn parse(key_id: &str) -> Result<Self, FederationError> {
        let lower = key_id.to_lowercase();

        if let Some(acct) = lower.strip_prefix("acct:") {
            let (username, host) = parse_acct(acct);
            let Some(host) = host else {
                return Err(FederationError::LocalActorClaim(username.to_string()));
            };
            if username.is_empty() {
                return Err(FederationError::InvalidKeyId(key_id.to_string()));
            }
            let host = normalize_host(host)
                .ok_or_else(|| FederationError::InvalidKeyId(key_id.to_string()))?;
            return Ok(Self::Handle {
                username: username.to_string(),
                host,
            });
        }

        let host = host_of(key_id).ok_or_else(|| FederationError::InvalidKeyId(key_id.to_string()))?;
        Ok(Self::Key {
            key_id: key_id.to_string(),
            host,
        })
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Handle { host, .. } | Self::Key { host, .. } => host,
        }
    }
}

/// Check that every identifier in the activity lives on `host`
///
/// Covers `id` and `actor`, plus `object.id` and `object.attributedTo` of
/// a Create. An `attributedTo` array passes when any entry matches.
pub fn validate_activity_hosts(activity: &Activity, host: &str) -> Result<(), FederationError> {
    let forwarded = activity.has_ld_signature();
    let check = |field: &str, uri: &str| -> Result<(), FederationError> {
        if host_of(uri).as_deref() == Some(host) {
            return Ok(());
        }
        let mut message = format!("{field} has different host: {uri} (signer: {host})");
        if forwarded {
            message.push_str("; the activity carries an LD-Signature and was probably forwarded");
        }
        Err(FederationError::HostMismatch(message))
    };

    if let Some(id) = activity.id() {
        check("activity.id", id)?;
    }
    if let Some(actor) = activity.actor_id() {
        check("activity.actor", actor)?;
    }

    if *activity.kind() == ActivityKind::Create {
        if let Some(object) = activity.embedded_object() {
            if let Some(id) = object.get("id").and_then(Value::as_str) {
                check("activity.object.id", id)?;
            }

            match object.get("attributedTo") {
                Some(Value::Array(entries)) => {
                    let ids: Vec<&str> = entries.iter().filter_map(ap_id).collect();
                    if !ids.is_empty() && !ids.iter().any(|id| host_of(id).as_deref() == Some(host)) {
                        check("activity.object.attributedTo", ids[0])?;
                    }
                }
                Some(value) => {
                    if let Some(id) = ap_id(value) {
                        check("activity.object.attributedTo", id)?;
                    }
                }
                None => {}
            }
        }
    }

    Ok(())
}
