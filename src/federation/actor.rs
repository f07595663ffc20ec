//! Remote actor store
//!
//! Looks up known remote actors and creates new ones from fetched actor
//! documents. Creation is an upsert keyed by the actor URI, so concurrent
//! deliveries from the same unknown actor converge on one row.

use super::document::{ACTOR_TYPES, ap_id, ap_type};
use super::host::host_of;
use super::resolver::Resolver;
use crate::data::{Database, EntityId, RemoteActor};
use crate::error::FederationError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

/// Lookup and creation of remote actors
#[async_trait]
pub trait ActorStore: Send + Sync {
    /// Find by lowercase username and normalized host
    async fn find_by_handle(
        &self,
        username: &str,
        host: &str,
    ) -> Result<Option<RemoteActor>, FederationError>;

    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<RemoteActor>, FederationError>;

    /// Fetch the actor document behind `actor_uri` and store it
    ///
    /// A 4xx from the remote surfaces as a client-error `RemoteStatus`.
    async fn create(
        &self,
        resolver: &Resolver,
        actor_uri: &str,
    ) -> Result<RemoteActor, FederationError>;
}

/// Database-backed [`ActorStore`]
pub struct RemoteActorService {
    db: Arc<Database>,
}

impl RemoteActorService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn find_by_uri(&self, uri: &str) -> Result<Option<RemoteActor>, FederationError> {
        Ok(self.db.find_remote_actor_by_uri(uri).await?)
    }

    /// Store an already-fetched actor document
    pub async fn create_from_document(
        &self,
        actor_uri: &str,
        document: &Value,
    ) -> Result<RemoteActor, FederationError> {
        let actor = parse_actor_document(actor_uri, document)?;
        let stored = self.db.upsert_remote_actor(&actor).await?;

        tracing::info!(
            uri = %stored.uri,
            username = %stored.username,
            host = %stored.host,
            "Registered remote actor"
        );
        Ok(stored)
    }
}

#[async_trait]
impl ActorStore for RemoteActorService {
    async fn find_by_handle(
        &self,
        username: &str,
        host: &str,
    ) -> Result<Option<RemoteActor>, FederationError> {
        Ok(self.db.find_remote_actor_by_handle(username, host).await?)
    }

    async fn find_by_key_id(&self, key_id: &str) -> Result<Option<RemoteActor>, FederationError> {
        Ok(self.db.find_remote_actor_by_key_id(key_id).await?)
    }

    async fn create(
        &self,
        resolver: &Resolver,
        actor_uri: &str,
    ) -> Result<RemoteActor, FederationError> {
        let document = resolver.resolve_uri(actor_uri).await?;
        self.create_from_document(actor_uri, &document).await
    }
}

fn required_str<'a>(document: &'a Value, field: &str) -> Result<&'a str, FederationError> {
    document
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FederationError::InvalidActor(format!("missing {}", field)))
}

/// Validate an actor document and project it into a [`RemoteActor`]
///
/// The document's `id` and key id must live on the same host as the URI
/// it was fetched from.
pub fn parse_actor_document(
    actor_uri: &str,
    document: &Value,
) -> Result<RemoteActor, FederationError> {
    let type_name = ap_type(document).unwrap_or_default();
    if !ACTOR_TYPES.contains(&type_name) {
        return Err(FederationError::InvalidActor(format!(
            "unsupported actor type: {}",
            type_name
        )));
    }

    let expected_host = host_of(actor_uri)
        .ok_or_else(|| FederationError::InvalidActor(format!("invalid uri: {}", actor_uri)))?;

    let uri = required_str(document, "id")?;
    if host_of(uri).as_deref() != Some(expected_host.as_str()) {
        return Err(FederationError::InvalidActor(format!(
            "actor id {} is not on {}",
            uri, expected_host
        )));
    }

    let username = required_str(document, "preferredUsername")?;
    let inbox = required_str(document, "inbox")?;
    let shared_inbox = document
        .get("sharedInbox")
        .or_else(|| document.get("endpoints").and_then(|e| e.get("sharedInbox")))
        .and_then(ap_id)
        .map(str::to_string);

    let public_key = match document.get("publicKey") {
        Some(Value::Array(keys)) => keys.first(),
        other => other,
    }
    .ok_or_else(|| FederationError::InvalidActor("missing publicKey".to_string()))?;

    let public_key_id = required_str(public_key, "id")?;
    if host_of(public_key_id).as_deref() != Some(expected_host.as_str()) {
        return Err(FederationError::InvalidActor(format!(
            "key id {} is not on {}",
            public_key_id, expected_host
        )));
    }
    let public_key_pem = required_str(public_key, "publicKeyPem")?;

    Ok(RemoteActor {
        id: EntityId::new().0,
        uri: uri.to_string(),
        username: username.to_string(),
        username_lower: username.to_lowercase(),
        host: expected_host,
        inbox: inbox.to_string(),
        shared_inbox,
        public_key_id: public_key_id.to_string(),
        public_key_pem: public_key_pem.to_string(),
        last_communicated_at: Some(Utc::now()),
        created_at: Utc::now(),
    })
}
