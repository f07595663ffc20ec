//! Object lookup
//!
//! Turns an arbitrary URI into a local user, a remote actor or a note,
//! fetching and storing the object when this server has never seen it.

use super::actor::RemoteActorService;
use super::document::{ACTOR_TYPES, Activity, ap_id, ap_type};
use super::host::host_of;
use super::inbox::ContentHandler;
use super::instance::InstanceRegistry;
use super::resolver::{Resolver, ResolverConfig};
use crate::data::{Database, LocalUser, Note, RemoteActor};
use crate::error::{AppError, FederationError};
use serde_json::{Value, json};
use std::sync::Arc;

/// Object types the lookup stores as notes
const NOTE_OBJECT_TYPES: [&str; 5] = ["Note", "Question", "Article", "Page", "Document"];

/// What a URI turned out to be
#[derive(Debug, Clone)]
pub enum LookupResult {
    LocalUser(LocalUser),
    RemoteUser(RemoteActor),
    Note(Note),
}

impl LookupResult {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::LocalUser(_) | Self::RemoteUser(_) => "User",
            Self::Note(_) => "Note",
        }
    }

    /// `{ type, object }` response body
    pub fn to_json(&self) -> Value {
        let object = match self {
            Self::LocalUser(user) => json!(user),
            Self::RemoteUser(actor) => json!(actor),
            Self::Note(note) => json!(note),
        };
        json!({
            "type": self.type_name(),
            "object": object
        })
    }
}

pub struct ObjectLookup {
    db: Arc<Database>,
    actors: Arc<RemoteActorService>,
    content: Arc<dyn ContentHandler>,
    instances: InstanceRegistry,
    http_client: reqwest::Client,
    resolver_config: Arc<ResolverConfig>,
    base_url: String,
}

impl ObjectLookup {
    pub fn new(
        db: Arc<Database>,
        content: Arc<dyn ContentHandler>,
        instances: InstanceRegistry,
        http_client: reqwest::Client,
        resolver_config: Arc<ResolverConfig>,
        base_url: String,
    ) -> Self {
        Self {
            actors: Arc::new(RemoteActorService::new(db.clone())),
            db,
            content,
            instances,
            http_client,
            resolver_config,
            base_url,
        }
    }

    /// Resolve `uri` to a known or newly stored object
    ///
    /// Remote fetch failures yield `Ok(None)`; only local store failures are
    /// returned as errors.
    pub async fn lookup(&self, uri: &str) -> Result<Option<LookupResult>, AppError> {
        if self.is_local(uri) {
            return self.find_local(uri).await;
        }

        let Some(host) = host_of(uri) else {
            return Ok(None);
        };
        if self.instances.is_blocked(&host).await? {
            tracing::info!(uri = %uri, host = %host, "Refusing lookup on blocked instance");
            return Ok(None);
        }

        if let Some(found) = self.find_known(uri).await? {
            return Ok(Some(found));
        }

        let resolver = Resolver::new(self.http_client.clone(), self.resolver_config.clone());
        let document = match resolver.resolve_uri(uri).await {
            Ok(document) => document,
            Err(e) => {
                tracing::debug!(uri = %uri, error = %e, "Lookup fetch failed");
                return Ok(None);
            }
        };

        let Some(canonical) = ap_id(&document).map(str::to_string) else {
            return Ok(None);
        };
        if host_of(&canonical).as_deref() != Some(host.as_str()) {
            tracing::warn!(uri = %uri, id = %canonical, "Fetched object claims another host");
            return Ok(None);
        }

        if canonical != uri {
            if self.is_local(&canonical) {
                return self.find_local(&canonical).await;
            }
            if let Some(found) = self.find_known(&canonical).await? {
                return Ok(Some(found));
            }
        }

        self.store(&resolver, &canonical, &document).await
    }

    fn is_local(&self, uri: &str) -> bool {
        uri.strip_prefix(&self.base_url)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Objects served by this server
    async fn find_local(&self, uri: &str) -> Result<Option<LookupResult>, AppError> {
        let Some(path) = uri.strip_prefix(&self.base_url) else {
            return Ok(None);
        };
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let found = match segments.as_slice() {
            ["users", id] => self
                .db
                .get_user(id)
                .await?
                .filter(LocalUser::is_federated)
                .map(LookupResult::LocalUser),
            [handle] if handle.starts_with('@') => self
                .db
                .get_user_by_username(&handle[1..].to_lowercase())
                .await?
                .filter(LocalUser::is_federated)
                .map(LookupResult::LocalUser),
            ["notes", id] => self
                .db
                .get_note(id)
                .await?
                .filter(|note| note.is_local() && !note.local_only)
                .map(LookupResult::Note),
            _ => None,
        };
        Ok(found)
    }

    /// Remote objects already stored
    async fn find_known(&self, uri: &str) -> Result<Option<LookupResult>, AppError> {
        if let Some(actor) = self.db.find_remote_actor_by_uri(uri).await? {
            return Ok(Some(LookupResult::RemoteUser(actor)));
        }
        Ok(self.db.get_note_by_uri(uri).await?.map(LookupResult::Note))
    }

    async fn store(
        &self,
        resolver: &Resolver,
        uri: &str,
        document: &Value,
    ) -> Result<Option<LookupResult>, AppError> {
        let object_type = ap_type(document).unwrap_or_default();

        if ACTOR_TYPES.contains(&object_type) {
            return match self.actors.create_from_document(uri, document).await {
                Ok(actor) => Ok(Some(LookupResult::RemoteUser(actor))),
                Err(e) => self.give_up(uri, e),
            };
        }

        if !NOTE_OBJECT_TYPES.contains(&object_type) {
            tracing::debug!(uri = %uri, object_type, "Lookup found an unsupported object");
            return Ok(None);
        }

        let Some(author_uri) = author_of(document) else {
            tracing::debug!(uri = %uri, "Looked up note has no author");
            return Ok(None);
        };
        if host_of(author_uri) != host_of(uri) {
            tracing::warn!(uri = %uri, author = %author_uri, "Looked up note is attributed to another host");
            return Ok(None);
        }

        let author = match self.actors.find_by_uri(author_uri).await? {
            Some(actor) => actor,
            None => {
                let fetched = match resolver.resolve_uri(author_uri).await {
                    Ok(fetched) => fetched,
                    Err(e) => return self.give_up(author_uri, e),
                };
                match self.actors.create_from_document(author_uri, &fetched).await {
                    Ok(actor) => actor,
                    Err(e) => return self.give_up(author_uri, e),
                }
            }
        };

        let create = Activity::from_value(json!({
            "type": "Create",
            "id": format!("{}#create", uri),
            "actor": author.uri,
            "object": document
        }))?;
        self.content.dispatch(&author, &create).await?;

        Ok(self.db.get_note_by_uri(uri).await?.map(LookupResult::Note))
    }

    fn give_up(
        &self,
        uri: &str,
        error: FederationError,
    ) -> Result<Option<LookupResult>, AppError> {
        match error {
            FederationError::Database(e) => Err(AppError::Database(e)),
            other => {
                tracing::debug!(uri = %uri, error = %other, "Lookup could not store object");
                Ok(None)
            }
        }
    }
}

/// The first `attributedTo` identifier of a note
fn author_of(document: &Value) -> Option<&str> {
    match document.get("attributedTo")? {
        Value::Array(entries) => entries.iter().find_map(ap_id),
        other => ap_id(other),
    }
}
