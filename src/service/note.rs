//! Note content handler
//!
//! Applies authenticated activities to the local note store. Every write is
//! keyed by an ActivityPub URI, so redelivered activities are no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::{Database, EntityId, Note, RemoteActor, Visibility};
use crate::error::FederationError;
use crate::federation::{
    ACTOR_TYPES, Activity, ActivityKind, ContentHandler, PUBLIC_COLLECTION, ap_id, ap_type,
    field_contains, host_of,
};

/// Object types stored as notes
pub const NOTE_TYPES: [&str; 4] = ["Note", "Question", "Article", "Page"];

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// The URI a `Delete` targets
///
/// Accepts a bare URI, an embedded object, or a `Tombstone`.
fn delete_target_uri(object: &Value) -> Option<&str> {
    if let Some(uri) = object.as_str() {
        return Some(uri);
    }

    let is_tombstone = ap_type(object).is_some_and(|t| t.eq_ignore_ascii_case("Tombstone"));
    if is_tombstone {
        return object
            .get("object")
            .and_then(Value::as_str)
            .or_else(|| ap_id(object));
    }

    ap_id(object)
}

/// Visibility of a remote object from its addressing
fn extract_visibility(object: &Value, actor: &RemoteActor) -> Visibility {
    if field_contains(object.get("to"), PUBLIC_COLLECTION) {
        Visibility::Public
    } else if field_contains(object.get("cc"), PUBLIC_COLLECTION) {
        Visibility::Home
    } else {
        let followers = format!("{}/followers", actor.uri);
        let addressed_followers = field_contains(object.get("to"), &followers)
            || field_contains(object.get("cc"), &followers);
        if addressed_followers {
            Visibility::Followers
        } else {
            Visibility::Specified
        }
    }
}

fn published_at(object: &Value) -> DateTime<Utc> {
    object
        .get("published")
        .and_then(Value::as_str)
        .and_then(|published| DateTime::parse_from_rfc3339(published).ok())
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Stores notes, renotes and deletions from remote actors
pub struct NoteActivityHandler {
    db: Arc<Database>,
    base_url: String,
}

impl NoteActivityHandler {
    pub fn new(db: Arc<Database>, base_url: String) -> Self {
        Self { db, base_url }
    }

    /// Find a stored note by URI, local or remote
    async fn find_note(&self, uri: &str) -> Result<Option<Note>, FederationError> {
        let local_prefix = format!("{}/notes/", self.base_url);
        if let Some(id) = uri.strip_prefix(&local_prefix) {
            return Ok(self.db.get_note(id).await?.filter(Note::is_local));
        }
        Ok(self.db.get_note_by_uri(uri).await?)
    }

    async fn find_note_id(&self, uri: Option<&str>) -> Result<Option<String>, FederationError> {
        match uri {
            Some(uri) => Ok(self.find_note(uri).await?.map(|note| note.id)),
            None => Ok(None),
        }
    }

    async fn handle_create(
        &self,
        actor: &RemoteActor,
        activity: &Activity,
    ) -> Result<(), FederationError> {
        let Some(object) = activity.embedded_object() else {
            tracing::debug!(actor = %actor.uri, "Ignoring Create with a referenced object");
            return Ok(());
        };

        let object_type = ap_type(object).unwrap_or_default();
        if !NOTE_TYPES.contains(&object_type) {
            tracing::debug!(actor = %actor.uri, object_type, "Ignoring Create of unsupported object");
            return Ok(());
        }

        let Some(uri) = ap_id(object) else {
            return Err(FederationError::InvalidActivity(
                "Create object has no id".to_string(),
            ));
        };

        if !field_contains(object.get("attributedTo"), &actor.uri) {
            tracing::warn!(actor = %actor.uri, note = %uri, "Ignoring note attributed to someone else");
            return Ok(());
        }

        let text = match object.get("_misskey_content").and_then(Value::as_str) {
            Some(source) => Some(source.to_string()),
            None => object
                .get("content")
                .and_then(Value::as_str)
                .map(sanitize_remote_html),
        };
        let cw = object
            .get("summary")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let quote_uri = ["_misskey_quote", "quoteUrl", "quoteUri"]
            .iter()
            .find_map(|field| object.get(*field).and_then(Value::as_str));
        let reply_uri = object.get("inReplyTo").and_then(ap_id);

        let file_count = object
            .get("attachment")
            .and_then(Value::as_array)
            .map_or(0, |files| files.len() as i64);

        let note = Note {
            id: EntityId::new().0,
            user_id: actor.id.clone(),
            user_host: Some(actor.host.clone()),
            uri: Some(uri.to_string()),
            text,
            cw,
            renote_id: self.find_note_id(quote_uri).await?,
            reply_id: self.find_note_id(reply_uri).await?,
            has_poll: object_type == "Question",
            file_count,
            visibility: extract_visibility(object, actor).as_str().to_string(),
            local_only: false,
            created_at: published_at(object),
        };

        let stored = self.db.upsert_remote_note(&note).await?;
        tracing::debug!(note = %uri, id = %stored.id, "Stored remote note");
        Ok(())
    }

    async fn handle_announce(
        &self,
        actor: &RemoteActor,
        activity: &Activity,
    ) -> Result<(), FederationError> {
        let (Some(uri), Some(target_uri)) = (activity.id(), activity.object_id()) else {
            tracing::debug!(actor = %actor.uri, "Ignoring Announce without id or object");
            return Ok(());
        };

        let Some(target) = self.find_note(target_uri).await? else {
            tracing::debug!(actor = %actor.uri, target = %target_uri, "Ignoring Announce of unknown note");
            return Ok(());
        };

        let renote = Note {
            id: EntityId::new().0,
            user_id: actor.id.clone(),
            user_host: Some(actor.host.clone()),
            uri: Some(uri.to_string()),
            text: None,
            cw: None,
            renote_id: Some(target.id),
            reply_id: None,
            has_poll: false,
            file_count: 0,
            visibility: extract_visibility(activity.raw(), actor).as_str().to_string(),
            local_only: false,
            created_at: published_at(activity.raw()),
        };

        self.db.upsert_remote_note(&renote).await?;
        Ok(())
    }

    async fn handle_delete(
        &self,
        actor: &RemoteActor,
        activity: &Activity,
    ) -> Result<(), FederationError> {
        let Some(uri) = activity.object().and_then(delete_target_uri) else {
            return Err(FederationError::InvalidActivity(
                "Delete without object".to_string(),
            ));
        };

        if uri == actor.uri {
            tracing::debug!(actor = %actor.uri, "Ignoring actor self-deletion");
            return Ok(());
        }

        if self.db.delete_note_by_uri(uri, &actor.id).await? {
            tracing::debug!(note = %uri, "Deleted remote note");
        } else {
            tracing::debug!(actor = %actor.uri, note = %uri, "Delete target not found or not owned");
        }
        Ok(())
    }

    async fn handle_undo(
        &self,
        actor: &RemoteActor,
        activity: &Activity,
    ) -> Result<(), FederationError> {
        let Some(object) = activity.object() else {
            return Err(FederationError::InvalidActivity("Undo without object".to_string()));
        };

        let undoes_announce = object.is_string() || ap_type(object) == Some("Announce");
        let Some(uri) = ap_id(object).filter(|_| undoes_announce) else {
            tracing::debug!(actor = %actor.uri, "Ignoring Undo of unsupported activity");
            return Ok(());
        };

        self.db.delete_note_by_uri(uri, &actor.id).await?;
        Ok(())
    }

    async fn handle_update(
        &self,
        actor: &RemoteActor,
        activity: &Activity,
    ) -> Result<(), FederationError> {
        let Some(object) = activity.embedded_object() else {
            return Ok(());
        };

        let is_actor = ap_type(object).is_some_and(|t| ACTOR_TYPES.contains(&t));
        if !is_actor || ap_id(object) != Some(actor.uri.as_str()) {
            tracing::debug!(actor = %actor.uri, "Ignoring Update of something other than the actor");
            return Ok(());
        }

        let username = object
            .get("preferredUsername")
            .and_then(Value::as_str)
            .unwrap_or(actor.username.as_str());
        let inbox = object
            .get("inbox")
            .and_then(Value::as_str)
            .filter(|inbox| host_of(inbox).as_deref() == Some(actor.host.as_str()))
            .unwrap_or(actor.inbox.as_str());
        let shared_inbox = object
            .get("sharedInbox")
            .or_else(|| object.get("endpoints").and_then(|e| e.get("sharedInbox")))
            .and_then(ap_id)
            .or(actor.shared_inbox.as_deref());

        self.db
            .update_remote_actor_profile(&actor.uri, username, inbox, shared_inbox)
            .await?;
        tracing::debug!(actor = %actor.uri, "Updated remote actor profile");
        Ok(())
    }
}

#[async_trait]
impl ContentHandler for NoteActivityHandler {
    async fn dispatch(&self, actor: &RemoteActor, activity: &Activity) -> Result<(), FederationError> {
        match activity.kind() {
            ActivityKind::Create => self.handle_create(actor, activity).await,
            ActivityKind::Announce => self.handle_announce(actor, activity).await,
            ActivityKind::Delete => self.handle_delete(actor, activity).await,
            ActivityKind::Undo => self.handle_undo(actor, activity).await,
            ActivityKind::Update => self.handle_update(actor, activity).await,
            other => {
                tracing::debug!(actor = %actor.uri, activity_type = %other, "Ignoring unhandled activity");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::LocalUser;
    use serde_json::json;
    use tempfile::TempDir;

    const BASE: &str = "https://local.example";

    struct Fixture {
        db: Arc<Database>,
        handler: NoteActivityHandler,
        actor: RemoteActor,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let actor = db
            .upsert_remote_actor(&RemoteActor {
                id: EntityId::new().0,
                uri: "https://remote.example/users/alice".to_string(),
                username: "alice".to_string(),
                username_lower: "alice".to_string(),
                host: "remote.example".to_string(),
                inbox: "https://remote.example/users/alice/inbox".to_string(),
                shared_inbox: None,
                public_key_id: "https://remote.example/users/alice#main-key".to_string(),
                public_key_pem: "pem".to_string(),
                last_communicated_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let handler = NoteActivityHandler::new(db.clone(), BASE.to_string());
        Fixture {
            db,
            handler,
            actor,
            _temp_dir: temp_dir,
        }
    }

    fn activity(value: Value) -> Activity {
        Activity::from_value(value).unwrap()
    }

    fn create(object: Value) -> Activity {
        activity(json!({
            "type": "Create",
            "id": "https://remote.example/notes/1/activity",
            "actor": "https://remote.example/users/alice",
            "object": object
        }))
    }

    fn note_object() -> Value {
        json!({
            "type": "Note",
            "id": "https://remote.example/notes/1",
            "attributedTo": "https://remote.example/users/alice",
            "content": "<p>hello<script>alert(1)</script></p>",
            "published": "2024-05-01T12:00:00Z",
            "to": [PUBLIC_COLLECTION],
            "cc": ["https://remote.example/users/alice/followers"]
        })
    }

    #[tokio::test]
    async fn create_stores_sanitized_note_once() {
        let f = fixture().await;

        f.handler.dispatch(&f.actor, &create(note_object())).await.unwrap();
        f.handler.dispatch(&f.actor, &create(note_object())).await.unwrap();

        let note = f
            .db
            .get_note_by_uri("https://remote.example/notes/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.user_id, f.actor.id);
        assert_eq!(note.user_host.as_deref(), Some("remote.example"));
        assert_eq!(note.visibility, "public");
        assert_eq!(note.text.as_deref(), Some("<p>hello</p>"));
        assert_eq!(note.created_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[tokio::test]
    async fn create_links_replies_to_local_notes() {
        let f = fixture().await;
        let author = LocalUser {
            id: EntityId::new().0,
            username: "bob".to_string(),
            username_lower: "bob".to_string(),
            name: None,
            summary: None,
            is_bot: false,
            is_locked: false,
            is_deleted: false,
            is_suspended: false,
            no_federation: false,
            notes_count: 0,
            public_key_pem: "pem".to_string(),
            created_at: Utc::now(),
        };
        f.db.insert_user(&author).await.unwrap();
        let local = Note {
            id: EntityId::new().0,
            user_id: author.id.clone(),
            user_host: None,
            uri: None,
            text: Some("original".to_string()),
            cw: None,
            renote_id: None,
            reply_id: None,
            has_poll: false,
            file_count: 0,
            visibility: "public".to_string(),
            local_only: false,
            created_at: Utc::now(),
        };
        f.db.insert_local_note(&local).await.unwrap();

        let mut object = note_object();
        object["inReplyTo"] = json!(format!("{}/notes/{}", BASE, local.id));
        object["_misskey_quote"] = json!("https://unknown.example/notes/9");
        f.handler.dispatch(&f.actor, &create(object)).await.unwrap();

        let note = f
            .db
            .get_note_by_uri("https://remote.example/notes/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.reply_id, Some(local.id));
        assert_eq!(note.renote_id, None);
    }

    #[tokio::test]
    async fn create_ignores_notes_attributed_to_others() {
        let f = fixture().await;
        let mut object = note_object();
        object["attributedTo"] = json!("https://remote.example/users/bob");

        f.handler.dispatch(&f.actor, &create(object)).await.unwrap();
        assert!(
            f.db.get_note_by_uri("https://remote.example/notes/1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn followers_only_and_direct_visibility() {
        let f = fixture().await;
        let mut object = note_object();
        object["to"] = json!(["https://remote.example/users/alice/followers"]);
        object["cc"] = json!([]);
        assert_eq!(extract_visibility(&object, &f.actor), Visibility::Followers);

        object["to"] = json!(["https://local.example/users/someone"]);
        assert_eq!(extract_visibility(&object, &f.actor), Visibility::Specified);

        object["cc"] = json!(PUBLIC_COLLECTION);
        assert_eq!(extract_visibility(&object, &f.actor), Visibility::Home);
    }

    #[tokio::test]
    async fn announce_and_undo_round_trip() {
        let f = fixture().await;
        f.handler.dispatch(&f.actor, &create(note_object())).await.unwrap();

        let announce = json!({
            "type": "Announce",
            "id": "https://remote.example/announces/1",
            "actor": "https://remote.example/users/alice",
            "object": "https://remote.example/notes/1",
            "to": [PUBLIC_COLLECTION]
        });
        f.handler.dispatch(&f.actor, &activity(announce.clone())).await.unwrap();

        let renote = f
            .db
            .get_note_by_uri("https://remote.example/announces/1")
            .await
            .unwrap()
            .unwrap();
        assert!(renote.is_pure_renote());

        let undo = json!({
            "type": "Undo",
            "id": "https://remote.example/undo/1",
            "actor": "https://remote.example/users/alice",
            "object": announce
        });
        f.handler.dispatch(&f.actor, &activity(undo)).await.unwrap();
        assert!(
            f.db.get_note_by_uri("https://remote.example/announces/1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let f = fixture().await;
        f.handler.dispatch(&f.actor, &create(note_object())).await.unwrap();

        let mut mallory = f.actor.clone();
        mallory.id = EntityId::new().0;
        let delete = activity(json!({
            "type": "Delete",
            "actor": "https://remote.example/users/mallory",
            "object": {"type": "Tombstone", "id": "https://remote.example/notes/1"}
        }));
        f.handler.dispatch(&mallory, &delete).await.unwrap();
        assert!(
            f.db.get_note_by_uri("https://remote.example/notes/1")
                .await
                .unwrap()
                .is_some()
        );

        f.handler.dispatch(&f.actor, &delete).await.unwrap();
        assert!(
            f.db.get_note_by_uri("https://remote.example/notes/1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn update_refreshes_profile_but_not_keys() {
        let f = fixture().await;
        let update = activity(json!({
            "type": "Update",
            "actor": "https://remote.example/users/alice",
            "object": {
                "type": "Person",
                "id": "https://remote.example/users/alice",
                "preferredUsername": "Alice2",
                "inbox": "https://remote.example/inbox2",
                "publicKey": {
                    "id": "https://remote.example/users/alice#other-key",
                    "publicKeyPem": "replaced"
                }
            }
        }));
        f.handler.dispatch(&f.actor, &update).await.unwrap();

        let stored = f
            .db
            .find_remote_actor_by_uri("https://remote.example/users/alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.username, "Alice2");
        assert_eq!(stored.username_lower, "alice2");
        assert_eq!(stored.inbox, "https://remote.example/inbox2");
        assert_eq!(stored.public_key_pem, "pem");
        assert_eq!(stored.public_key_id, "https://remote.example/users/alice#main-key");
    }

    #[tokio::test]
    async fn unknown_activities_are_ignored() {
        let f = fixture().await;
        let like = activity(json!({"type": "Like", "object": "https://local.example/notes/x"}));
        f.handler.dispatch(&f.actor, &like).await.unwrap();

        let custom = activity(json!({"type": "EmojiReact"}));
        f.handler.dispatch(&f.actor, &custom).await.unwrap();
    }

    #[test]
    fn delete_targets_accept_all_shapes() {
        assert_eq!(delete_target_uri(&json!("https://r.example/1")), Some("https://r.example/1"));
        assert_eq!(
            delete_target_uri(&json!({"type": "Tombstone", "id": "https://r.example/2"})),
            Some("https://r.example/2")
        );
        assert_eq!(
            delete_target_uri(&json!({"type": "Note", "id": "https://r.example/3"})),
            Some("https://r.example/3")
        );
        assert_eq!(delete_target_uri(&json!(42)), None);
    }
}
