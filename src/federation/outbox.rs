//! Outbox emitter
//!
//! Serves a local user's activity history as an `OrderedCollection` with
//! cursor-paginated `OrderedCollectionPage`s. Pages are newest-first and
//! hold at most [`OUTBOX_PAGE_SIZE`] items. `until_id` walks backward in
//! time; `since_id` walks forward.

use super::renderer::{
    NoteLinks, note_uri, note_url, render_activity, render_announce, render_create, render_note,
    render_ordered_collection, render_ordered_collection_page, user_url,
};
use crate::data::{Database, EntityId, LocalUser, Note, OutboxScope};
use crate::error::AppError;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub const OUTBOX_PAGE_SIZE: usize = 20;

/// Query string of an outbox request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboxQuery {
    pub page: Option<String>,
    pub since_id: Option<String>,
    pub until_id: Option<String>,
}

/// Where a page starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Latest,
    Since(String),
    Until(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxRequest {
    Index,
    Page(Cursor),
}

impl OutboxQuery {
    /// Validate the query
    ///
    /// `page` must be `true` or `false`, cursors must be valid ids, and at
    /// most one cursor may be given.
    pub fn parse(&self) -> Result<OutboxRequest, AppError> {
        let page = match self.page.as_deref() {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(AppError::Validation(format!("invalid page: {}", other)));
            }
        };

        let since_id = self.since_id.as_deref().map(parse_cursor).transpose()?;
        let until_id = self.until_id.as_deref().map(parse_cursor).transpose()?;

        if since_id.is_some() && until_id.is_some() {
            return Err(AppError::Validation(
                "cannot set since_id and until_id".to_string(),
            ));
        }

        if !page {
            return Ok(OutboxRequest::Index);
        }

        Ok(OutboxRequest::Page(match (since_id, until_id) {
            (Some(id), _) => Cursor::Since(id),
            (_, Some(id)) => Cursor::Until(id),
            (None, None) => Cursor::Latest,
        }))
    }
}

fn parse_cursor(value: &str) -> Result<String, AppError> {
    EntityId::parse(value)
        .map(|id| id.0)
        .ok_or_else(|| AppError::Validation(format!("invalid cursor: {}", value)))
}

/// Deployment values the emitter needs
#[derive(Debug, Clone)]
pub struct OutboxContext {
    pub base_url: String,
}

pub struct OutboxEmitter {
    db: Arc<Database>,
    context: OutboxContext,
}

impl OutboxEmitter {
    pub fn new(db: Arc<Database>, context: OutboxContext) -> Self {
        Self { db, context }
    }

    /// Render the outbox of `user_id` for the given query
    ///
    /// # Errors
    /// - `NotFound` for malformed ids and users that are not federated
    /// - `Validation` for bad query parameters
    pub async fn render(&self, user_id: &str, query: &OutboxQuery) -> Result<Value, AppError> {
        let user_id = EntityId::parse(user_id).ok_or(AppError::NotFound)?;
        let request = query.parse()?;

        let user = self
            .db
            .get_user(&user_id.0)
            .await?
            .filter(LocalUser::is_federated)
            .ok_or(AppError::NotFound)?;

        let outbox_url = format!("{}/outbox", user_url(&self.context.base_url, &user.id));

        let document = match request {
            OutboxRequest::Index => render_ordered_collection(
                &outbox_url,
                user.notes_count,
                &page_url(&outbox_url, None),
                &page_url(&outbox_url, Some(("since_id", &EntityId::zero().0))),
            ),
            OutboxRequest::Page(cursor) => self.render_page(&user, &outbox_url, cursor).await?,
        };

        Ok(render_activity(document))
    }

    async fn render_page(
        &self,
        user: &LocalUser,
        outbox_url: &str,
        cursor: Cursor,
    ) -> Result<Value, AppError> {
        let scope = if user.is_everyone() {
            OutboxScope::LocalPublic
        } else {
            OutboxScope::User(user.id.clone())
        };

        let (since_id, until_id, page_id) = match &cursor {
            Cursor::Latest => (None, None, page_url(outbox_url, None)),
            Cursor::Since(id) => (
                Some(id.as_str()),
                None,
                page_url(outbox_url, Some(("since_id", id))),
            ),
            Cursor::Until(id) => (
                None,
                Some(id.as_str()),
                page_url(outbox_url, Some(("until_id", id))),
            ),
        };

        let mut notes = self
            .db
            .get_outbox_notes(&scope, since_id, until_id, OUTBOX_PAGE_SIZE)
            .await?;
        if since_id.is_some() {
            notes.reverse();
        }

        let mut items = Vec::with_capacity(notes.len());
        for note in &notes {
            items.push(self.pack_activity(note, user).await?);
        }

        let prev = notes
            .first()
            .map(|n| page_url(outbox_url, Some(("since_id", &n.id))));
        let next = notes
            .last()
            .map(|n| page_url(outbox_url, Some(("until_id", &n.id))));

        Ok(render_ordered_collection_page(
            &page_id,
            user.notes_count,
            items,
            outbox_url,
            prev,
            next,
        ))
    }

    /// Convert one note of `owner`'s outbox into an activity
    ///
    /// A pure renote becomes an `Announce` of the renoted note; anything else
    /// is a `Create` of the note. The aggregate actor announces every note.
    pub async fn pack_activity(&self, note: &Note, owner: &LocalUser) -> Result<Value, AppError> {
        let base_url = &self.context.base_url;

        if owner.is_everyone() {
            return Ok(render_announce(base_url, note, &owner.id, &note_uri(base_url, note)));
        }

        if note.is_pure_renote() {
            let target = self.linked_uri(note.renote_id.as_deref()).await?;
            let target = target.unwrap_or_else(|| note_uri(base_url, note));
            return Ok(render_announce(base_url, note, &note.user_id, &target));
        }

        let links = NoteLinks {
            in_reply_to: self.linked_uri(note.reply_id.as_deref()).await?,
            quote: self.linked_uri(note.renote_id.as_deref()).await?,
        };
        Ok(render_create(base_url, note, render_note(base_url, note, &links)))
    }

    /// Canonical URI of a referenced note
    ///
    /// Falls back to the local URL when the note is no longer stored.
    async fn linked_uri(&self, note_id: Option<&str>) -> Result<Option<String>, AppError> {
        let Some(note_id) = note_id else {
            return Ok(None);
        };
        let base_url = &self.context.base_url;
        Ok(Some(match self.db.get_note(note_id).await? {
            Some(target) => note_uri(base_url, &target),
            None => note_url(base_url, note_id),
        }))
    }
}

fn page_url(outbox_url: &str, cursor: Option<(&str, &str)>) -> String {
    match cursor {
        Some((name, id)) => format!("{}?page=true&{}={}", outbox_url, name, id),
        None => format!("{}?page=true", outbox_url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EVERYONE_USERNAME;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    const BASE: &str = "https://local.example";

    struct Fixture {
        db: Arc<Database>,
        emitter: OutboxEmitter,
        _temp_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let emitter = OutboxEmitter::new(
            db.clone(),
            OutboxContext {
                base_url: BASE.to_string(),
            },
        );
        Fixture {
            db,
            emitter,
            _temp_dir: temp_dir,
        }
    }

    fn user(username: &str) -> LocalUser {
        LocalUser {
            id: EntityId::new().0,
            username: username.to_string(),
            username_lower: username.to_lowercase(),
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
        }
    }

    fn note(user_id: &str, text: Option<&str>) -> Note {
        Note {
            id: EntityId::new().0,
            user_id: user_id.to_string(),
            user_host: None,
            uri: None,
            text: text.map(str::to_string),
            cw: None,
            renote_id: None,
            reply_id: None,
            has_poll: false,
            file_count: 0,
            visibility: "public".to_string(),
            local_only: false,
            created_at: Utc::now(),
        }
    }

    async fn seed(fixture: &Fixture, count: usize) -> (LocalUser, Vec<String>) {
        let alice = user("alice");
        fixture.db.insert_user(&alice).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let n = note(&alice.id, Some(&format!("note {}", i)));
            ids.push(n.id.clone());
            fixture.db.insert_local_note(&n).await.unwrap();
        }
        (alice, ids)
    }

    fn query(page: Option<&str>, since_id: Option<&str>, until_id: Option<&str>) -> OutboxQuery {
        OutboxQuery {
            page: page.map(str::to_string),
            since_id: since_id.map(str::to_string),
            until_id: until_id.map(str::to_string),
        }
    }

    #[test]
    fn both_cursors_are_rejected() {
        let since = EntityId::new().0;
        let until = EntityId::new().0;
        assert!(matches!(
            query(Some("true"), Some(&since), Some(&until)).parse(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        assert!(query(Some("yes"), None, None).parse().is_err());
        assert!(query(Some("true"), Some("nope"), None).parse().is_err());
        assert_eq!(query(None, None, None).parse().unwrap(), OutboxRequest::Index);
        assert_eq!(
            query(Some("true"), None, None).parse().unwrap(),
            OutboxRequest::Page(Cursor::Latest)
        );
    }

    #[tokio::test]
    async fn index_links_first_and_last_pages() {
        let fixture = fixture().await;
        let (alice, _) = seed(&fixture, 3).await;

        let index = fixture
            .emitter
            .render(&alice.id, &OutboxQuery::default())
            .await
            .unwrap();
        let outbox = format!("{}/users/{}/outbox", BASE, alice.id);
        assert_eq!(index["type"], "OrderedCollection");
        assert_eq!(index["totalItems"], 3);
        assert_eq!(index["first"], format!("{}?page=true", outbox));
        assert_eq!(
            index["last"],
            format!("{}?page=true&since_id=00000000000000000000000000", outbox)
        );
        assert!(index["@context"].is_array());
    }

    #[tokio::test]
    async fn pages_are_newest_first_and_linked() {
        let fixture = fixture().await;
        let (alice, ids) = seed(&fixture, 25).await;
        let outbox = format!("{}/users/{}/outbox", BASE, alice.id);

        let first = fixture
            .emitter
            .render(&alice.id, &query(Some("true"), None, None))
            .await
            .unwrap();
        let items = first["orderedItems"].as_array().unwrap();
        assert_eq!(items.len(), OUTBOX_PAGE_SIZE);
        assert_eq!(items[0]["object"]["id"], format!("{}/notes/{}", BASE, ids[24]));
        assert_eq!(first["prev"], format!("{}?page=true&since_id={}", outbox, ids[24]));
        assert_eq!(first["next"], format!("{}?page=true&until_id={}", outbox, ids[5]));
        assert_eq!(first["partOf"], outbox);

        let older = fixture
            .emitter
            .render(&alice.id, &query(Some("true"), None, Some(&ids[5])))
            .await
            .unwrap();
        let items = older["orderedItems"].as_array().unwrap();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0]["object"]["id"], format!("{}/notes/{}", BASE, ids[4]));

        let oldest = fixture
            .emitter
            .render(&alice.id, &query(Some("true"), Some(&EntityId::zero().0), None))
            .await
            .unwrap();
        let items = oldest["orderedItems"].as_array().unwrap();
        assert_eq!(items.len(), OUTBOX_PAGE_SIZE);
        assert_eq!(items[0]["object"]["id"], format!("{}/notes/{}", BASE, ids[19]));
        assert_eq!(
            items[OUTBOX_PAGE_SIZE - 1]["object"]["id"],
            format!("{}/notes/{}", BASE, ids[0])
        );
    }

    #[tokio::test]
    async fn empty_page_has_no_links() {
        let fixture = fixture().await;
        let (alice, ids) = seed(&fixture, 1).await;

        let page = fixture
            .emitter
            .render(&alice.id, &query(Some("true"), Some(&ids[0]), None))
            .await
            .unwrap();
        assert_eq!(page["orderedItems"], json!([]));
        assert!(page["prev"].is_null());
        assert!(page["next"].is_null());
    }

    #[tokio::test]
    async fn pure_renote_becomes_announce_of_the_original() {
        let fixture = fixture().await;
        let (alice, ids) = seed(&fixture, 1).await;

        let mut remote = note("remote-actor", Some("elsewhere"));
        remote.user_host = Some("remote.example".to_string());
        remote.uri = Some("https://remote.example/notes/1".to_string());
        let remote = fixture.db.upsert_remote_note(&remote).await.unwrap();

        let mut renote = note(&alice.id, None);
        renote.renote_id = Some(remote.id.clone());
        fixture.db.insert_local_note(&renote).await.unwrap();

        let mut local_renote = note(&alice.id, Some(""));
        local_renote.renote_id = Some(ids[0].clone());

        let announce = fixture.emitter.pack_activity(&renote, &alice).await.unwrap();
        assert_eq!(announce["type"], "Announce");
        assert_eq!(announce["object"], "https://remote.example/notes/1");

        let local = fixture
            .emitter
            .pack_activity(&local_renote, &alice)
            .await
            .unwrap();
        assert_eq!(local["object"], format!("{}/notes/{}", BASE, ids[0]));
    }

    #[tokio::test]
    async fn quotes_are_created_with_a_quote_link() {
        let fixture = fixture().await;
        let (alice, ids) = seed(&fixture, 1).await;

        let mut quote = note(&alice.id, Some("look"));
        quote.renote_id = Some(ids[0].clone());

        let create = fixture.emitter.pack_activity(&quote, &alice).await.unwrap();
        assert_eq!(create["type"], "Create");
        assert_eq!(
            create["object"]["_misskey_quote"],
            format!("{}/notes/{}", BASE, ids[0])
        );
    }

    #[tokio::test]
    async fn aggregate_actor_announces_everything() {
        let fixture = fixture().await;
        let (_alice, ids) = seed(&fixture, 2).await;
        let everyone = user(EVERYONE_USERNAME);
        fixture.db.insert_user(&everyone).await.unwrap();

        let page = fixture
            .emitter
            .render(&everyone.id, &query(Some("true"), None, None))
            .await
            .unwrap();
        let items = page["orderedItems"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        for item in items {
            assert_eq!(item["type"], "Announce");
            assert_eq!(item["actor"], format!("{}/users/{}", BASE, everyone.id));
        }
        assert_eq!(items[0]["object"], format!("{}/notes/{}", BASE, ids[1]));
    }

    #[tokio::test]
    async fn hidden_users_and_bad_ids_are_not_found() {
        let fixture = fixture().await;
        let mut suspended = user("mallory");
        suspended.is_suspended = true;
        fixture.db.insert_user(&suspended).await.unwrap();

        let unknown = EntityId::new().0;
        for id in [suspended.id.as_str(), "not-an-id", unknown.as_str()] {
            assert!(matches!(
                fixture.emitter.render(id, &OutboxQuery::default()).await,
                Err(AppError::NotFound)
            ));
        }
    }

    #[tokio::test]
    async fn bad_query_on_a_valid_user_is_a_validation_error() {
        let fixture = fixture().await;
        let (alice, ids) = seed(&fixture, 2).await;

        assert!(matches!(
            fixture
                .emitter
                .render(&alice.id, &query(Some("true"), Some(&ids[0]), Some(&ids[1])))
                .await,
            Err(AppError::Validation(_))
        ));
    }
}
