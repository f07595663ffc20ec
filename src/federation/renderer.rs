//! ActivityPub document rendering
//!
//! Pure functions from local models to JSON documents. URLs are built
//! from the instance base URL; nothing here touches the database.

use super::document::PUBLIC_COLLECTION;
use crate::data::{LocalUser, Note, Visibility};
use serde_json::{Value, json};

/// `@context` attached to every top-level document
pub fn context() -> Value {
    json!([
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1",
        {
            "sensitive": "as:sensitive",
            "Hashtag": "as:Hashtag",
            "quoteUrl": "as:quoteUrl",
            "misskey": "https://misskey-hub.net/ns#",
            "_misskey_content": "misskey:_misskey_content",
            "_misskey_quote": "misskey:_misskey_quote"
        }
    ])
}

/// Attach the `@context` to a top-level document
pub fn render_activity(mut document: Value) -> Value {
    if let Some(map) = document.as_object_mut() {
        map.insert("@context".to_string(), context());
    }
    document
}

pub fn user_url(base_url: &str, user_id: &str) -> String {
    format!("{}/users/{}", base_url, user_id)
}

pub fn note_url(base_url: &str, note_id: &str) -> String {
    format!("{}/notes/{}", base_url, note_id)
}

/// Canonical URI of a note: its own `uri` when remote, the local URL otherwise
pub fn note_uri(base_url: &str, note: &Note) -> String {
    note.uri
        .clone()
        .unwrap_or_else(|| note_url(base_url, &note.id))
}

/// Plain text to the minimal HTML remote servers expect
pub fn text_to_html(text: &str) -> String {
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(|paragraph| {
            let lines: Vec<String> = paragraph
                .lines()
                .map(|line| html_escape::encode_text(line).into_owned())
                .collect();
            format!("<p>{}</p>", lines.join("<br>"))
        })
        .collect();
    paragraphs.concat()
}

/// `to`/`cc` for a note by `actor_uri` with the given visibility
fn addressing(visibility: &str, actor_uri: &str) -> (Vec<String>, Vec<String>) {
    let followers = format!("{}/followers", actor_uri);
    match visibility.parse::<Visibility>() {
        Ok(Visibility::Public) => (vec![PUBLIC_COLLECTION.to_string()], vec![followers]),
        Ok(Visibility::Home) => (vec![followers], vec![PUBLIC_COLLECTION.to_string()]),
        Ok(Visibility::Followers) => (vec![followers], Vec::new()),
        Ok(Visibility::Specified) | Err(_) => (Vec::new(), Vec::new()),
    }
}

/// Links a note has to other notes, already resolved to URIs
#[derive(Debug, Default, Clone)]
pub struct NoteLinks {
    pub in_reply_to: Option<String>,
    pub quote: Option<String>,
}

/// Render a note as an ActivityPub `Note` (or `Question` when it has a poll)
pub fn render_note(base_url: &str, note: &Note, links: &NoteLinks) -> Value {
    let actor_uri = user_url(base_url, &note.user_id);
    let (to, cc) = addressing(&note.visibility, &actor_uri);
    let text = note.text.clone().unwrap_or_default();
    let object_type = if note.has_poll { "Question" } else { "Note" };

    let mut content = text_to_html(&text);
    if let Some(quote) = &links.quote {
        content.push_str(&format!(
            "<p><span class=\"quote-inline\"><br>RE: <a href=\"{0}\">{0}</a></span></p>",
            html_escape::encode_double_quoted_attribute(quote)
        ));
    }

    json!({
        "id": note_url(base_url, &note.id),
        "type": object_type,
        "attributedTo": actor_uri,
        "summary": note.cw,
        "content": content,
        "_misskey_content": note.text,
        "_misskey_quote": links.quote,
        "quoteUrl": links.quote,
        "published": note.created_at.to_rfc3339(),
        "to": to,
        "cc": cc,
        "inReplyTo": links.in_reply_to,
        "attachment": [],
        "sensitive": note.cw.is_some(),
        "tag": []
    })
}

/// Wrap a rendered note in a `Create`
pub fn render_create(base_url: &str, note: &Note, object: Value) -> Value {
    let actor_uri = user_url(base_url, &note.user_id);
    let to = object.get("to").cloned().unwrap_or_else(|| json!([]));
    let cc = object.get("cc").cloned().unwrap_or_else(|| json!([]));

    json!({
        "id": format!("{}/activity", note_url(base_url, &note.id)),
        "actor": actor_uri,
        "type": "Create",
        "published": note.created_at.to_rfc3339(),
        "object": object,
        "to": to,
        "cc": cc
    })
}

/// `Announce` of `object_uri`, made by `actor_id` through `note`
pub fn render_announce(base_url: &str, note: &Note, actor_id: &str, object_uri: &str) -> Value {
    let actor_uri = user_url(base_url, actor_id);
    let (to, cc) = addressing(&note.visibility, &actor_uri);

    json!({
        "id": format!("{}/activity", note_url(base_url, &note.id)),
        "actor": actor_uri,
        "type": "Announce",
        "published": note.created_at.to_rfc3339(),
        "to": to,
        "cc": cc,
        "object": object_uri
    })
}

/// Outbox index document
pub fn render_ordered_collection(id: &str, total_items: i64, first: &str, last: &str) -> Value {
    json!({
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total_items,
        "first": first,
        "last": last
    })
}

/// One page of an ordered collection
pub fn render_ordered_collection_page(
    id: &str,
    total_items: i64,
    ordered_items: Vec<Value>,
    part_of: &str,
    prev: Option<String>,
    next: Option<String>,
) -> Value {
    json!({
        "id": id,
        "partOf": part_of,
        "type": "OrderedCollectionPage",
        "totalItems": total_items,
        "orderedItems": ordered_items,
        "prev": prev,
        "next": next
    })
}

/// Actor document for a local user
pub fn render_person(base_url: &str, user: &LocalUser) -> Value {
    let actor_url = user_url(base_url, &user.id);
    let actor_type = if user.is_bot || user.is_everyone() {
        "Service"
    } else {
        "Person"
    };

    json!({
        "type": actor_type,
        "id": actor_url,
        "inbox": format!("{}/inbox", actor_url),
        "outbox": format!("{}/outbox", actor_url),
        "followers": format!("{}/followers", actor_url),
        "following": format!("{}/following", actor_url),
        "sharedInbox": format!("{}/inbox", base_url),
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "url": format!("{}/@{}", base_url, user.username),
        "preferredUsername": user.username,
        "name": user.name,
        "summary": user.summary.as_deref().map(text_to_html),
        "manuallyApprovesFollowers": user.is_locked,
        "publicKey": {
            "id": format!("{}#main-key", actor_url),
            "owner": actor_url,
            "publicKeyPem": user.public_key_pem
        }
    })
}
