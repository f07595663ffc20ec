//! ActivityPub federation module
//!
//! Handles:
//! - Inbound deliveries (HTTP signatures, host checks, inbox processing)
//! - Dereferencing remote objects (resolver)
//! - Remote actor and instance bookkeeping
//! - Outbox collections and document rendering
//! - Object lookup by URI

mod actor;
mod document;
mod host;
mod inbox;
mod instance;
mod lookup;
mod outbox;
mod queue;
mod renderer;
mod resolver;
mod signature;

pub use actor::{ActorStore, RemoteActorService, parse_actor_document};
pub use document::{
    ACTOR_TYPES, Activity, ActivityKind, PUBLIC_COLLECTION, ap_id, ap_type, context_includes,
    detect_system, field_contains,
};
pub use host::{SignerIdentity, host_of, normalize_host, parse_acct, validate_activity_hosts};
pub use inbox::{ContentHandler, DeliveryEnvelope, DropReason, InboxOutcome, InboxProcessor};
pub use instance::{InstanceRegistry, InstanceStore};
pub use lookup::{LookupResult, ObjectLookup};
pub use outbox::{Cursor, OUTBOX_PAGE_SIZE, OutboxContext, OutboxEmitter, OutboxQuery, OutboxRequest};
pub use queue::{DeliveryHandler, InboxQueue};
pub use renderer::{
    NoteLinks, context, note_uri, note_url, render_activity, render_announce, render_create,
    render_note, render_ordered_collection, render_ordered_collection_page, render_person,
    text_to_html, user_url,
};
pub use resolver::{Collection, CollectionKind, Resolver, ResolverConfig};
pub use signature::{
    SignatureHeaders, SignatureParams, generate_digest, parse_signature_header, sign_request,
    verify_signature,
};
