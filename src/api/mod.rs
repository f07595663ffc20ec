//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor, inbox, outbox)
//! - Object lookup
//! - Metrics (Prometheus)

mod activitypub;
mod lookup;
pub mod metrics;

pub use activitypub::{ACTIVITY_JSON, activitypub_router};
pub use lookup::lookup_router;
pub use metrics::metrics_router;
