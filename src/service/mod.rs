//! Service layer
//!
//! Content handling for authenticated federation traffic.

mod note;

pub use note::{NOTE_TYPES, NoteActivityHandler};
