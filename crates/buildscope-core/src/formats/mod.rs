//! # Formats
//!
//! Binary workspace format: a refactoring session (graph plus undo/redo
//! history) serialized with postcard behind a magic/version header.

pub mod persistence;

pub use persistence::{
    MAX_PERSISTENCE_PAYLOAD_SIZE, PersistenceHeader, session_from_bytes, session_to_bytes,
};
