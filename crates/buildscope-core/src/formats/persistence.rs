//! # Persistence Format
//!
//! Binary serialization for buildscope workspaces.
//!
//! File I/O operations are in the app layer.
//!
//! Format: Header (5 bytes) + postcard-serialized workspace.
//! - 4 bytes: Magic ("BSCP")
//! - 1 byte: Version
//!
//! The workspace holds the graph and both undo stacks, so `undo` and `redo`
//! keep working across CLI invocations.
//!
//! ## Validation
//!
//! Size and header are checked before the payload is decoded, and corrupted
//! data is reported as an error rather than a panic.

use crate::constants::{FORMAT_VERSION, MAGIC_BYTES};
use crate::graph::{BuildGraph, SerializableGraph};
use crate::session::RefactorSession;
use crate::undo::UndoEntry;
use crate::GraphError;
use serde::{Deserialize, Serialize};

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum allowed size of a workspace file (500 MB).
///
/// Checked before deserialization so a corrupted length prefix cannot trigger
/// a huge allocation.
pub const MAX_PERSISTENCE_PAYLOAD_SIZE: usize = 500 * 1024 * 1024;

/// Minimum valid file size (header only).
const HEADER_SIZE: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The persistence header precedes all workspace data.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    /// Create a new header with current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if &self.magic != MAGIC_BYTES {
            return Err(GraphError::DeserializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(GraphError::DeserializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraphError> {
        let Some(header) = bytes.get(..HEADER_SIZE) else {
            return Err(GraphError::DeserializationError(
                "Header too short".to_string(),
            ));
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        Ok(Self {
            magic,
            version: header[4],
        })
    }
}

impl Default for PersistenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// WORKSPACE PAYLOAD
// =============================================================================

#[derive(Serialize, Deserialize)]
struct PersistedWorkspace {
    graph: SerializableGraph,
    applied: Vec<UndoEntry>,
    undone: Vec<UndoEntry>,
}

/// Serialize a session (graph and history) to bytes.
///
/// This is a pure transformation - no file I/O.
pub fn session_to_bytes(session: &RefactorSession<BuildGraph>) -> Result<Vec<u8>, GraphError> {
    let workspace = PersistedWorkspace {
        graph: SerializableGraph::from(session.store()),
        applied: session.applied().to_vec(),
        undone: session.undone().to_vec(),
    };
    let payload = postcard::to_stdvec(&workspace)
        .map_err(|e| GraphError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&PersistenceHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize a session from bytes.
///
/// This is a pure transformation - no file I/O.
pub fn session_from_bytes(bytes: &[u8]) -> Result<RefactorSession<BuildGraph>, GraphError> {
    if bytes.len() > MAX_PERSISTENCE_PAYLOAD_SIZE {
        return Err(GraphError::DeserializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_PERSISTENCE_PAYLOAD_SIZE
        )));
    }
    let header = PersistenceHeader::from_bytes(bytes)?;
    header.validate()?;

    let payload = bytes.get(HEADER_SIZE..).unwrap_or_default();
    let workspace: PersistedWorkspace = postcard::from_bytes(payload).map_err(|e| {
        GraphError::DeserializationError(format!("Failed to deserialize workspace: {}", e))
    })?;
    let graph = BuildGraph::try_from(workspace.graph)?;
    Ok(RefactorSession::with_history(
        graph,
        workspace.applied,
        workspace.undone,
    ))
}

// =============================================================================
// TESTS
// =============================================================================
