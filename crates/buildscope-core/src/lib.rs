//! # buildscope-core
//!
//! The build-graph refactoring engine for buildscope.
//!
//! A captured build is a tree of actions (commands) linked to the file
//! system paths they read and write. This crate stores that graph and
//! rewrites it: deleting files and actions, merging and flattening actions,
//! and moving artifacts into packages with synthesized file groups. Every
//! rewrite is expressed as an undo log entry, so it can be reverted exactly.
//!
//! ## Layout
//!
//! - `types`: ids, graph records, error and rejection types
//! - `graph`: the `BuildStore` trait and its in-memory `BuildGraph`
//! - `undo`: primitive operations and reversible entries
//! - `refactor`: validation and entry synthesis for each refactoring
//! - `session`: one open graph with undo/redo stacks
//! - `ingest`: importing a captured build manifest
//! - `snapshot`, `formats`: canonical state and binary persistence
//!
//! ## Constraints
//!
//! - Deterministic: BTreeMap only, no HashMap, no floats, no randomness
//! - A rejected refactoring never touches the store
//! - No async, no network dependencies (pure Rust)

// =============================================================================
// MODULES
// =============================================================================

pub mod constants;
pub mod formats;
pub mod graph;
pub mod ingest;
pub mod refactor;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod undo;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ActionId, ActionNode, Cause, FileAccess, FileGroup, FileGroupId, GraphError, GroupKind,
    GroupMember, MemberRef, Membership, OperationType, Package, PackageId, PathId, PathNode,
    PathType, RefactorError, Scope, SlotKind,
};

// =============================================================================
// RE-EXPORTS: Graph Engine
// =============================================================================

pub use graph::{BuildGraph, BuildStore, FilterPattern, SerializableGraph};
pub use ingest::{AccessSpec, ActionSpec, GraphManifest, IngestReport, Ingestor, PackageSpec};
pub use refactor::RefactorContext;
pub use session::RefactorSession;
pub use snapshot::GraphSnapshot;
pub use undo::{UndoEntry, UndoOp};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{PersistenceHeader, session_from_bytes, session_to_bytes};
