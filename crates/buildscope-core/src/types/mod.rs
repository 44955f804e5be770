//! # Core Type Definitions
//!
//! This module contains all core types for the buildscope graph:
//! - Object identifiers (`ActionId`, `PathId`, `PackageId`, `FileGroupId`)
//! - Node records (`ActionNode`, `PathNode`, `Package`, `FileGroup`)
//! - File-access links (`FileAccess`, `OperationType`)
//! - Package membership (`MemberRef`, `Membership`, `Scope`)
//! - Error types (`GraphError`, `Cause`, `RefactorError`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers implement `Ord` so that every collection in the store and
//! in the refactoring engine is a `BTreeMap`/`BTreeSet` with a stable order.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of an action (build step) in the action tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub u64);

/// Identifier of a path (file, directory or symlink) in the path tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId(pub u64);

/// Identifier of a package. Defaults to [`PackageId::IMPORT`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PackageId(pub u64);

/// Identifier of a file group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileGroupId(pub u64);

impl ActionId {
    /// The sentinel root of the action tree. Never trashed.
    pub const ROOT: Self = Self(0);
}

impl PathId {
    /// The root directory `/`. Never trashed.
    pub const ROOT: Self = Self(0);
}

impl PackageId {
    /// The `<import>` package every object belongs to until it is moved.
    pub const IMPORT: Self = Self(0);
}

macro_rules! display_id {
    ($ty:ty, $prefix:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

display_id!(ActionId, "action:");
display_id!(PathId, "path:");
display_id!(PackageId, "package:");
display_id!(FileGroupId, "group:");

// =============================================================================
// FILE ACCESS
// =============================================================================

/// The kind of access an action made to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Read,
    Write,
    Modify,
    Delete,
    Unspecified,
}

impl OperationType {
    /// Parse the lower-case name used in manifests and on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "modify" => Some(Self::Modify),
            "delete" => Some(Self::Delete),
            "unspecified" => Some(Self::Unspecified),
            _ => None,
        }
    }

    /// Lower-case name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Unspecified => "unspecified",
        }
    }
}

/// One file-access link: `action` touched `path` with `operation`.
///
/// `seq` is unique across the store and orders the accesses of an action.
/// It is preserved exactly when a link is removed and re-added by undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileAccess {
    pub seq: u64,
    pub action: ActionId,
    pub path: PathId,
    pub operation: OperationType,
}

impl FileAccess {
    #[must_use]
    pub const fn new(seq: u64, action: ActionId, path: PathId, operation: OperationType) -> Self {
        Self {
            seq,
            action,
            path,
            operation,
        }
    }
}

// =============================================================================
// NODES
// =============================================================================

/// Type of a node in the path tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathType {
    File,
    Directory,
    Symlink,
}

/// A node of the path tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub id: PathId,
    /// The root path is its own parent.
    pub parent: PathId,
    pub name: String,
    pub kind: PathType,
    pub trashed: bool,
}

/// A node of the action tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNode {
    pub id: ActionId,
    /// The root action is its own parent.
    pub parent: ActionId,
    pub command: String,
    /// Working directory the command ran in.
    pub directory: PathId,
    pub trashed: bool,
}

// =============================================================================
// PACKAGES
// =============================================================================

/// Visibility of a member inside its package.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Scope {
    #[default]
    None,
    Private,
    Public,
}

/// A named package. Members of a package must live below its source root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    /// `None` for `<import>`, which has no source root.
    pub root: Option<PathId>,
}

/// Reference to anything that can be a package member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemberRef {
    Path(PathId),
    Action(ActionId),
    Group(FileGroupId),
}

impl MemberRef {
    /// Raw numeric id, as reported in refactoring errors.
    #[must_use]
    pub const fn raw(self) -> u64 {
        match self {
            Self::Path(id) => id.0,
            Self::Action(id) => id.0,
            Self::Group(id) => id.0,
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(id) => id.fmt(f),
            Self::Action(id) => id.fmt(f),
            Self::Group(id) => id.fmt(f),
        }
    }
}

/// Package and scope a member currently belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Membership {
    pub package: PackageId,
    pub scope: Scope,
}

impl Membership {
    #[must_use]
    pub const fn new(package: PackageId, scope: Scope) -> Self {
        Self { package, scope }
    }
}

// =============================================================================
// FILE GROUPS
// =============================================================================

/// Variant of a file group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    /// Explicit ordered list of paths.
    Source,
    /// Ordered concatenation of other groups.
    Merge,
    /// Narrows `source` with include/exclude glob patterns.
    Filter { source: FileGroupId },
}

/// One entry of a group's member list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GroupMember {
    Path(PathId),
    Group(FileGroupId),
    /// `include:<glob>` or `exclude:<glob>`.
    Pattern(String),
}

/// A file group record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    pub id: FileGroupId,
    pub kind: GroupKind,
    pub members: Vec<GroupMember>,
    pub trashed: bool,
}

/// The two group slots an action exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    Input,
    Output,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by a graph store.
///
/// Mutators return these when a primitive would break the store's structural
/// integrity. The refactoring engine turns such a failure into
/// [`RefactorError::Fatal`].
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Path not found: {0}")]
    PathNotFound(PathId),

    #[error("Action not found: {0}")]
    ActionNotFound(ActionId),

    #[error("Package not found: {0}")]
    PackageNotFound(PackageId),

    #[error("File group not found: {0}")]
    GroupNotFound(FileGroupId),

    /// A mutation would leave the graph inconsistent.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// A filter pattern could not be compiled.
    #[error("Invalid pattern '{0}': {1}")]
    InvalidPattern(String, String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

/// Why a refactoring was rejected.
///
/// The ids carried next to a cause name the offending objects:
/// path ids for path causes, action ids for action causes, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Cause {
    /// Path does not exist or is already trashed.
    InvalidPath,
    DirectoryNotEmpty,
    /// Path is still read by an action.
    PathInUse,
    /// Path is written by an action and cascading was not requested.
    PathIsGenerated,
    ActionNotAtomic,
    /// A generated output is still consumed by an action outside the deletion.
    ActionInUse,
    /// File has a modifying access or more than one producer.
    FileIsModified,
    InvalidPackage,
    InvalidMember,
    InvalidAction,
    InvalidFileGroup,
    /// Path lies outside the destination package's source root.
    PathOutOfRange,
    /// Directory is still the working directory of an action.
    DirectoryContainsActions,
}

impl Cause {
    /// Human-readable description used in error messages.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::InvalidPath => "invalid path",
            Self::DirectoryNotEmpty => "directory not empty",
            Self::PathInUse => "path in use",
            Self::PathIsGenerated => "path is generated",
            Self::ActionNotAtomic => "action not atomic",
            Self::ActionInUse => "action in use",
            Self::FileIsModified => "file is modified",
            Self::InvalidPackage => "invalid package",
            Self::InvalidMember => "invalid member",
            Self::InvalidAction => "invalid action",
            Self::InvalidFileGroup => "invalid file group",
            Self::PathOutOfRange => "path out of range",
            Self::DirectoryContainsActions => "directory contains actions",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Errors raised by refactoring operations and the session.
#[derive(Debug, Error)]
pub enum RefactorError {
    /// Validation rejected the change. Nothing was mutated.
    #[error("Cannot refactor ({cause}): {ids:?}")]
    Rejected { cause: Cause, ids: Vec<u64> },

    /// A pre-validated primitive failed while being applied or inverted.
    /// The store and the engine disagree; the graph can no longer be trusted.
    #[error("Internal error: {0}")]
    Fatal(String),

    /// A store query failed during validation.
    #[error(transparent)]
    Store(#[from] GraphError),
}

impl RefactorError {
    /// Build a rejection from any ids convertible to raw numbers.
    pub fn rejected<I>(cause: Cause, ids: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let mut ids: Vec<u64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self::Rejected { cause, ids }
    }

    /// The rejection cause, if this is a recoverable failure.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        match self {
            Self::Rejected { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Whether this error means the graph can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_parse_roundtrip() {
        for op in [
            OperationType::Read,
            OperationType::Write,
            OperationType::Modify,
            OperationType::Delete,
            OperationType::Unspecified,
        ] {
            assert_eq!(OperationType::parse(op.as_str()), Some(op));
        }
        assert_eq!(OperationType::parse("execute"), None);
    }

    #[test]
    fn default_membership_is_import_without_scope() {
        let membership = Membership::default();
        assert_eq!(membership.package, PackageId::IMPORT);
        assert_eq!(membership.scope, Scope::None);
    }

    #[test]
    fn rejected_sorts_and_dedups_ids() {
        let err = RefactorError::rejected(Cause::PathInUse, [7, 3, 7, 1]);
        match err {
            RefactorError::Rejected { cause, ids } => {
                assert_eq!(cause, Cause::PathInUse);
                assert_eq!(ids, vec![1, 3, 7]);
            }
            other => unreachable!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn fatal_is_distinct_from_rejection() {
        let fatal = RefactorError::Fatal("boom".to_string());
        assert!(fatal.is_fatal());
        assert_eq!(fatal.cause(), None);

        let rejected = RefactorError::rejected(Cause::InvalidAction, [1]);
        assert!(!rejected.is_fatal());
        assert_eq!(rejected.cause(), Some(Cause::InvalidAction));
    }

    #[test]
    fn ids_display_with_kind_prefix() {
        assert_eq!(ActionId(4).to_string(), "action:4");
        assert_eq!(MemberRef::Path(PathId(9)).to_string(), "path:9");
        assert_eq!(MemberRef::Group(FileGroupId(2)).raw(), 2);
    }
}
