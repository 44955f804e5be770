//! # Build Graph Store
//!
//! The action tree, the path tree, the file-access link table, packages and
//! file groups.
//!
//! This module defines the `BuildStore` trait consumed by the refactoring
//! engine and implements it for the in-memory `BuildGraph`.
//! All data structures use `BTreeMap` for deterministic ordering.
//!
//! ## Soft deletion
//!
//! Nothing is physically removed by a refactoring. Actions, paths and groups
//! carry a `trashed` flag so that undo can revive them with their original
//! identity. `reap_trash` is the separate garbage-collection pass.

use crate::constants::{
    EXCLUDE_PREFIX, IMPORT_PACKAGE_NAME, INCLUDE_PREFIX, MAX_GROUP_DEPTH,
};
use crate::{
    ActionId, ActionNode, FileAccess, FileGroup, FileGroupId, GraphError, GroupKind, GroupMember,
    MemberRef, Membership, OperationType, Package, PackageId, PathId, PathNode, PathType, SlotKind,
};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// BUILDSTORE TRAIT
// =============================================================================

/// The BuildStore trait defines everything the refactoring engine needs from
/// a graph store.
///
/// Queries have no side effects. Mutators are only ever called by undo
/// primitives, and each one refuses to leave the graph structurally
/// inconsistent.
///
/// All fallible operations return `Result<T, GraphError>` so in-memory and
/// persistent backends can share the trait.
pub trait BuildStore {
    // -------------------------------------------------------------------------
    // Path tree
    // -------------------------------------------------------------------------

    /// Lookup a path, trashed or not.
    fn path(&self, id: PathId) -> Result<Option<PathNode>, GraphError>;

    /// Live children of a directory, ordered by name.
    fn path_children(&self, id: PathId) -> Result<Vec<PathId>, GraphError>;

    /// Absolute textual form of a path, e.g. `/out/x.o`.
    fn path_name(&self, id: PathId) -> Result<String, GraphError>;

    /// Textual form of a path as seen from `package`: `@<package>/<rel>` when
    /// the path lies under the package's source root, absolute otherwise.
    fn path_name_in_package(&self, id: PathId, package: PackageId) -> Result<String, GraphError>;

    /// Whether `path` is `ancestor` or lies below it.
    fn is_path_under(&self, path: PathId, ancestor: PathId) -> Result<bool, GraphError>;

    // -------------------------------------------------------------------------
    // Action tree
    // -------------------------------------------------------------------------

    /// Lookup an action, trashed or not.
    fn action(&self, id: ActionId) -> Result<Option<ActionNode>, GraphError>;

    /// Live children of an action, ordered by id.
    fn action_children(&self, id: ActionId) -> Result<Vec<ActionId>, GraphError>;

    /// Live actions whose working directory is `dir`.
    fn actions_in_directory(&self, dir: PathId) -> Result<Vec<ActionId>, GraphError>;

    // -------------------------------------------------------------------------
    // File-access links
    // -------------------------------------------------------------------------

    /// Links held by an action, ordered by sequence number.
    fn accesses_of_action(&self, id: ActionId) -> Result<Vec<FileAccess>, GraphError>;

    /// Links pointing at a path, ordered by sequence number.
    fn accesses_of_path(&self, id: PathId) -> Result<Vec<FileAccess>, GraphError>;

    // -------------------------------------------------------------------------
    // Packages and groups
    // -------------------------------------------------------------------------

    fn package(&self, id: PackageId) -> Result<Option<Package>, GraphError>;

    /// Package and scope of a member. Members never moved are in `<import>`.
    fn member_package(&self, member: MemberRef) -> Result<Membership, GraphError>;

    /// Lookup a file group, trashed or not.
    fn group(&self, id: FileGroupId) -> Result<Option<FileGroup>, GraphError>;

    /// The paths a group evaluates to, in order.
    fn group_paths(&self, id: FileGroupId) -> Result<Vec<PathId>, GraphError>;

    fn action_slot(&self, action: ActionId, slot: SlotKind)
    -> Result<Option<FileGroupId>, GraphError>;

    // -------------------------------------------------------------------------
    // Identity allocation (peek only)
    // -------------------------------------------------------------------------

    fn next_action_id(&self) -> ActionId;

    fn next_group_id(&self) -> FileGroupId;

    fn next_sequence(&self) -> u64;

    // -------------------------------------------------------------------------
    // Mutators (used by undo primitives only)
    // -------------------------------------------------------------------------

    fn trash_path(&mut self, id: PathId) -> Result<(), GraphError>;

    fn revive_path(&mut self, id: PathId) -> Result<(), GraphError>;

    fn trash_action(&mut self, id: ActionId) -> Result<(), GraphError>;

    fn revive_action(&mut self, id: ActionId) -> Result<(), GraphError>;

    fn add_access(&mut self, access: FileAccess) -> Result<(), GraphError>;

    fn remove_access(&mut self, access: FileAccess) -> Result<(), GraphError>;

    fn reparent_action(&mut self, id: ActionId, parent: ActionId) -> Result<(), GraphError>;

    /// Create an action under a reserved id, or revive it if it was created
    /// before and later trashed by undo.
    fn create_action(
        &mut self,
        id: ActionId,
        parent: ActionId,
        command: &str,
        directory: PathId,
    ) -> Result<(), GraphError>;

    fn set_member_package(
        &mut self,
        member: MemberRef,
        membership: Membership,
    ) -> Result<(), GraphError>;

    /// Create a group under a reserved id, or revive it.
    fn create_group(&mut self, id: FileGroupId, kind: GroupKind) -> Result<(), GraphError>;

    fn trash_group(&mut self, id: FileGroupId) -> Result<(), GraphError>;

    fn set_group_members(
        &mut self,
        id: FileGroupId,
        members: Vec<GroupMember>,
    ) -> Result<(), GraphError>;

    fn set_action_slot(
        &mut self,
        action: ActionId,
        slot: SlotKind,
        group: Option<FileGroupId>,
    ) -> Result<(), GraphError>;

    /// Enter a bulk mutation scope. Nested scopes are counted.
    fn begin_bulk(&mut self);

    /// Leave a bulk mutation scope, finishing deferred bookkeeping when the
    /// outermost scope closes.
    fn end_bulk(&mut self);

    /// Physically drop trashed objects. Returns how many were reaped.
    fn reap_trash(&mut self) -> Result<usize, GraphError>;

    // -------------------------------------------------------------------------
    // Provided queries
    // -------------------------------------------------------------------------

    /// An action with no live children.
    fn is_atomic(&self, id: ActionId) -> Result<bool, GraphError> {
        Ok(self.action_children(id)?.is_empty())
    }

    /// Live, non-trashed action.
    fn is_live_action(&self, id: ActionId) -> Result<bool, GraphError> {
        Ok(self.action(id)?.is_some_and(|a| !a.trashed))
    }

    /// Live, non-trashed path.
    fn is_live_path(&self, id: PathId) -> Result<bool, GraphError> {
        Ok(self.path(id)?.is_some_and(|p| !p.trashed))
    }

    /// Distinct actions accessing `path` with one of `operations`.
    fn actions_accessing(
        &self,
        path: PathId,
        operations: &[OperationType],
    ) -> Result<Vec<ActionId>, GraphError> {
        let set: BTreeSet<ActionId> = self
            .accesses_of_path(path)?
            .into_iter()
            .filter(|a| operations.contains(&a.operation))
            .map(|a| a.action)
            .collect();
        Ok(set.into_iter().collect())
    }
}

// =============================================================================
// FILTER PATTERNS
// =============================================================================

/// A compiled `include:`/`exclude:` pattern.
#[derive(Debug, Clone)]
pub struct FilterPattern {
    include: bool,
    matcher: GlobMatcher,
}

impl FilterPattern {
    /// Parse `include:<glob>` or `exclude:<glob>`. A backslash escapes the
    /// next character on every platform.
    pub fn parse(pattern: &str) -> Result<Self, GraphError> {
        let (include, glob) = if let Some(rest) = pattern.strip_prefix(INCLUDE_PREFIX) {
            (true, rest)
        } else if let Some(rest) = pattern.strip_prefix(EXCLUDE_PREFIX) {
            (false, rest)
        } else {
            return Err(GraphError::InvalidPattern(
                pattern.to_string(),
                "missing include:/exclude: prefix".to_string(),
            ));
        };
        let matcher = GlobBuilder::new(glob)
            .backslash_escape(true)
            .build()
            .map_err(|e| GraphError::InvalidPattern(pattern.to_string(), e.to_string()))?
            .compile_matcher();
        Ok(Self { include, matcher })
    }

    /// Evaluate an ordered pattern list: first match wins, default exclude.
    #[must_use]
    pub fn admits(patterns: &[Self], name: &str) -> bool {
        patterns
            .iter()
            .find(|p| p.matcher.is_match(name))
            .is_some_and(|p| p.include)
    }
}

// =============================================================================
// BUILDGRAPH IMPLEMENTATION
// =============================================================================

/// The in-memory build graph.
///
/// Uses `BTreeMap` exclusively for deterministic ordering.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    paths: BTreeMap<PathId, PathNode>,

    /// Name index: parent -> (name -> child). Holds trashed children too.
    path_index: BTreeMap<PathId, BTreeMap<String, PathId>>,

    actions: BTreeMap<ActionId, ActionNode>,

    /// Live children per action. Rebuilt lazily after a bulk scope.
    action_index: BTreeMap<ActionId, BTreeSet<ActionId>>,

    /// Link table keyed by sequence number.
    accesses: BTreeMap<u64, FileAccess>,
    accesses_by_action: BTreeMap<ActionId, BTreeSet<u64>>,
    accesses_by_path: BTreeMap<PathId, BTreeSet<u64>>,

    packages: BTreeMap<PackageId, Package>,
    memberships: BTreeMap<MemberRef, Membership>,
    groups: BTreeMap<FileGroupId, FileGroup>,
    slots: BTreeMap<(ActionId, SlotKind), FileGroupId>,

    next_path_id: u64,
    next_action_id: u64,
    next_group_id: u64,
    next_package_id: u64,
    next_seq: u64,

    bulk_depth: u32,
    action_index_stale: bool,
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildGraph {
    /// Create a graph holding only the root path, the root action and the
    /// `<import>` package.
    #[must_use]
    pub fn new() -> Self {
        let mut graph = Self {
            paths: BTreeMap::new(),
            path_index: BTreeMap::new(),
            actions: BTreeMap::new(),
            action_index: BTreeMap::new(),
            accesses: BTreeMap::new(),
            accesses_by_action: BTreeMap::new(),
            accesses_by_path: BTreeMap::new(),
            packages: BTreeMap::new(),
            memberships: BTreeMap::new(),
            groups: BTreeMap::new(),
            slots: BTreeMap::new(),
            next_path_id: 1,
            next_action_id: 1,
            next_group_id: 1,
            next_package_id: 1,
            next_seq: 1,
            bulk_depth: 0,
            action_index_stale: false,
        };
        graph.paths.insert(
            PathId::ROOT,
            PathNode {
                id: PathId::ROOT,
                parent: PathId::ROOT,
                name: String::new(),
                kind: PathType::Directory,
                trashed: false,
            },
        );
        graph.actions.insert(
            ActionId::ROOT,
            ActionNode {
                id: ActionId::ROOT,
                parent: ActionId::ROOT,
                command: "<root>".to_string(),
                directory: PathId::ROOT,
                trashed: false,
            },
        );
        graph.packages.insert(
            PackageId::IMPORT,
            Package {
                id: PackageId::IMPORT,
                name: IMPORT_PACKAGE_NAME.to_string(),
                root: None,
            },
        );
        graph
    }

    // =========================================================================
    // CONSTRUCTION (import pipeline)
    // =========================================================================

    /// Add a path given in absolute textual form, creating missing parent
    /// directories. Returns the existing id if the path is already present.
    pub fn add_path(&mut self, text: &str, kind: PathType) -> Result<PathId, GraphError> {
        let Some(rest) = text.strip_prefix('/') else {
            return Err(GraphError::InvalidManifest(format!(
                "path '{}' is not absolute",
                text
            )));
        };
        let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();
        let mut current = PathId::ROOT;
        let last = components.len();
        for (i, component) in components.into_iter().enumerate() {
            let want = if i + 1 == last {
                kind
            } else {
                PathType::Directory
            };
            current = self.add_child_path(current, component, want)?;
        }
        Ok(current)
    }

    /// Add a file path.
    pub fn add_file(&mut self, text: &str) -> Result<PathId, GraphError> {
        self.add_path(text, PathType::File)
    }

    /// Add a directory path.
    pub fn add_directory(&mut self, text: &str) -> Result<PathId, GraphError> {
        self.add_path(text, PathType::Directory)
    }

    fn add_child_path(
        &mut self,
        parent: PathId,
        name: &str,
        kind: PathType,
    ) -> Result<PathId, GraphError> {
        if let Some(&existing) = self.path_index.get(&parent).and_then(|m| m.get(name)) {
            let node = self
                .paths
                .get(&existing)
                .ok_or(GraphError::PathNotFound(existing))?;
            if node.trashed {
                return Err(GraphError::Integrity(format!(
                    "{} '{}' is trashed",
                    existing, name
                )));
            }
            return Ok(existing);
        }
        let parent_node = self
            .paths
            .get(&parent)
            .ok_or(GraphError::PathNotFound(parent))?;
        if parent_node.kind != PathType::Directory {
            return Err(GraphError::Integrity(format!(
                "cannot create '{}' below non-directory {}",
                name, parent
            )));
        }
        let id = PathId(self.next_path_id);
        self.next_path_id = self.next_path_id.saturating_add(1);
        self.paths.insert(
            id,
            PathNode {
                id,
                parent,
                name: name.to_string(),
                kind,
                trashed: false,
            },
        );
        self.path_index
            .entry(parent)
            .or_default()
            .insert(name.to_string(), id);
        Ok(id)
    }

    /// Add an action below a live parent.
    pub fn add_action(
        &mut self,
        parent: ActionId,
        command: &str,
        directory: PathId,
    ) -> Result<ActionId, GraphError> {
        let id = ActionId(self.next_action_id);
        self.create_action(id, parent, command, directory)?;
        Ok(id)
    }

    /// Record an access with the next sequence number.
    pub fn record_access(
        &mut self,
        action: ActionId,
        path: PathId,
        operation: OperationType,
    ) -> Result<FileAccess, GraphError> {
        let access = FileAccess::new(self.next_seq, action, path, operation);
        self.add_access(access)?;
        Ok(access)
    }

    /// Add a package. Package names are unique.
    pub fn add_package(&mut self, name: &str, root: Option<PathId>) -> Result<PackageId, GraphError> {
        if self.package_by_name(name).is_some() {
            return Err(GraphError::Integrity(format!(
                "package '{}' already exists",
                name
            )));
        }
        if let Some(root) = root {
            if !self.is_live_path(root)? {
                return Err(GraphError::PathNotFound(root));
            }
        }
        let id = PackageId(self.next_package_id);
        self.next_package_id = self.next_package_id.saturating_add(1);
        self.packages.insert(
            id,
            Package {
                id,
                name: name.to_string(),
                root,
            },
        );
        Ok(id)
    }

    /// Add a source group holding `paths`, owned by `package`.
    pub fn add_source_group(
        &mut self,
        package: PackageId,
        paths: &[PathId],
    ) -> Result<FileGroupId, GraphError> {
        let id = FileGroupId(self.next_group_id);
        self.create_group(id, GroupKind::Source)?;
        self.set_group_members(id, paths.iter().map(|&p| GroupMember::Path(p)).collect())?;
        self.set_member_package(MemberRef::Group(id), Membership::new(package, crate::Scope::Public))?;
        Ok(id)
    }

    // =========================================================================
    // LOOKUP HELPERS
    // =========================================================================

    /// Resolve an absolute textual path to a live path id.
    #[must_use]
    pub fn lookup_path(&self, text: &str) -> Option<PathId> {
        let rest = text.strip_prefix('/')?;
        let mut current = PathId::ROOT;
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            current = *self.path_index.get(&current)?.get(component)?;
        }
        self.paths
            .get(&current)
            .filter(|p| !p.trashed)
            .map(|p| p.id)
    }

    /// Find a package by name.
    #[must_use]
    pub fn package_by_name(&self, name: &str) -> Option<PackageId> {
        self.packages
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id)
    }

    /// All actions in id order, trashed included.
    pub fn actions(&self) -> impl Iterator<Item = &ActionNode> {
        self.actions.values()
    }

    /// All paths in id order, trashed included.
    pub fn paths(&self) -> impl Iterator<Item = &PathNode> {
        self.paths.values()
    }

    /// All links in sequence order.
    pub fn accesses(&self) -> impl Iterator<Item = &FileAccess> {
        self.accesses.values()
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &FileGroup> {
        self.groups.values()
    }

    /// Explicit memberships (members never moved are absent).
    pub fn memberships(&self) -> impl Iterator<Item = (MemberRef, Membership)> + '_ {
        self.memberships.iter().map(|(m, s)| (*m, *s))
    }

    pub fn slots(&self) -> impl Iterator<Item = (ActionId, SlotKind, FileGroupId)> + '_ {
        self.slots.iter().map(|(&(a, s), &g)| (a, s, g))
    }

    /// Number of live actions, the root included.
    #[must_use]
    pub fn live_action_count(&self) -> usize {
        self.actions.values().filter(|a| !a.trashed).count()
    }

    /// Number of live paths, the root included.
    #[must_use]
    pub fn live_path_count(&self) -> usize {
        self.paths.values().filter(|p| !p.trashed).count()
    }

    /// Whether a bulk mutation scope is open.
    #[must_use]
    pub fn in_bulk(&self) -> bool {
        self.bulk_depth > 0
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    fn live_path_node(&self, id: PathId) -> Result<&PathNode, GraphError> {
        self.paths
            .get(&id)
            .filter(|p| !p.trashed)
            .ok_or(GraphError::PathNotFound(id))
    }

    fn live_action_node(&self, id: ActionId) -> Result<&ActionNode, GraphError> {
        self.actions
            .get(&id)
            .filter(|a| !a.trashed)
            .ok_or(GraphError::ActionNotFound(id))
    }

    fn live_group_node(&self, id: FileGroupId) -> Result<&FileGroup, GraphError> {
        self.groups
            .get(&id)
            .filter(|g| !g.trashed)
            .ok_or(GraphError::GroupNotFound(id))
    }

    fn has_live_path_children(&self, id: PathId) -> bool {
        self.path_index.get(&id).is_some_and(|children| {
            children
                .values()
                .any(|c| self.paths.get(c).is_some_and(|p| !p.trashed))
        })
    }

    fn live_action_children(&self, id: ActionId) -> Vec<ActionId> {
        if self.action_index_stale {
            return self
                .actions
                .values()
                .filter(|a| !a.trashed && a.parent == id && a.id != ActionId::ROOT)
                .map(|a| a.id)
                .collect();
        }
        self.action_index
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn index_child(&mut self, parent: ActionId, child: ActionId) {
        if self.bulk_depth > 0 {
            self.action_index_stale = true;
        } else if !self.action_index_stale {
            self.action_index.entry(parent).or_default().insert(child);
        }
    }

    fn unindex_child(&mut self, parent: ActionId, child: ActionId) {
        if self.bulk_depth > 0 {
            self.action_index_stale = true;
        } else if !self.action_index_stale {
            if let Some(set) = self.action_index.get_mut(&parent) {
                set.remove(&child);
                if set.is_empty() {
                    self.action_index.remove(&parent);
                }
            }
        }
    }

    fn rebuild_action_index(&mut self) {
        self.action_index.clear();
        for action in self.actions.values() {
            if !action.trashed && action.id != ActionId::ROOT {
                self.action_index
                    .entry(action.parent)
                    .or_default()
                    .insert(action.id);
            }
        }
        self.action_index_stale = false;
    }

    fn group_is_referenced(&self, id: FileGroupId) -> bool {
        let by_slot = self.slots.values().any(|&g| g == id);
        let by_group = self.groups.values().filter(|g| !g.trashed).any(|g| {
            g.kind == GroupKind::Filter { source: id }
                || g.members.contains(&GroupMember::Group(id))
        });
        by_slot || by_group
    }

    fn expand_group(
        &self,
        id: FileGroupId,
        depth: usize,
        out: &mut Vec<PathId>,
    ) -> Result<(), GraphError> {
        if depth > MAX_GROUP_DEPTH {
            return Err(GraphError::Integrity(format!(
                "group nesting deeper than {} at {}",
                MAX_GROUP_DEPTH, id
            )));
        }
        let group = self.groups.get(&id).ok_or(GraphError::GroupNotFound(id))?;
        match group.kind {
            GroupKind::Source => {
                for member in &group.members {
                    if let GroupMember::Path(p) = member {
                        if self.paths.get(p).is_some_and(|n| !n.trashed) {
                            out.push(*p);
                        }
                    }
                }
            }
            GroupKind::Merge => {
                for member in &group.members {
                    if let GroupMember::Group(g) = member {
                        self.expand_group(*g, depth.saturating_add(1), out)?;
                    }
                }
            }
            GroupKind::Filter { source } => {
                let patterns = group
                    .members
                    .iter()
                    .filter_map(|m| match m {
                        GroupMember::Pattern(p) => Some(FilterPattern::parse(p)),
                        _ => None,
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let mut upstream = Vec::new();
                self.expand_group(source, depth.saturating_add(1), &mut upstream)?;
                for path in upstream {
                    let package = self.member_package(MemberRef::Path(path))?.package;
                    let name = self.path_name_in_package(path, package)?;
                    if FilterPattern::admits(&patterns, &name) {
                        out.push(path);
                    }
                }
            }
        }
        Ok(())
    }

    /// Path components from `ancestor` (exclusive) down to `path`, or `None`
    /// if `path` does not lie under `ancestor`.
    fn relative_components(
        &self,
        path: PathId,
        ancestor: PathId,
    ) -> Result<Option<Vec<String>>, GraphError> {
        let mut components = Vec::new();
        let mut current = path;
        loop {
            if current == ancestor {
                components.reverse();
                return Ok(Some(components));
            }
            if current == PathId::ROOT {
                return Ok(None);
            }
            let node = self
                .paths
                .get(&current)
                .ok_or(GraphError::PathNotFound(current))?;
            components.push(node.name.clone());
            current = node.parent;
        }
    }
}

impl BuildStore for BuildGraph {
    fn path(&self, id: PathId) -> Result<Option<PathNode>, GraphError> {
        Ok(self.paths.get(&id).cloned())
    }

    fn path_children(&self, id: PathId) -> Result<Vec<PathId>, GraphError> {
        Ok(self
            .path_index
            .get(&id)
            .into_iter()
            .flat_map(|children| children.values())
            .filter(|c| self.paths.get(c).is_some_and(|p| !p.trashed))
            .copied()
            .collect())
    }

    fn path_name(&self, id: PathId) -> Result<String, GraphError> {
        let components = self
            .relative_components(id, PathId::ROOT)?
            .unwrap_or_default();
        Ok(format!("/{}", components.join("/")))
    }

    fn path_name_in_package(&self, id: PathId, package: PackageId) -> Result<String, GraphError> {
        let pkg = self
            .packages
            .get(&package)
            .ok_or(GraphError::PackageNotFound(package))?;
        if let Some(root) = pkg.root {
            if let Some(components) = self.relative_components(id, root)? {
                if components.is_empty() {
                    return Ok(format!("@{}", pkg.name));
                }
                return Ok(format!("@{}/{}", pkg.name, components.join("/")));
            }
        }
        self.path_name(id)
    }

    fn is_path_under(&self, path: PathId, ancestor: PathId) -> Result<bool, GraphError> {
        Ok(self.relative_components(path, ancestor)?.is_some())
    }

    fn action(&self, id: ActionId) -> Result<Option<ActionNode>, GraphError> {
        Ok(self.actions.get(&id).cloned())
    }

    fn action_children(&self, id: ActionId) -> Result<Vec<ActionId>, GraphError> {
        Ok(self.live_action_children(id))
    }

    fn actions_in_directory(&self, dir: PathId) -> Result<Vec<ActionId>, GraphError> {
        Ok(self
            .actions
            .values()
            .filter(|a| !a.trashed && a.directory == dir)
            .map(|a| a.id)
            .collect())
    }

    fn accesses_of_action(&self, id: ActionId) -> Result<Vec<FileAccess>, GraphError> {
        Ok(self
            .accesses_by_action
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|seq| self.accesses.get(seq).copied())
            .collect())
    }

    fn accesses_of_path(&self, id: PathId) -> Result<Vec<FileAccess>, GraphError> {
        Ok(self
            .accesses_by_path
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|seq| self.accesses.get(seq).copied())
            .collect())
    }

    fn package(&self, id: PackageId) -> Result<Option<Package>, GraphError> {
        Ok(self.packages.get(&id).cloned())
    }

    fn member_package(&self, member: MemberRef) -> Result<Membership, GraphError> {
        Ok(self.memberships.get(&member).copied().unwrap_or_default())
    }

    fn group(&self, id: FileGroupId) -> Result<Option<FileGroup>, GraphError> {
        Ok(self.groups.get(&id).cloned())
    }

    fn group_paths(&self, id: FileGroupId) -> Result<Vec<PathId>, GraphError> {
        let mut out = Vec::new();
        self.expand_group(id, 0, &mut out)?;
        Ok(out)
    }

    fn action_slot(
        &self,
        action: ActionId,
        slot: SlotKind,
    ) -> Result<Option<FileGroupId>, GraphError> {
        Ok(self.slots.get(&(action, slot)).copied())
    }

    fn next_action_id(&self) -> ActionId {
        ActionId(self.next_action_id)
    }

    fn next_group_id(&self) -> FileGroupId {
        FileGroupId(self.next_group_id)
    }

    fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    fn trash_path(&mut self, id: PathId) -> Result<(), GraphError> {
        if id == PathId::ROOT {
            return Err(GraphError::Integrity("cannot trash the root path".to_string()));
        }
        self.live_path_node(id)?;
        if self.accesses_by_path.get(&id).is_some_and(|s| !s.is_empty()) {
            return Err(GraphError::Integrity(format!(
                "{} still has file-access links",
                id
            )));
        }
        if self.has_live_path_children(id) {
            return Err(GraphError::Integrity(format!("{} has live children", id)));
        }
        if self
            .actions
            .values()
            .any(|a| !a.trashed && a.directory == id)
        {
            return Err(GraphError::Integrity(format!(
                "{} is the working directory of a live action",
                id
            )));
        }
        if let Some(node) = self.paths.get_mut(&id) {
            node.trashed = true;
        }
        Ok(())
    }

    fn revive_path(&mut self, id: PathId) -> Result<(), GraphError> {
        let node = self.paths.get(&id).ok_or(GraphError::PathNotFound(id))?;
        if !node.trashed {
            return Err(GraphError::Integrity(format!("{} is not trashed", id)));
        }
        self.live_path_node(node.parent)?;
        if let Some(node) = self.paths.get_mut(&id) {
            node.trashed = false;
        }
        Ok(())
    }

    fn trash_action(&mut self, id: ActionId) -> Result<(), GraphError> {
        if id == ActionId::ROOT {
            return Err(GraphError::Integrity(
                "cannot trash the root action".to_string(),
            ));
        }
        let parent = self.live_action_node(id)?.parent;
        if self
            .accesses_by_action
            .get(&id)
            .is_some_and(|s| !s.is_empty())
        {
            return Err(GraphError::Integrity(format!(
                "{} still has file-access links",
                id
            )));
        }
        if !self.live_action_children(id).is_empty() {
            return Err(GraphError::Integrity(format!("{} has live children", id)));
        }
        if let Some(node) = self.actions.get_mut(&id) {
            node.trashed = true;
        }
        self.unindex_child(parent, id);
        Ok(())
    }

    fn revive_action(&mut self, id: ActionId) -> Result<(), GraphError> {
        let node = self
            .actions
            .get(&id)
            .ok_or(GraphError::ActionNotFound(id))?;
        if !node.trashed {
            return Err(GraphError::Integrity(format!("{} is not trashed", id)));
        }
        let parent = node.parent;
        self.live_action_node(parent)?;
        if let Some(node) = self.actions.get_mut(&id) {
            node.trashed = false;
        }
        self.index_child(parent, id);
        Ok(())
    }

    fn add_access(&mut self, access: FileAccess) -> Result<(), GraphError> {
        if self.accesses.contains_key(&access.seq) {
            return Err(GraphError::Integrity(format!(
                "sequence number {} already used",
                access.seq
            )));
        }
        self.live_action_node(access.action)?;
        self.live_path_node(access.path)?;
        self.accesses.insert(access.seq, access);
        self.accesses_by_action
            .entry(access.action)
            .or_default()
            .insert(access.seq);
        self.accesses_by_path
            .entry(access.path)
            .or_default()
            .insert(access.seq);
        if access.seq >= self.next_seq {
            self.next_seq = access.seq.saturating_add(1);
        }
        Ok(())
    }

    fn remove_access(&mut self, access: FileAccess) -> Result<(), GraphError> {
        if self.accesses.get(&access.seq) != Some(&access) {
            return Err(GraphError::Integrity(format!(
                "no link {:?} to remove",
                access
            )));
        }
        self.accesses.remove(&access.seq);
        if let Some(set) = self.accesses_by_action.get_mut(&access.action) {
            set.remove(&access.seq);
            if set.is_empty() {
                self.accesses_by_action.remove(&access.action);
            }
        }
        if let Some(set) = self.accesses_by_path.get_mut(&access.path) {
            set.remove(&access.seq);
            if set.is_empty() {
                self.accesses_by_path.remove(&access.path);
            }
        }
        Ok(())
    }

    fn reparent_action(&mut self, id: ActionId, parent: ActionId) -> Result<(), GraphError> {
        if id == ActionId::ROOT {
            return Err(GraphError::Integrity(
                "cannot reparent the root action".to_string(),
            ));
        }
        let old_parent = self.live_action_node(id)?.parent;
        self.live_action_node(parent)?;
        let mut cursor = parent;
        while cursor != ActionId::ROOT {
            if cursor == id {
                return Err(GraphError::Integrity(format!(
                    "reparenting {} under {} creates a cycle",
                    id, parent
                )));
            }
            cursor = self.live_action_node(cursor)?.parent;
        }
        if let Some(node) = self.actions.get_mut(&id) {
            node.parent = parent;
        }
        self.unindex_child(old_parent, id);
        self.index_child(parent, id);
        Ok(())
    }

    fn create_action(
        &mut self,
        id: ActionId,
        parent: ActionId,
        command: &str,
        directory: PathId,
    ) -> Result<(), GraphError> {
        self.live_action_node(parent)?;
        self.live_path_node(directory)?;
        if let Some(existing) = self.actions.get(&id) {
            if !existing.trashed
                || existing.parent != parent
                || existing.command != command
                || existing.directory != directory
            {
                return Err(GraphError::Integrity(format!(
                    "{} already exists with different content",
                    id
                )));
            }
            return self.revive_action(id);
        }
        if id.0 < self.next_action_id {
            return Err(GraphError::Integrity(format!(
                "{} is below the allocation watermark",
                id
            )));
        }
        self.actions.insert(
            id,
            ActionNode {
                id,
                parent,
                command: command.to_string(),
                directory,
                trashed: false,
            },
        );
        self.next_action_id = id.0.saturating_add(1);
        self.index_child(parent, id);
        Ok(())
    }

    fn set_member_package(
        &mut self,
        member: MemberRef,
        membership: Membership,
    ) -> Result<(), GraphError> {
        if !self.packages.contains_key(&membership.package) {
            return Err(GraphError::PackageNotFound(membership.package));
        }
        let exists = match member {
            MemberRef::Path(id) => self.paths.contains_key(&id),
            MemberRef::Action(id) => self.actions.contains_key(&id),
            MemberRef::Group(id) => self.groups.contains_key(&id),
        };
        if !exists {
            return Err(GraphError::Integrity(format!(
                "cannot set package of missing {}",
                member
            )));
        }
        if membership == Membership::default() {
            self.memberships.remove(&member);
        } else {
            self.memberships.insert(member, membership);
        }
        Ok(())
    }

    fn create_group(&mut self, id: FileGroupId, kind: GroupKind) -> Result<(), GraphError> {
        if let GroupKind::Filter { source } = kind {
            self.live_group_node(source)?;
        }
        if let Some(existing) = self.groups.get_mut(&id) {
            if !existing.trashed || existing.kind != kind {
                return Err(GraphError::Integrity(format!(
                    "{} already exists with different content",
                    id
                )));
            }
            existing.trashed = false;
            return Ok(());
        }
        if id.0 < self.next_group_id {
            return Err(GraphError::Integrity(format!(
                "{} is below the allocation watermark",
                id
            )));
        }
        self.groups.insert(
            id,
            FileGroup {
                id,
                kind,
                members: Vec::new(),
                trashed: false,
            },
        );
        self.next_group_id = id.0.saturating_add(1);
        Ok(())
    }

    fn trash_group(&mut self, id: FileGroupId) -> Result<(), GraphError> {
        self.live_group_node(id)?;
        if self.group_is_referenced(id) {
            return Err(GraphError::Integrity(format!("{} is still referenced", id)));
        }
        if let Some(group) = self.groups.get_mut(&id) {
            group.trashed = true;
        }
        Ok(())
    }

    fn set_group_members(
        &mut self,
        id: FileGroupId,
        members: Vec<GroupMember>,
    ) -> Result<(), GraphError> {
        let kind = self.live_group_node(id)?.kind;
        for member in &members {
            match (kind, member) {
                (GroupKind::Source, GroupMember::Path(p)) => {
                    self.path(*p)?.ok_or(GraphError::PathNotFound(*p))?;
                }
                (GroupKind::Merge, GroupMember::Group(g)) => {
                    if *g == id {
                        return Err(GraphError::Integrity(format!("{} cannot contain itself", id)));
                    }
                    self.live_group_node(*g)?;
                }
                (GroupKind::Filter { .. }, GroupMember::Pattern(p)) => {
                    FilterPattern::parse(p)?;
                }
                (kind, member) => {
                    return Err(GraphError::Integrity(format!(
                        "{:?} is not a valid member of a {:?} group",
                        member, kind
                    )));
                }
            }
        }
        if let Some(group) = self.groups.get_mut(&id) {
            group.members = members;
        }
        Ok(())
    }

    fn set_action_slot(
        &mut self,
        action: ActionId,
        slot: SlotKind,
        group: Option<FileGroupId>,
    ) -> Result<(), GraphError> {
        if !self.actions.contains_key(&action) {
            return Err(GraphError::ActionNotFound(action));
        }
        match group {
            Some(g) => {
                self.live_group_node(g)?;
                self.slots.insert((action, slot), g);
            }
            None => {
                self.slots.remove(&(action, slot));
            }
        }
        Ok(())
    }

    fn begin_bulk(&mut self) {
        self.bulk_depth = self.bulk_depth.saturating_add(1);
    }

    fn end_bulk(&mut self) {
        self.bulk_depth = self.bulk_depth.saturating_sub(1);
        if self.bulk_depth == 0 && self.action_index_stale {
            self.rebuild_action_index();
        }
    }

    fn reap_trash(&mut self) -> Result<usize, GraphError> {
        let dead_actions: Vec<ActionId> = self
            .actions
            .values()
            .filter(|a| a.trashed)
            .map(|a| a.id)
            .collect();
        let dead_paths: Vec<PathId> = self
            .paths
            .values()
            .filter(|p| p.trashed)
            .map(|p| p.id)
            .collect();
        let dead_groups: Vec<FileGroupId> = self
            .groups
            .values()
            .filter(|g| g.trashed)
            .map(|g| g.id)
            .collect();

        for id in &dead_actions {
            self.actions.remove(id);
            self.memberships.remove(&MemberRef::Action(*id));
            self.slots.retain(|(a, _), _| a != id);
        }
        for id in &dead_paths {
            if let Some(node) = self.paths.remove(id) {
                if let Some(siblings) = self.path_index.get_mut(&node.parent) {
                    siblings.remove(&node.name);
                }
            }
            self.path_index.remove(id);
            self.memberships.remove(&MemberRef::Path(*id));
        }
        let dead_path_set: BTreeSet<PathId> = dead_paths.iter().copied().collect();
        for group in self.groups.values_mut() {
            group.members.retain(|m| match m {
                GroupMember::Path(p) => !dead_path_set.contains(p),
                _ => true,
            });
        }
        for id in &dead_groups {
            self.groups.remove(id);
            self.memberships.remove(&MemberRef::Group(*id));
        }
        self.rebuild_action_index();
        Ok(dead_actions.len() + dead_paths.len() + dead_groups.len())
    }
}

// =============================================================================
// SERIALIZATION SUPPORT
// =============================================================================

/// Serializable representation of the graph for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableGraph {
    pub paths: Vec<PathNode>,
    pub actions: Vec<ActionNode>,
    pub accesses: Vec<FileAccess>,
    pub packages: Vec<Package>,
    pub memberships: Vec<(MemberRef, Membership)>,
    pub groups: Vec<FileGroup>,
    pub slots: Vec<(ActionId, SlotKind, FileGroupId)>,
    pub next_path_id: u64,
    pub next_action_id: u64,
    pub next_group_id: u64,
    pub next_package_id: u64,
    pub next_seq: u64,
}

impl From<&BuildGraph> for SerializableGraph {
    fn from(graph: &BuildGraph) -> Self {
        Self {
            paths: graph.paths.values().cloned().collect(),
            actions: graph.actions.values().cloned().collect(),
            accesses: graph.accesses.values().copied().collect(),
            packages: graph.packages.values().cloned().collect(),
            memberships: graph.memberships().collect(),
            groups: graph.groups.values().cloned().collect(),
            slots: graph.slots().collect(),
            next_path_id: graph.next_path_id,
            next_action_id: graph.next_action_id,
            next_group_id: graph.next_group_id,
            next_package_id: graph.next_package_id,
            next_seq: graph.next_seq,
        }
    }
}

impl TryFrom<SerializableGraph> for BuildGraph {
    type Error = GraphError;

    fn try_from(sg: SerializableGraph) -> Result<Self, Self::Error> {
        let mut graph = Self::new();
        graph.paths.clear();
        graph.actions.clear();
        graph.packages.clear();

        for node in sg.paths {
            if node.id != PathId::ROOT {
                graph
                    .path_index
                    .entry(node.parent)
                    .or_default()
                    .insert(node.name.clone(), node.id);
            }
            graph.paths.insert(node.id, node);
        }
        for node in sg.actions {
            graph.actions.insert(node.id, node);
        }
        if !graph.paths.contains_key(&PathId::ROOT) || !graph.actions.contains_key(&ActionId::ROOT)
        {
            return Err(GraphError::DeserializationError(
                "graph is missing its root path or root action".to_string(),
            ));
        }
        for access in sg.accesses {
            graph.accesses.insert(access.seq, access);
            graph
                .accesses_by_action
                .entry(access.action)
                .or_default()
                .insert(access.seq);
            graph
                .accesses_by_path
                .entry(access.path)
                .or_default()
                .insert(access.seq);
        }
        for package in sg.packages {
            graph.packages.insert(package.id, package);
        }
        graph.memberships = sg.memberships.into_iter().collect();
        for group in sg.groups {
            graph.groups.insert(group.id, group);
        }
        graph.slots = sg
            .slots
            .into_iter()
            .map(|(a, s, g)| ((a, s), g))
            .collect();
        graph.next_path_id = sg.next_path_id;
        graph.next_action_id = sg.next_action_id;
        graph.next_group_id = sg.next_group_id;
        graph.next_package_id = sg.next_package_id;
        graph.next_seq = sg.next_seq;
        graph.rebuild_action_index();
        Ok(graph)
    }
}

// =============================================================================
// TESTS
// =============================================================================
