//! # Refactoring Operations
//!
//! Every refactoring follows the same pattern: validate, then build, then
//! invoke. Validation and building happen against a [`RefactorContext`],
//! which records primitives into an [`UndoEntry`] without touching the
//! store. Only the session applies the finished entry.
//!
//! ## Overlay
//!
//! A refactoring may record many primitives before the first one is
//! applied (a whole subtree deletion, a recursive package move). The
//! context therefore answers queries as the store *will* look once the
//! primitives recorded so far are applied: removed links, actions and paths
//! disappear, reparented actions move, created groups report their pending
//! members.
//!
//! New object ids and sequence numbers are reserved from the store's
//! counters and advanced locally, so a rejected refactoring leaves no trace.

mod delete;
mod merge;
mod package_move;

pub use delete::{delete_action, delete_action_tree, delete_path, delete_path_tree};
pub use merge::{make_action_atomic, merge_actions};
pub use package_move::move_to_package;

use crate::graph::BuildStore;
use crate::undo::{UndoEntry, UndoOp};
use crate::{
    ActionId, Cause, FileAccess, FileGroupId, GroupKind, GroupMember, MemberRef, Membership,
    OperationType, PathId, PathType, RefactorError, SlotKind,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// REFACTOR CONTEXT
// =============================================================================

/// Transaction-local state of one refactoring.
pub struct RefactorContext<'s, S: BuildStore + ?Sized> {
    store: &'s S,
    entry: UndoEntry,

    removed_links: BTreeSet<u64>,
    added_links: BTreeMap<u64, FileAccess>,
    removed_actions: BTreeSet<ActionId>,
    created_actions: BTreeSet<ActionId>,
    parents: BTreeMap<ActionId, ActionId>,

    /// Paths scheduled for removal, flushed when the entry is finished.
    removed_paths: BTreeSet<PathId>,
    deferred_paths: Vec<PathId>,

    /// Pending group membership: groups created by this refactoring cannot
    /// be evaluated by the store yet.
    pending_groups: BTreeMap<FileGroupId, Vec<PathId>>,
    pending_memberships: BTreeMap<MemberRef, Membership>,

    next_action: u64,
    next_group: u64,
    next_seq: u64,
}

impl<'s, S: BuildStore + ?Sized> RefactorContext<'s, S> {
    /// Start a refactoring named `label` against `store`.
    pub fn new(store: &'s S, label: &str) -> Self {
        Self {
            store,
            entry: UndoEntry::new(label),
            removed_links: BTreeSet::new(),
            added_links: BTreeMap::new(),
            removed_actions: BTreeSet::new(),
            created_actions: BTreeSet::new(),
            parents: BTreeMap::new(),
            removed_paths: BTreeSet::new(),
            deferred_paths: Vec::new(),
            pending_groups: BTreeMap::new(),
            pending_memberships: BTreeMap::new(),
            next_action: store.next_action_id().0,
            next_group: store.next_group_id().0,
            next_seq: store.next_sequence(),
        }
    }

    /// The underlying store, as it was before this refactoring.
    pub fn store(&self) -> &'s S {
        self.store
    }

    /// Flush deferred path removals and hand over the finished entry.
    ///
    /// Paths are removed deepest first so a directory always follows its
    /// contents.
    pub fn finish(mut self) -> Result<UndoEntry, RefactorError> {
        let mut keyed = Vec::with_capacity(self.deferred_paths.len());
        for path in std::mem::take(&mut self.deferred_paths) {
            keyed.push((self.path_depth(path)?, path));
        }
        keyed.sort_by_key(|&(depth, _)| Reverse(depth));
        for (_, path) in keyed {
            self.entry.append(UndoOp::RemovePath(path));
        }
        Ok(self.entry)
    }

    // =========================================================================
    // OVERLAY QUERIES
    // =========================================================================

    pub fn path_is_live(&self, path: PathId) -> Result<bool, RefactorError> {
        Ok(!self.removed_paths.contains(&path) && self.store.is_live_path(path)?)
    }

    pub fn path_kind(&self, path: PathId) -> Result<Option<PathType>, RefactorError> {
        Ok(self.store.path(path)?.map(|p| p.kind))
    }

    /// Live children of a directory, ordered by name.
    pub fn path_children(&self, path: PathId) -> Result<Vec<PathId>, RefactorError> {
        Ok(self
            .store
            .path_children(path)?
            .into_iter()
            .filter(|p| !self.removed_paths.contains(p))
            .collect())
    }

    pub fn action_is_live(&self, action: ActionId) -> Result<bool, RefactorError> {
        if self.removed_actions.contains(&action) {
            return Ok(false);
        }
        Ok(self.created_actions.contains(&action) || self.store.is_live_action(action)?)
    }

    pub fn action_parent(&self, action: ActionId) -> Result<ActionId, RefactorError> {
        if let Some(&parent) = self.parents.get(&action) {
            return Ok(parent);
        }
        self.store
            .action(action)?
            .map(|a| a.parent)
            .ok_or_else(|| RefactorError::rejected(Cause::InvalidAction, [action.0]))
    }

    /// Live children of an action, ordered by id.
    pub fn action_children(&self, action: ActionId) -> Result<Vec<ActionId>, RefactorError> {
        let mut children: BTreeSet<ActionId> = self
            .store
            .action_children(action)?
            .into_iter()
            .filter(|c| !self.removed_actions.contains(c))
            .filter(|c| self.parents.get(c).is_none_or(|&p| p == action))
            .collect();
        children.extend(
            self.parents
                .iter()
                .filter(|&(c, &p)| p == action && !self.removed_actions.contains(c))
                .map(|(&c, _)| c),
        );
        Ok(children.into_iter().collect())
    }

    pub fn is_atomic(&self, action: ActionId) -> Result<bool, RefactorError> {
        Ok(self.action_children(action)?.is_empty())
    }

    /// Live actions working in `dir`.
    pub fn actions_in_directory(&self, dir: PathId) -> Result<Vec<ActionId>, RefactorError> {
        Ok(self
            .store
            .actions_in_directory(dir)?
            .into_iter()
            .filter(|a| !self.removed_actions.contains(a))
            .collect())
    }

    /// Links held by an action, in sequence order.
    pub fn accesses_of_action(&self, action: ActionId) -> Result<Vec<FileAccess>, RefactorError> {
        let mut links: Vec<FileAccess> = self
            .store
            .accesses_of_action(action)?
            .into_iter()
            .filter(|a| !self.removed_links.contains(&a.seq))
            .collect();
        links.extend(self.added_links.values().filter(|a| a.action == action));
        links.sort_by_key(|a| a.seq);
        Ok(links)
    }

    /// Links pointing at a path, in sequence order.
    pub fn accesses_of_path(&self, path: PathId) -> Result<Vec<FileAccess>, RefactorError> {
        let mut links: Vec<FileAccess> = self
            .store
            .accesses_of_path(path)?
            .into_iter()
            .filter(|a| !self.removed_links.contains(&a.seq))
            .collect();
        links.extend(self.added_links.values().filter(|a| a.path == path));
        links.sort_by_key(|a| a.seq);
        Ok(links)
    }

    /// Distinct actions accessing `path` with one of `operations`.
    pub fn actions_accessing(
        &self,
        path: PathId,
        operations: &[OperationType],
    ) -> Result<BTreeSet<ActionId>, RefactorError> {
        Ok(self
            .accesses_of_path(path)?
            .into_iter()
            .filter(|a| operations.contains(&a.operation))
            .map(|a| a.action)
            .collect())
    }

    pub fn member_package(&self, member: MemberRef) -> Result<Membership, RefactorError> {
        if let Some(&pending) = self.pending_memberships.get(&member) {
            return Ok(pending);
        }
        Ok(self.store.member_package(member)?)
    }

    /// Paths a group evaluates to, using pending membership for groups
    /// created by this refactoring.
    pub fn group_paths(&self, group: FileGroupId) -> Result<Vec<PathId>, RefactorError> {
        if let Some(pending) = self.pending_groups.get(&group) {
            return Ok(pending.clone());
        }
        Ok(self.store.group_paths(group)?)
    }

    fn path_depth(&self, path: PathId) -> Result<usize, RefactorError> {
        let mut depth = 0usize;
        let mut current = path;
        while current != PathId::ROOT {
            current = self
                .store
                .path(current)?
                .map(|p| p.parent)
                .ok_or_else(|| RefactorError::rejected(Cause::InvalidPath, [current.0]))?;
            depth = depth.saturating_add(1);
        }
        Ok(depth)
    }

    // =========================================================================
    // PRIMITIVE RECORDING
    // =========================================================================

    pub fn remove_link(&mut self, access: FileAccess) {
        if self.added_links.remove(&access.seq).is_none() {
            self.removed_links.insert(access.seq);
        }
        self.entry.append(UndoOp::RemoveAccess(access));
    }

    /// Record a new link with a freshly reserved sequence number.
    pub fn add_link(
        &mut self,
        action: ActionId,
        path: PathId,
        operation: OperationType,
    ) -> FileAccess {
        let access = FileAccess::new(self.next_seq, action, path, operation);
        self.next_seq = self.next_seq.saturating_add(1);
        self.added_links.insert(access.seq, access);
        self.entry.append(UndoOp::AddAccess(access));
        access
    }

    pub fn remove_action(&mut self, action: ActionId) {
        self.removed_actions.insert(action);
        self.entry.append(UndoOp::RemoveAction(action));
    }

    pub fn reparent(&mut self, action: ActionId, to: ActionId) -> Result<(), RefactorError> {
        let from = self.action_parent(action)?;
        self.parents.insert(action, to);
        self.entry.append(UndoOp::ReparentAction { action, from, to });
        Ok(())
    }

    /// Schedule a path for removal at the end of the entry.
    pub fn schedule_path_removal(&mut self, path: PathId) {
        if self.removed_paths.insert(path) {
            self.deferred_paths.push(path);
        }
    }

    /// Record creation of a new action under a reserved id.
    pub fn create_action(&mut self, parent: ActionId, command: String, directory: PathId) -> ActionId {
        let action = ActionId(self.next_action);
        self.next_action = self.next_action.saturating_add(1);
        self.created_actions.insert(action);
        self.parents.insert(action, parent);
        self.entry.append(UndoOp::CreateAction {
            action,
            parent,
            command,
            directory,
        });
        action
    }

    /// Record creation of a group with its members. `evaluated` is what the
    /// group will evaluate to once applied.
    pub fn create_group(
        &mut self,
        kind: GroupKind,
        members: Vec<GroupMember>,
        evaluated: Vec<PathId>,
    ) -> FileGroupId {
        let group = FileGroupId(self.next_group);
        self.next_group = self.next_group.saturating_add(1);
        self.entry.append(UndoOp::CreateGroup { group, kind });
        self.entry.append(UndoOp::SetGroupMembers {
            group,
            old: Vec::new(),
            new: members,
        });
        self.pending_groups.insert(group, evaluated);
        group
    }

    pub fn set_member_package(
        &mut self,
        member: MemberRef,
        new: Membership,
    ) -> Result<(), RefactorError> {
        let old = self.member_package(member)?;
        if old == new {
            return Ok(());
        }
        self.pending_memberships.insert(member, new);
        self.entry
            .append(UndoOp::SetMemberPackage { member, old, new });
        Ok(())
    }

    pub fn set_action_slot(
        &mut self,
        action: ActionId,
        slot: SlotKind,
        group: FileGroupId,
    ) -> Result<(), RefactorError> {
        let old = if self.created_actions.contains(&action) {
            None
        } else {
            self.store.action_slot(action, slot)?
        };
        self.entry.append(UndoOp::SetActionSlot {
            action,
            slot,
            old,
            new: Some(group),
        });
        Ok(())
    }
}

/// Require `action` to be a live, non-root action.
fn require_action<S: BuildStore + ?Sized>(
    ctx: &RefactorContext<'_, S>,
    action: ActionId,
) -> Result<(), RefactorError> {
    if action == ActionId::ROOT || !ctx.action_is_live(action)? {
        return Err(RefactorError::rejected(Cause::InvalidAction, [action.0]));
    }
    Ok(())
}

/// Live descendants of `action` in post-order (deepest first, children in
/// id order), not including `action` itself.
fn descendants_post_order<S: BuildStore + ?Sized>(
    ctx: &RefactorContext<'_, S>,
    action: ActionId,
) -> Result<Vec<ActionId>, RefactorError> {
    let mut out = Vec::new();
    let mut stack = vec![(action, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            if node != action {
                out.push(node);
            }
            continue;
        }
        stack.push((node, true));
        for child in ctx.action_children(node)?.into_iter().rev() {
            stack.push((child, false));
        }
    }
    Ok(out)
}

// =============================================================================
// TESTS
// =============================================================================
