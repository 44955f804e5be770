//! # Undo Log
//!
//! Every refactoring is recorded as an [`UndoEntry`]: an ordered list of
//! primitive graph edits. An entry is built completely before anything is
//! applied, so a rejected refactoring never touches the store.
//!
//! Each [`UndoOp`] has an exact inverse. Applying an entry runs its
//! primitives in order; inverting it runs the inverses in reverse order.
//! Both directions are all-or-nothing: if a primitive fails part-way, the
//! primitives already performed are rolled back before the failure is
//! reported as [`RefactorError::Fatal`].

use crate::graph::BuildStore;
use crate::{
    ActionId, FileAccess, FileGroupId, GraphError, GroupKind, GroupMember, MemberRef, Membership,
    PathId, RefactorError, SlotKind,
};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use tracing::{debug, error};

// =============================================================================
// PRIMITIVES
// =============================================================================

/// A primitive, reversible graph edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoOp {
    /// Trash a path. Inverse: revive it.
    RemovePath(PathId),
    /// Trash an action. Inverse: revive it.
    RemoveAction(ActionId),
    /// Remove a link. Inverse: re-add it with the same sequence number.
    RemoveAccess(FileAccess),
    /// Add a link. Inverse: remove it.
    AddAccess(FileAccess),
    /// Move an action to a new parent.
    ReparentAction {
        action: ActionId,
        from: ActionId,
        to: ActionId,
    },
    /// Create an action under a reserved id. Inverse: trash it.
    CreateAction {
        action: ActionId,
        parent: ActionId,
        command: String,
        directory: PathId,
    },
    SetMemberPackage {
        member: MemberRef,
        old: Membership,
        new: Membership,
    },
    /// Create a group under a reserved id. Inverse: trash it.
    CreateGroup { group: FileGroupId, kind: GroupKind },
    SetGroupMembers {
        group: FileGroupId,
        old: Vec<GroupMember>,
        new: Vec<GroupMember>,
    },
    SetActionSlot {
        action: ActionId,
        slot: SlotKind,
        old: Option<FileGroupId>,
        new: Option<FileGroupId>,
    },
}

impl UndoOp {
    /// Perform the edit.
    fn forward<S: BuildStore + ?Sized>(&self, store: &mut S) -> Result<(), GraphError> {
        match self {
            Self::RemovePath(id) => store.trash_path(*id),
            Self::RemoveAction(id) => store.trash_action(*id),
            Self::RemoveAccess(access) => store.remove_access(*access),
            Self::AddAccess(access) => store.add_access(*access),
            Self::ReparentAction { action, from, to } => reparent(store, *action, *from, *to),
            Self::CreateAction {
                action,
                parent,
                command,
                directory,
            } => store.create_action(*action, *parent, command, *directory),
            Self::SetMemberPackage { member, new, .. } => store.set_member_package(*member, *new),
            Self::CreateGroup { group, kind } => store.create_group(*group, *kind),
            Self::SetGroupMembers { group, new, .. } => store.set_group_members(*group, new.clone()),
            Self::SetActionSlot {
                action, slot, new, ..
            } => store.set_action_slot(*action, *slot, *new),
        }
    }

    /// Perform the exact inverse of the edit.
    fn backward<S: BuildStore + ?Sized>(&self, store: &mut S) -> Result<(), GraphError> {
        match self {
            Self::RemovePath(id) => store.revive_path(*id),
            Self::RemoveAction(id) => store.revive_action(*id),
            Self::RemoveAccess(access) => store.add_access(*access),
            Self::AddAccess(access) => store.remove_access(*access),
            Self::ReparentAction { action, from, to } => reparent(store, *action, *to, *from),
            Self::CreateAction { action, .. } => store.trash_action(*action),
            Self::SetMemberPackage { member, old, .. } => store.set_member_package(*member, *old),
            Self::CreateGroup { group, .. } => store.trash_group(*group),
            Self::SetGroupMembers { group, old, .. } => store.set_group_members(*group, old.clone()),
            Self::SetActionSlot {
                action, slot, old, ..
            } => store.set_action_slot(*action, *slot, *old),
        }
    }
}

fn reparent<S: BuildStore + ?Sized>(
    store: &mut S,
    action: ActionId,
    from: ActionId,
    to: ActionId,
) -> Result<(), GraphError> {
    let current = store
        .action(action)?
        .ok_or(GraphError::ActionNotFound(action))?
        .parent;
    if current != from {
        return Err(GraphError::Integrity(format!(
            "{} has parent {}, expected {}",
            action, current, from
        )));
    }
    store.reparent_action(action, to)
}

// =============================================================================
// BULK SCOPE
// =============================================================================

/// Holds a store inside a bulk mutation scope until dropped.
struct BulkGuard<'a, S: BuildStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: BuildStore + ?Sized> BulkGuard<'a, S> {
    fn new(store: &'a mut S) -> Self {
        store.begin_bulk();
        Self { store }
    }
}

impl<S: BuildStore + ?Sized> Drop for BulkGuard<'_, S> {
    fn drop(&mut self) {
        self.store.end_bulk();
    }
}

impl<S: BuildStore + ?Sized> Deref for BulkGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: BuildStore + ?Sized> DerefMut for BulkGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

// =============================================================================
// UNDO ENTRY
// =============================================================================

/// An ordered, reversible batch of primitives recorded by one refactoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoEntry {
    label: String,
    ops: Vec<UndoOp>,
}

impl UndoEntry {
    /// Create an empty entry. `label` names the refactoring for logs.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ops: Vec::new(),
        }
    }

    /// Record a primitive at the end of the entry.
    pub fn append(&mut self, op: UndoOp) {
        self.ops.push(op);
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn ops(&self) -> &[UndoOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every primitive in order.
    ///
    /// On failure the primitives already applied are inverted in reverse
    /// order and `RefactorError::Fatal` is returned.
    pub fn apply<S: BuildStore + ?Sized>(&self, store: &mut S) -> Result<(), RefactorError> {
        debug!(entry = %self.label, ops = self.ops.len(), "applying undo entry");
        let mut store = BulkGuard::new(store);
        for (i, op) in self.ops.iter().enumerate() {
            if let Err(e) = op.forward(&mut *store) {
                error!(entry = %self.label, index = i, op = ?op, error = %e, "primitive failed, rolling back");
                for done in self.ops[..i].iter().rev() {
                    if let Err(rollback) = done.backward(&mut *store) {
                        error!(entry = %self.label, op = ?done, error = %rollback, "rollback failed");
                    }
                }
                return Err(RefactorError::Fatal(format!(
                    "applying '{}' failed at primitive {}: {}",
                    self.label, i, e
                )));
            }
        }
        Ok(())
    }

    /// Apply the inverse of every primitive, last to first.
    ///
    /// On failure the inverses already performed are re-applied forward and
    /// `RefactorError::Fatal` is returned.
    pub fn invert<S: BuildStore + ?Sized>(&self, store: &mut S) -> Result<(), RefactorError> {
        debug!(entry = %self.label, ops = self.ops.len(), "inverting undo entry");
        let mut store = BulkGuard::new(store);
        for (i, op) in self.ops.iter().enumerate().rev() {
            if let Err(e) = op.backward(&mut *store) {
                error!(entry = %self.label, index = i, op = ?op, error = %e, "inverse failed, rolling back");
                for done in &self.ops[i + 1..] {
                    if let Err(rollback) = done.forward(&mut *store) {
                        error!(entry = %self.label, op = ?done, error = %rollback, "rollback failed");
                    }
                }
                return Err(RefactorError::Fatal(format!(
                    "inverting '{}' failed at primitive {}: {}",
                    self.label, i, e
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
