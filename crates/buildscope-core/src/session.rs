//! # Session Module
//!
//! A `RefactorSession` owns one open build graph and its undo history.
//!
//! - `applied`: entries available to undo, most recent last
//! - `undone`: entries available to redo, most recently undone last
//!
//! Invoking a new refactoring clears `undone`: once the graph moves forward,
//! the previously undone future is unreachable. History is per session, so
//! two graphs open in one process never share it.

use crate::graph::BuildStore;
use crate::refactor::{self, RefactorContext};
use crate::undo::UndoEntry;
use crate::{ActionId, GraphError, MemberRef, PackageId, PathId, RefactorError};
use tracing::{info, warn};

/// One open graph plus its undo/redo stacks.
#[derive(Debug)]
pub struct RefactorSession<S: BuildStore> {
    store: S,
    applied: Vec<UndoEntry>,
    undone: Vec<UndoEntry>,
}

impl<S: BuildStore + Default> Default for RefactorSession<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: BuildStore> RefactorSession<S> {
    /// Open a session with empty history.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            applied: Vec::new(),
            undone: Vec::new(),
        }
    }

    /// Reopen a session with persisted history.
    #[must_use]
    pub fn with_history(store: S, applied: Vec<UndoEntry>, undone: Vec<UndoEntry>) -> Self {
        Self {
            store,
            applied,
            undone,
        }
    }

    /// Read-only access to the graph.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Entries available to undo, oldest first.
    #[must_use]
    pub fn applied(&self) -> &[UndoEntry] {
        &self.applied
    }

    /// Entries available to redo, oldest undo first.
    #[must_use]
    pub fn undone(&self) -> &[UndoEntry] {
        &self.undone
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.applied.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    /// Split the session into its store and both stacks.
    pub fn into_parts(self) -> (S, Vec<UndoEntry>, Vec<UndoEntry>) {
        (self.store, self.applied, self.undone)
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Apply an entry and make it the most recent undo step.
    ///
    /// An empty entry is a no-op and leaves history alone. Returns whether
    /// anything was applied.
    pub fn invoke(&mut self, entry: UndoEntry) -> Result<bool, RefactorError> {
        if entry.is_empty() {
            info!(entry = entry.label(), "refactoring is a no-op");
            return Ok(false);
        }
        entry.apply(&mut self.store)?;
        info!(entry = entry.label(), ops = entry.len(), "refactoring applied");
        self.applied.push(entry);
        self.undone.clear();
        Ok(true)
    }

    /// Undo the most recent entry. Returns `false` if there is nothing to undo.
    pub fn undo(&mut self) -> Result<bool, RefactorError> {
        let Some(entry) = self.applied.pop() else {
            return Ok(false);
        };
        if let Err(e) = entry.invert(&mut self.store) {
            self.applied.push(entry);
            return Err(e);
        }
        info!(entry = entry.label(), "refactoring undone");
        self.undone.push(entry);
        Ok(true)
    }

    /// Redo the most recently undone entry. Returns `false` if there is
    /// nothing to redo.
    pub fn redo(&mut self) -> Result<bool, RefactorError> {
        let Some(entry) = self.undone.pop() else {
            return Ok(false);
        };
        if let Err(e) = entry.apply(&mut self.store) {
            self.undone.push(entry);
            return Err(e);
        }
        info!(entry = entry.label(), "refactoring redone");
        self.applied.push(entry);
        Ok(true)
    }

    /// Physically drop trashed objects. History is cleared, since its
    /// entries may refer to what was reaped.
    pub fn reap_trash(&mut self) -> Result<usize, GraphError> {
        let reaped = self.store.reap_trash()?;
        self.applied.clear();
        self.undone.clear();
        info!(reaped, "trash reaped, history cleared");
        Ok(reaped)
    }

    // =========================================================================
    // REFACTORINGS
    // =========================================================================

    /// Validate and build an entry, then invoke it.
    fn run<F>(&mut self, label: &str, build: F) -> Result<bool, RefactorError>
    where
        F: FnOnce(&mut RefactorContext<'_, S>) -> Result<(), RefactorError>,
    {
        let mut ctx = RefactorContext::new(&self.store, label);
        let entry = match build(&mut ctx).and_then(|()| ctx.finish()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(refactoring = label, error = %e, "refactoring rejected");
                return Err(e);
            }
        };
        self.invoke(entry)
    }

    pub fn delete_path(&mut self, path: PathId, cascade: bool) -> Result<bool, RefactorError> {
        self.run("delete-path", |ctx| refactor::delete_path(ctx, path, cascade))
    }

    pub fn delete_path_tree(&mut self, path: PathId, cascade: bool) -> Result<bool, RefactorError> {
        self.run("delete-path-tree", |ctx| {
            refactor::delete_path_tree(ctx, path, cascade)
        })
    }

    pub fn delete_action(&mut self, action: ActionId) -> Result<bool, RefactorError> {
        self.run("delete-action", |ctx| refactor::delete_action(ctx, action))
    }

    pub fn delete_action_tree(&mut self, action: ActionId) -> Result<bool, RefactorError> {
        self.run("delete-action-tree", |ctx| {
            refactor::delete_action_tree(ctx, action)
        })
    }

    pub fn merge_actions(&mut self, actions: &[ActionId]) -> Result<bool, RefactorError> {
        self.run("merge-actions", |ctx| refactor::merge_actions(ctx, actions))
    }

    pub fn make_action_atomic(&mut self, action: ActionId) -> Result<bool, RefactorError> {
        self.run("make-action-atomic", |ctx| {
            refactor::make_action_atomic(ctx, action)
        })
    }

    pub fn move_to_package(
        &mut self,
        members: &[MemberRef],
        package: PackageId,
    ) -> Result<bool, RefactorError> {
        self.run("move-to-package", |ctx| {
            refactor::move_to_package(ctx, members, package)
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
