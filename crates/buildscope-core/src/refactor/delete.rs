//! Deleting paths and actions, singly or as whole subtrees.

use super::{RefactorContext, descendants_post_order, require_action};
use crate::graph::BuildStore;
use crate::{ActionId, Cause, OperationType, PathId, PathType, RefactorError};
use std::collections::BTreeSet;
use tracing::debug;

const GENERATING: &[OperationType] = &[
    OperationType::Write,
    OperationType::Modify,
    OperationType::Delete,
    OperationType::Unspecified,
];

const ALL_OPERATIONS: &[OperationType] = &[
    OperationType::Read,
    OperationType::Write,
    OperationType::Modify,
    OperationType::Delete,
    OperationType::Unspecified,
];

// =============================================================================
// DELETE PATH
// =============================================================================

/// Delete a path. With `cascade`, the atomic actions generating it are
/// deleted too, along with every other path only they wrote.
pub fn delete_path<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    path: PathId,
    cascade: bool,
) -> Result<(), RefactorError> {
    if path == PathId::ROOT || !ctx.path_is_live(path)? {
        return Err(RefactorError::rejected(Cause::InvalidPath, [path.0]));
    }
    if ctx.path_kind(path)? == Some(PathType::Directory) && !ctx.path_children(path)?.is_empty()
    {
        return Err(RefactorError::rejected(Cause::DirectoryNotEmpty, [path.0]));
    }
    delete_paths(ctx, &BTreeSet::from([path]), cascade)
}

/// Delete a path and everything below it. The subtree is validated as one
/// closure, so an action reading a path inside it does not block the
/// delete when it is a generator being removed too.
pub fn delete_path_tree<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    path: PathId,
    cascade: bool,
) -> Result<(), RefactorError> {
    if path == PathId::ROOT || !ctx.path_is_live(path)? {
        return Err(RefactorError::rejected(Cause::InvalidPath, [path.0]));
    }

    let mut subtree = BTreeSet::new();
    let mut stack = vec![path];
    while let Some(node) = stack.pop() {
        if subtree.insert(node) {
            stack.extend(ctx.path_children(node)?);
        }
    }
    debug!(%path, paths = subtree.len(), "deleting path tree");
    delete_paths(ctx, &subtree, cascade)
}

/// Remove `targets` and, with `cascade`, every action generating one of
/// them. Accessors inside that closure never count as users.
fn delete_paths<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    targets: &BTreeSet<PathId>,
    cascade: bool,
) -> Result<(), RefactorError> {
    let mut generators = BTreeSet::new();
    let mut generated = BTreeSet::new();
    for &target in targets {
        let writers = ctx.actions_accessing(target, GENERATING)?;
        if !writers.is_empty() {
            generated.insert(target);
            generators.extend(writers);
        }
    }
    if !generated.is_empty() && !cascade {
        return Err(RefactorError::rejected(
            Cause::PathIsGenerated,
            generated.iter().map(|p| p.0),
        ));
    }

    let mut composite = Vec::new();
    for &generator in &generators {
        if !ctx.is_atomic(generator)? {
            composite.push(generator.0);
        }
    }
    if !composite.is_empty() {
        return Err(RefactorError::rejected(Cause::ActionNotAtomic, composite));
    }

    let mut working = BTreeSet::new();
    for &target in targets {
        if ctx.path_kind(target)? == Some(PathType::Directory) {
            working.extend(
                ctx.actions_in_directory(target)?
                    .into_iter()
                    .filter(|a| !generators.contains(a))
                    .map(|a| a.0),
            );
        }
    }
    if !working.is_empty() {
        return Err(RefactorError::rejected(Cause::DirectoryContainsActions, working));
    }

    let mut read = BTreeSet::new();
    for target in targets.difference(&generated) {
        let readers = ctx.actions_accessing(*target, &[OperationType::Read])?;
        if readers.difference(&generators).next().is_some() {
            read.insert(target.0);
        }
    }
    if !read.is_empty() {
        return Err(RefactorError::rejected(Cause::PathInUse, read));
    }

    // Every target and every output of a generator must be used by nothing
    // but the generators themselves.
    let mut outputs = targets.clone();
    for &generator in &generators {
        for link in ctx.accesses_of_action(generator)? {
            if link.operation == OperationType::Write {
                outputs.insert(link.path);
            }
        }
    }
    let mut in_use = BTreeSet::new();
    for &output in &outputs {
        let users = ctx.actions_accessing(output, ALL_OPERATIONS)?;
        in_use.extend(users.difference(&generators).map(|a| a.0));
    }
    if !in_use.is_empty() {
        return Err(RefactorError::rejected(Cause::ActionInUse, in_use));
    }

    debug!(paths = targets.len(), generators = generators.len(), "deleting paths");
    for &generator in &generators {
        for link in ctx.accesses_of_action(generator)? {
            ctx.remove_link(link);
        }
        ctx.remove_action(generator);
    }
    for output in outputs.difference(targets) {
        if removable(ctx, *output)? {
            ctx.schedule_path_removal(*output);
        }
    }
    for &target in targets {
        ctx.schedule_path_removal(target);
    }
    Ok(())
}

/// An unlinked path can be trashed unless something still lives in it.
fn removable<S: BuildStore + ?Sized>(
    ctx: &RefactorContext<'_, S>,
    path: PathId,
) -> Result<bool, RefactorError> {
    Ok(ctx.path_is_live(path)?
        && ctx.accesses_of_path(path)?.is_empty()
        && ctx.path_children(path)?.is_empty()
        && ctx.actions_in_directory(path)?.is_empty())
}

// =============================================================================
// DELETE ACTION
// =============================================================================

/// Delete an action. Its children move up to its parent; paths only it
/// generated are deleted with it.
pub fn delete_action<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    action: ActionId,
) -> Result<(), RefactorError> {
    require_action(ctx, action)?;
    let closure = BTreeSet::from([action]);
    check_outputs_unused(ctx, &closure)?;

    let mut outputs = BTreeSet::new();
    unlink_and_remove(ctx, action, &mut outputs)?;
    remove_orphans(ctx, outputs)
}

/// Delete an action together with all its descendants.
pub fn delete_action_tree<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    action: ActionId,
) -> Result<(), RefactorError> {
    require_action(ctx, action)?;
    let mut order = descendants_post_order(ctx, action)?;
    order.push(action);
    let closure: BTreeSet<ActionId> = order.iter().copied().collect();
    check_outputs_unused(ctx, &closure)?;

    debug!(%action, actions = order.len(), "deleting action tree");
    let mut outputs = BTreeSet::new();
    for node in order {
        unlink_and_remove(ctx, node, &mut outputs)?;
    }
    remove_orphans(ctx, outputs)
}

/// Reject if an action outside `closure` reads anything written inside it.
fn check_outputs_unused<S: BuildStore + ?Sized>(
    ctx: &RefactorContext<'_, S>,
    closure: &BTreeSet<ActionId>,
) -> Result<(), RefactorError> {
    let mut in_use = BTreeSet::new();
    for &member in closure {
        for link in ctx.accesses_of_action(member)? {
            if link.operation != OperationType::Write {
                continue;
            }
            let readers = ctx.actions_accessing(link.path, &[OperationType::Read])?;
            in_use.extend(readers.difference(closure).map(|a| a.0));
        }
    }
    if !in_use.is_empty() {
        return Err(RefactorError::rejected(Cause::ActionInUse, in_use));
    }
    Ok(())
}

fn unlink_and_remove<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    action: ActionId,
    outputs: &mut BTreeSet<PathId>,
) -> Result<(), RefactorError> {
    for link in ctx.accesses_of_action(action)? {
        if link.operation == OperationType::Write {
            outputs.insert(link.path);
        }
        ctx.remove_link(link);
    }
    let parent = ctx.action_parent(action)?;
    for child in ctx.action_children(action)? {
        ctx.reparent(child, parent)?;
    }
    ctx.remove_action(action);
    Ok(())
}

/// Schedule removal of written paths nothing accesses any more.
fn remove_orphans<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    outputs: BTreeSet<PathId>,
) -> Result<(), RefactorError> {
    for output in outputs {
        if removable(ctx, output)? {
            ctx.schedule_path_removal(output);
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
