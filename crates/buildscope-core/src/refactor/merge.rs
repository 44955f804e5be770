//! Merging sibling actions and flattening composite actions.

use super::{RefactorContext, descendants_post_order, require_action};
use crate::constants::COMMAND_SEPARATOR;
use crate::graph::BuildStore;
use crate::{ActionId, Cause, FileAccess, MemberRef, PackageId, RefactorError, SlotKind};
use std::collections::BTreeSet;
use tracing::debug;

/// Merge sibling atomic actions into one new action.
///
/// The new action runs every command in list order and holds every access
/// link, re-sequenced in list order. Merging zero or one action does nothing.
pub fn merge_actions<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    actions: &[ActionId],
) -> Result<(), RefactorError> {
    let [first, ..] = actions else {
        return Ok(());
    };
    if actions.len() == 1 {
        return Ok(());
    }

    let mut seen = BTreeSet::new();
    let duplicates: Vec<u64> = actions
        .iter()
        .filter(|a| !seen.insert(**a))
        .map(|a| a.0)
        .collect();
    if !duplicates.is_empty() {
        return Err(RefactorError::rejected(Cause::InvalidAction, duplicates));
    }
    for &action in actions {
        require_action(ctx, action)?;
    }

    let parent = ctx.action_parent(*first)?;
    let mut strangers = Vec::new();
    for &action in actions {
        if ctx.action_parent(action)? != parent {
            strangers.push(action.0);
        }
    }
    if !strangers.is_empty() {
        return Err(RefactorError::rejected(Cause::InvalidAction, strangers));
    }

    let mut composite = Vec::new();
    for &action in actions {
        if !ctx.is_atomic(action)? {
            composite.push(action.0);
        }
    }
    if !composite.is_empty() {
        return Err(RefactorError::rejected(Cause::ActionNotAtomic, composite));
    }

    let mut commands = Vec::with_capacity(actions.len());
    let mut links = Vec::new();
    for &action in actions {
        let node = ctx
            .store()
            .action(action)?
            .ok_or_else(|| RefactorError::rejected(Cause::InvalidAction, [action.0]))?;
        commands.push(node.command);
        links.extend(ctx.accesses_of_action(action)?);
    }
    let directory = ctx
        .store()
        .action(*first)?
        .map(|a| a.directory)
        .ok_or_else(|| RefactorError::rejected(Cause::InvalidAction, [first.0]))?;

    debug!(actions = actions.len(), links = links.len(), "merging actions");
    let clone = ctx.create_action(parent, commands.join(COMMAND_SEPARATOR), directory);
    replace_with_clone(ctx, *first, clone, &links, actions)
}

/// Flatten a composite action into a single atomic action holding every
/// access link of its subtree in original order. Atomic actions are left
/// alone.
pub fn make_action_atomic<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    action: ActionId,
) -> Result<(), RefactorError> {
    require_action(ctx, action)?;
    if ctx.is_atomic(action)? {
        return Ok(());
    }

    let descendants = descendants_post_order(ctx, action)?;
    let mut links = ctx.accesses_of_action(action)?;
    for &descendant in &descendants {
        links.extend(ctx.accesses_of_action(descendant)?);
    }
    links.sort_by_key(|l| l.seq);

    let node = ctx
        .store()
        .action(action)?
        .ok_or_else(|| RefactorError::rejected(Cause::InvalidAction, [action.0]))?;
    let parent = ctx.action_parent(action)?;

    debug!(%action, descendants = descendants.len(), links = links.len(), "flattening action");
    let clone = ctx.create_action(parent, node.command, node.directory);
    let mut removed = descendants;
    removed.push(action);
    replace_with_clone(ctx, action, clone, &links, &removed)
}

/// Copy `links` onto `clone` with fresh sequence numbers, then unlink and
/// remove `originals` in order.
///
/// The clone inherits package membership and each input/output slot from
/// `template`, or from the first of `originals` that has one when the
/// template does not.
fn replace_with_clone<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    template: ActionId,
    clone: ActionId,
    links: &[FileAccess],
    originals: &[ActionId],
) -> Result<(), RefactorError> {
    let mut donors = vec![template];
    donors.extend(originals.iter().copied().filter(|&a| a != template));

    let mut membership = None;
    for &donor in &donors {
        let current = ctx.member_package(MemberRef::Action(donor))?;
        if current.package != PackageId::IMPORT {
            membership = Some(current);
            break;
        }
    }
    let mut slots = Vec::new();
    for slot in [SlotKind::Input, SlotKind::Output] {
        for &donor in &donors {
            if let Some(group) = ctx.store().action_slot(donor, slot)? {
                slots.push((slot, group));
                break;
            }
        }
    }

    for link in links {
        ctx.add_link(clone, link.path, link.operation);
    }
    for &original in originals {
        for link in ctx.accesses_of_action(original)? {
            ctx.remove_link(link);
        }
        ctx.remove_action(original);
    }
    if let Some(membership) = membership {
        ctx.set_member_package(MemberRef::Action(clone), membership)?;
    }
    for (slot, group) in slots {
        ctx.set_action_slot(clone, slot, group)?;
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
