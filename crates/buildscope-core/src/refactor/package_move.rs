//! # Package Move
//!
//! Relocates paths, actions and file groups into a destination package.
//!
//! Moving an action drags its whole producer chain along: every path the
//! action reads that another action writes causes that producer to be moved
//! first, and the producer's output group is wired into the consumer's
//! input. Where the consumer needs only part of an upstream group, a filter
//! group narrows it; where it needs several upstream groups, a merge group
//! combines them.

use super::RefactorContext;
use crate::constants::INCLUDE_PREFIX;
use crate::graph::BuildStore;
use crate::{
    ActionId, Cause, FileGroupId, GroupKind, GroupMember, MemberRef, Membership, OperationType,
    PackageId, PathId, PathType, RefactorError, Scope, SlotKind,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Per-move state threaded through the recursive walk.
struct MoveState {
    package: PackageId,
    root: PathId,
    /// Output group of every action moved so far. `None` while the action is
    /// still being processed, or when it writes nothing.
    moved: BTreeMap<ActionId, Option<FileGroupId>>,
    /// Paths whose package change is already recorded.
    scheduled: BTreeSet<PathId>,
    out_of_range: BTreeSet<PathId>,
}

/// Move `members` into `package`.
pub fn move_to_package<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    members: &[MemberRef],
    package: PackageId,
) -> Result<(), RefactorError> {
    let root = ctx
        .store()
        .package(package)?
        .and_then(|p| p.root)
        .ok_or_else(|| RefactorError::rejected(Cause::InvalidPackage, [package.0]))?;
    validate_members(ctx, members)?;

    let mut actions = Vec::new();
    let mut loose = Vec::new();
    let mut groups = Vec::new();
    for &member in members {
        match member {
            MemberRef::Path(path) => match sole_producer(ctx, path)? {
                Some(producer) => push_unique(&mut actions, producer),
                None => push_unique(&mut loose, path),
            },
            MemberRef::Action(action) => push_unique(&mut actions, action),
            MemberRef::Group(group) => push_unique(&mut groups, group),
        }
    }

    debug!(
        %package,
        actions = actions.len(),
        loose = loose.len(),
        groups = groups.len(),
        "moving members to package"
    );
    let mut state = MoveState {
        package,
        root,
        moved: BTreeMap::new(),
        scheduled: BTreeSet::new(),
        out_of_range: BTreeSet::new(),
    };

    if !loose.is_empty() {
        create_source_group(ctx, &mut state, &loose, Scope::Public)?;
    }
    for group in groups {
        move_group(ctx, &mut state, group)?;
    }
    for action in actions {
        move_action(ctx, &mut state, action)?;
    }

    if !state.out_of_range.is_empty() {
        return Err(RefactorError::rejected(
            Cause::PathOutOfRange,
            state.out_of_range.iter().map(|p| p.0),
        ));
    }
    Ok(())
}

fn validate_members<S: BuildStore + ?Sized>(
    ctx: &RefactorContext<'_, S>,
    members: &[MemberRef],
) -> Result<(), RefactorError> {
    for &member in members {
        match member {
            MemberRef::Path(path) => {
                if !ctx.path_is_live(path)? {
                    return Err(RefactorError::rejected(Cause::InvalidPath, [path.0]));
                }
                if ctx.path_kind(path)? == Some(PathType::Directory) {
                    return Err(RefactorError::rejected(Cause::InvalidMember, [path.0]));
                }
            }
            MemberRef::Action(action) => {
                if action == ActionId::ROOT || !ctx.action_is_live(action)? {
                    return Err(RefactorError::rejected(Cause::InvalidAction, [action.0]));
                }
            }
            MemberRef::Group(group) => {
                if !ctx.store().group(group)?.is_some_and(|g| !g.trashed) {
                    return Err(RefactorError::rejected(
                        Cause::InvalidFileGroup,
                        [group.0],
                    ));
                }
            }
        }
    }
    Ok(())
}

/// The single action writing `path`, or `None` for a loose file.
///
/// Modified files and files with several writers have no well-defined
/// producer.
fn sole_producer<S: BuildStore + ?Sized>(
    ctx: &RefactorContext<'_, S>,
    path: PathId,
) -> Result<Option<ActionId>, RefactorError> {
    if !ctx
        .actions_accessing(path, &[OperationType::Modify])?
        .is_empty()
    {
        return Err(RefactorError::rejected(Cause::FileIsModified, [path.0]));
    }
    let writers = ctx.actions_accessing(path, &[OperationType::Write])?;
    let mut iter = writers.into_iter();
    match (iter.next(), iter.next()) {
        (None, _) => Ok(None),
        (Some(writer), None) => Ok(Some(writer)),
        (Some(_), Some(_)) => Err(RefactorError::rejected(Cause::FileIsModified, [path.0])),
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Move an action and, recursively, the producers of everything it reads.
/// Returns the action's output group.
fn move_action<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    state: &mut MoveState,
    action: ActionId,
) -> Result<Option<FileGroupId>, RefactorError> {
    if let Some(&output) = state.moved.get(&action) {
        return Ok(output);
    }
    if !ctx.is_atomic(action)? {
        return Err(RefactorError::rejected(Cause::ActionNotAtomic, [action.0]));
    }
    state.moved.insert(action, None);
    ctx.set_member_package(
        MemberRef::Action(action),
        Membership::new(state.package, Scope::Private),
    )?;

    let links = ctx.accesses_of_action(action)?;
    let mut written = Vec::new();
    let mut read = Vec::new();
    for link in &links {
        match link.operation {
            OperationType::Write => push_unique(&mut written, link.path),
            OperationType::Read => push_unique(&mut read, link.path),
            _ => {}
        }
    }

    let mut output = None;
    if !written.is_empty() {
        let group = create_source_group(ctx, state, &written, Scope::Public)?;
        ctx.set_action_slot(action, SlotKind::Output, group)?;
        state.moved.insert(action, Some(group));
        output = Some(group);
    }

    let inputs = compute_inputs(ctx, state, action, &read)?;
    match inputs.as_slice() {
        [] => {}
        [(group, needed)] => {
            let input = create_filter_if_needed(ctx, state, *group, needed)?;
            ctx.set_action_slot(action, SlotKind::Input, input)?;
        }
        many => {
            let mut children = Vec::with_capacity(many.len());
            let mut evaluated = Vec::new();
            for (group, needed) in many {
                children.push(create_filter_if_needed(ctx, state, *group, needed)?);
                evaluated.extend(needed.iter().copied());
            }
            let merge = ctx.create_group(
                GroupKind::Merge,
                children.into_iter().map(GroupMember::Group).collect(),
                evaluated,
            );
            ctx.set_member_package(
                MemberRef::Group(merge),
                Membership::new(state.package, Scope::Private),
            )?;
            ctx.set_action_slot(action, SlotKind::Input, merge)?;
        }
    }
    Ok(output)
}

/// Resolve what `action` reads into upstream groups, each paired with the
/// paths the action actually needs from it.
fn compute_inputs<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    state: &mut MoveState,
    action: ActionId,
    read: &[PathId],
) -> Result<Vec<(FileGroupId, Vec<PathId>)>, RefactorError> {
    let mut inputs: Vec<(FileGroupId, Vec<PathId>)> = Vec::new();
    let mut loose = Vec::new();
    for &path in read {
        let Some(producer) = sole_producer(ctx, path)? else {
            loose.push(path);
            continue;
        };
        if producer == action {
            continue;
        }
        // A producer still in progress sits on a dependency cycle.
        let Some(group) = move_action(ctx, state, producer)? else {
            continue;
        };
        match inputs.iter_mut().find(|(g, _)| *g == group) {
            Some((_, needed)) => needed.push(path),
            None => inputs.push((group, vec![path])),
        }
    }
    if !loose.is_empty() {
        let group = create_source_group(ctx, state, &loose, Scope::Private)?;
        inputs.push((group, loose));
    }
    Ok(inputs)
}

/// `group` itself if every member is needed, otherwise a new filter group
/// over it that includes exactly `needed`.
fn create_filter_if_needed<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    state: &MoveState,
    group: FileGroupId,
    needed: &[PathId],
) -> Result<FileGroupId, RefactorError> {
    let members = ctx.group_paths(group)?;
    if members.iter().all(|m| needed.contains(m)) {
        return Ok(group);
    }

    let mut patterns = Vec::with_capacity(needed.len());
    for &path in needed {
        // Rendered as it will read once moved into the destination package.
        let name = ctx.store().path_name_in_package(path, state.package)?;
        patterns.push(GroupMember::Pattern(format!(
            "{}{}",
            INCLUDE_PREFIX,
            escape_glob(&name)
        )));
    }
    let filter = ctx.create_group(
        GroupKind::Filter { source: group },
        patterns,
        needed.to_vec(),
    );
    ctx.set_member_package(
        MemberRef::Group(filter),
        Membership::new(state.package, Scope::Private),
    )?;
    Ok(filter)
}

fn create_source_group<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    state: &mut MoveState,
    paths: &[PathId],
    scope: Scope,
) -> Result<FileGroupId, RefactorError> {
    let group = ctx.create_group(
        GroupKind::Source,
        paths.iter().map(|&p| GroupMember::Path(p)).collect(),
        paths.to_vec(),
    );
    ctx.set_member_package(MemberRef::Group(group), Membership::new(state.package, scope))?;
    for &path in paths {
        move_path(ctx, state, path)?;
    }
    Ok(group)
}

/// Move an explicitly listed group, with the loose paths it holds.
fn move_group<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    state: &mut MoveState,
    group: FileGroupId,
) -> Result<(), RefactorError> {
    ctx.set_member_package(
        MemberRef::Group(group),
        Membership::new(state.package, Scope::Public),
    )?;
    let record = ctx
        .store()
        .group(group)?
        .ok_or_else(|| RefactorError::rejected(Cause::InvalidFileGroup, [group.0]))?;
    for member in record.members {
        if let GroupMember::Path(path) = member {
            move_path(ctx, state, path)?;
        }
    }
    Ok(())
}

/// Record a path's package change once, noting it if it lies outside the
/// destination's source root.
fn move_path<S: BuildStore + ?Sized>(
    ctx: &mut RefactorContext<'_, S>,
    state: &mut MoveState,
    path: PathId,
) -> Result<(), RefactorError> {
    if !state.scheduled.insert(path) {
        return Ok(());
    }
    if !ctx.store().is_path_under(path, state.root)? {
        state.out_of_range.insert(path);
    }
    ctx.set_member_package(
        MemberRef::Path(path),
        Membership::new(state.package, Scope::Private),
    )
}

/// Quote glob metacharacters so a path name matches only itself.
fn escape_glob(name: &str) -> String {
    globset::escape(&name.replace('\\', "\\\\"))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BuildGraph;
    use crate::undo::UndoOp;

    struct Fixture {
        graph: BuildGraph,
        pkg: PackageId,
    }

    fn fixture() -> Fixture {
        let mut graph = BuildGraph::new();
        let root = graph.add_directory("/pkg").expect("dir");
        let pkg = graph.add_package("p", Some(root)).expect("package");
        Fixture { graph, pkg }
    }

    fn created_groups(ops: &[UndoOp]) -> Vec<(FileGroupId, GroupKind)> {
        ops.iter()
            .filter_map(|op| match op {
                UndoOp::CreateGroup { group, kind } => Some((*group, *kind)),
                _ => None,
            })
            .collect()
    }

    fn slot(ops: &[UndoOp], action: ActionId, kind: SlotKind) -> Option<FileGroupId> {
        ops.iter().find_map(|op| match op {
            UndoOp::SetActionSlot {
                action: a,
                slot,
                new,
                ..
            } if *a == action && *slot == kind => *new,
            _ => None,
        })
    }

    #[test]
    fn loose_file_gets_one_source_group() {
        let mut f = fixture();
        let file = f.graph.add_file("/pkg/README").expect("file");

        let mut ctx = RefactorContext::new(&f.graph, "move");
        move_to_package(&mut ctx, &[MemberRef::Path(file)], f.pkg).expect("move");
        assert_eq!(
            ctx.member_package(MemberRef::Path(file)).expect("member").package,
            f.pkg
        );
        let entry = ctx.finish().expect("finish");

        let groups = created_groups(entry.ops());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, GroupKind::Source);
    }

    #[test]
    fn producer_is_moved_transitively() {
        let mut f = fixture();
        let f1 = f.graph.add_file("/pkg/f1").expect("file");
        let f2 = f.graph.add_file("/pkg/f2").expect("file");
        let a = f
            .graph
            .add_action(ActionId::ROOT, "gen f1", PathId::ROOT)
            .expect("action");
        let b = f
            .graph
            .add_action(ActionId::ROOT, "gen f2 from f1", PathId::ROOT)
            .expect("action");
        f.graph.record_access(a, f1, OperationType::Write).expect("link");
        f.graph.record_access(b, f1, OperationType::Read).expect("link");
        f.graph.record_access(b, f2, OperationType::Write).expect("link");

        let mut ctx = RefactorContext::new(&f.graph, "move");
        move_to_package(&mut ctx, &[MemberRef::Action(b)], f.pkg).expect("move");
        for action in [a, b] {
            assert_eq!(
                ctx.member_package(MemberRef::Action(action))
                    .expect("member")
                    .package,
                f.pkg
            );
        }
        let entry = ctx.finish().expect("finish");

        // Two output groups, no filter, no merge.
        let groups = created_groups(entry.ops());
        assert!(groups.iter().all(|(_, k)| *k == GroupKind::Source));
        assert_eq!(groups.len(), 2);
        let a_out = slot(entry.ops(), a, SlotKind::Output).expect("output");
        assert_eq!(slot(entry.ops(), b, SlotKind::Input), Some(a_out));
    }

    #[test]
    fn partial_need_synthesizes_filter() {
        let mut f = fixture();
        let obj = f.graph.add_file("/pkg/x.o").expect("file");
        let dep = f.graph.add_file("/pkg/x.d").expect("file");
        let prog = f.graph.add_file("/pkg/prog").expect("file");
        let cc = f
            .graph
            .add_action(ActionId::ROOT, "cc", PathId::ROOT)
            .expect("action");
        let ld = f
            .graph
            .add_action(ActionId::ROOT, "ld", PathId::ROOT)
            .expect("action");
        f.graph.record_access(cc, obj, OperationType::Write).expect("link");
        f.graph.record_access(cc, dep, OperationType::Write).expect("link");
        f.graph.record_access(ld, obj, OperationType::Read).expect("link");
        f.graph.record_access(ld, prog, OperationType::Write).expect("link");

        let mut ctx = RefactorContext::new(&f.graph, "move");
        move_to_package(&mut ctx, &[MemberRef::Path(prog)], f.pkg).expect("move");
        let entry = ctx.finish().expect("finish");

        let input = slot(entry.ops(), ld, SlotKind::Input).expect("input");
        let cc_out = slot(entry.ops(), cc, SlotKind::Output).expect("output");
        assert!(created_groups(entry.ops()).contains(&(
            input,
            GroupKind::Filter { source: cc_out }
        )));
        assert!(entry.ops().contains(&UndoOp::SetGroupMembers {
            group: input,
            old: Vec::new(),
            new: vec![GroupMember::Pattern("include:@p/x.o".to_string())],
        }));
    }

    #[test]
    fn several_inputs_are_merged() {
        let mut f = fixture();
        let a_out = f.graph.add_file("/pkg/a").expect("file");
        let b_out = f.graph.add_file("/pkg/b").expect("file");
        let src = f.graph.add_file("/pkg/src").expect("file");
        let out = f.graph.add_file("/pkg/out").expect("file");
        let a = f
            .graph
            .add_action(ActionId::ROOT, "a", PathId::ROOT)
            .expect("action");
        let b = f
            .graph
            .add_action(ActionId::ROOT, "b", PathId::ROOT)
            .expect("action");
        let c = f
            .graph
            .add_action(ActionId::ROOT, "c", PathId::ROOT)
            .expect("action");
        f.graph.record_access(a, a_out, OperationType::Write).expect("link");
        f.graph.record_access(b, b_out, OperationType::Write).expect("link");
        f.graph.record_access(c, a_out, OperationType::Read).expect("link");
        f.graph.record_access(c, b_out, OperationType::Read).expect("link");
        f.graph.record_access(c, src, OperationType::Read).expect("link");
        f.graph.record_access(c, out, OperationType::Write).expect("link");

        let mut ctx = RefactorContext::new(&f.graph, "move");
        move_to_package(&mut ctx, &[MemberRef::Action(c)], f.pkg).expect("move");
        let entry = ctx.finish().expect("finish");

        let input = slot(entry.ops(), c, SlotKind::Input).expect("input");
        assert!(created_groups(entry.ops()).contains(&(input, GroupKind::Merge)));
        // a's output, b's output and the loose source group.
        let members = entry
            .ops()
            .iter()
            .find_map(|op| match op {
                UndoOp::SetGroupMembers { group, new, .. } if *group == input => Some(new.len()),
                _ => None,
            })
            .expect("members");
        assert_eq!(members, 3);
    }

    #[test]
    fn out_of_range_paths_are_all_reported() {
        let mut f = fixture();
        let x = f.graph.add_file("/elsewhere/x").expect("file");
        let y = f.graph.add_file("/elsewhere/y").expect("file");

        let mut ctx = RefactorContext::new(&f.graph, "move");
        let err = move_to_package(&mut ctx, &[MemberRef::Path(x), MemberRef::Path(y)], f.pkg)
            .expect_err("out of range");
        match err {
            RefactorError::Rejected { cause, ids } => {
                assert_eq!(cause, Cause::PathOutOfRange);
                assert_eq!(ids, vec![x.0, y.0]);
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut f = fixture();
        let dir = f.graph.lookup_path("/pkg").expect("dir");
        let shared = f.graph.add_file("/pkg/shared").expect("file");
        let w1 = f
            .graph
            .add_action(ActionId::ROOT, "w1", PathId::ROOT)
            .expect("action");
        let w2 = f
            .graph
            .add_action(ActionId::ROOT, "w2", PathId::ROOT)
            .expect("action");
        f.graph.record_access(w1, shared, OperationType::Write).expect("link");
        f.graph.record_access(w2, shared, OperationType::Write).expect("link");
        let parent = f
            .graph
            .add_action(ActionId::ROOT, "make", PathId::ROOT)
            .expect("action");
        f.graph.add_action(parent, "cc", PathId::ROOT).expect("action");
        let no_root = f.graph.add_package("floating", None).expect("package");

        let cause = |members: &[MemberRef], pkg: PackageId| {
            let mut ctx = RefactorContext::new(&f.graph, "move");
            move_to_package(&mut ctx, members, pkg)
                .err()
                .and_then(|e| e.cause())
        };
        assert_eq!(
            cause(&[MemberRef::Path(shared)], no_root),
            Some(Cause::InvalidPackage)
        );
        assert_eq!(
            cause(&[MemberRef::Path(dir)], f.pkg),
            Some(Cause::InvalidMember)
        );
        assert_eq!(
            cause(&[MemberRef::Path(shared)], f.pkg),
            Some(Cause::FileIsModified)
        );
        assert_eq!(
            cause(&[MemberRef::Action(parent)], f.pkg),
            Some(Cause::ActionNotAtomic)
        );
        assert_eq!(
            cause(&[MemberRef::Group(FileGroupId(77))], f.pkg),
            Some(Cause::InvalidFileGroup)
        );
        assert_eq!(
            cause(&[MemberRef::Action(ActionId(999))], f.pkg),
            Some(Cause::InvalidAction)
        );
    }

    #[test]
    fn modified_member_file_is_rejected() {
        let mut f = fixture();
        let cfg = f.graph.add_file("/pkg/config.h").expect("file");
        let patch = f
            .graph
            .add_action(ActionId::ROOT, "patch config.h", PathId::ROOT)
            .expect("action");
        f.graph.record_access(patch, cfg, OperationType::Modify).expect("link");

        let mut ctx = RefactorContext::new(&f.graph, "move");
        let err = move_to_package(&mut ctx, &[MemberRef::Path(cfg)], f.pkg)
            .expect_err("modified");
        match err {
            RefactorError::Rejected { cause, ids } => {
                assert_eq!(cause, Cause::FileIsModified);
                assert_eq!(ids, vec![cfg.0]);
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn modified_or_shared_input_is_rejected() {
        let mut f = fixture();
        let gen_h = f.graph.add_file("/pkg/gen.h").expect("file");
        let out = f.graph.add_file("/pkg/out").expect("file");
        let writer = f
            .graph
            .add_action(ActionId::ROOT, "gen", PathId::ROOT)
            .expect("action");
        let other = f
            .graph
            .add_action(ActionId::ROOT, "gen again", PathId::ROOT)
            .expect("action");
        let cc = f
            .graph
            .add_action(ActionId::ROOT, "cc", PathId::ROOT)
            .expect("action");
        f.graph.record_access(writer, gen_h, OperationType::Write).expect("link");
        f.graph.record_access(cc, gen_h, OperationType::Read).expect("link");
        f.graph.record_access(cc, out, OperationType::Write).expect("link");

        for op in [OperationType::Modify, OperationType::Write] {
            let mut graph = f.graph.clone();
            graph.record_access(other, gen_h, op).expect("link");
            let mut ctx = RefactorContext::new(&graph, "move");
            let err = move_to_package(&mut ctx, &[MemberRef::Action(cc)], f.pkg)
                .expect_err("no sole producer");
            match err {
                RefactorError::Rejected { cause, ids } => {
                    assert_eq!(cause, Cause::FileIsModified);
                    assert_eq!(ids, vec![gen_h.0]);
                }
                other => unreachable!("unexpected {other:?}"),
            }
        }

        // With a single writer the move goes through.
        let mut ctx = RefactorContext::new(&f.graph, "move");
        move_to_package(&mut ctx, &[MemberRef::Action(cc)], f.pkg).expect("move");
    }

    #[test]
    fn glob_metacharacters_are_quoted() {
        assert_eq!(escape_glob("@p/a*b?.o"), "@p/a[*]b[?].o");
        assert_eq!(escape_glob("@p/plain.o"), "@p/plain.o");
        assert_eq!(escape_glob("@p/a\\b"), "@p/a\\\\b");
    }
}
