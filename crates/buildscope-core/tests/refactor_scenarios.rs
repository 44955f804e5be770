//! # Refactoring Scenario Tests
//!
//! End-to-end behavior of the refactorings through a `RefactorSession`.
//!
//! ## Groups
//! - Deletion: cascading rules and consumer protection
//! - Flatten and merge: link order and identity
//! - Package move: producer chains, filters and merges
//! - History: undo/redo restores exact state

use buildscope_core::{
    ActionId, BuildGraph, BuildStore, Cause, GraphSnapshot, GroupKind, MemberRef, OperationType,
    PackageId, PathId, RefactorSession, Scope, SlotKind,
};

fn snapshot(session: &RefactorSession<BuildGraph>) -> GraphSnapshot {
    GraphSnapshot::capture(session.store()).expect("snapshot")
}

/// `make` runs A (`/src/x.c` -> `/out/x.o`) and B (`/out/x.o` -> `/out/prog`).
struct Chain {
    session: RefactorSession<BuildGraph>,
    make: ActionId,
    a: ActionId,
    b: ActionId,
    obj: PathId,
    prog: PathId,
}

fn chain() -> Chain {
    let mut graph = BuildGraph::new();
    let src = graph.add_file("/src/x.c").expect("file");
    let obj = graph.add_file("/out/x.o").expect("file");
    let prog = graph.add_file("/out/prog").expect("file");
    let make = graph
        .add_action(ActionId::ROOT, "make", PathId::ROOT)
        .expect("action");
    let a = graph.add_action(make, "cc -c x.c", PathId::ROOT).expect("action");
    let b = graph.add_action(make, "ld -o prog x.o", PathId::ROOT).expect("action");
    graph.record_access(a, src, OperationType::Read).expect("link");
    graph.record_access(a, obj, OperationType::Write).expect("link");
    graph.record_access(b, obj, OperationType::Read).expect("link");
    graph.record_access(b, prog, OperationType::Write).expect("link");
    Chain {
        session: RefactorSession::new(graph),
        make,
        a,
        b,
        obj,
        prog,
    }
}

// =============================================================================
// DELETION
// =============================================================================

mod deletion {
    use super::*;

    #[test]
    fn generated_path_needs_cascade() {
        let mut c = chain();
        let err = c.session.delete_path(c.obj, false).expect_err("generated");
        assert_eq!(err.cause(), Some(Cause::PathIsGenerated));
    }

    #[test]
    fn cascade_refuses_consumed_output() {
        let mut c = chain();
        let before = snapshot(&c.session);
        let err = c.session.delete_path(c.obj, true).expect_err("in use");
        assert_eq!(err.cause(), Some(Cause::ActionInUse));
        assert!(matches!(
            err,
            buildscope_core::RefactorError::Rejected { ref ids, .. } if ids == &vec![c.b.0]
        ));
        assert_eq!(snapshot(&c.session), before);
    }

    #[test]
    fn cascade_removes_final_output_and_generator() {
        let mut c = chain();
        assert!(c.session.delete_path(c.prog, true).expect("delete"));
        let store = c.session.store();
        assert!(!store.is_live_action(c.b).expect("live"));
        assert!(!store.is_live_path(c.prog).expect("live"));
        // x.o is still written by A
        assert!(store.is_live_path(c.obj).expect("live"));
        assert!(store.accesses_of_path(c.obj).expect("links").len() == 1);
    }

    #[test]
    fn tree_delete_then_undo_restores_all_links() {
        let mut c = chain();
        let before = snapshot(&c.session);
        assert_eq!(before.accesses.len(), 4);

        assert!(c.session.delete_action_tree(c.make).expect("delete tree"));
        let store = c.session.store();
        for action in [c.make, c.a, c.b] {
            assert!(!store.is_live_action(action).expect("live"));
        }
        assert!(!store.is_live_path(c.obj).expect("live"));
        assert!(!store.is_live_path(c.prog).expect("live"));

        assert!(c.session.undo().expect("undo"));
        assert_eq!(snapshot(&c.session), before);
    }

    #[test]
    fn delete_action_reparents_children() {
        let mut c = chain();
        assert!(c.session.delete_action(c.make).expect("delete"));
        let store = c.session.store();
        assert_eq!(
            store.action_children(ActionId::ROOT).expect("children"),
            vec![c.a, c.b]
        );
    }

    #[test]
    fn delete_action_refuses_consumed_output() {
        let mut c = chain();
        let err = c.session.delete_action(c.a).expect_err("in use");
        assert_eq!(err.cause(), Some(Cause::ActionInUse));
    }

    #[test]
    fn non_atomic_generator_rejected() {
        let mut graph = BuildGraph::new();
        let out = graph.add_file("/out/lib.a").expect("file");
        let outer = graph
            .add_action(ActionId::ROOT, "make lib", PathId::ROOT)
            .expect("action");
        graph.add_action(outer, "ar", PathId::ROOT).expect("action");
        graph
            .record_access(outer, out, OperationType::Write)
            .expect("link");
        let mut session = RefactorSession::new(graph);

        let err = session.delete_path(out, true).expect_err("composite");
        assert_eq!(err.cause(), Some(Cause::ActionNotAtomic));
    }

    #[test]
    fn cascading_path_tree_removes_whole_chain() {
        let mut c = chain();
        let before = snapshot(&c.session);
        let out = c.session.store().lookup_path("/out").expect("dir");

        assert!(c.session.delete_path_tree(out, true).expect("delete tree"));
        let store = c.session.store();
        for action in [c.a, c.b] {
            assert!(!store.is_live_action(action).expect("live"));
        }
        for path in [c.obj, c.prog, out] {
            assert!(!store.is_live_path(path).expect("live"));
        }
        assert!(store.is_live_action(c.make).expect("live"));
        assert!(store.lookup_path("/src/x.c").is_some());

        assert!(c.session.undo().expect("undo"));
        assert_eq!(snapshot(&c.session), before);
    }

    #[test]
    fn path_tree_failure_applies_nothing() {
        let mut graph = BuildGraph::new();
        graph.add_file("/tmp/a").expect("file");
        let b = graph.add_file("/tmp/b").expect("file");
        let tmp = graph.lookup_path("/tmp").expect("dir");
        let reader = graph
            .add_action(ActionId::ROOT, "cat b", PathId::ROOT)
            .expect("action");
        graph.record_access(reader, b, OperationType::Read).expect("link");
        let mut session = RefactorSession::new(graph);
        let before = snapshot(&session);

        let err = session.delete_path_tree(tmp, false).expect_err("in use");
        assert_eq!(err.cause(), Some(Cause::PathInUse));
        assert_eq!(snapshot(&session), before);
        assert!(!session.can_undo());
    }
}

// =============================================================================
// FLATTEN AND MERGE
// =============================================================================

mod flatten_and_merge {
    use super::*;

    #[test]
    fn flatten_then_undo() {
        let mut c = chain();
        let before = snapshot(&c.session);
        assert!(c.session.make_action_atomic(c.make).expect("flatten"));

        let store = c.session.store();
        let roots = store.action_children(ActionId::ROOT).expect("children");
        assert_eq!(roots.len(), 1);
        let flat = roots[0];
        assert!(store.is_atomic(flat).expect("atomic"));
        assert_eq!(store.accesses_of_action(flat).expect("links").len(), 4);

        c.session.undo().expect("undo");
        assert_eq!(snapshot(&c.session), before);
    }

    #[test]
    fn merge_siblings_then_redo() {
        let mut c = chain();
        assert!(c.session.merge_actions(&[c.a, c.b]).expect("merge"));
        let after = snapshot(&c.session);

        let merged = c.session.store().action_children(c.make).expect("children");
        assert_eq!(merged.len(), 1);
        let node = c
            .session
            .store()
            .action(merged[0])
            .expect("action")
            .expect("exists");
        assert_eq!(node.command, "cc -c x.c\nld -o prog x.o");

        c.session.undo().expect("undo");
        c.session.redo().expect("redo");
        assert_eq!(snapshot(&c.session), after);
    }
}

// =============================================================================
// PACKAGE MOVE
// =============================================================================

mod package_move {
    use super::*;

    struct Producers {
        session: RefactorSession<BuildGraph>,
        package: PackageId,
        a: ActionId,
        b: ActionId,
        f1: PathId,
        f2: PathId,
    }

    /// A writes `f1` (and `extra` when asked); B reads `f1` and writes `f2`.
    fn producers(with_extra: bool) -> Producers {
        let mut graph = BuildGraph::new();
        let root = graph.add_directory("/pkg").expect("dir");
        let package = graph.add_package("p", Some(root)).expect("package");
        let f1 = graph.add_file("/pkg/f1").expect("file");
        let f2 = graph.add_file("/pkg/f2").expect("file");
        let a = graph
            .add_action(ActionId::ROOT, "gen f1", PathId::ROOT)
            .expect("action");
        let b = graph
            .add_action(ActionId::ROOT, "gen f2", PathId::ROOT)
            .expect("action");
        graph.record_access(a, f1, OperationType::Write).expect("link");
        if with_extra {
            let extra = graph.add_file("/pkg/extra").expect("file");
            graph
                .record_access(a, extra, OperationType::Write)
                .expect("link");
        }
        graph.record_access(b, f1, OperationType::Read).expect("link");
        graph.record_access(b, f2, OperationType::Write).expect("link");
        Producers {
            session: RefactorSession::new(graph),
            package,
            a,
            b,
            f1,
            f2,
        }
    }

    #[test]
    fn moving_consumer_drags_producer() {
        let mut p = producers(false);
        assert!(
            p.session
                .move_to_package(&[MemberRef::Action(p.b)], p.package)
                .expect("move")
        );
        let store = p.session.store();
        for action in [p.a, p.b] {
            assert_eq!(
                store
                    .member_package(MemberRef::Action(action))
                    .expect("member")
                    .package,
                p.package
            );
        }

        let a_out = store
            .action_slot(p.a, SlotKind::Output)
            .expect("slot")
            .expect("output group");
        let b_in = store
            .action_slot(p.b, SlotKind::Input)
            .expect("slot")
            .expect("input group");
        assert_eq!(a_out, b_in, "full output needs no filter");
        assert_eq!(store.group_paths(b_in).expect("paths"), vec![p.f1]);

        let b_out = store
            .action_slot(p.b, SlotKind::Output)
            .expect("slot")
            .expect("output group");
        assert_eq!(store.group_paths(b_out).expect("paths"), vec![p.f2]);
        assert_eq!(
            store.member_package(MemberRef::Path(p.f1)).expect("member"),
            buildscope_core::Membership::new(p.package, Scope::Private)
        );
    }

    #[test]
    fn partial_need_synthesizes_filter() {
        let mut p = producers(true);
        p.session
            .move_to_package(&[MemberRef::Action(p.b)], p.package)
            .expect("move");
        let store = p.session.store();

        let a_out = store
            .action_slot(p.a, SlotKind::Output)
            .expect("slot")
            .expect("output group");
        let b_in = store
            .action_slot(p.b, SlotKind::Input)
            .expect("slot")
            .expect("input group");
        let filter = store.group(b_in).expect("group").expect("exists");
        assert_eq!(filter.kind, GroupKind::Filter { source: a_out });
        assert_eq!(store.group_paths(b_in).expect("paths"), vec![p.f1]);
        assert_eq!(store.group_paths(a_out).expect("paths").len(), 2);
    }

    #[test]
    fn filter_keeps_names_with_backslashes() {
        let mut graph = BuildGraph::new();
        let root = graph.add_directory("/pkg").expect("dir");
        let package = graph.add_package("p", Some(root)).expect("package");
        let needed = graph.add_file("/pkg/a\\b").expect("file");
        let lookalike = graph.add_file("/pkg/ab").expect("file");
        let out = graph.add_file("/pkg/out").expect("file");
        let a = graph
            .add_action(ActionId::ROOT, "gen", PathId::ROOT)
            .expect("action");
        let b = graph
            .add_action(ActionId::ROOT, "use", PathId::ROOT)
            .expect("action");
        graph.record_access(a, needed, OperationType::Write).expect("link");
        graph
            .record_access(a, lookalike, OperationType::Write)
            .expect("link");
        graph.record_access(b, needed, OperationType::Read).expect("link");
        graph.record_access(b, out, OperationType::Write).expect("link");
        let mut session = RefactorSession::new(graph);

        session
            .move_to_package(&[MemberRef::Action(b)], package)
            .expect("move");
        let store = session.store();
        let b_in = store
            .action_slot(b, SlotKind::Input)
            .expect("slot")
            .expect("input group");
        assert!(matches!(
            store.group(b_in).expect("group").expect("exists").kind,
            GroupKind::Filter { .. }
        ));
        assert_eq!(store.group_paths(b_in).expect("paths"), vec![needed]);
    }

    #[test]
    fn loose_file_becomes_source_group() {
        let mut graph = BuildGraph::new();
        let root = graph.add_directory("/pkg").expect("dir");
        let package = graph.add_package("p", Some(root)).expect("package");
        let loose = graph.add_file("/pkg/readme").expect("file");
        let mut session = RefactorSession::new(graph);
        let groups_before = session.store().groups().count();

        session
            .move_to_package(&[MemberRef::Path(loose)], package)
            .expect("move");
        let store = session.store();
        let created: Vec<_> = store.groups().skip(groups_before).collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, GroupKind::Source);
        assert_eq!(store.group_paths(created[0].id).expect("paths"), vec![loose]);
    }

    #[test]
    fn out_of_range_paths_reported_together() {
        let mut graph = BuildGraph::new();
        let root = graph.add_directory("/pkg").expect("dir");
        let package = graph.add_package("p", Some(root)).expect("package");
        let x = graph.add_file("/elsewhere/x").expect("file");
        let y = graph.add_file("/elsewhere/y").expect("file");
        let mut session = RefactorSession::new(graph);
        let before = snapshot(&session);

        let err = session
            .move_to_package(&[MemberRef::Path(x), MemberRef::Path(y)], package)
            .expect_err("out of range");
        assert_eq!(err.cause(), Some(Cause::PathOutOfRange));
        assert!(matches!(
            err,
            buildscope_core::RefactorError::Rejected { ref ids, .. } if ids == &vec![x.0, y.0]
        ));
        assert_eq!(snapshot(&session), before);
    }

    #[test]
    fn move_undo_restores_state() {
        let mut p = producers(true);
        let before = snapshot(&p.session);
        p.session
            .move_to_package(&[MemberRef::Path(p.f2)], p.package)
            .expect("move");
        p.session.undo().expect("undo");
        assert_eq!(snapshot(&p.session), before);
    }
}
