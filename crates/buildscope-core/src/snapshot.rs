//! # Graph Snapshots
//!
//! A [`GraphSnapshot`] is the observable, live state of a build graph in a
//! sorted canonical form. Two graphs are observationally equal exactly when
//! their snapshots are equal; this is how undo and redo are verified.
//!
//! Trashed objects are not part of the snapshot. Neither are allocation
//! counters, since ids reserved by a refactoring stay reserved after undo.

use crate::graph::BuildGraph;
use crate::{
    ActionId, FileAccess, FileGroupId, GraphError, GroupKind, GroupMember, MemberRef, Membership,
    OperationType, PathId, PathType, SlotKind,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// SNAPSHOT RECORDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotPath {
    pub id: PathId,
    pub parent: PathId,
    pub name: String,
    pub kind: PathType,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotAction {
    pub id: ActionId,
    pub parent: ActionId,
    pub command: String,
    pub directory: PathId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotGroup {
    pub id: FileGroupId,
    pub kind: GroupKind,
    pub members: Vec<GroupMember>,
}

// =============================================================================
// GRAPH SNAPSHOT
// =============================================================================

/// Sorted, canonical view of everything live in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub paths: Vec<SnapshotPath>,
    pub actions: Vec<SnapshotAction>,
    pub accesses: Vec<FileAccess>,
    pub memberships: Vec<(MemberRef, Membership)>,
    pub groups: Vec<SnapshotGroup>,
    pub slots: Vec<(ActionId, SlotKind, FileGroupId)>,
}

impl GraphSnapshot {
    /// Capture the live state of `graph`.
    pub fn capture(graph: &BuildGraph) -> Result<Self, GraphError> {
        let paths: Vec<SnapshotPath> = graph
            .paths()
            .filter(|p| !p.trashed)
            .map(|p| SnapshotPath {
                id: p.id,
                parent: p.parent,
                name: p.name.clone(),
                kind: p.kind,
            })
            .collect();
        let actions: Vec<SnapshotAction> = graph
            .actions()
            .filter(|a| !a.trashed)
            .map(|a| SnapshotAction {
                id: a.id,
                parent: a.parent,
                command: a.command.clone(),
                directory: a.directory,
            })
            .collect();
        let groups: Vec<SnapshotGroup> = graph
            .groups()
            .filter(|g| !g.trashed)
            .map(|g| SnapshotGroup {
                id: g.id,
                kind: g.kind,
                members: g.members.clone(),
            })
            .collect();

        let live_member = |member: &MemberRef| match member {
            MemberRef::Path(id) => paths.binary_search_by_key(id, |p| p.id).is_ok(),
            MemberRef::Action(id) => actions.binary_search_by_key(id, |a| a.id).is_ok(),
            MemberRef::Group(id) => groups.binary_search_by_key(id, |g| g.id).is_ok(),
        };
        let memberships: Vec<(MemberRef, Membership)> = graph
            .memberships()
            .filter(|(member, _)| live_member(member))
            .collect();
        let slots: Vec<(ActionId, SlotKind, FileGroupId)> = graph
            .slots()
            .filter(|(action, _, _)| live_member(&MemberRef::Action(*action)))
            .collect();

        Ok(Self {
            accesses: graph.accesses().copied().collect(),
            paths,
            actions,
            memberships,
            groups,
            slots,
        })
    }

    /// Canonical, bit-exact postcard encoding of the snapshot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GraphError> {
        postcard::to_stdvec(self).map_err(|e| GraphError::SerializationError(e.to_string()))
    }

    /// Compute a deterministic checksum of the snapshot.
    ///
    /// Uses rotations and XOR for simplicity and determinism. This is not a
    /// cryptographic hash; enable the `crypto-hash` feature for BLAKE3.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        let mut hash: u64 = 0;

        for path in &self.paths {
            hash ^= path.id.0.rotate_left(13);
            hash ^= path.parent.0.rotate_left(7);
            hash = fold_bytes(hash, path.name.as_bytes(), 23);
        }

        for action in &self.actions {
            hash ^= action.id.0.rotate_left(17);
            hash ^= action.parent.0.rotate_left(11);
            hash ^= action.directory.0.rotate_left(31);
            hash = fold_bytes(hash, action.command.as_bytes(), 29);
        }

        for access in &self.accesses {
            hash ^= access.seq.rotate_left(5);
            hash ^= access.action.0.rotate_left(19);
            hash ^= access.path.0.rotate_left(37);
            hash ^= operation_code(access.operation).rotate_left(41);
        }

        for (member, membership) in &self.memberships {
            hash ^= member.raw().rotate_left(43);
            hash ^= membership.package.0.rotate_left(47);
        }

        for group in &self.groups {
            hash ^= group.id.0.rotate_left(53);
            hash ^= (group.members.len() as u64).rotate_left(59);
        }

        for (action, _, group) in &self.slots {
            hash ^= action.0.rotate_left(3);
            hash ^= group.0.rotate_left(61);
        }

        hash
    }

    /// BLAKE3 digest of the canonical encoding, as a hex string.
    #[cfg(feature = "crypto-hash")]
    pub fn crypto_hash(&self) -> Result<String, GraphError> {
        let bytes = self.to_bytes()?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

/// Mix bytes into `hash` position-dependently.
fn fold_bytes(mut hash: u64, bytes: &[u8], rotation: u32) -> u64 {
    for (i, byte) in bytes.iter().enumerate() {
        hash ^= (*byte as u64).rotate_left(rotation.wrapping_add(i as u32) % 64);
    }
    hash
}

const fn operation_code(op: OperationType) -> u64 {
    match op {
        OperationType::Read => 1,
        OperationType::Write => 2,
        OperationType::Modify => 3,
        OperationType::Delete => 4,
        OperationType::Unspecified => 5,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BuildStore;

    fn sample() -> BuildGraph {
        let mut graph = BuildGraph::new();
        let src = graph.add_file("/src/a.c").expect("file");
        let obj = graph.add_file("/out/a.o").expect("file");
        let cc = graph
            .add_action(ActionId::ROOT, "cc -c a.c", PathId::ROOT)
            .expect("action");
        graph
            .record_access(cc, src, OperationType::Read)
            .expect("access");
        graph
            .record_access(cc, obj, OperationType::Write)
            .expect("access");
        graph
    }

    #[test]
    fn identical_graphs_have_identical_snapshots() {
        let a = GraphSnapshot::capture(&sample()).expect("snapshot");
        let b = GraphSnapshot::capture(&sample()).expect("snapshot");
        assert_eq!(a, b);
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.to_bytes().expect("bytes"), b.to_bytes().expect("bytes"));
    }

    #[test]
    fn trashed_objects_are_invisible() {
        let mut graph = sample();
        let before = GraphSnapshot::capture(&graph).expect("snapshot");

        let extra = graph
            .add_action(ActionId::ROOT, "true", PathId::ROOT)
            .expect("action");
        assert_ne!(GraphSnapshot::capture(&graph).expect("snapshot"), before);

        graph.trash_action(extra).expect("trash");
        assert_eq!(GraphSnapshot::capture(&graph).expect("snapshot"), before);
    }

    #[test]
    fn checksum_sensitive_to_commands() {
        let mut graph = sample();
        let before = GraphSnapshot::capture(&graph).expect("snapshot").checksum();
        graph
            .add_action(ActionId::ROOT, "ld a.o", PathId::ROOT)
            .expect("action");
        let after = GraphSnapshot::capture(&graph).expect("snapshot").checksum();
        assert_ne!(before, after);
    }

    #[cfg(feature = "crypto-hash")]
    #[test]
    fn crypto_hash_is_stable() {
        let a = GraphSnapshot::capture(&sample()).expect("snapshot");
        let h1 = a.crypto_hash().expect("hash");
        let h2 = a.crypto_hash().expect("hash");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
