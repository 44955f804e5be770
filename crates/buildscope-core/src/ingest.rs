//! # Ingest Module
//!
//! Imports a captured build, described by a [`GraphManifest`], into a
//! `BuildGraph`.
//!
//! - Validate the whole manifest before the graph is touched
//! - Reject malformed input
//! - Number accesses in manifest order

use crate::constants::{IMPORT_PACKAGE_NAME, MAX_COMMAND_LENGTH, MAX_MANIFEST_ACTIONS};
use crate::graph::{BuildGraph, BuildStore};
use crate::{ActionId, GraphError, MemberRef, Membership, OperationType, PackageId, Scope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

// =============================================================================
// MANIFEST
// =============================================================================

/// A captured build: packages, directories and the action tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphManifest {
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    /// Directories to create even if no action touches them.
    #[serde(default)]
    pub directories: Vec<String>,
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// Absolute source root. Packages without one cannot receive members.
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Index of the parent in `actions`; must precede this action. `None`
    /// places the action under the root.
    #[serde(default)]
    pub parent: Option<usize>,
    pub command: String,
    #[serde(default = "root_directory")]
    pub directory: String,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub accesses: Vec<AccessSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSpec {
    pub path: String,
    /// `read`, `write`, `modify`, `delete` or `unspecified`.
    pub operation: String,
}

fn root_directory() -> String {
    "/".to_string()
}

/// Summary of an ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Created action ids, in manifest order.
    pub actions: Vec<ActionId>,
    pub accesses: usize,
}

// =============================================================================
// INGESTOR
// =============================================================================

/// Validates manifests and ingests them into a graph.
pub struct Ingestor;

impl Ingestor {
    /// Validate a manifest without touching any graph.
    pub fn validate(manifest: &GraphManifest, graph: &BuildGraph) -> Result<(), GraphError> {
        if manifest.actions.len() > MAX_MANIFEST_ACTIONS {
            return Err(invalid(format!(
                "{} actions exceeds the limit of {}",
                manifest.actions.len(),
                MAX_MANIFEST_ACTIONS
            )));
        }

        let mut known: Vec<&str> = vec![IMPORT_PACKAGE_NAME];
        for package in &manifest.packages {
            if package.name.is_empty() || known.contains(&package.name.as_str()) {
                return Err(invalid(format!(
                    "package name '{}' is empty or duplicated",
                    package.name
                )));
            }
            if graph.package_by_name(&package.name).is_some() {
                return Err(invalid(format!("package '{}' already exists", package.name)));
            }
            if let Some(root) = &package.root {
                require_absolute(root)?;
            }
            known.push(&package.name);
        }

        for dir in &manifest.directories {
            require_absolute(dir)?;
        }

        for (index, action) in manifest.actions.iter().enumerate() {
            if action.command.is_empty() || action.command.len() > MAX_COMMAND_LENGTH {
                return Err(invalid(format!(
                    "action {} has an empty or oversized command",
                    index
                )));
            }
            if action.parent.is_some_and(|p| p >= index) {
                return Err(invalid(format!(
                    "action {} refers to a parent that does not precede it",
                    index
                )));
            }
            require_absolute(&action.directory)?;
            if let Some(package) = &action.package {
                if !known.contains(&package.as_str()) {
                    return Err(invalid(format!(
                        "action {} names unknown package '{}'",
                        index, package
                    )));
                }
            }
            for access in &action.accesses {
                require_absolute(&access.path)?;
                if OperationType::parse(&access.operation).is_none() {
                    return Err(invalid(format!(
                        "action {} has unknown operation '{}'",
                        index, access.operation
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and ingest a manifest.
    pub fn ingest(
        graph: &mut BuildGraph,
        manifest: &GraphManifest,
    ) -> Result<IngestReport, GraphError> {
        Self::validate(manifest, graph)?;

        for dir in &manifest.directories {
            graph.add_directory(dir)?;
        }

        let mut packages: BTreeMap<&str, PackageId> = BTreeMap::new();
        packages.insert(IMPORT_PACKAGE_NAME, PackageId::IMPORT);
        for package in &manifest.packages {
            let root = match &package.root {
                Some(root) => Some(graph.add_directory(root)?),
                None => None,
            };
            packages.insert(&package.name, graph.add_package(&package.name, root)?);
        }

        let mut actions = Vec::with_capacity(manifest.actions.len());
        let mut accesses = 0usize;
        for entry in &manifest.actions {
            let parent = match entry.parent {
                Some(index) => actions
                    .get(index)
                    .copied()
                    .ok_or_else(|| invalid(format!("unknown parent index {}", index)))?,
                None => ActionId::ROOT,
            };
            let directory = graph.add_directory(&entry.directory)?;
            let action = graph.add_action(parent, &entry.command, directory)?;

            if let Some(package) = entry
                .package
                .as_deref()
                .and_then(|name| packages.get(name))
                .filter(|&&p| p != PackageId::IMPORT)
            {
                graph.set_member_package(
                    MemberRef::Action(action),
                    Membership::new(*package, Scope::Private),
                )?;
            }

            for access in &entry.accesses {
                let operation = OperationType::parse(&access.operation)
                    .ok_or_else(|| invalid(format!("unknown operation '{}'", access.operation)))?;
                let path = graph.add_file(&access.path)?;
                graph.record_access(action, path, operation)?;
                accesses = accesses.saturating_add(1);
            }
            actions.push(action);
        }

        debug!(actions = actions.len(), accesses, "manifest ingested");
        Ok(IngestReport { actions, accesses })
    }
}

fn invalid(message: String) -> GraphError {
    GraphError::InvalidManifest(message)
}

fn require_absolute(path: &str) -> Result<(), GraphError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(invalid(format!("path '{}' is not absolute", path)))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn action(command: &str, parent: Option<usize>, accesses: &[(&str, &str)]) -> ActionSpec {
        ActionSpec {
            parent,
            command: command.to_string(),
            directory: "/".to_string(),
            package: None,
            accesses: accesses
                .iter()
                .map(|(path, op)| AccessSpec {
                    path: (*path).to_string(),
                    operation: (*op).to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn ingest_builds_tree_and_links() {
        let manifest = GraphManifest {
            packages: vec![PackageSpec {
                name: "zlib".to_string(),
                root: Some("/src/zlib".to_string()),
            }],
            directories: vec!["/out".to_string()],
            actions: vec![
                action("make", None, &[]),
                action("cc -c a.c", Some(0), &[("/src/zlib/a.c", "read"), ("/out/a.o", "write")]),
            ],
        };
        let mut graph = BuildGraph::new();
        let report = Ingestor::ingest(&mut graph, &manifest).expect("ingest");

        assert_eq!(report.actions.len(), 2);
        assert_eq!(report.accesses, 2);
        assert_eq!(
            graph.action_children(report.actions[0]).expect("children"),
            vec![report.actions[1]]
        );
        let obj = graph.lookup_path("/out/a.o").expect("path");
        assert_eq!(
            graph
                .actions_accessing(obj, &[OperationType::Write])
                .expect("writers"),
            vec![report.actions[1]]
        );
        assert!(graph.package_by_name("zlib").is_some());
    }

    #[test]
    fn rejects_forward_parent() {
        let manifest = GraphManifest {
            actions: vec![action("a", Some(0), &[])],
            ..GraphManifest::default()
        };
        let mut graph = BuildGraph::new();
        assert!(matches!(
            Ingestor::ingest(&mut graph, &manifest),
            Err(GraphError::InvalidManifest(_))
        ));
    }

    #[test]
    fn rejects_bad_operation_without_mutating() {
        let manifest = GraphManifest {
            actions: vec![
                action("ok", None, &[("/a", "write")]),
                action("bad", None, &[("/b", "execute")]),
            ],
            ..GraphManifest::default()
        };
        let mut graph = BuildGraph::new();
        assert!(Ingestor::ingest(&mut graph, &manifest).is_err());
        assert_eq!(graph.live_action_count(), 1);
        assert!(graph.lookup_path("/a").is_none());
    }

    #[test]
    fn rejects_relative_paths_and_unknown_packages() {
        let graph = BuildGraph::new();
        let relative = GraphManifest {
            actions: vec![action("cc", None, &[("a.c", "read")])],
            ..GraphManifest::default()
        };
        assert!(Ingestor::validate(&relative, &graph).is_err());

        let mut unknown = action("cc", None, &[]);
        unknown.package = Some("nope".to_string());
        let manifest = GraphManifest {
            actions: vec![unknown],
            ..GraphManifest::default()
        };
        assert!(Ingestor::validate(&manifest, &graph).is_err());
    }

    #[test]
    fn empty_command_rejected() {
        let graph = BuildGraph::new();
        let manifest = GraphManifest {
            actions: vec![action("", None, &[])],
            ..GraphManifest::default()
        };
        assert!(Ingestor::validate(&manifest, &graph).is_err());
    }
}
