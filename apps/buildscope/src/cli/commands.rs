//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::CliError;
use buildscope_core::{
    ActionId, BuildGraph, FileGroupId, GraphError, GraphManifest, GraphSnapshot, Ingestor,
    MemberRef, PathId, RefactorError, RefactorSession, session_from_bytes, session_to_bytes,
};
use std::path::{Path, PathBuf};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum manifest size for ingestion (100 MB).
///
/// This prevents memory exhaustion from malicious or accidental large files.
const MAX_INGEST_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), CliError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| GraphError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(GraphError::IoError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        ))
        .into());
    }
    Ok(())
}

/// Resolve an input path to a regular file.
///
/// Canonicalizing resolves ".." and symlinks and fails if the file does
/// not exist.
fn validate_file_path(path: &Path) -> Result<PathBuf, CliError> {
    let canonical = path.canonicalize().map_err(|e| {
        GraphError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(GraphError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        ))
        .into());
    }

    Ok(canonical)
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Initialize a new workspace.
pub fn cmd_init(db_path: &Path, force: bool) -> Result<(), CliError> {
    if db_path.exists() && !force {
        return Err(CliError::Usage(
            "Workspace already exists. Use --force to overwrite.".to_string(),
        ));
    }

    let session = RefactorSession::new(BuildGraph::new());
    save_session(&session, db_path)?;
    println!("Initialized new workspace at {:?}", db_path);
    Ok(())
}

// =============================================================================
// INGEST COMMAND
// =============================================================================

/// Ingest a build manifest.
///
/// Ingesting adds objects outside the undo log, so the history is cleared.
pub fn cmd_ingest(db_path: &Path, json_mode: bool, file: &Path) -> Result<(), CliError> {
    tracing::info!("Ingesting manifest from {:?}", file);

    let validated_path = validate_file_path(file)?;
    validate_file_size(&validated_path, MAX_INGEST_FILE_SIZE)?;

    let contents = std::fs::read(&validated_path)
        .map_err(|e| GraphError::IoError(format!("Read file: {}", e)))?;
    let manifest: GraphManifest = serde_json::from_slice(&contents)
        .map_err(|e| GraphError::InvalidManifest(e.to_string()))?;

    let (mut graph, _, _) = load_or_create_session(db_path)?.into_parts();
    let report = Ingestor::ingest(&mut graph, &manifest)?;
    let session = RefactorSession::new(graph);
    save_session(&session, db_path)?;

    if json_mode {
        let output = serde_json::json!({
            "actions": report.actions.len(),
            "accesses": report.accesses,
            "live_actions": session.store().live_action_count(),
            "live_paths": session.store().live_path_count(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!(
        "Ingested {} actions, {} accesses",
        report.actions.len(),
        report.accesses
    );
    println!(
        "Graph now has {} actions, {} paths",
        session.store().live_action_count(),
        session.store().live_path_count()
    );
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show graph status.
pub fn cmd_status(db_path: &Path, json_mode: bool, checksum: bool) -> Result<(), CliError> {
    let session = load_or_create_session(db_path)?;
    let graph = session.store();
    let live_groups = graph.groups().filter(|g| !g.trashed).count();
    let snapshot = if checksum {
        Some(GraphSnapshot::capture(graph)?)
    } else {
        None
    };
    let hash = match &snapshot {
        Some(s) => Some(s.crypto_hash()?),
        None => None,
    };

    if json_mode {
        let output = serde_json::json!({
            "database": db_path.to_string_lossy(),
            "actions": graph.live_action_count(),
            "paths": graph.live_path_count(),
            "accesses": graph.accesses().count(),
            "packages": graph.packages().count(),
            "groups": live_groups,
            "undo_depth": session.applied().len(),
            "redo_depth": session.undone().len(),
            "checksum": snapshot.as_ref().map(GraphSnapshot::checksum),
            "blake3": hash,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("buildscope Workspace Status");
    println!("===========================");
    println!("Database: {:?}", db_path);
    println!();
    println!("Actions:    {}", graph.live_action_count());
    println!("Paths:      {}", graph.live_path_count());
    println!("Accesses:   {}", graph.accesses().count());
    println!("Packages:   {}", graph.packages().count());
    println!("Groups:     {}", live_groups);
    println!();
    println!("Undo depth: {}", session.applied().len());
    println!("Redo depth: {}", session.undone().len());
    if let Some(s) = &snapshot {
        println!();
        println!("Checksum:   {}", s.checksum());
    }
    if let Some(h) = hash {
        println!("BLAKE3:     {}", h);
    }
    Ok(())
}

// =============================================================================
// REFACTORING COMMANDS
// =============================================================================

/// Delete a path, or a path subtree.
pub fn cmd_rm_path(
    db_path: &Path,
    json_mode: bool,
    path: &str,
    cascade: bool,
    tree: bool,
) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let path = resolve_path(session.store(), path)?;
    let applied = if tree {
        session.delete_path_tree(path, cascade)?
    } else {
        session.delete_path(path, cascade)?
    };
    finish(&session, db_path, json_mode, applied)
}

/// Delete an action, or an action subtree.
pub fn cmd_rm_action(
    db_path: &Path,
    json_mode: bool,
    action: u64,
    tree: bool,
) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let applied = if tree {
        session.delete_action_tree(ActionId(action))?
    } else {
        session.delete_action(ActionId(action))?
    };
    finish(&session, db_path, json_mode, applied)
}

/// Merge sibling actions.
pub fn cmd_merge(db_path: &Path, json_mode: bool, actions: &[u64]) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let actions: Vec<ActionId> = actions.iter().map(|&a| ActionId(a)).collect();
    let applied = session.merge_actions(&actions)?;
    finish(&session, db_path, json_mode, applied)
}

/// Flatten a composite action.
pub fn cmd_make_atomic(db_path: &Path, json_mode: bool, action: u64) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let applied = session.make_action_atomic(ActionId(action))?;
    finish(&session, db_path, json_mode, applied)
}

/// Move members into a package.
pub fn cmd_move(
    db_path: &Path,
    json_mode: bool,
    package: &str,
    members: &[String],
) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let package_id = session
        .store()
        .package_by_name(package)
        .ok_or_else(|| CliError::Usage(format!("Unknown package '{}'", package)))?;
    let members = members
        .iter()
        .map(|m| parse_member(session.store(), m))
        .collect::<Result<Vec<_>, _>>()?;
    let applied = session.move_to_package(&members, package_id)?;
    finish(&session, db_path, json_mode, applied)
}

// =============================================================================
// HISTORY COMMANDS
// =============================================================================

pub fn cmd_undo(db_path: &Path, json_mode: bool) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let applied = session.undo()?;
    finish(&session, db_path, json_mode, applied)
}

pub fn cmd_redo(db_path: &Path, json_mode: bool) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let applied = session.redo()?;
    finish(&session, db_path, json_mode, applied)
}

/// Physically drop trashed objects.
pub fn cmd_reap(db_path: &Path, json_mode: bool) -> Result<(), CliError> {
    let mut session = load_or_create_session(db_path)?;
    let reaped = session.reap_trash()?;
    save_session(&session, db_path)?;

    if json_mode {
        println!("{}", serde_json::json!({ "reaped": reaped }));
    } else {
        println!("Reaped {} trashed objects; history cleared", reaped);
    }
    Ok(())
}

// =============================================================================
// ERROR REPORTING
// =============================================================================

/// Print a failure for the user: cause and every offending id for
/// rejections, a distinct internal-error line for fatal failures.
pub fn report_error(err: &CliError, json_mode: bool) {
    if json_mode {
        let output = match err {
            CliError::Refactor(RefactorError::Rejected { cause, ids }) => serde_json::json!({
                "error": "rejected",
                "cause": cause.describe(),
                "ids": ids,
            }),
            CliError::Refactor(RefactorError::Fatal(message)) => serde_json::json!({
                "error": "fatal",
                "message": message,
            }),
            other => serde_json::json!({
                "error": "failed",
                "message": other.to_string(),
            }),
        };
        eprintln!("{}", output);
        return;
    }

    match err {
        CliError::Refactor(RefactorError::Rejected { cause, ids }) => {
            let ids: Vec<String> = ids.iter().map(u64::to_string).collect();
            eprintln!("Rejected: {} (ids: {})", cause, ids.join(", "));
        }
        CliError::Refactor(RefactorError::Fatal(message)) => {
            eprintln!("Internal error, workspace left unchanged: {}", message);
        }
        other => eprintln!("Error: {}", other),
    }
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Resolve `text` as an absolute path or a numeric path id.
fn resolve_path(graph: &BuildGraph, text: &str) -> Result<PathId, CliError> {
    if text.starts_with('/') {
        return graph
            .lookup_path(text)
            .ok_or_else(|| CliError::Usage(format!("Unknown path '{}'", text)));
    }
    text.parse::<u64>()
        .map(PathId)
        .map_err(|_| CliError::Usage(format!("Expected a path or path id, got '{}'", text)))
}

/// Parse `path:<id|/abs>`, `action:<id>` or `group:<id>`.
fn parse_member(graph: &BuildGraph, text: &str) -> Result<MemberRef, CliError> {
    let (kind, value) = text
        .split_once(':')
        .ok_or_else(|| CliError::Usage(format!("Member '{}' has no kind prefix", text)))?;
    let number = || {
        value
            .parse::<u64>()
            .map_err(|_| CliError::Usage(format!("Member '{}' has no numeric id", text)))
    };
    match kind {
        "path" => Ok(MemberRef::Path(resolve_path(graph, value)?)),
        "action" => Ok(MemberRef::Action(ActionId(number()?))),
        "group" => Ok(MemberRef::Group(FileGroupId(number()?))),
        _ => Err(CliError::Usage(format!(
            "Unknown member kind '{}'. Use: path, action, group",
            kind
        ))),
    }
}

/// Save and print the outcome of one history-changing command.
fn finish(
    session: &RefactorSession<BuildGraph>,
    db_path: &Path,
    json_mode: bool,
    applied: bool,
) -> Result<(), CliError> {
    if applied {
        save_session(session, db_path)?;
    }

    if json_mode {
        let output = serde_json::json!({
            "applied": applied,
            "undo_depth": session.applied().len(),
            "redo_depth": session.undone().len(),
        });
        println!("{}", output);
    } else if applied {
        println!(
            "Done (undo depth {}, redo depth {})",
            session.applied().len(),
            session.undone().len()
        );
    } else {
        println!("Nothing to do");
    }
    Ok(())
}

/// Load a workspace, or start an empty one if the file does not exist.
pub fn load_or_create_session(db_path: &Path) -> Result<RefactorSession<BuildGraph>, CliError> {
    if !db_path.exists() {
        return Ok(RefactorSession::new(BuildGraph::new()));
    }
    let data =
        std::fs::read(db_path).map_err(|e| GraphError::IoError(format!("Read db: {}", e)))?;
    Ok(session_from_bytes(&data)?)
}

/// Save a workspace.
pub fn save_session(session: &RefactorSession<BuildGraph>, db_path: &Path) -> Result<(), CliError> {
    let data = session_to_bytes(session)?;
    std::fs::write(db_path, &data).map_err(|e| GraphError::IoError(format!("Write db: {}", e)))?;
    Ok(())
}
