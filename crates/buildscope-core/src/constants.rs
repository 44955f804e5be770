//! # Engine Constants
//!
//! Fixed names, format markers and limits compiled into the engine.

/// Name of the package every imported object starts in.
pub const IMPORT_PACKAGE_NAME: &str = "<import>";

/// Separator placed between commands when actions are merged.
pub const COMMAND_SEPARATOR: &str = "\n";

/// Prefix of a filter pattern that keeps matching paths.
pub const INCLUDE_PREFIX: &str = "include:";

/// Prefix of a filter pattern that drops matching paths.
pub const EXCLUDE_PREFIX: &str = "exclude:";

/// Magic bytes for the workspace file header.
///
/// - File Header = Magic Bytes ("BSCP") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"BSCP";

/// Current serialization format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Maximum depth of nested groups expanded by `group_paths`.
///
/// Merge and filter groups may reference each other; a malformed store with
/// a reference cycle must not recurse forever.
pub const MAX_GROUP_DEPTH: usize = 64;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length of a command string accepted by the ingestor (1 MB).
pub const MAX_COMMAND_LENGTH: usize = 1024 * 1024;

/// Maximum number of actions in a single manifest.
pub const MAX_MANIFEST_ACTIONS: usize = 1_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"BSCP");
    }

    #[test]
    fn pattern_prefixes_are_distinct() {
        assert_ne!(INCLUDE_PREFIX, EXCLUDE_PREFIX);
        assert!(INCLUDE_PREFIX.ends_with(':'));
    }
}
