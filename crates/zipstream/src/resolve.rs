//! Identifier resolution and the existence gate.
//!
//! Archive identifiers are attacker-controlled strings. They are used in
//! exactly two places: joined under the base directory as a single path
//! segment, and passed as a literal argument to the compressor. They are
//! never interpreted by a shell. Anything that is not a plain directory
//! name is rejected here, before the filesystem or a subprocess is touched.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Rejects identifiers that could escape the base directory, be mistaken
/// for a compressor option, or corrupt the response headers.
///
/// Allowed: any non-empty name that is not `.` or `..`, without path
/// separators, without ASCII control characters or `"` (the identifier is
/// echoed into the `Content-Disposition` filename), and without a leading
/// `-` (the compressor would parse it as a flag).
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let plain = !identifier.is_empty()
        && identifier != "."
        && identifier != ".."
        && !identifier.starts_with('-')
        && !identifier
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '"' || c.is_ascii_control());

    if plain {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier {
            identifier: identifier.to_string(),
        })
    }
}

/// Resolves an identifier to `base_dir/identifier` and verifies that the
/// target exists and is a directory.
///
/// # Errors
///
/// - [`Error::InvalidIdentifier`] if the identifier is not a plain name.
/// - [`Error::NotFound`] if the resolved path is missing or not a
///   directory. No subprocess is spawned in either case.
pub async fn resolve_archive_dir(base_dir: &Path, identifier: &str) -> Result<PathBuf> {
    validate_identifier(identifier)?;

    let dir = base_dir.join(identifier);
    match tokio::fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => Ok(dir),
        _ => Err(Error::NotFound {
            identifier: identifier.to_string(),
        }),
    }
}
