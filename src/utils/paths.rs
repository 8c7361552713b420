//! Standard filesystem locations, following the single-dotfile-directory
//! convention used by similar CLI tools (`~/.<name>` for all process data).

use std::path::PathBuf;

/// Base directory for this process's data when no explicit paths are
/// configured (used only as a fallback for defaults in [`crate::config`]).
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn base_dir() -> PathBuf {
    #[expect(clippy::expect_used, reason = "home directory is required for default paths")]
    dirs::home_dir()
        .expect("could not determine home directory")
        .join(".sandboxd")
}
