use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use tracing::debug;

/// Resolves a compiler name or path to an executable.
///
/// Names containing a path separator must point at an existing file; bare
/// names are searched on `search_path` (colon-separated, like `PATH`) and
/// then on this process's `PATH`.
pub fn find_compiler(name: &str, search_path: Option<&str>) -> Result<PathBuf> {
    if name.trim().is_empty() {
        return Err(KilnError::BuildEnvError("empty compiler name".to_string()));
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        if path.is_file() {
            debug!("Using compiler at explicit path: {}", path.display());
            return Ok(path);
        }
        return Err(KilnError::BuildEnvError(format!(
            "Compiler '{}' does not exist",
            path.display()
        )));
    }

    if let Some(paths) = search_path {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        if let Ok(found) = which::which_in(name, Some(paths), &cwd) {
            debug!("Found compiler '{}' on build PATH: {}", name, found.display());
            return Ok(found);
        }
    }

    debug!("Falling back to searching PATH for '{name}'");
    which::which(name).map_err(|e| {
        KilnError::BuildEnvError(format!("Failed to find compiler '{name}' on PATH: {e}"))
    })
}

/// True when `path` is an executable regular file.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
