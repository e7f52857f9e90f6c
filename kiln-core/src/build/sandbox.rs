// kiln-core/src/build/sandbox.rs
use std::fs;
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use tempfile::TempDir;
use tracing::debug;

/// Temporary build directory for one node. Removed on drop, whether the
/// build succeeded or not.
#[derive(Debug)]
pub struct BuildSandbox {
    dir: TempDir,
}

impl BuildSandbox {
    pub fn new_in(parent: &Path, label: &str) -> Result<Self> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(parent)
            .map_err(|e| {
                KilnError::BuildEnvError(format!(
                    "Failed to create build directory in {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        debug!("Build sandbox at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let sandbox = BuildSandbox::new_in(parent.path(), "zlib").unwrap();
            fs::write(sandbox.path().join("obj.o"), b"\0").unwrap();
            assert!(sandbox
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("zlib-"));
            sandbox.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
