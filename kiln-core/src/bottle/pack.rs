// kiln-core/src/bottle/pack.rs
use std::fs::{self, File};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::RECEIPT_FILE;
use tracing::debug;
use walkdir::WalkDir;

use crate::checksum::sha256_file;
use crate::install::extract::{extract_archive, infer_archive_root_dir};
use crate::install::link::MANIFEST_FILE;

// Per-install bookkeeping, rewritten after every pour.
const SKIPPED: &[&str] = &[RECEIPT_FILE, MANIFEST_FILE];

/// Packs the contents of `keg` into a `.tar.gz` at `dest` with paths
/// relative to the keg. Returns the archive's SHA-256.
pub fn pack_keg(keg: &Path, dest: &Path) -> Result<String> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(keg)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || !SKIPPED.iter().any(|s| e.file_name() == *s));
    let mut count = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| KilnError::Generic(format!("walking {}: {}", keg.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(keg)
            .map_err(|e| KilnError::Generic(e.to_string()))?;
        builder.append_path_with_name(entry.path(), relative)?;
        count += 1;
    }
    builder.into_inner()?.finish()?;
    let sha = sha256_file(dest)?;
    debug!(
        "Packed {} entries of {} into {} ({})",
        count,
        keg.display(),
        dest.display(),
        sha
    );
    Ok(sha)
}

/// Extracts a bottle into an empty keg. Archives laid out as
/// `<name>/<version>/...` have both levels stripped.
pub fn pour(archive: &Path, keg: &Path, formula_name: &str) -> Result<()> {
    let strip = match infer_archive_root_dir(archive)? {
        Some(root) if root.as_os_str() == formula_name => 2,
        _ => 0,
    };
    debug!("Pouring {} into {} (strip {})", archive.display(), keg.display(), strip);
    extract_archive(archive, keg, strip)
}
