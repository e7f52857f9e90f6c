// kiln-core/src/install/extract.rs
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tar::{Archive, EntryType};
use tracing::{debug, error, warn};
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    TarBz2,
    TarXz,
    Tar,
}

impl ArchiveKind {
    /// Guesses the compression from the file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz") || name.ends_with(".tbz2")
        {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    fn reader(self, file: File) -> Box<dyn Read> {
        match self {
            Self::TarGz => Box::new(GzDecoder::new(file)),
            Self::TarBz2 => Box::new(BzDecoder::new(file)),
            Self::TarXz => Box::new(XzDecoder::new(file)),
            Self::Tar => Box::new(file),
        }
    }
}

fn open_archive(archive_path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let kind = ArchiveKind::from_path(archive_path).ok_or_else(|| {
        KilnError::Generic(format!(
            "Unsupported archive type for {}",
            archive_path.display()
        ))
    })?;
    let file = File::open(archive_path).map_err(|e| {
        KilnError::from(io::Error::new(
            e.kind(),
            format!("Failed to open archive {}: {}", archive_path.display(), e),
        ))
    })?;
    Ok(Archive::new(kind.reader(file)))
}

/// Name of the single top-level directory of a tarball, if it has one.
pub fn infer_archive_root_dir(archive_path: &Path) -> Result<Option<PathBuf>> {
    let mut archive = open_archive(archive_path)?;
    let mut roots = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry.map_err(|e| {
            KilnError::Generic(format!(
                "Error reading TAR entry from {}: {}",
                archive_path.display(),
                e
            ))
        })?;
        let path = entry.path()?.into_owned();
        match path.components().find(|c| !matches!(c, Component::CurDir)) {
            Some(Component::Normal(name)) => {
                // A lone top-level file cannot be stripped.
                if path.components().filter(|c| matches!(c, Component::Normal(_))).count() == 1
                    && entry.header().entry_type() != EntryType::Directory
                {
                    return Ok(None);
                }
                roots.insert(PathBuf::from(name));
                if roots.len() > 1 {
                    debug!(
                        "Multiple top-level items in {}, no single root",
                        archive_path.display()
                    );
                    return Ok(None);
                }
            }
            Some(_) => return Ok(None),
            None => continue,
        }
    }
    Ok(roots.into_iter().next())
}

/// Extracts a tarball into `target_dir`, dropping the first
/// `strip_components` path components of every entry. Entries that would
/// land outside `target_dir` are rejected.
pub fn extract_archive(archive_path: &Path, target_dir: &Path, strip_components: usize) -> Result<()> {
    debug!(
        "Extracting '{}' to '{}' (strip_components={})",
        archive_path.display(),
        target_dir.display(),
        strip_components
    );
    let archive = open_archive(archive_path)?;
    fs::create_dir_all(target_dir)?;
    extract_tar_archive(archive, target_dir, strip_components, archive_path)
}

struct DeferredHardLink {
    link: PathBuf,
    target: PathBuf,
}

fn stripped_destination(
    target_dir: &Path,
    archive_path: &Path,
    strip_components: usize,
) -> std::result::Result<Option<PathBuf>, String> {
    let remaining: Vec<Component<'_>> = archive_path.components().skip(strip_components).collect();
    if remaining.is_empty() {
        return Ok(None);
    }
    let mut dest = target_dir.to_path_buf();
    for comp in remaining {
        match comp {
            Component::Normal(p) => dest.push(p),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("Unsafe '..' in TAR path {}", archive_path.display()))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!(
                    "Disallowed component {:?} in TAR path {}",
                    comp,
                    archive_path.display()
                ))
            }
        }
    }
    if dest == target_dir {
        return Ok(None);
    }
    Ok(Some(dest))
}

fn extract_tar_archive<R: Read>(
    mut archive: Archive<R>,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut deferred_hardlinks: Vec<DeferredHardLink> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result.map_err(|e| {
            KilnError::Generic(format!(
                "Error reading TAR entry from {}: {}",
                archive_path_for_log.display(),
                e
            ))
        })?;
        let original_path: PathBuf = entry.path()?.into_owned();

        let dest = match stripped_destination(target_dir, &original_path, strip_components) {
            Ok(Some(dest)) => dest,
            Ok(None) => {
                debug!("Skipping entry due to strip_components: {:?}", original_path);
                continue;
            }
            Err(msg) => {
                error!("{} in {}", msg, archive_path_for_log.display());
                errors.push(msg);
                continue;
            }
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry.header().entry_type() == EntryType::Link {
            match entry.link_name() {
                Ok(Some(target)) => {
                    match stripped_destination(target_dir, &target, strip_components) {
                        Ok(Some(target)) => deferred_hardlinks.push(DeferredHardLink {
                            link: dest,
                            target,
                        }),
                        _ => errors.push(format!(
                            "Hardlink '{}' points outside the extraction root",
                            original_path.display()
                        )),
                    }
                }
                _ => {
                    let msg = format!(
                        "Hardlink entry '{}' has no link target name",
                        original_path.display()
                    );
                    warn!("{}", msg);
                    errors.push(msg);
                }
            }
            continue;
        }

        if let Err(e) = entry.unpack(&dest) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                let msg = format!(
                    "Failed to unpack entry {:?} to {}: {}",
                    original_path,
                    dest.display(),
                    e
                );
                error!("{}", msg);
                errors.push(msg);
            }
        }
    }

    // Hardlink targets may appear later in the stream than the link itself.
    for deferred in deferred_hardlinks {
        if !deferred.target.exists() {
            errors.push(format!(
                "Target '{}' for hardlink '{}' does not exist",
                deferred.target.display(),
                deferred.link.display()
            ));
            continue;
        }
        if deferred.link.symlink_metadata().is_ok() {
            let _ = fs::remove_file(&deferred.link);
        }
        if let Err(e) = fs::hard_link(&deferred.target, &deferred.link) {
            errors.push(format!(
                "Failed to create hardlink '{}' -> '{}': {}",
                deferred.link.display(),
                deferred.target.display(),
                e
            ));
        }
    }

    if !errors.is_empty() {
        return Err(KilnError::InstallFailure(format!(
            "Failed during TAR extraction for {} with {} error(s): {}",
            archive_path_for_log.display(),
            errors.len(),
            errors.join("; ")
        )));
    }
    debug!(
        "Finished TAR extraction for {}",
        archive_path_for_log.display()
    );
    Ok(())
}
