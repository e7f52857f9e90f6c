// kiln-core/src/install/link.rs
// opt/ and bin/ links for installed kegs, and their removal.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::InstalledKeg;
use kiln_common::model::Formula;
use tracing::{debug, error, warn};

use super::devtools::is_executable;

pub const MANIFEST_FILE: &str = "INSTALL_MANIFEST.json";

/// Links `keg` as `opt/<name>` and, unless the formula is keg-only, every
/// executable in `keg/bin` into the shared `bin/`. Returns the links made.
pub fn link_keg(formula: &Formula, keg: &Path, config: &Config) -> Result<Vec<PathBuf>> {
    debug!("Linking {} from {}", formula.name, keg.display());
    let mut created = Vec::new();

    let opt_link = config.formula_opt_path(&formula.name);
    fs::create_dir_all(config.opt_dir())?;
    replace_with_symlink(keg, &opt_link)?;
    created.push(opt_link);

    if let Some(reason) = &formula.keg_only {
        debug!("{} is keg-only ({}), not linking bin/", formula.name, reason);
    } else {
        let keg_bin = keg.join("bin");
        if keg_bin.is_dir() {
            fs::create_dir_all(config.bin_dir())?;
            let mut entries: Vec<PathBuf> = fs::read_dir(&keg_bin)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_executable(p))
                .collect();
            entries.sort();
            for source in entries {
                let Some(file_name) = source.file_name() else {
                    continue;
                };
                let target = config.bin_dir().join(file_name);
                if let Some(owner) = foreign_link_owner(&target, keg) {
                    warn!(
                        "{} already provided by {}, replacing link",
                        target.display(),
                        owner.display()
                    );
                }
                replace_with_symlink(&source, &target)?;
                created.push(target);
            }
        }
    }

    write_install_manifest(keg, &created)?;
    debug!("Created {} link(s) for {}", created.len(), formula.name);
    Ok(created)
}

/// Removes the links recorded in `keg`'s manifest that still point into it.
pub fn unlink_keg(keg: &Path, config: &Config) -> Result<usize> {
    let manifest_path = keg.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        debug!("No install manifest at {}", manifest_path.display());
        return Ok(0);
    }
    let links: Vec<PathBuf> = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
    let mut removed = 0;
    for link in links {
        if !(link.starts_with(config.opt_dir()) || link.starts_with(config.bin_dir())) {
            error!(
                "Manifest contains unexpected link path, skipping removal: {}",
                link.display()
            );
            continue;
        }
        match fs::read_link(&link) {
            Ok(dest) if dest.starts_with(keg) => {
                fs::remove_file(&link)?;
                removed += 1;
            }
            Ok(dest) => debug!(
                "{} now points at {}, leaving it",
                link.display(),
                dest.display()
            ),
            Err(_) => debug!("{} is gone already", link.display()),
        }
    }
    Ok(removed)
}

/// Unlinks and deletes an installed keg.
pub fn uninstall_keg(keg: &InstalledKeg, config: &Config) -> Result<()> {
    debug!("Uninstalling {} {}", keg.name, keg.version_str);
    unlink_keg(&keg.path, config)?;
    if keg.path.exists() {
        fs::remove_dir_all(&keg.path).map_err(|e| {
            error!("Failed to remove keg {}: {}", keg.path.display(), e);
            KilnError::InstallFailure(format!(
                "Failed to remove keg directory {}: {}",
                keg.path.display(),
                e
            ))
        })?;
    } else {
        warn!(
            "Keg directory {} not found during uninstall",
            keg.path.display()
        );
    }
    if let Some(parent) = keg.path.parent() {
        // Drop Cellar/<name> once its last keg is gone.
        if fs::read_dir(parent).map(|mut d| d.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(parent);
        }
    }
    Ok(())
}

fn foreign_link_owner(target: &Path, keg: &Path) -> Option<PathBuf> {
    fs::read_link(target).ok().filter(|dest| !dest.starts_with(keg))
}

fn replace_with_symlink(source: &Path, link: &Path) -> Result<()> {
    remove_existing_link_target(link)?;
    #[cfg(unix)]
    unix_fs::symlink(source, link).map_err(|e| {
        KilnError::from(std::io::Error::new(
            e.kind(),
            format!(
                "Failed to link {} -> {}: {}",
                link.display(),
                source.display(),
                e
            ),
        ))
    })?;
    #[cfg(not(unix))]
    return Err(KilnError::Generic(format!(
        "symlinks unsupported, cannot link {}",
        source.display()
    )));
    debug!("  Linked {} -> {}", link.display(), source.display());
    Ok(())
}

fn remove_existing_link_target(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(metadata) => {
            let file_type = metadata.file_type();
            if file_type.is_dir() && !file_type.is_symlink() {
                return Err(KilnError::InstallFailure(format!(
                    "Refusing to replace directory {} with a link",
                    path.display()
                )));
            }
            fs::remove_file(path)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_install_manifest(keg: &Path, links: &[PathBuf]) -> Result<()> {
    let manifest_path = keg.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_string_pretty(links)?)?;
    debug!(
        "Wrote install manifest with {} links: {}",
        links.len(),
        manifest_path.display()
    );
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn keg_with_tool(config: &Config, name: &str) -> PathBuf {
        let keg = config.formula_cellar_dir(name).join("1.0");
        fs::create_dir_all(keg.join("bin")).unwrap();
        let tool = keg.join("bin").join(format!("{name}-tool"));
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(keg.join("bin").join("README"), "not executable").unwrap();
        keg
    }

    #[test]
    fn links_opt_and_executables() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let formula = Formula::load(r#"{"name": "zstd", "version": "1.0"}"#, "zstd.json").unwrap();
        let keg = keg_with_tool(&config, "zstd");

        let links = link_keg(&formula, &keg, &config).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(fs::read_link(config.formula_opt_path("zstd")).unwrap(), keg);
        assert!(config.bin_dir().join("zstd-tool").symlink_metadata().is_ok());
        assert!(!config.bin_dir().join("README").exists());

        assert_eq!(unlink_keg(&keg, &config).unwrap(), 2);
        assert!(config.formula_opt_path("zstd").symlink_metadata().is_err());
    }

    #[test]
    fn keg_only_formulas_skip_bin() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let formula = Formula::load(
            r#"{"name": "icu4c", "version": "1.0", "keg_only": "provided by the system"}"#,
            "icu4c.json",
        )
        .unwrap();
        let keg = keg_with_tool(&config, "icu4c");
        assert_eq!(link_keg(&formula, &keg, &config).unwrap().len(), 1);
        assert!(!config.bin_dir().join("icu4c-tool").exists());
    }

    #[test]
    fn uninstall_removes_keg_and_empty_parent() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let formula = Formula::load(r#"{"name": "zstd", "version": "1.0"}"#, "zstd.json").unwrap();
        let keg = keg_with_tool(&config, "zstd");
        link_keg(&formula, &keg, &config).unwrap();

        let installed = InstalledKeg {
            name: "zstd".into(),
            version_str: "1.0".into(),
            path: keg.clone(),
        };
        uninstall_keg(&installed, &config).unwrap();
        assert!(!keg.exists());
        assert!(!config.formula_cellar_dir("zstd").exists());
        assert!(config.bin_dir().join("zstd-tool").symlink_metadata().is_err());
    }
}
