// kiln-common/src/keg.rs
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::Config;
use super::dependency::BuildNode;
use super::error::{KilnError, Result};
use super::model::formula::parse_version;
use super::model::option::OptionSet;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// How a keg came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallSource {
    Source,
    /// Poured from the local bottle cache.
    Cache { digest: String },
    /// Poured from a bottle declared by the formula.
    Bottle { url: String },
}

/// Written into every keg after a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    /// Node identity the keg was produced for.
    pub identity: String,
    pub options: OptionSet,
    pub source: InstallSource,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
    pub installed_at: u64,
}

impl InstallReceipt {
    pub fn for_node(node: &BuildNode, source: InstallSource) -> Self {
        let installed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name: node.formula.name.clone(),
            version: node.formula.version_str_full(),
            identity: node.identity.clone(),
            options: node.options.clone(),
            source,
            runtime_dependencies: node
                .formula
                .runtime_dependency_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            installed_at,
        }
    }

    pub fn read(keg: &Path) -> Result<Option<Self>> {
        let path = keg.join(RECEIPT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let receipt = serde_json::from_str(&raw).map_err(|e| {
            KilnError::ParseError(path.display().to_string(), e.to_string())
        })?;
        Ok(Some(receipt))
    }

    pub fn write(&self, keg: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(keg.join(RECEIPT_FILE), json)?;
        Ok(())
    }
}

// Free-form versions first, then semver order; ties by directory name.
fn compare_kegs(a: &InstalledKeg, b: &InstalledKeg) -> Ordering {
    a.semver()
        .cmp(&b.semver())
        .then_with(|| a.version_str.cmp(&b.version_str))
}

/// Represents information about an installed package (Keg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    /// Directory name below `Cellar/<name>`, e.g. `1.62.0_1-3fa2b9c1`.
    pub version_str: String,
    pub path: PathBuf,
}

impl InstalledKeg {
    /// Semantic version of the keg directory, ignoring the `_<revision>`
    /// and `-<identity>` suffixes.
    pub fn semver(&self) -> Option<Version> {
        let base = self.version_str.split('_').next().unwrap_or(&self.version_str);
        let base = match base.rsplit_once('-') {
            Some((version, suffix))
                if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                version
            }
            _ => base,
        };
        parse_version(base)
    }

    pub fn receipt(&self) -> Result<Option<InstallReceipt>> {
        InstallReceipt::read(&self.path)
    }
}

/// Manages querying installed packages in the Cellar.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn cellar_path(&self) -> PathBuf {
        self.config.cellar_dir()
    }

    /// Keg directory owned by `node`. Nodes built with non-default options
    /// get the first eight identity characters appended, so two option sets
    /// of one formula never share a prefix.
    pub fn keg_path(&self, node: &BuildNode) -> PathBuf {
        let version = node.formula.version_str_full();
        let dir = if node.uses_default_options() {
            version
        } else {
            format!("{version}-{}", node.short_identity())
        };
        self.config.formula_cellar_dir(&node.formula.name).join(dir)
    }

    /// An installed keg whose receipt records exactly this node identity.
    pub fn installed_for_node(&self, node: &BuildNode) -> Result<Option<InstalledKeg>> {
        let path = self.keg_path(node);
        match InstallReceipt::read(&path) {
            Ok(Some(receipt)) if receipt.identity == node.identity => {
                debug!("[KEG_REGISTRY:{}] receipt matches {}", node.name(), path.display());
                Ok(Some(InstalledKeg {
                    name: node.formula.name.clone(),
                    version_str: path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string(),
                    path,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(
                    "[KEG_REGISTRY:{}] unreadable receipt in {}: {}",
                    node.name(),
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    pub fn kegs_of(&self, name: &str) -> Result<Vec<InstalledKeg>> {
        let formula_dir = self.config.formula_cellar_dir(name);
        if !formula_dir.is_dir() {
            debug!(
                "[KEG_REGISTRY:{}] no cellar directory at {}",
                name,
                formula_dir.display()
            );
            return Ok(Vec::new());
        }
        let mut kegs = Vec::new();
        for entry in fs::read_dir(&formula_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        "[KEG_REGISTRY:{}] error reading entry in '{}': {}. Skipping.",
                        name,
                        formula_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(version_str) = path.file_name().and_then(|n| n.to_str()) {
                kegs.push(InstalledKeg {
                    name: name.to_string(),
                    version_str: version_str.to_string(),
                    path: path.clone(),
                });
            }
        }
        kegs.sort_by(compare_kegs);
        Ok(kegs)
    }

    pub fn list_installed_kegs(&self) -> Result<Vec<InstalledKeg>> {
        let cellar_dir = self.cellar_path();
        if !cellar_dir.is_dir() {
            debug!("[KEG_REGISTRY] Cellar directory not found, nothing installed.");
            return Ok(Vec::new());
        }
        let mut installed = Vec::new();
        for entry in fs::read_dir(&cellar_dir)? {
            let path = match entry {
                Ok(e) => e.path(),
                Err(e) => {
                    warn!("[KEG_REGISTRY] Error reading entry in cellar: {}. Skipping.", e);
                    continue;
                }
            };
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if path.is_dir() {
                    installed.extend(self.kegs_of(name)?);
                }
            }
        }
        installed.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| compare_kegs(a, b)));
        debug!("[KEG_REGISTRY] Found {} installed keg(s).", installed.len());
        Ok(installed)
    }
}
