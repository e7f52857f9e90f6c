// kiln/src/cli/uninstall.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{InstalledKeg, KegRegistry};
use kiln_core::install::uninstall_keg;
use tracing::{debug, error};
use walkdir::WalkDir;

#[derive(Args, Debug)]
pub struct Uninstall {
    /// The names of the formulas to uninstall
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Remove kegs even when other installed formulas depend on them
    #[arg(long)]
    pub ignore_dependencies: bool,
}

impl Uninstall {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let registry = KegRegistry::new(config.clone());
        let mut errors: Vec<(String, KilnError)> = Vec::new();

        for name in &self.names {
            if name.contains('/') || name.contains("..") {
                let msg = format!("Invalid formula name '{name}' contains disallowed characters");
                error!("✖ {msg}");
                errors.push((name.clone(), KilnError::Generic(msg)));
                continue;
            }

            let kegs = registry.kegs_of(name)?;
            if kegs.is_empty() {
                errors.push((
                    name.clone(),
                    KilnError::NotFound(format!("Formula '{name}' is not installed")),
                ));
                continue;
            }

            if !self.ignore_dependencies {
                let dependents = installed_dependents(&registry, name, &self.names)?;
                if !dependents.is_empty() {
                    errors.push((
                        name.clone(),
                        KilnError::Generic(format!(
                            "Refusing to uninstall '{name}': required by {}",
                            dependents.join(", ")
                        )),
                    ));
                    continue;
                }
            }

            println!("Uninstalling {name}...");
            for keg in kegs {
                let (file_count, size_bytes) = count_files_and_size(&keg);
                match uninstall_keg(&keg, config) {
                    Ok(()) => println!(
                        "✓ Uninstalled {} {} ({} files, {})",
                        name.green(),
                        keg.version_str,
                        file_count,
                        format_size(size_bytes)
                    ),
                    Err(e) => {
                        error!("✖ Failed to uninstall '{}': {}", name.cyan(), e);
                        errors.push((name.clone(), e));
                    }
                }
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        for (name, e) in &errors {
            eprintln!("{} {}: {}", "✖".red().bold(), name.cyan(), e);
        }
        Err(KilnError::Generic(format!(
            "{} uninstall(s) failed",
            errors.len()
        )))
    }
}

/// Installed formulas (outside `removing`) whose receipts list `name` as a
/// runtime dependency.
fn installed_dependents(registry: &KegRegistry, name: &str, removing: &[String]) -> Result<Vec<String>> {
    let mut dependents = Vec::new();
    for keg in registry.list_installed_kegs()? {
        if keg.name == name || removing.contains(&keg.name) {
            continue;
        }
        match keg.receipt() {
            Ok(Some(receipt)) if receipt.runtime_dependencies.iter().any(|d| d == name) => {
                if !dependents.contains(&keg.name) {
                    dependents.push(keg.name.clone());
                }
            }
            Ok(_) => {}
            Err(e) => debug!("Unreadable receipt in {}: {}", keg.path.display(), e),
        }
    }
    Ok(dependents)
}

fn count_files_and_size(keg: &InstalledKeg) -> (usize, u64) {
    let mut file_count = 0;
    let mut total_size = 0;
    for entry in WalkDir::new(&keg.path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            file_count += 1;
            total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (file_count, total_size)
}

fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if size >= GB {
        format!("{:.1}GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.1}MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.1}KB", size as f64 / KB as f64)
    } else {
        format!("{size}B")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kiln_common::keg::{InstallReceipt, InstallSource};
    use kiln_common::model::OptionSet;

    use super::*;

    fn fake_keg(config: &Config, name: &str, deps: &[&str]) {
        let keg = config.formula_cellar_dir(name).join("1.0");
        fs::create_dir_all(&keg).unwrap();
        InstallReceipt {
            name: name.into(),
            version: "1.0".into(),
            identity: "ab".repeat(32),
            options: OptionSet::default(),
            source: InstallSource::Source,
            runtime_dependencies: deps.iter().map(|d| d.to_string()).collect(),
            installed_at: 0,
        }
        .write(&keg)
        .unwrap();
    }

    #[test]
    fn dependents_block_unless_removed_together() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        fake_keg(&config, "zlib", &[]);
        fake_keg(&config, "png", &["zlib"]);
        let registry = KegRegistry::new(config);

        assert_eq!(
            installed_dependents(&registry, "zlib", &["zlib".into()]).unwrap(),
            vec!["png".to_string()]
        );
        assert!(installed_dependents(&registry, "zlib", &["zlib".into(), "png".into()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(10), "10B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0MB");
    }
}
