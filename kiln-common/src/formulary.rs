use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::formula::Formula;

/// Source of formulas for graph construction.
///
/// `Ok(None)` means the name is unknown; `Err` means a recipe exists but
/// could not be loaded.
pub trait FormulaRegistry {
    fn lookup(&self, name: &str) -> Result<Option<Arc<Formula>>>;
}

impl FormulaRegistry for HashMap<String, Arc<Formula>> {
    fn lookup(&self, name: &str) -> Result<Option<Arc<Formula>>> {
        Ok(self.get(name).cloned())
    }
}

/// Directory-backed registry: `<dir>/<name>.json`, first directory wins.
pub struct Formulary {
    dirs: Vec<PathBuf>,
    parsed_cache: Mutex<HashMap<String, Arc<Formula>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self::from_dirs(config.formula_dirs.clone())
    }

    pub fn from_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    fn recipe_path(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(format!("{name}.json")))
            .find(|p| p.is_file())
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<Formula>> {
        self.lookup(name)?
            .ok_or_else(|| KilnError::NotFound(format!("Formula '{name}' not found")))
    }

    /// Names of every recipe visible through the search path.
    pub fn available(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.insert(stem.to_string());
                    }
                }
            }
        }
        Ok(names)
    }
}

impl FormulaRegistry for Formulary {
    fn lookup(&self, name: &str) -> Result<Option<Arc<Formula>>> {
        if let Some(formula) = self.parsed_cache.lock()?.get(name) {
            debug!("Loaded formula '{}' from parsed cache.", name);
            return Ok(Some(Arc::clone(formula)));
        }

        let Some(path) = self.recipe_path(name) else {
            debug!("Formula '{}' not found in {:?}", name, self.dirs);
            return Ok(None);
        };
        let formula = Formula::load_path(&path)?;
        if formula.name != name {
            return Err(KilnError::ParseError(
                path.display().to_string(),
                format!("recipe declares name '{}', expected '{name}'", formula.name),
            ));
        }
        debug!(
            "Successfully loaded formula '{}' version {} from {}",
            formula.name,
            formula.version_str_full(),
            path.display()
        );

        let formula = Arc::new(formula);
        let mut cache = self.parsed_cache.lock()?;
        let entry = cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&formula));
        Ok(Some(Arc::clone(entry)))
    }
}
