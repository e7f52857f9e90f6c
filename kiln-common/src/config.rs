// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};

use directories::UserDirs;
use tracing::debug;

use super::error::{KilnError, Result};
use super::model::environment::BuildSettings;

// Used when KILN_PREFIX is unset and no home directory can be determined.
const DEFAULT_FALLBACK_ROOT: &str = "/opt/kiln";
const DEFAULT_ROOT_DIRNAME: &str = ".kiln";

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    /// Directories searched for `<name>.json` recipes, in priority order.
    pub formula_dirs: Vec<PathBuf>,
    /// Upper bound on nodes installed concurrently.
    pub jobs: usize,
    /// Value substituted for `{make_jobs}` and exported as MAKEFLAGS.
    pub make_jobs: usize,
    pub cc: Option<String>,
    pub cxx: Option<String>,
    /// Pack every successful source build into the bottle cache.
    pub store_bottles: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let root = env::var("KILN_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let fallback = UserDirs::new().map_or_else(
                    || PathBuf::from(DEFAULT_FALLBACK_ROOT),
                    |ud| ud.home_dir().join(DEFAULT_ROOT_DIRNAME),
                );
                debug!(
                    "KILN_PREFIX not set or empty, falling back to default: {}",
                    fallback.display()
                );
                fallback
            });
        debug!("Effective root set to: {}", root.display());

        let mut config = Self::with_root(root);

        if let Ok(paths) = env::var("KILN_FORMULA_PATH") {
            let dirs: Vec<PathBuf> = env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !dirs.is_empty() {
                config.formula_dirs = dirs;
            }
        }
        if let Some(jobs) = parse_count_var("KILN_JOBS")? {
            config.jobs = jobs;
        }
        if let Some(make_jobs) = parse_count_var("KILN_MAKE_JOBS")? {
            config.make_jobs = make_jobs;
        }
        config.cc = env::var("CC").ok().filter(|s| !s.is_empty());
        config.cxx = env::var("CXX").ok().filter(|s| !s.is_empty());
        config.store_bottles = env::var("KILN_STORE_BOTTLES").is_ok_and(|v| v == "1");

        debug!("Configuration loaded successfully: {:?}", config);
        Ok(config)
    }

    /// Configuration rooted at `root` with defaults for everything else and
    /// no environment lookups.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let parallelism = num_cpus::get().max(1);
        Self {
            formula_dirs: vec![root.join("Library").join("Formula")],
            root,
            jobs: parallelism,
            make_jobs: parallelism,
            cc: None,
            cxx: None,
            store_bottles: false,
        }
    }

    /// Toolchain settings for graph construction: `CC`/`CXX` when set,
    /// defaults otherwise.
    pub fn build_settings(&self) -> BuildSettings {
        let defaults = BuildSettings::default();
        BuildSettings {
            cc: self.cc.clone().unwrap_or_else(|| defaults.cc.clone()),
            cxx: self.cxx.clone().unwrap_or_else(|| defaults.cxx.clone()),
            make_jobs: self.make_jobs,
            ..defaults
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.root.join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn bottle_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("bottles")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    pub fn node_log_path(&self, formula_name: &str) -> PathBuf {
        self.logs_dir().join(formula_name)
    }
}

fn parse_count_var(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            let value = raw.trim().parse::<usize>().map_err(|e| {
                KilnError::Config(format!("{name} must be a positive integer, got '{raw}': {e}"))
            })?;
            if value == 0 {
                return Err(KilnError::Config(format!("{name} must be at least 1")));
            }
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}
