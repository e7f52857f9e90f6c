// kiln-core/src/build/env.rs
// The environment a single node's install procedure runs in. Nothing here
// touches the process environment; commands get this map via env_clear().

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use kiln_common::config::Config;
use kiln_common::dependency::BuildNode;
use kiln_common::error::Result;
use tracing::{debug, warn};

use crate::install::devtools;

// Passed through from the invoking environment when present.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "USER", "LOGNAME", "HOME", "TERM", "SHELL", "LANG", "LC_ALL", "LC_CTYPE", "TZ",
];

const SYSTEM_PATH: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"];

#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
    path_dirs: Vec<PathBuf>,
    prefix: PathBuf,
    build_dir: PathBuf,
    cc: String,
    cxx: String,
    make_jobs: usize,
    /// Keg of every direct prerequisite, by formula name.
    dependency_kegs: BTreeMap<String, PathBuf>,
}

impl BuildEnvironment {
    /// Environment for installing `node` into `prefix`, building inside
    /// `build_dir`, with prerequisites installed at `dependency_kegs`.
    pub fn new(
        node: &BuildNode,
        prefix: &Path,
        build_dir: &Path,
        dependency_kegs: &BTreeMap<String, PathBuf>,
        config: &Config,
    ) -> Result<Self> {
        debug!("Creating build environment for {}", node);
        let mut vars = BTreeMap::new();
        for key in ENV_VARS_TO_KEEP {
            if let Ok(value) = env::var(key) {
                vars.insert((*key).to_string(), value);
            }
        }

        let mut path_dirs: Vec<PathBuf> = Vec::new();
        for keg in dependency_kegs.values() {
            for sub in ["bin", "sbin"] {
                let dir = keg.join(sub);
                if dir.is_dir() && !path_dirs.contains(&dir) {
                    path_dirs.push(dir);
                }
            }
        }
        let root_bin = config.bin_dir();
        if root_bin.is_dir() {
            path_dirs.push(root_bin);
        }
        path_dirs.extend(SYSTEM_PATH.iter().map(PathBuf::from));
        let path_string = env::join_paths(&path_dirs)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| SYSTEM_PATH.join(":"));

        let cc = resolve_compiler(&node.env.cc, &path_string);
        let cxx = resolve_compiler(&node.env.cxx, &path_string);

        let mut cppflags = Vec::new();
        let mut ldflags = node.env.ldflags.clone();
        let mut pkg_config = Vec::new();
        for keg in dependency_kegs.values() {
            if keg.join("include").is_dir() {
                cppflags.push(format!("-I{}", keg.join("include").display()));
            }
            if keg.join("lib").is_dir() {
                ldflags.push(format!("-L{}", keg.join("lib").display()));
            }
            let pc = keg.join("lib").join("pkgconfig");
            if pc.is_dir() {
                pkg_config.push(pc.display().to_string());
            }
        }

        vars.insert("PATH".into(), path_string);
        vars.insert("CC".into(), cc.clone());
        vars.insert("CXX".into(), cxx.clone());
        vars.insert("CFLAGS".into(), node.env.cflags.join(" "));
        vars.insert("CXXFLAGS".into(), node.env.cxxflags.join(" "));
        vars.insert("CPPFLAGS".into(), cppflags.join(" "));
        vars.insert("LDFLAGS".into(), ldflags.join(" "));
        if !pkg_config.is_empty() {
            vars.insert("PKG_CONFIG_PATH".into(), pkg_config.join(":"));
        }
        vars.insert("MAKEFLAGS".into(), format!("-j{}", config.make_jobs));
        vars.insert("PREFIX".into(), prefix.display().to_string());
        vars.insert("KILN_PREFIX".into(), config.root().display().to_string());
        vars.insert("TMPDIR".into(), build_dir.display().to_string());

        Ok(Self {
            vars,
            path_dirs,
            prefix: prefix.to_path_buf(),
            build_dir: build_dir.to_path_buf(),
            cc,
            cxx,
            make_jobs: config.make_jobs,
            dependency_kegs: dependency_kegs.clone(),
        })
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn path_dirs(&self) -> &[PathBuf] {
        &self.path_dirs
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn cc(&self) -> &str {
        &self.cc
    }

    pub fn cxx(&self) -> &str {
        &self.cxx
    }

    pub fn make_jobs(&self) -> usize {
        self.make_jobs
    }

    pub fn dependency_keg(&self, name: &str) -> Option<&Path> {
        self.dependency_kegs.get(name).map(PathBuf::as_path)
    }

    /// Replaces the child's whole environment with this one.
    pub fn apply_to_command(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(&self.vars);
    }
}

// A compiler that cannot be found is left as given: recipes that never
// invoke it still build, and those that do fail at exec time.
fn resolve_compiler(name: &str, search_path: &str) -> String {
    match devtools::find_compiler(name, Some(search_path)) {
        Ok(path) => path.display().to_string(),
        Err(e) => {
            warn!("{}; using '{}' unresolved", e, name);
            name.to_string()
        }
    }
}
