// kiln-common/src/model/formula.rs
// A formula is a declarative build recipe: identity, source, options,
// dependency declarations, install/test steps and prebuilt bottles.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::activation::Activation;
use super::option::{
    is_valid_option_name, DeprecatedOption, DeprecatedOptions, OptionDecl, OptionSet,
};
use super::step::BuildStep;
use crate::dependency::{Dependency, DependencyExt, DependencyTag, RequirementKind};
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BottleFileSpec {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BottleSpec {
    #[serde(default)]
    pub rebuild: u32,
    /// Platform tag (e.g. `x86_64_linux`, `arm64_sonoma`) to artifact.
    #[serde(default)]
    pub files: BTreeMap<String, BottleFileSpec>,
}

/// Compiler capabilities a formula can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerFeature {
    Cxx11,
    Cxx14,
    Cxx17,
}

impl CompilerFeature {
    pub fn cxx_flag(&self) -> &'static str {
        match self {
            Self::Cxx11 => "-std=c++11",
            Self::Cxx14 => "-std=c++14",
            Self::Cxx17 => "-std=c++17",
        }
    }
}

impl fmt::Display for CompilerFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cxx11 => write!(f, "cxx11"),
            Self::Cxx14 => write!(f, "cxx14"),
            Self::Cxx17 => write!(f, "cxx17"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilerNeed {
    pub feature: CompilerFeature,
    #[serde(skip_serializing_if = "Activation::is_always")]
    pub when: Activation,
}

impl<'de> Deserialize<'de> for CompilerNeed {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawNeed {
            Bare(CompilerFeature),
            Guarded {
                feature: CompilerFeature,
                #[serde(default)]
                when: Activation,
            },
        }
        Ok(match RawNeed::deserialize(deserializer)? {
            RawNeed::Bare(feature) => CompilerNeed {
                feature,
                when: Activation::Always,
            },
            RawNeed::Guarded { feature, when } => CompilerNeed { feature, when },
        })
    }
}

/// Name plus full version (`1.62.0_1`). Unique per loaded formula.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormulaId {
    pub name: String,
    pub version: String,
}

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Formula {
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    /// Source archive location; empty for formulas built purely from steps.
    pub url: String,
    pub sha256: String,
    pub mirrors: Vec<String>,
    pub keg_only: Option<String>,
    /// Declared options in declaration order, implicit ones appended.
    pub options: Vec<OptionDecl>,
    pub deprecated_options: DeprecatedOptions,
    pub dependencies: Vec<Dependency>,
    pub needs: Vec<CompilerNeed>,
    pub install: Vec<BuildStep>,
    pub test: Vec<BuildStep>,
    pub bottle: BottleSpec,
}

#[derive(Deserialize)]
struct RawFormula {
    name: String,
    version: String,
    #[serde(default)]
    revision: u32,
    desc: Option<String>,
    homepage: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    sha256: String,
    #[serde(default)]
    mirrors: Vec<String>,
    #[serde(default)]
    keg_only: Option<String>,
    #[serde(default)]
    options: Vec<OptionDecl>,
    #[serde(default)]
    deprecated_options: Vec<DeprecatedOption>,
    #[serde(default)]
    dependencies: Vec<Dependency>,
    #[serde(default)]
    needs: Vec<CompilerNeed>,
    #[serde(default)]
    install: Vec<BuildStep>,
    #[serde(default)]
    test: Vec<BuildStep>,
    #[serde(default)]
    bottle: BottleSpec,
}

fn is_valid_formula_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.' | '_' | '@'))
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl Formula {
    /// Parses and validates one JSON recipe. `origin` names the source in
    /// error messages (usually the file path).
    pub fn load(source: &str, origin: &str) -> Result<Self> {
        let raw: RawFormula = serde_json::from_str(source)
            .map_err(|e| KilnError::ParseError(origin.to_string(), e.to_string()))?;
        Self::from_raw(raw, origin)
    }

    pub fn load_path(path: &Path) -> Result<Self> {
        let origin = path.display().to_string();
        let source = std::fs::read_to_string(path).map_err(|e| {
            KilnError::ParseError(origin.clone(), format!("cannot read recipe: {e}"))
        })?;
        Self::load(&source, &origin)
    }

    fn from_raw(raw: RawFormula, origin: &str) -> Result<Self> {
        let parse_err = |msg: String| KilnError::ParseError(origin.to_string(), msg);

        if !is_valid_formula_name(&raw.name) {
            return Err(parse_err(format!("invalid formula name '{}'", raw.name)));
        }
        if raw.version.trim().is_empty() || raw.version.chars().any(char::is_whitespace) {
            return Err(parse_err(format!("invalid version '{}'", raw.version)));
        }
        if !raw.sha256.is_empty() && !is_sha256_hex(&raw.sha256) {
            return Err(parse_err("sha256 must be 64 hex characters".to_string()));
        }
        if !raw.url.is_empty() && raw.sha256.is_empty() {
            return Err(parse_err(format!("source url '{}' has no sha256", raw.url)));
        }
        for (platform, file) in &raw.bottle.files {
            if !is_sha256_hex(&file.sha256) {
                return Err(parse_err(format!(
                    "bottle for '{platform}' has an invalid sha256"
                )));
            }
        }

        let mut options = raw.options;
        let mut seen = HashSet::new();
        for decl in &options {
            if !is_valid_option_name(&decl.name) {
                return Err(parse_err(format!("invalid option name '{}'", decl.name)));
            }
            if !seen.insert(decl.name.clone()) {
                return Err(parse_err(format!("option '{}' declared twice", decl.name)));
            }
        }

        for dep in &raw.dependencies {
            if !is_valid_formula_name(&dep.name) {
                return Err(parse_err(format!("invalid dependency name '{}'", dep.name)));
            }
            let implicit = match dep.kind() {
                RequirementKind::Required => None,
                RequirementKind::Optional => Some((
                    format!("with-{}", dep.name),
                    format!("Build with {} support", dep.name),
                )),
                RequirementKind::Recommended => Some((
                    format!("without-{}", dep.name),
                    format!("Build without {} support", dep.name),
                )),
            };
            if let Some((name, description)) = implicit {
                let counterpart_declared = seen.contains(&format!("with-{}", dep.name))
                    || seen.contains(&format!("without-{}", dep.name));
                if !counterpart_declared {
                    debug!("{}: implicitly declaring option '{}'", raw.name, name);
                    seen.insert(name.clone());
                    options.push(OptionDecl::new(name, description));
                }
            }
        }

        let declared: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
        let deprecated_options =
            DeprecatedOptions::build(origin, &raw.deprecated_options, &declared)?;
        for (old, new) in deprecated_options.iter() {
            if !declared.contains(&new.as_str()) {
                return Err(parse_err(format!(
                    "deprecated option '{old}' points at undeclared option '{new}'"
                )));
            }
        }

        let formula = Formula {
            name: raw.name,
            version: raw.version,
            revision: raw.revision,
            desc: raw.desc,
            homepage: raw.homepage,
            url: raw.url,
            sha256: raw.sha256.to_ascii_lowercase(),
            mirrors: raw.mirrors,
            keg_only: raw.keg_only,
            options,
            deprecated_options,
            dependencies: raw.dependencies,
            needs: raw.needs,
            install: raw.install,
            test: raw.test,
            bottle: raw.bottle,
        };
        match formula.semver() {
            Some(v) => debug!("{}: semantic version {}", formula.name, v),
            None => debug!(
                "{}: version '{}' is not semver, kept verbatim",
                formula.name, formula.version
            ),
        }
        formula.warn_unknown_references();
        Ok(formula)
    }

    // Guards that read options nobody declares are legal but always false
    // (or always true under `without`), which is almost always a typo.
    fn warn_unknown_references(&self) {
        let mut names: Vec<&str> = Vec::new();
        for dep in &self.dependencies {
            names.extend(dep.when.referenced_names());
        }
        for need in &self.needs {
            names.extend(need.when.referenced_names());
        }
        for step in self.install.iter().chain(self.test.iter()) {
            names.extend(step.referenced_names());
        }
        for name in names {
            let known = self.option(name).is_some()
                || self.option(&format!("with-{name}")).is_some()
                || self.option(&format!("without-{name}")).is_some();
            if !known {
                warn!(
                    "{}: activation refers to undeclared option '{}'",
                    self.name, name
                );
            }
        }
    }

    pub fn id(&self) -> FormulaId {
        FormulaId {
            name: self.name.clone(),
            version: self.version_str_full(),
        }
    }

    /// Version with the revision suffix, e.g. `1.62.0_1`.
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    /// Semantic version when the version string is (or pads to) one.
    pub fn semver(&self) -> Option<Version> {
        parse_version(&self.version)
    }

    pub fn option(&self, name: &str) -> Option<&OptionDecl> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn default_options(&self) -> OptionSet {
        let mut set = OptionSet::default();
        for decl in &self.options {
            set.insert(decl.name.clone(), decl.default.clone());
        }
        set
    }

    pub fn is_keg_only(&self) -> bool {
        self.keg_only.is_some()
    }

    pub fn dependencies_for(&self, options: &OptionSet, include_test: bool) -> Vec<&Dependency> {
        self.dependencies.active(options, include_test)
    }

    pub fn active_needs(&self, options: &OptionSet) -> Vec<CompilerFeature> {
        self.needs
            .iter()
            .filter(|n| n.when.is_active(options))
            .map(|n| n.feature)
            .collect()
    }

    pub fn bottle_for(&self, platform: &str) -> Option<&BottleFileSpec> {
        self.bottle.files.get(platform)
    }

    pub fn runtime_dependency_names(&self) -> Vec<&str> {
        self.dependencies
            .filter_by_tags(DependencyTag::RUNTIME, DependencyTag::empty())
            .into_iter()
            .map(|d| d.name.as_str())
            .collect()
    }
}

/// Lenient semver parse: `1.62` and `3` are padded to three components.
/// Date-style or otherwise free-form versions yield `None`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let padded = match raw.split('.').count() {
        1 => format!("{raw}.0.0"),
        2 => format!("{raw}.0"),
        _ => raw.to_string(),
    };
    Version::parse(&padded).ok()
}
