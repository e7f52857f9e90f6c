// kiln-common/src/model/option.rs
// Build options: declarations, resolved option sets and the resolver that
// turns user flags into an effective configuration for one formula.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::formula::Formula;
use crate::error::{KilnError, Result};

/// Value of a single build option.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Str(String),
}

impl OptionValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// What an option name means, derived from its spelling and default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKind {
    /// `with-X`: feature X, off unless requested.
    With(String),
    /// `without-X`: feature X, on unless disabled.
    Without(String),
    Flag,
    Value,
}

impl OptionKind {
    pub fn classify(name: &str, default: &OptionValue) -> Self {
        if let OptionValue::Str(_) = default {
            return Self::Value;
        }
        if let Some(feature) = name.strip_prefix("with-") {
            Self::With(feature.to_string())
        } else if let Some(feature) = name.strip_prefix("without-") {
            Self::Without(feature.to_string())
        } else {
            Self::Flag
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_off")]
    pub default: OptionValue,
}

fn default_off() -> OptionValue {
    OptionValue::Bool(false)
}

impl OptionDecl {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: default_off(),
        }
    }

    pub fn kind(&self) -> OptionKind {
        OptionKind::classify(&self.name, &self.default)
    }

    /// The flag a user types to turn this option on (or set it).
    pub fn flag(&self) -> String {
        match self.kind() {
            OptionKind::Value => format!("--{}=<value>", self.name),
            _ => format!("--{}", self.name),
        }
    }
}

/// Option names are lowercase-ish identifiers: letters, digits and `+-._@`.
pub fn is_valid_option_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.' | '_' | '@'))
}

/// Resolved option values for one formula instance.
///
/// Ordered by name so that [`OptionSet::canonical`] is deterministic, which
/// node identities and bottle cache keys depend on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSet {
    values: BTreeMap<String, OptionValue>,
}

impl OptionSet {
    pub fn insert(&mut self, name: impl Into<String>, value: OptionValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(OptionValue::is_truthy)
    }

    /// Whether feature `name` is enabled, answered from whichever of
    /// `with-<name>` / `without-<name>` the formula declares.
    pub fn with(&self, name: &str) -> bool {
        if let Some(v) = self.values.get(&format!("with-{name}")) {
            v.is_truthy()
        } else if let Some(v) = self.values.get(&format!("without-{name}")) {
            !v.is_truthy()
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stable textual form, `name=value` pairs joined by `;`.
    pub fn canonical(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| match v {
                OptionValue::Bool(b) => format!("{k}={b}"),
                OptionValue::Str(s) => format!("{k}=\"{}\"", s.escape_default()),
            })
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Flags that reproduce this set from the formula defaults, e.g.
    /// `["--with-icu4c", "--prefix-suffix=x"]`.
    pub fn active_flags(&self, formula: &Formula) -> Vec<String> {
        let defaults = formula.default_options();
        self.values
            .iter()
            .filter(|(k, v)| defaults.get(k) != Some(*v))
            .map(|(k, v)| match v {
                OptionValue::Bool(true) => format!("--{k}"),
                OptionValue::Bool(false) => format!("--{k}=false"),
                OptionValue::Str(s) => format!("--{k}={s}"),
            })
            .collect()
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on: Vec<&str> = self
            .values
            .iter()
            .filter(|(_, v)| v.is_truthy())
            .map(|(k, _)| k.as_str())
            .collect();
        if on.is_empty() {
            write!(f, "(defaults)")
        } else {
            write!(f, "{}", on.join(", "))
        }
    }
}

/// Old option name to its replacement. Chains are flattened on construction
/// so every lookup is a single step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeprecatedOptions {
    table: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecatedOption {
    pub old: String,
    pub new: String,
}

impl DeprecatedOptions {
    /// Builds the rewriting table, rejecting conflicting, cyclic or
    /// shadowing aliases. `origin` names the recipe in errors.
    pub fn build(origin: &str, entries: &[DeprecatedOption], declared: &[&str]) -> Result<Self> {
        let parse_err = |msg: String| KilnError::ParseError(origin.to_string(), msg);
        let mut direct: BTreeMap<String, String> = BTreeMap::new();
        for entry in entries {
            if !is_valid_option_name(&entry.old) || !is_valid_option_name(&entry.new) {
                return Err(parse_err(format!(
                    "invalid deprecated option '{}' => '{}'",
                    entry.old, entry.new
                )));
            }
            if entry.old == entry.new {
                return Err(parse_err(format!(
                    "deprecated option '{}' points at itself",
                    entry.old
                )));
            }
            if declared.contains(&entry.old.as_str()) {
                return Err(parse_err(format!(
                    "deprecated option '{}' shadows a declared option",
                    entry.old
                )));
            }
            match direct.get(&entry.old) {
                Some(existing) if existing != &entry.new => {
                    return Err(parse_err(format!(
                        "deprecated option '{}' maps to both '{}' and '{}'",
                        entry.old, existing, entry.new
                    )));
                }
                Some(_) => {}
                None => {
                    direct.insert(entry.old.clone(), entry.new.clone());
                }
            }
        }

        let mut table = BTreeMap::new();
        for start in direct.keys() {
            let mut seen = vec![start.as_str()];
            let mut current = start.as_str();
            while let Some(next) = direct.get(current) {
                if seen.contains(&next.as_str()) {
                    seen.push(next);
                    return Err(parse_err(format!(
                        "deprecated option aliases form a cycle: {}",
                        seen.join(" -> ")
                    )));
                }
                seen.push(next);
                current = next;
            }
            table.insert(start.clone(), current.to_string());
        }
        Ok(Self { table })
    }

    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.table.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.table.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// A user flag the formula does not understand. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownOptionWarning {
    pub formula: String,
    pub flag: String,
    pub reason: String,
}

impl fmt::Display for UnknownOptionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: ignoring option '{}' ({})",
            self.formula, self.flag, self.reason
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub options: OptionSet,
    pub warnings: Vec<UnknownOptionWarning>,
}

/// Computes the effective option set of `formula` for `user_flags`.
///
/// Deprecated names are rewritten first, then every declared option gets its
/// default, then user flags override. Unknown flags become warnings.
pub fn resolve_options<S: AsRef<str>>(formula: &Formula, user_flags: &[S]) -> ResolvedOptions {
    let mut options = formula.default_options();
    let mut warnings = Vec::new();

    for raw_flag in user_flags {
        let raw_flag = raw_flag.as_ref();
        let body = raw_flag.strip_prefix("--").unwrap_or(raw_flag);
        let (given_name, given_value) = match body.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (body, None),
        };
        let name = formula.deprecated_options.canonical(given_name);
        if name != given_name {
            debug!(
                "{}: rewriting deprecated option '{}' to '{}'",
                formula.name, given_name, name
            );
        }

        let mut warn_unknown = |reason: &str| {
            let w = UnknownOptionWarning {
                formula: formula.name.clone(),
                flag: raw_flag.to_string(),
                reason: reason.to_string(),
            };
            warn!("{}", w);
            warnings.push(w);
        };

        if let Some(decl) = formula.option(name) {
            match (&decl.default, given_value) {
                (OptionValue::Str(_), Some(v)) => {
                    options.insert(name, OptionValue::Str(v.to_string()));
                }
                (OptionValue::Str(_), None) => warn_unknown("option requires a value"),
                (OptionValue::Bool(_), None) => options.insert(name, OptionValue::Bool(true)),
                (OptionValue::Bool(_), Some(v)) => match v {
                    "true" | "1" | "yes" => options.insert(name, OptionValue::Bool(true)),
                    "false" | "0" | "no" => options.insert(name, OptionValue::Bool(false)),
                    _ => warn_unknown("not a boolean value"),
                },
            }
            continue;
        }

        // `--with-X` against a formula declaring only `without-X`, or the
        // reverse, switches the declared counterpart off.
        let counterpart = if let Some(feature) = name.strip_prefix("with-") {
            Some(format!("without-{feature}"))
        } else {
            name.strip_prefix("without-")
                .map(|feature| format!("with-{feature}"))
        };
        match counterpart {
            Some(other) if given_value.is_none() && formula.option(&other).is_some() => {
                debug!(
                    "{}: '{}' toggles declared option '{}' off",
                    formula.name, name, other
                );
                options.insert(other, OptionValue::Bool(false));
            }
            _ => warn_unknown("not declared by this formula"),
        }
    }

    ResolvedOptions { options, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(old: &str, new: &str) -> DeprecatedOption {
        DeprecatedOption {
            old: old.into(),
            new: new.into(),
        }
    }

    #[test]
    fn classifies_by_spelling_and_default() {
        let off = OptionValue::Bool(false);
        assert_eq!(
            OptionKind::classify("with-icu4c", &off),
            OptionKind::With("icu4c".into())
        );
        assert_eq!(
            OptionKind::classify("without-static", &off),
            OptionKind::Without("static".into())
        );
        assert_eq!(OptionKind::classify("c++11", &off), OptionKind::Flag);
        assert_eq!(
            OptionKind::classify("with-suffix", &OptionValue::Str(String::new())),
            OptionKind::Value
        );
    }

    #[test]
    fn alias_chains_are_flattened() {
        let table = DeprecatedOptions::build(
            "demo",
            &[alias("with-icu", "with-icu4"), alias("with-icu4", "with-icu4c")],
            &["with-icu4c"],
        )
        .unwrap();
        assert_eq!(table.canonical("with-icu"), "with-icu4c");
        assert_eq!(table.canonical("with-icu4"), "with-icu4c");
        assert_eq!(table.canonical("with-icu4c"), "with-icu4c");
    }

    #[test]
    fn conflicting_aliases_are_rejected() {
        let err = DeprecatedOptions::build(
            "demo",
            &[alias("with-icu", "with-icu4c"), alias("with-icu", "with-other")],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, KilnError::ParseError(ref f, _) if f == "demo"));
    }

    #[test]
    fn alias_cycles_and_shadowing_are_rejected() {
        assert!(DeprecatedOptions::build(
            "demo",
            &[alias("a", "b"), alias("b", "a")],
            &[]
        )
        .is_err());
        assert!(DeprecatedOptions::build("demo", &[alias("a", "b")], &["a", "b"]).is_err());
    }

    #[test]
    fn canonical_form_is_sorted() {
        let mut set = OptionSet::default();
        set.insert("without-static", OptionValue::Bool(false));
        set.insert("c++11", OptionValue::Bool(true));
        set.insert("suffix", OptionValue::Str("mt".into()));
        assert_eq!(
            set.canonical(),
            "c++11=true;suffix=\"mt\";without-static=false"
        );
    }

    #[test]
    fn option_names_are_validated() {
        assert!(is_valid_option_name("c++11"));
        assert!(is_valid_option_name("with-boost@1.62"));
        assert!(!is_valid_option_name(""));
        assert!(!is_valid_option_name("--with-x"));
        assert!(!is_valid_option_name("with x"));
    }
}
