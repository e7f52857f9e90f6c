// kiln-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::activation::Activation;
use crate::model::option::OptionSet;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const TEST        = 0b00000100;
        const OPTIONAL    = 0b00001000;
        const RECOMMENDED = 0b00010000;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(n, _)| n).collect();
        write!(f, "{}", names.join("|").to_lowercase())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    #[default]
    Required,
    Optional,
    Recommended,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Dependency {
    pub name: String,
    pub tags: DependencyTag,
    /// Extra guard AND-ed with the optional/recommended rule.
    #[serde(skip_serializing_if = "Activation::is_always")]
    pub when: Activation,
    /// Option flags forwarded to the dependency's own resolution.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self::new_with_tags(name, DependencyTag::RUNTIME)
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
            when: Activation::Always,
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn when(mut self, when: Activation) -> Self {
        self.when = when;
        self
    }

    pub fn kind(&self) -> RequirementKind {
        if self.tags.contains(DependencyTag::OPTIONAL) {
            RequirementKind::Optional
        } else if self.tags.contains(DependencyTag::RECOMMENDED) {
            RequirementKind::Recommended
        } else {
            RequirementKind::Required
        }
    }

    /// Whether the dependency participates in a build configured with
    /// `options`. Must stay free of side effects: graph construction calls
    /// it repeatedly.
    pub fn is_active(&self, options: &OptionSet, include_test: bool) -> bool {
        if self.tags.contains(DependencyTag::TEST)
            && !self.tags.intersects(DependencyTag::RUNTIME | DependencyTag::BUILD)
            && !include_test
        {
            return false;
        }
        let by_kind = match self.kind() {
            RequirementKind::Required => true,
            RequirementKind::Optional | RequirementKind::Recommended => options.with(&self.name),
        };
        by_kind && self.when.is_active(options)
    }
}

#[derive(Deserialize)]
struct RawDependency {
    name: String,
    #[serde(default)]
    kind: RequirementKind,
    #[serde(default)]
    build: bool,
    #[serde(default)]
    test: bool,
    #[serde(default)]
    when: Activation,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependencyEntry {
    Name(String),
    Full(RawDependency),
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = match RawDependencyEntry::deserialize(deserializer)? {
            RawDependencyEntry::Name(name) => return Ok(Dependency::new_runtime(name)),
            RawDependencyEntry::Full(raw) => raw,
        };
        let mut tags = match (raw.build, raw.test) {
            (false, false) => DependencyTag::RUNTIME,
            (build, test) => {
                let mut t = DependencyTag::empty();
                t.set(DependencyTag::BUILD, build);
                t.set(DependencyTag::TEST, test);
                t
            }
        };
        match raw.kind {
            RequirementKind::Required => {}
            RequirementKind::Optional => tags |= DependencyTag::OPTIONAL,
            RequirementKind::Recommended => tags |= DependencyTag::RECOMMENDED,
        }
        Ok(Dependency {
            name: raw.name,
            tags,
            when: raw.when,
            options: raw.options,
        })
    }
}

pub trait DependencyExt {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency>;
    fn active(&self, options: &OptionSet, include_test: bool) -> Vec<&Dependency>;
}

impl DependencyExt for Vec<Dependency> {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(include) && !dep.tags.intersects(exclude))
            .collect()
    }

    fn active(&self, options: &OptionSet, include_test: bool) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.is_active(options, include_test))
            .collect()
    }
}
