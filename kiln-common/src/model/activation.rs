// kiln-common/src/model/activation.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use super::option::OptionSet;

/// A pure predicate over a resolved [`OptionSet`].
///
/// Guards dependency declarations, compiler needs and build steps. Written in
/// recipes as `"always"`, `{"with": "icu4c"}`, `{"without": "static"}`,
/// `{"flag": "c++11"}`, `{"not": ...}`, `{"all": [...]}` or `{"any": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Always,
    /// Feature enabled (`with-X` set, or `without-X` declared and unset).
    With(String),
    /// Feature disabled.
    Without(String),
    /// A plain flag option is set.
    Flag(String),
    Not(Box<Activation>),
    All(Vec<Activation>),
    Any(Vec<Activation>),
}

impl Activation {
    pub fn is_active(&self, options: &OptionSet) -> bool {
        match self {
            Self::Always => true,
            Self::With(feature) => options.with(feature),
            Self::Without(feature) => !options.with(feature),
            Self::Flag(name) => options.is_set(name),
            Self::Not(inner) => !inner.is_active(options),
            Self::All(all) => all.iter().all(|a| a.is_active(options)),
            Self::Any(any) => any.iter().any(|a| a.is_active(options)),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }

    /// Option names this predicate reads. Used to validate recipes.
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Always => {}
            Self::With(n) | Self::Without(n) | Self::Flag(n) => out.push(n),
            Self::Not(inner) => inner.collect_names(out),
            Self::All(list) | Self::Any(list) => {
                for a in list {
                    a.collect_names(out);
                }
            }
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::With(n) => write!(f, "with?({n})"),
            Self::Without(n) => write!(f, "without?({n})"),
            Self::Flag(n) => write!(f, "{n}?"),
            Self::Not(inner) => write!(f, "!({inner})"),
            Self::All(list) => {
                let parts: Vec<String> = list.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(" && "))
            }
            Self::Any(list) => {
                let parts: Vec<String> = list.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(" || "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::option::OptionValue;

    fn options(pairs: &[(&str, bool)]) -> OptionSet {
        let mut set = OptionSet::default();
        for (name, value) in pairs {
            set.insert(*name, OptionValue::Bool(*value));
        }
        set
    }

    #[test]
    fn with_reads_either_polarity() {
        let set = options(&[("with-icu4c", true), ("without-single", false)]);
        assert!(Activation::With("icu4c".into()).is_active(&set));
        assert!(Activation::With("single".into()).is_active(&set));
        assert!(!Activation::Without("single".into()).is_active(&set));
        assert!(!Activation::With("undeclared".into()).is_active(&set));
    }

    #[test]
    fn combinators_compose() {
        let set = options(&[("c++11", true), ("with-icu4c", false)]);
        let pred = Activation::All(vec![
            Activation::Flag("c++11".into()),
            Activation::Not(Box::new(Activation::With("icu4c".into()))),
        ]);
        assert!(pred.is_active(&set));
        let either = Activation::Any(vec![
            Activation::With("icu4c".into()),
            Activation::Flag("missing".into()),
        ]);
        assert!(!either.is_active(&set));
    }

    #[test]
    fn parses_recipe_notation() {
        let pred: Activation =
            serde_json::from_str(r#"{"all": [{"flag": "c++11"}, "always"]}"#).unwrap();
        assert_eq!(
            pred,
            Activation::All(vec![Activation::Flag("c++11".into()), Activation::Always])
        );
        assert_eq!(pred.referenced_names(), vec!["c++11"]);
    }
}
