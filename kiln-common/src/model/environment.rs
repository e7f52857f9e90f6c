// kiln-common/src/model/environment.rs
use serde::{Deserialize, Serialize};

use super::formula::Formula;
use super::option::OptionSet;

/// Toolchain settings shared by every node of one invocation. Compiler
/// discovery happens before graph construction; this only carries results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub cc: String,
    pub cxx: String,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub ldflags: Vec<String>,
    pub make_jobs: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            cc: "cc".to_string(),
            cxx: "c++".to_string(),
            cflags: vec!["-O2".to_string()],
            cxxflags: vec!["-O2".to_string()],
            ldflags: Vec::new(),
            make_jobs: 1,
        }
    }
}

/// Compiler selection and flags of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEnvironment {
    pub cc: String,
    pub cxx: String,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub ldflags: Vec<String>,
}

impl NodeEnvironment {
    /// Applies the formula's active compiler needs on top of `settings`.
    pub fn for_formula(settings: &BuildSettings, formula: &Formula, options: &OptionSet) -> Self {
        let mut cxxflags = settings.cxxflags.clone();
        for feature in formula.active_needs(options) {
            let flag = feature.cxx_flag().to_string();
            if !cxxflags.contains(&flag) {
                cxxflags.push(flag);
            }
        }
        Self {
            cc: settings.cc.clone(),
            cxx: settings.cxx.clone(),
            cflags: settings.cflags.clone(),
            cxxflags,
            ldflags: settings.ldflags.clone(),
        }
    }

    /// Part of the node identity. Parallelism is deliberately not included.
    pub fn fingerprint(&self) -> String {
        format!(
            "cc={};cxx={};cflags={};cxxflags={};ldflags={}",
            self.cc,
            self.cxx,
            self.cflags.join(" "),
            self.cxxflags.join(" "),
            self.ldflags.join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::option::OptionValue;

    #[test]
    fn needs_extend_cxxflags_only_when_active() {
        let formula = Formula::load(
            r#"{"name": "b", "version": "1.0",
                "options": [{"name": "c++11"}],
                "needs": [{"feature": "cxx11", "when": {"flag": "c++11"}}, "cxx11"]}"#,
            "b.json",
        )
        .unwrap();
        let settings = BuildSettings::default();
        let mut options = formula.default_options();
        let env = NodeEnvironment::for_formula(&settings, &formula, &options);
        assert_eq!(env.cxxflags, vec!["-O2", "-std=c++11"]);

        options.insert("c++11", OptionValue::Bool(true));
        let same = NodeEnvironment::for_formula(&settings, &formula, &options);
        assert_eq!(same.fingerprint(), env.fingerprint());
    }
}
