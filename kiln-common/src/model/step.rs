// kiln-common/src/model/step.rs
use serde::{Deserialize, Serialize};

use super::activation::Activation;
use super::option::OptionSet;

/// One argument of a `run`/`configure`/`make` step. Either a plain template
/// string or one guarded by an activation predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepArg {
    Plain(String),
    Conditional { arg: String, when: Activation },
}

impl StepArg {
    pub fn template(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Conditional { arg, .. } => arg,
        }
    }

    pub fn is_active(&self, options: &OptionSet) -> bool {
        match self {
            Self::Plain(_) => true,
            Self::Conditional { when, .. } => when.is_active(options),
        }
    }
}

fn default_configure_script() -> String {
    "./configure".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// `<script> --prefix={prefix} <args..>`
    Configure {
        #[serde(default = "default_configure_script")]
        script: String,
        #[serde(default)]
        args: Vec<StepArg>,
    },
    /// `make -j{make_jobs} <args..>`
    Make {
        #[serde(default)]
        args: Vec<StepArg>,
    },
    /// Any external program. `program` is templated like the arguments.
    Run {
        program: String,
        #[serde(default)]
        args: Vec<StepArg>,
    },
    /// Writes (or appends) templated content to a file below the build
    /// directory, or below the keg when the path starts with `{prefix}`.
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        append: bool,
    },
}

/// An install or test step: an action plus its guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Activation::is_always")]
    pub when: Activation,
    /// Working directory relative to the build directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl BuildStep {
    pub fn run<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: StepAction::Run {
                program: program.into(),
                args: args.into_iter().map(|a| StepArg::Plain(a.into())).collect(),
            },
            when: Activation::Always,
            cwd: None,
        }
    }

    pub fn is_active(&self, options: &OptionSet) -> bool {
        self.when.is_active(options)
    }

    /// Short human label used in logs and failure messages.
    pub fn describe(&self) -> String {
        match &self.action {
            StepAction::Configure { script, .. } => script.clone(),
            StepAction::Make { .. } => "make".to_string(),
            StepAction::Run { program, args } => {
                let mut parts = vec![program.clone()];
                parts.extend(args.iter().take(3).map(|a| a.template().to_string()));
                parts.join(" ")
            }
            StepAction::WriteFile { path, .. } => format!("write {path}"),
        }
    }

    /// Option names referenced by this step's guards.
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = self.when.referenced_names();
        let args: &[StepArg] = match &self.action {
            StepAction::Configure { args, .. }
            | StepAction::Make { args }
            | StepAction::Run { args, .. } => args,
            StepAction::WriteFile { .. } => &[],
        };
        for arg in args {
            if let StepArg::Conditional { when, .. } = arg {
                names.extend(when.referenced_names());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_steps() {
        let steps: Vec<BuildStep> = serde_json::from_str(
            r#"[
                {"type": "run", "program": "./bootstrap.sh",
                 "args": ["--prefix={prefix}", {"arg": "--with-icu={opt:icu4c}", "when": {"with": "icu4c"}}]},
                {"type": "configure", "args": ["--disable-debug"]},
                {"type": "make", "args": ["install"], "when": {"flag": "c++11"}},
                {"type": "write_file", "path": "user-config.jam", "content": "using darwin : : {cxx} ;\n", "append": true}
            ]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 4);
        match &steps[0].action {
            StepAction::Run { program, args } => {
                assert_eq!(program, "./bootstrap.sh");
                assert_eq!(args[1].template(), "--with-icu={opt:icu4c}");
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &steps[1].action {
            StepAction::Configure { script, .. } => assert_eq!(script, "./configure"),
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(steps[2].when, Activation::Flag("c++11".into()));
        assert_eq!(steps[0].referenced_names(), vec!["icu4c"]);
    }

    #[test]
    fn conditional_arguments_follow_options() {
        let arg = StepArg::Conditional {
            arg: "--enable-static".into(),
            when: Activation::Without("static".into()),
        };
        let mut options = OptionSet::default();
        options.insert("without-static", crate::model::option::OptionValue::Bool(false));
        assert!(!arg.is_active(&options));
        options.insert("without-static", crate::model::option::OptionValue::Bool(true));
        assert!(arg.is_active(&options));
    }
}
