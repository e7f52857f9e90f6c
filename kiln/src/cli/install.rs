// kiln/src/cli/install.rs

use clap::error::ErrorKind;
use clap::Args;
use kiln_common::config::Config;
use kiln_common::error::Result;
use tracing::instrument;

use crate::pipeline::runner::{self, PipelineFlags};

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Formula names, followed by build options such as `--with-icu` or
    /// `--without-static`. Build options apply to every named formula.
    #[arg(
        required = true,
        value_name = "NAME|OPTION",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    targets: Vec<String>,

    /// Maximum number of formulas installed at once
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    #[arg(
        long,
        help = "Build every formula from source, ignoring cached and declared bottles"
    )]
    pub build_from_source: bool,

    /// Run each requested formula's test steps after installing it
    #[arg(long = "test")]
    pub run_tests: bool,

    /// Store successful source builds in the bottle cache
    #[arg(long)]
    pub store_bottles: bool,
}

impl InstallArgs {
    pub fn names(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| !t.starts_with('-'))
            .map(String::as_str)
            .collect()
    }

    pub fn option_flags(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| t.starts_with('-'))
            .map(String::as_str)
            .collect()
    }

    /// Moves `--jobs`, `--build-from-source`, `--test` and
    /// `--store-bottles` written after the first name out of `targets`.
    pub(crate) fn lift_install_flags(&mut self) -> std::result::Result<(), clap::Error> {
        let mut kept = Vec::new();
        let mut rest = std::mem::take(&mut self.targets).into_iter();
        while let Some(arg) = rest.next() {
            match arg.as_str() {
                "--build-from-source" => self.build_from_source = true,
                "--test" => self.run_tests = true,
                "--store-bottles" => self.store_bottles = true,
                "--jobs" | "-j" => {
                    let value = rest.next().ok_or_else(|| {
                        clap::Error::raw(
                            ErrorKind::InvalidValue,
                            format!("a value is required for '{arg}'\n"),
                        )
                    })?;
                    self.jobs = Some(parse_jobs(&value)?);
                }
                other => match inline_jobs(other) {
                    Some(value) => self.jobs = Some(parse_jobs(value)?),
                    None => kept.push(arg.clone()),
                },
            }
        }
        if kept.iter().all(|t| t.starts_with('-')) {
            return Err(clap::Error::raw(
                ErrorKind::MissingRequiredArgument,
                "at least one formula name is required\n",
            ));
        }
        self.targets = kept;
        Ok(())
    }

    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(jobs) = self.jobs {
            config.jobs = jobs.max(1);
        }
        if self.store_bottles {
            config.store_bottles = true;
        }
    }

    #[instrument(skip(self, config), fields(targets = ?self.targets))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let flags = PipelineFlags {
            build_from_source: self.build_from_source,
            run_tests: self.run_tests,
            store_bottles: config.store_bottles,
        };
        let names: Vec<String> = self.names().into_iter().map(String::from).collect();
        let options: Vec<String> = self.option_flags().into_iter().map(String::from).collect();
        runner::run_pipeline(&names, &options, config, &flags).await
    }
}

fn inline_jobs(arg: &str) -> Option<&str> {
    arg.strip_prefix("--jobs=").or_else(|| {
        arg.strip_prefix("-j")
            .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
    })
}

fn parse_jobs(value: &str) -> std::result::Result<usize, clap::Error> {
    value.parse().map_err(|_| {
        clap::Error::raw(
            ErrorKind::InvalidValue,
            format!("invalid value '{value}' for '--jobs <N>'\n"),
        )
    })
}
