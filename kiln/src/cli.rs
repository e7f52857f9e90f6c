// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::ffi::OsString;

use clap::{ArgAction, Parser, Subcommand};
use kiln_common::config::Config;
use kiln_common::error::Result;

pub mod deps;
pub mod info;
pub mod install;
pub mod list;
pub mod status;
pub mod uninstall;

use crate::cli::deps::Deps;
use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::uninstall::Uninstall;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl CliArgs {
    /// Like `Parser::parse`, but also recovers install flags written after
    /// a formula name, which clap leaves among the build options.
    pub fn parse_args() -> Self {
        Self::try_parse_args(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    pub fn try_parse_args<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut parsed = Self::try_parse_from(args)?;
        if let Command::Install(install) = &mut parsed.command {
            install.lift_install_flags()?;
        }
        Ok(parsed)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build and install formulas together with their dependencies
    Install(InstallArgs),
    /// Show the resolved build graph of formulas
    Deps(Deps),
    /// Show a formula's options, dependencies and installed kegs
    Info(Info),
    /// List installed kegs
    List(List),
    /// Remove installed kegs and their links
    Uninstall(Uninstall),
}

impl Command {
    /// Lets command flags override environment configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Self::Install(args) = self {
            args.apply_overrides(config);
        }
    }

    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config).await,
            Self::Deps(command) => command.run(config).await,
            Self::Info(command) => command.run(config).await,
            Self::List(command) => command.run(config).await,
            Self::Uninstall(command) => command.run(config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn install_splits_names_from_build_options() {
        let args = CliArgs::try_parse_args([
            "kiln",
            "-v",
            "install",
            "--jobs",
            "3",
            "--store-bottles",
            "boost",
            "--with-icu",
            "zlib",
            "--without-static",
        ])
        .unwrap();
        assert_eq!(args.verbose, 1);
        let Command::Install(install) = args.command else {
            panic!("expected install");
        };
        assert_eq!(install.names(), vec!["boost", "zlib"]);
        assert_eq!(install.option_flags(), vec!["--with-icu", "--without-static"]);
        assert_eq!(install.jobs, Some(3));
        assert!(install.store_bottles);
        assert!(!install.build_from_source);
    }

    #[test]
    fn install_flags_after_a_name_are_not_build_options() {
        let args = CliArgs::try_parse_args([
            "kiln",
            "install",
            "boost",
            "--jobs",
            "3",
            "--build-from-source",
            "--with-icu",
            "--test",
            "-j4",
            "zlib",
            "--store-bottles",
        ])
        .unwrap();
        let Command::Install(install) = args.command else {
            panic!("expected install");
        };
        assert_eq!(install.names(), vec!["boost", "zlib"]);
        assert_eq!(install.option_flags(), vec!["--with-icu"]);
        assert_eq!(install.jobs, Some(4));
        assert!(install.build_from_source);
        assert!(install.run_tests);
        assert!(install.store_bottles);

        let args = CliArgs::try_parse_args(["kiln", "install", "boost", "--jobs=2"]).unwrap();
        let Command::Install(install) = args.command else {
            panic!("expected install");
        };
        assert_eq!(install.jobs, Some(2));
        assert!(install.option_flags().is_empty());
    }

    #[test]
    fn trailing_install_flags_are_validated() {
        assert!(CliArgs::try_parse_args(["kiln", "install", "boost", "--jobs"]).is_err());
        assert!(CliArgs::try_parse_args(["kiln", "install", "boost", "--jobs", "many"]).is_err());
    }

    #[test]
    fn install_requires_a_name() {
        assert!(CliArgs::try_parse_args(["kiln", "install"]).is_err());
    }

    #[test]
    fn jobs_override_reaches_the_config() {
        let args = CliArgs::try_parse_args(["kiln", "install", "--jobs", "2", "zlib"]).unwrap();
        let mut config = Config::with_root("/tmp/kiln-cli");
        args.command.apply_overrides(&mut config);
        assert_eq!(config.jobs, 2);
    }

    #[test]
    fn uninstall_and_deps_parse() {
        assert!(CliArgs::try_parse_from(["kiln", "uninstall", "zlib", "png"]).is_ok());
        assert!(CliArgs::try_parse_from(["kiln", "deps", "--tree", "boost"]).is_ok());
        assert!(CliArgs::try_parse_from(["kiln", "info", "boost"]).is_ok());
        assert!(CliArgs::try_parse_from(["kiln", "list", "--versions"]).is_ok());
    }
}
