// kiln/src/cli/info.rs
//! Contains the logic for the `info` command.
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::keg::KegRegistry;
use kiln_common::model::Formula;
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,

    /// Print the parsed recipe as JSON instead
    #[arg(long)]
    pub json: bool,
}

impl Info {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let formulary = Formulary::new(config);
        let formula = match formulary.load_formula(&self.name) {
            Ok(formula) => formula,
            Err(e @ KilnError::NotFound(_)) => {
                let known = formulary.available()?;
                if !known.is_empty() {
                    let names: Vec<&str> = known.iter().map(String::as_str).collect();
                    eprintln!("{} {}", "Available formulas:".dimmed(), names.join(", "));
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(formula.as_ref())?);
            return Ok(());
        }
        print_formula_info(&formula);
        print_installed(&formula.name, config)?;
        Ok(())
    }
}

fn print_formula_info(formula: &Formula) {
    println!(
        "{} {}",
        formula.name.green().bold(),
        formula.version_str_full()
    );
    if let Some(desc) = &formula.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &formula.homepage {
        println!("{}", homepage.blue().underline());
    }
    if let Some(reason) = &formula.keg_only {
        println!("{} {}", "Keg-only:".yellow(), reason);
    }
    if !formula.url.is_empty() {
        println!("{} {}", "Source:".bold(), formula.url);
    }

    if !formula.options.is_empty() {
        println!("\n{}", "Options".bold());
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        for decl in &formula.options {
            table.add_row(Row::new(vec![
                Cell::new(&decl.flag()).style_spec("Fc"),
                Cell::new(&format!("(default: {})", decl.default)),
                Cell::new(&decl.description),
            ]));
        }
        table.printstd();
    }

    if !formula.deprecated_options.is_empty() {
        println!("\n{}", "Deprecated options".bold());
        for (old, new) in formula.deprecated_options.iter() {
            println!("  --{old} {} --{new}", "→".dimmed());
        }
    }

    if !formula.dependencies.is_empty() {
        println!("\n{}", "Dependencies".bold());
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        for dep in &formula.dependencies {
            let mut notes = vec![dep.tags.to_string()];
            if !dep.when.is_always() {
                notes.push(format!("when {}", dep.when));
            }
            if !dep.options.is_empty() {
                notes.push(format!("with {}", dep.options.join(" ")));
            }
            table.add_row(Row::new(vec![
                Cell::new(&dep.name).style_spec("Fb"),
                Cell::new(&notes.join("; ")),
            ]));
        }
        table.printstd();
    }

    if !formula.bottle.files.is_empty() {
        let platforms: Vec<&str> = formula.bottle.files.keys().map(String::as_str).collect();
        println!("\n{} {}", "Bottles:".bold(), platforms.join(", "));
    }
}

fn print_installed(name: &str, config: &Config) -> Result<()> {
    let kegs = KegRegistry::new(config.clone()).kegs_of(name)?;
    if kegs.is_empty() {
        println!("\n{}", "Not installed".dimmed());
        return Ok(());
    }
    println!("\n{}", "Installed".bold());
    for keg in kegs {
        let options = keg
            .receipt()
            .ok()
            .flatten()
            .map(|r| r.options.to_string())
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| "default options".to_string());
        println!("  {} ({})", keg.path.display(), options);
    }
    Ok(())
}
