// kiln/src/cli/list.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::{InstallSource, KegRegistry};
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct List {
    /// Also show the options and install source of every keg
    #[arg(long)]
    pub versions: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let kegs = KegRegistry::new(config.clone()).list_installed_kegs()?;
        if kegs.is_empty() {
            println!("{}", "0 formulas installed".yellow());
            return Ok(());
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        let mut header = vec![
            Cell::new("Name").style_spec("b"),
            Cell::new("Keg").style_spec("b"),
        ];
        if self.versions {
            header.push(Cell::new("Options").style_spec("b"));
            header.push(Cell::new("Source").style_spec("b"));
        }
        table.add_row(Row::new(header));

        for keg in &kegs {
            let mut row = vec![
                Cell::new(&keg.name).style_spec("Fb"),
                Cell::new(&keg.version_str),
            ];
            if self.versions {
                let receipt = keg.receipt().ok().flatten();
                let options = receipt
                    .as_ref()
                    .map(|r| r.options.to_string())
                    .unwrap_or_default();
                let source = match receipt.map(|r| r.source) {
                    Some(InstallSource::Source) => "source".to_string(),
                    Some(InstallSource::Cache { digest }) => {
                        format!("cache {}", digest.chars().take(12).collect::<String>())
                    }
                    Some(InstallSource::Bottle { .. }) => "bottle".to_string(),
                    None => "unknown".to_string(),
                };
                row.push(Cell::new(&options));
                row.push(Cell::new(&source));
            }
            table.add_row(Row::new(row));
        }
        table.printstd();

        let mut names: Vec<&str> = kegs.iter().map(|k| k.name.as_str()).collect();
        names.dedup();
        println!(
            "{}",
            format!("{} formulas installed ({} kegs)", names.len(), kegs.len()).bold()
        );
        Ok(())
    }
}
