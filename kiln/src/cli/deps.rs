// kiln/src/cli/deps.rs
use std::collections::HashSet;

use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::{BuildGraph, NodeId};
use kiln_common::error::Result;
use kiln_common::keg::KegRegistry;

use crate::pipeline::runner::plan_graph;

#[derive(Args, Debug)]
pub struct Deps {
    /// Formula names, optionally followed by build options
    #[arg(
        required = true,
        value_name = "NAME|OPTION",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    targets: Vec<String>,

    /// Print the graph as a tree below each requested formula
    #[arg(long)]
    pub tree: bool,

    /// Include test-only dependencies of the requested formulas
    #[arg(long)]
    pub include_test: bool,
}

impl Deps {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let (names, flags): (Vec<String>, Vec<String>) =
            self.targets.iter().cloned().partition(|t| !t.starts_with('-'));
        let (graph, warnings) = plan_graph(config, &names, &flags, self.include_test)?;
        for warning in warnings {
            eprintln!("{} {}", "Warning:".yellow().bold(), warning);
        }
        let registry = KegRegistry::new(config.clone());

        if self.tree {
            for root in graph.roots() {
                print_tree(&graph, *root, 0, &mut HashSet::new(), &registry);
            }
            return Ok(());
        }

        for id in graph.topological_order() {
            println!("{}", node_line(&graph, id, &registry));
        }
        Ok(())
    }
}

fn node_line(graph: &BuildGraph, id: NodeId, registry: &KegRegistry) -> String {
    let node = graph.node(id);
    let mut line = format!(
        "{} {}",
        node.name().bold(),
        node.formula.version_str_full()
    );
    if !node.options.is_empty() && !node.uses_default_options() {
        line.push_str(&format!(" [{}]", node.options));
    }
    line.push_str(&format!(" ({})", node.short_identity()).dimmed().to_string());
    if matches!(registry.installed_for_node(node), Ok(Some(_))) {
        line.push_str(&format!(" {}", "✔".green()));
    }
    line
}

fn print_tree(
    graph: &BuildGraph,
    id: NodeId,
    depth: usize,
    seen: &mut HashSet<NodeId>,
    registry: &KegRegistry,
) {
    let indent = "  ".repeat(depth);
    let line = node_line(graph, id, registry);
    if !seen.insert(id) {
        println!("{indent}{line} {}", "(see above)".dimmed());
        return;
    }
    println!("{indent}{line}");
    for prereq in graph.prerequisites(id) {
        print_tree(graph, *prereq, depth + 1, seen, registry);
    }
}
