// kiln-common/src/dependency/graph.rs
// Expands dependency declarations into a DAG of build nodes.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::error::{KilnError, Result};
use crate::formulary::FormulaRegistry;
use crate::model::environment::{BuildSettings, NodeEnvironment};
use crate::model::formula::Formula;
use crate::model::option::{resolve_options, OptionSet, UnknownOptionWarning};

/// Index of a node inside its [`BuildGraph`]. Indices follow topological
/// order: every prerequisite has a smaller id than its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A formula resolved to one option set and environment.
#[derive(Debug, Clone)]
pub struct BuildNode {
    pub formula: Arc<Formula>,
    pub options: OptionSet,
    pub env: NodeEnvironment,
    /// Hex SHA-256 over formula id, canonical options and env fingerprint.
    pub identity: String,
    prerequisites: Vec<NodeId>,
}

impl BuildNode {
    pub fn name(&self) -> &str {
        &self.formula.name
    }

    pub fn uses_default_options(&self) -> bool {
        self.options == self.formula.default_options()
    }

    pub fn short_identity(&self) -> &str {
        &self.identity[..8.min(self.identity.len())]
    }
}

impl fmt::Display for BuildNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uses_default_options() {
            write!(f, "{}", self.formula.name)
        } else {
            write!(f, "{} [{}]", self.formula.name, self.options)
        }
    }
}

pub fn node_identity(formula: &Formula, options: &OptionSet, env: &NodeEnvironment) -> String {
    let mut hasher = Sha256::new();
    let id = formula.id();
    let canonical = options.canonical();
    let fingerprint = env.fingerprint();
    for part in [&id.name, &id.version, &canonical, &fingerprint] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    pub settings: BuildSettings,
    /// Follow test-only dependencies of the requested roots.
    pub include_test: bool,
}

#[derive(Debug, Clone)]
pub struct BuildGraph {
    nodes: Vec<BuildNode>,
    dependents: Vec<Vec<NodeId>>,
    roots: Vec<NodeId>,
    warnings: Vec<UnknownOptionWarning>,
}

impl BuildGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &BuildNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&BuildNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &BuildNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Dependencies before dependents; ties follow declaration order.
    pub fn topological_order(&self) -> Vec<NodeId> {
        (0..self.nodes.len()).map(NodeId).collect()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        self.roots.contains(&id)
    }

    /// Direct prerequisites, in declaration order.
    pub fn prerequisites(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].prerequisites
    }

    /// Direct dependents.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id.0]
    }

    /// Every node that reaches `id`, in topological order.
    pub fn dependents_transitive(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue: VecDeque<NodeId> = self.dependents(id).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen[next.0] {
                continue;
            }
            seen[next.0] = true;
            queue.extend(self.dependents(next).iter().copied());
        }
        seen.iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    pub fn find(&self, name: &str) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.formula.name == name)
            .map(|(id, _)| id)
            .collect()
    }

    /// Option warnings raised while resolving forwarded dependency flags.
    pub fn warnings(&self) -> &[UnknownOptionWarning] {
        &self.warnings
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    name: String,
    options: String,
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    InProgress,
    Done(NodeId),
}

struct GraphBuilder<'a, R: FormulaRegistry + ?Sized> {
    registry: &'a R,
    opts: &'a GraphOptions,
    marks: HashMap<NodeKey, Mark>,
    stack: Vec<String>,
    nodes: Vec<BuildNode>,
    warnings: Vec<UnknownOptionWarning>,
}

impl<'a, R: FormulaRegistry + ?Sized> GraphBuilder<'a, R> {
    fn cycle_error(&self, name: &str) -> KilnError {
        let start = self.stack.iter().position(|n| n == name).unwrap_or(0);
        let mut path: Vec<String> = self.stack[start..].to_vec();
        path.push(name.to_string());
        error!("Dependency cycle detected: {}", path.join(" -> "));
        KilnError::CyclicDependency(path)
    }

    fn visit(
        &mut self,
        formula: Arc<Formula>,
        options: OptionSet,
        is_root: bool,
    ) -> Result<NodeId> {
        let key = NodeKey {
            name: formula.name.clone(),
            options: options.canonical(),
        };
        // Reaching the same formula under any option set loops, even when
        // that variant is already finished.
        if self.stack.iter().any(|n| n == &formula.name) {
            return Err(self.cycle_error(&formula.name));
        }
        match self.marks.get(&key) {
            Some(Mark::Done(id)) => return Ok(*id),
            Some(Mark::InProgress) => return Err(self.cycle_error(&formula.name)),
            None => {}
        }

        debug!("Expanding '{}' with options [{}]", formula.name, options);
        self.marks.insert(key.clone(), Mark::InProgress);
        self.stack.push(formula.name.clone());

        let include_test = is_root && self.opts.include_test;
        let mut prerequisites = Vec::new();
        for dep in formula.dependencies_for(&options, include_test) {
            let dep_formula = self.registry.lookup(&dep.name)?.ok_or_else(|| {
                error!(
                    "Dependency '{}' of '{}' is not in the registry",
                    dep.name, formula.name
                );
                KilnError::UnresolvedDependency {
                    dependency: dep.name.clone(),
                    required_by: formula.name.clone(),
                }
            })?;
            let resolved = resolve_options(&dep_formula, &dep.options);
            self.warnings.extend(resolved.warnings);
            debug!(
                "Edge '{}' -> '{}' (tags {}, forwarded {:?})",
                formula.name, dep.name, dep.tags, dep.options
            );
            let id = self.visit(dep_formula, resolved.options, false)?;
            if !prerequisites.contains(&id) {
                prerequisites.push(id);
            }
        }

        self.stack.pop();
        let env = NodeEnvironment::for_formula(&self.opts.settings, &formula, &options);
        let identity = node_identity(&formula, &options, &env);
        let id = NodeId(self.nodes.len());
        debug!("Node {} = {} ({})", id, formula.name, &identity[..8]);
        self.nodes.push(BuildNode {
            formula,
            options,
            env,
            identity,
            prerequisites,
        });
        self.marks.insert(key, Mark::Done(id));
        Ok(id)
    }
}

/// Expands `root` under `options` into a build graph.
pub fn build_graph<R: FormulaRegistry + ?Sized>(
    root: Arc<Formula>,
    options: OptionSet,
    registry: &R,
    opts: &GraphOptions,
) -> Result<BuildGraph> {
    build_graph_for_roots(vec![(root, options)], registry, opts)
}

/// Expands several requested formulas into one graph sharing common nodes.
pub fn build_graph_for_roots<R: FormulaRegistry + ?Sized>(
    roots: Vec<(Arc<Formula>, OptionSet)>,
    registry: &R,
    opts: &GraphOptions,
) -> Result<BuildGraph> {
    let mut builder = GraphBuilder {
        registry,
        opts,
        marks: HashMap::new(),
        stack: Vec::new(),
        nodes: Vec::new(),
        warnings: Vec::new(),
    };
    let mut root_ids = Vec::new();
    for (formula, options) in roots {
        let id = builder.visit(formula, options, true)?;
        if !root_ids.contains(&id) {
            root_ids.push(id);
        }
    }

    let mut dependents = vec![Vec::new(); builder.nodes.len()];
    for (i, node) in builder.nodes.iter().enumerate() {
        for prereq in &node.prerequisites {
            dependents[prereq.0].push(NodeId(i));
        }
    }
    debug!(
        "Build graph complete: {} node(s), roots {:?}",
        builder.nodes.len(),
        root_ids
    );
    Ok(BuildGraph {
        nodes: builder.nodes,
        dependents,
        roots: root_ids,
        warnings: builder.warnings,
    })
}
