//! Dependency-ordered scheduling.
//!
//! Builds a directed graph over the requested apps and their transitive
//! dependencies, then orders it so every app appears after all of its
//! dependencies. A synthetic root node ties the requested apps together so
//! only their closure is returned.

use std::collections::{BTreeMap, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
  /// The dependency graph contains a cycle.
  #[error("apps could not be sorted in dependency order: the dependency graph contains a cycle")]
  Cycle,
}

const ROOT: &str = "__deploy__";

/// Order the transitive closure of `roots` so dependencies come first.
///
/// `dependencies` maps app name to the names it depends on; names that only
/// appear as dependencies are still included in the result. Apps with no
/// ordering constraint between them come out in name order, so the result is
/// deterministic for a given input.
pub fn dependency_order(
  dependencies: &BTreeMap<String, Vec<String>>,
  roots: &[String],
) -> Result<Vec<String>, GraphError> {
  let mut graph: DiGraph<String, ()> = DiGraph::new();
  let mut nodes: BTreeMap<String, NodeIndex> = BTreeMap::new();

  fn node(graph: &mut DiGraph<String, ()>, nodes: &mut BTreeMap<String, NodeIndex>, name: &str) -> NodeIndex {
    if let Some(&idx) = nodes.get(name) {
      return idx;
    }
    let idx = graph.add_node(name.to_string());
    nodes.insert(name.to_string(), idx);
    idx
  }

  let root = node(&mut graph, &mut nodes, ROOT);

  for requested in roots {
    let idx = node(&mut graph, &mut nodes, requested);
    graph.add_edge(idx, root, ());
  }

  // Edge dependency -> dependent, so in-degree zero means "ready to deploy".
  for (app, deps) in dependencies {
    let app_idx = node(&mut graph, &mut nodes, app);
    for dep in deps {
      let dep_idx = node(&mut graph, &mut nodes, dep);
      graph.add_edge(dep_idx, app_idx, ());
    }
  }

  // The closure of the requested apps: everything the root transitively
  // depends on, found by walking the graph backwards from the root.
  let reversed = Reversed(&graph);
  let mut reachable = vec![false; graph.node_count()];
  let mut dfs = Dfs::new(&reversed, root);
  while let Some(idx) = dfs.next(&reversed) {
    reachable[idx.index()] = true;
  }

  // Kahn's algorithm, releasing ready nodes in name order per round.
  let mut in_degree: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|idx| (idx, graph.neighbors_directed(idx, Direction::Incoming).count()))
    .collect();

  let mut remaining = nodes;
  let mut order: Vec<NodeIndex> = Vec::new();

  while !remaining.is_empty() {
    let ready: Vec<(String, NodeIndex)> = remaining
      .iter()
      .filter(|(_, idx)| in_degree[idx] == 0)
      .map(|(name, idx)| (name.clone(), *idx))
      .collect();

    if ready.is_empty() {
      return Err(GraphError::Cycle);
    }

    for (name, idx) in ready {
      remaining.remove(&name);
      order.push(idx);
      for dependent in graph.neighbors_directed(idx, Direction::Outgoing) {
        if let Some(degree) = in_degree.get_mut(&dependent) {
          *degree = degree.saturating_sub(1);
        }
      }
    }
  }

  Ok(
    order
      .into_iter()
      .filter(|idx| reachable[idx.index()] && *idx != root)
      .map(|idx| graph[idx].clone())
      .collect(),
  )
}
