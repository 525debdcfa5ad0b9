//! Dependency graph over the jobs of a pipeline.

use fastci_core::pipeline::PipelineDocument;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("Cycle detected in job dependencies at '{0}'")]
    CycleDetected(String),
    #[error("Job '{node}' depends on unknown job '{dependency}'")]
    UnknownDependency { node: String, dependency: String },
    #[error("Duplicate job name: {0}")]
    DuplicateNode(String),
    #[error("Empty pipeline")]
    Empty,
}

impl From<DagError> for fastci_core::Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::CycleDetected(name) => fastci_core::Error::CycleDetected(name),
            DagError::UnknownDependency { node, dependency } => fastci_core::Error::UnknownParent {
                job: node,
                parent: dependency,
            },
            DagError::DuplicateNode(name) => fastci_core::Error::DuplicateJobName(name),
            DagError::Empty => {
                fastci_core::Error::InvalidPipeline("a pipeline needs at least one job".into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Untouched,
    InProgress,
    Done,
}

/// Jobs as nodes, with an edge from every parent to each of its children.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build from `(name, parent names)` pairs.
    pub fn build<I>(nodes: I) -> Result<Self, DagError>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let nodes: Vec<(String, Vec<String>)> = nodes.into_iter().collect();
        if nodes.is_empty() {
            return Err(DagError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for (name, _) in &nodes {
            if index.contains_key(name) {
                return Err(DagError::DuplicateNode(name.clone()));
            }
            let idx = graph.add_node(name.clone());
            index.insert(name.clone(), idx);
        }

        for (name, parents) in &nodes {
            let child = index[name];
            for parent in parents {
                let parent_idx =
                    index
                        .get(parent)
                        .copied()
                        .ok_or_else(|| DagError::UnknownDependency {
                            node: name.clone(),
                            dependency: parent.clone(),
                        })?;
                graph.update_edge(parent_idx, child, ());
            }
        }

        Ok(Self { graph, index })
    }

    pub fn from_document(doc: &PipelineDocument) -> Result<Self, DagError> {
        Self::build(doc.jobs.iter().map(|job| {
            (
                job.name.clone(),
                doc.parents_of(&job.name).to_vec(),
            )
        }))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Jobs without parents, sorted by name.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].as_str())
            .collect();
        roots.sort_unstable();
        roots
    }

    pub fn parents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    pub fn children(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .map(|n| self.graph[n].as_str())
                    .collect()
            })
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    /// Reverse DFS finish order. Walks with an explicit stack so deep chains
    /// cannot overflow the call stack.
    fn topological_order(&self) -> Result<Vec<NodeIndex>, DagError> {
        let mut marks = vec![Mark::Untouched; self.graph.node_count()];
        let mut finished = Vec::with_capacity(self.graph.node_count());

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Untouched {
                continue;
            }

            marks[start.index()] = Mark::InProgress;
            let mut stack = vec![(
                start,
                self.graph
                    .neighbors_directed(start, Direction::Outgoing)
                    .detach(),
            )];

            while let Some((node, walker)) = stack.last_mut() {
                let node = *node;
                match walker.next_node(&self.graph) {
                    Some(next) => match marks[next.index()] {
                        Mark::Untouched => {
                            marks[next.index()] = Mark::InProgress;
                            stack.push((
                                next,
                                self.graph
                                    .neighbors_directed(next, Direction::Outgoing)
                                    .detach(),
                            ));
                        }
                        Mark::InProgress => {
                            return Err(DagError::CycleDetected(self.graph[next].clone()));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        finished.push(node);
                        stack.pop();
                    }
                }
            }
        }

        finished.reverse();
        Ok(finished)
    }

    /// Fail if the graph has a cycle.
    pub fn check_acyclic(&self) -> Result<(), DagError> {
        self.topological_order().map(|_| ())
    }

    /// Topological layers: layer 0 has no parents, layer k holds the jobs
    /// whose deepest parent sits in layer k - 1. Names are sorted per layer.
    pub fn layers(&self) -> Result<Vec<Vec<String>>, DagError> {
        let order = self.topological_order()?;
        let mut depth = vec![0usize; self.graph.node_count()];

        for &node in &order {
            depth[node.index()] = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|parent| depth[parent.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut layers: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for node in order {
            layers
                .entry(depth[node.index()])
                .or_default()
                .push(self.graph[node].clone());
        }

        Ok(layers
            .into_values()
            .map(|mut layer| {
                layer.sort_unstable();
                layer
            })
            .collect())
    }
}
