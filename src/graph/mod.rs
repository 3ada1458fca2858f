//! Artifact graph data model: specifications, dependency edges, cycle
//! detection and wave computation. No I/O happens here.
//!
//! Planning is treated as a DAG problem: instead of decomposing a goal from
//! trunk to leaves, all leaf artifacts are identified up front and execution
//! converges upward. Waves are maximal sets of artifacts whose dependencies
//! are already satisfied, so every wave can run in parallel.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::errors::{EngineError, Result};
use crate::core::limits::ExecutionLimits;

/// Coarse cost/capability bucket for the content-generation capability.
///
/// A closed set on purpose: tier selection is a pure function of graph
/// shape, not open-ended dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Small => write!(f, "small"),
            ModelTier::Medium => write!(f, "medium"),
            ModelTier::Large => write!(f, "large"),
        }
    }
}

/// Specification for one unit of planned work.
///
/// The spec is the contract (what must exist); the artifact is the
/// implementation (the generated content). `contract` is free text consumed
/// by verification, never parsed structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Stable identifier, unique within a graph.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// What this artifact must satisfy (interface description, outline).
    pub contract: String,
    /// File path this artifact creates or modifies, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces_file: Option<PathBuf>,
    /// Ids of artifacts that must exist before this one can be created.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Optional domain tag ("protocol", "schema", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_type: Option<String>,
    /// Opaque domain-specific data.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl ArtifactSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            contract: String::new(),
            produces_file: None,
            requires: BTreeSet::new(),
            domain_type: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = contract.into();
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_produces_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces_file = Some(path.into());
        self
    }

    /// Leaves have no dependencies and form the first wave.
    pub fn is_leaf(&self) -> bool {
        self.requires.is_empty()
    }
}

/// One execution wave: artifact ids whose dependencies are all satisfied by
/// earlier waves. Sorted for deterministic output.
pub type Wave = Vec<String>;

/// Serialized shape of a graph. Adjacency is derived, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphData {
    artifacts: BTreeMap<String, ArtifactSpec>,
}

/// Directed acyclic graph of artifact specifications.
///
/// Single-writer-then-freeze discipline: `add` is not concurrency-safe and
/// must be externally serialized; once `freeze` succeeds the graph is
/// read-only and safe to share across concurrent readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphData", into = "GraphData")]
pub struct ArtifactGraph {
    specs: HashMap<String, ArtifactSpec>,
    /// Edge direction: dependency -> dependent.
    adjacency: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    /// Requirers of ids that have not been added yet.
    pending: HashMap<String, HashSet<String>>,
    frozen: bool,
    max_artifacts: Option<usize>,
    max_depth: Option<usize>,
    max_discovery_rounds: Option<usize>,
    discovery_rounds: usize,
}

impl Default for ArtifactGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactGraph {
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
            adjacency: DiGraph::new(),
            index: HashMap::new(),
            pending: HashMap::new(),
            frozen: false,
            max_artifacts: None,
            max_depth: None,
            max_discovery_rounds: None,
            discovery_rounds: 0,
        }
    }

    /// A graph that rejects growth past `limit` artifacts.
    pub fn with_limit(limit: usize) -> Self {
        let mut graph = Self::new();
        graph.max_artifacts = Some(limit);
        graph
    }

    /// A graph enforcing the size, depth, and discovery-round caps from a
    /// limits object.
    pub fn with_limits(limits: &ExecutionLimits) -> Self {
        let mut graph = Self::new();
        graph.max_artifacts = Some(limits.max_artifacts);
        graph.max_depth = Some(limits.max_depth);
        graph.max_discovery_rounds = Some(limits.max_discovery_rounds);
        graph
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    pub fn get(&self, id: &str) -> Result<&ArtifactSpec> {
        self.specs.get(id).ok_or_else(|| EngineError::ArtifactNotFound {
            artifact_id: id.to_string(),
        })
    }

    /// Add one artifact. Atomic: on any error the graph is unchanged.
    pub fn add(&mut self, spec: ArtifactSpec) -> Result<()> {
        if self.frozen {
            return Err(EngineError::GraphFrozen);
        }
        if self.specs.contains_key(&spec.id) {
            return Err(EngineError::DuplicateArtifact {
                artifact_id: spec.id,
            });
        }
        if spec.requires.contains(&spec.id) {
            return Err(EngineError::CyclicDependency {
                cycle: vec![spec.id],
            });
        }
        if let Some(limit) = self.max_artifacts {
            if self.specs.len() + 1 > limit {
                return Err(EngineError::GraphExplosion {
                    count: self.specs.len() + 1,
                    limit,
                });
            }
        }

        // Cycle check against the specs map before touching adjacency, so a
        // rejected add leaves no trace. Only edges among existing nodes can
        // close a cycle.
        if let Some(cycle) = self.would_cycle(&spec) {
            return Err(EngineError::CyclicDependency { cycle });
        }

        let id = spec.id.clone();
        let idx = self.adjacency.add_node(id.clone());
        self.index.insert(id.clone(), idx);

        for dep in &spec.requires {
            match self.index.get(dep) {
                Some(&dep_idx) => {
                    self.adjacency.add_edge(dep_idx, idx, ());
                }
                None => {
                    self.pending
                        .entry(dep.clone())
                        .or_default()
                        .insert(id.clone());
                }
            }
        }

        // Resolve dangling references from earlier adds that required us.
        if let Some(requirers) = self.pending.remove(&id) {
            for requirer in requirers {
                if let Some(&req_idx) = self.index.get(&requirer) {
                    self.adjacency.add_edge(idx, req_idx, ());
                }
            }
        }

        self.specs.insert(id, spec);
        Ok(())
    }

    pub fn add_all(&mut self, specs: impl IntoIterator<Item = ArtifactSpec>) -> Result<()> {
        for spec in specs {
            self.add(spec)?;
        }
        Ok(())
    }

    /// Walk `requires` edges from the candidate through existing specs; a
    /// path back to the candidate names a cycle.
    fn would_cycle(&self, candidate: &ArtifactSpec) -> Option<Vec<String>> {
        // Simulated spec lookup with the candidate included.
        let lookup = |id: &str| -> Option<&BTreeSet<String>> {
            if id == candidate.id {
                Some(&candidate.requires)
            } else {
                self.specs.get(id).map(|s| &s.requires)
            }
        };

        let mut stack: Vec<(String, Vec<String>)> = vec![(candidate.id.clone(), vec![])];
        let mut visited: HashSet<String> = HashSet::new();

        while let Some((node, path)) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            let mut next_path = path.clone();
            next_path.push(node.clone());
            if let Some(requires) = lookup(&node) {
                for dep in requires {
                    if dep == &candidate.id {
                        return Some(next_path);
                    }
                    if self.specs.contains_key(dep) {
                        stack.push((dep.clone(), next_path.clone()));
                    }
                }
            }
        }
        None
    }

    /// Ids that depend directly on `id`. Used for invalidation cascades.
    pub fn dependents(&self, id: &str) -> HashSet<String> {
        match self.index.get(id) {
            Some(&idx) => self
                .adjacency
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
                .map(|n| self.adjacency[n].clone())
                .collect(),
            None => HashSet::new(),
        }
    }

    /// Longest dependency chain below `id`. Leaves are depth 0.
    pub fn depth(&self, id: &str) -> usize {
        fn walk(graph: &ArtifactGraph, id: &str, memo: &mut HashMap<String, usize>) -> usize {
            if let Some(&d) = memo.get(id) {
                return d;
            }
            let d = match graph.specs.get(id) {
                Some(spec) if !spec.requires.is_empty() => {
                    1 + spec
                        .requires
                        .iter()
                        .filter(|r| graph.specs.contains_key(*r))
                        .map(|r| walk(graph, r, memo))
                        .max()
                        .unwrap_or(0)
                }
                _ => 0,
            };
            memo.insert(id.to_string(), d);
            d
        }
        walk(self, id, &mut HashMap::new())
    }

    pub fn fan_in(&self, id: &str) -> usize {
        self.specs.get(id).map_or(0, |s| s.requires.len())
    }

    pub fn fan_out(&self, id: &str) -> usize {
        self.dependents(id).len()
    }

    /// Artifacts with no dependencies; the first wave.
    pub fn leaves(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .specs
            .values()
            .filter(|s| s.is_leaf())
            .map(|s| s.id.clone())
            .collect();
        out.sort();
        out
    }

    /// Artifacts nothing depends on; the convergence points.
    pub fn roots(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .specs
            .keys()
            .filter(|id| self.fan_out(id) == 0)
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Dangling `requires` references and over-deep chains. Empty means the
    /// graph is executable.
    pub fn validate(&self) -> Result<()> {
        for spec in self.specs.values() {
            let missing: Vec<String> = spec
                .requires
                .iter()
                .filter(|r| !self.specs.contains_key(*r))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(EngineError::MissingDependency {
                    artifact_id: spec.id.clone(),
                    missing,
                });
            }
        }
        if let Some(limit) = self.max_depth {
            for id in self.specs.keys() {
                let depth = self.depth(id);
                if depth > limit {
                    return Err(EngineError::DepthExceeded {
                        artifact_id: id.clone(),
                        depth,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate and make the graph read-only. Execution requires a frozen
    /// graph; dangling references are a construction error, never a runtime
    /// surprise.
    pub fn freeze(&mut self) -> Result<()> {
        self.validate()?;
        self.frozen = true;
        Ok(())
    }

    /// Group artifacts into parallel execution waves (Kahn-style in-degree
    /// reduction, O(V+E)). Every node lands in exactly one wave and strictly
    /// after all of its dependencies.
    pub fn execution_waves(&self) -> Result<Vec<Wave>> {
        // Defensive re-check; `add` should have made cycles impossible.
        if is_cyclic_directed(&self.adjacency) {
            return Err(EngineError::CyclicDependency {
                cycle: self.detect_cycle().unwrap_or_default(),
            });
        }

        let mut in_degree: HashMap<&str, usize> = self
            .specs
            .values()
            .map(|spec| {
                let deg = spec
                    .requires
                    .iter()
                    .filter(|r| self.specs.contains_key(*r))
                    .count();
                (spec.id.as_str(), deg)
            })
            .collect();

        let mut waves: Vec<Wave> = Vec::new();
        let mut current: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| id.to_string())
            .collect();
        let mut assigned = 0usize;

        while !current.is_empty() {
            current.sort();
            assigned += current.len();

            let mut next: Vec<String> = Vec::new();
            for id in &current {
                for dependent in self.dependents(id) {
                    let deg = in_degree
                        .get_mut(dependent.as_str())
                        .expect("dependent is a known node");
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(dependent);
                    }
                }
            }
            waves.push(std::mem::replace(&mut current, next));
        }

        if assigned != self.specs.len() {
            // Residual nodes mean a cycle survived the earlier checks.
            return Err(EngineError::CyclicDependency {
                cycle: self.detect_cycle().unwrap_or_else(|| {
                    let mut rest: Vec<String> = self
                        .specs
                        .keys()
                        .filter(|id| *in_degree.get(id.as_str()).unwrap_or(&0) > 0)
                        .cloned()
                        .collect();
                    rest.sort();
                    rest
                }),
            });
        }

        Ok(waves)
    }

    /// Waves for artifacts not yet completed, preserving the global wave
    /// ordering. Used by resume and by mid-execution extension.
    pub fn remaining_waves(&self, completed: &HashSet<String>) -> Result<Vec<Wave>> {
        let waves = self.execution_waves()?;
        Ok(waves
            .into_iter()
            .map(|wave| {
                wave.into_iter()
                    .filter(|id| !completed.contains(id))
                    .collect::<Wave>()
            })
            .filter(|wave| !wave.is_empty())
            .collect())
    }

    /// Three-color DFS reconstructing one dependency cycle, if any.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn dfs(
            graph: &ArtifactGraph,
            node: &str,
            color: &mut HashMap<String, Color>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            color.insert(node.to_string(), Color::Gray);
            path.push(node.to_string());

            if let Some(spec) = graph.specs.get(node) {
                for dep in &spec.requires {
                    if !graph.specs.contains_key(dep) {
                        continue;
                    }
                    match color.get(dep.as_str()).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            let start = path.iter().position(|p| p == dep).unwrap_or(0);
                            return Some(path[start..].to_vec());
                        }
                        Color::White => {
                            if let Some(cycle) = dfs(graph, dep, color, path) {
                                return Some(cycle);
                            }
                        }
                        Color::Black => {}
                    }
                }
            }

            path.pop();
            color.insert(node.to_string(), Color::Black);
            None
        }

        let mut color: HashMap<String, Color> = HashMap::new();
        for id in self.specs.keys() {
            if color.get(id.as_str()).copied().unwrap_or(Color::White) == Color::White {
                let mut path = Vec::new();
                if let Some(cycle) = dfs(self, id, &mut color, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Induced subgraph closed over transitive dependencies of `ids`. Used
    /// for partial re-execution.
    pub fn subgraph(&self, ids: &HashSet<String>) -> Result<ArtifactGraph> {
        let mut closure: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = ids
            .iter()
            .filter(|id| self.specs.contains_key(*id))
            .cloned()
            .collect();

        while let Some(id) = queue.pop_front() {
            if !closure.insert(id.clone()) {
                continue;
            }
            if let Some(spec) = self.specs.get(&id) {
                for dep in &spec.requires {
                    if self.specs.contains_key(dep) && !closure.contains(dep) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        let mut sub = ArtifactGraph::new();
        sub.max_artifacts = self.max_artifacts;
        // Insert in wave order so requires always precede requirers.
        for wave in self.execution_waves()? {
            for id in wave {
                if closure.contains(&id) {
                    sub.add(self.specs[&id].clone())?;
                }
            }
        }
        Ok(sub)
    }

    /// Accept new specs mid-execution, or reject the whole batch.
    ///
    /// `completed` marks the frozen wave boundary: new nodes may depend on
    /// completed nodes or on nodes still pending (same or later waves), but
    /// a batch is rejected if it introduces a cycle, a dangling reference,
    /// or pushes the graph past its size limit. On success the remaining
    /// waves are recomputed and returned.
    pub fn propose_extension(
        &mut self,
        new_specs: Vec<ArtifactSpec>,
        completed: &HashSet<String>,
    ) -> Result<Vec<Wave>> {
        if new_specs.is_empty() {
            return self.remaining_waves(completed);
        }
        if let Some(cap) = self.max_discovery_rounds {
            if self.discovery_rounds >= cap {
                return Err(EngineError::ExtensionRejected {
                    reason: format!("discovery round limit reached ({cap})"),
                });
            }
        }

        // Validate against a scratch copy so rejection leaves the graph
        // untouched; the frozen flag is lifted only on the copy.
        let mut trial = self.clone();
        trial.frozen = false;

        if let Some(limit) = trial.max_artifacts {
            let count = trial.specs.len() + new_specs.len();
            if count > limit {
                return Err(EngineError::GraphExplosion { count, limit });
            }
        }

        let new_ids: HashSet<String> = new_specs.iter().map(|s| s.id.clone()).collect();
        for spec in &new_specs {
            for dep in &spec.requires {
                if !trial.specs.contains_key(dep) && !new_ids.contains(dep) {
                    return Err(EngineError::ExtensionRejected {
                        reason: format!(
                            "artifact '{}' requires unknown artifact '{}'",
                            spec.id, dep
                        ),
                    });
                }
            }
        }

        // Intra-batch ordering: add leaves-first within the batch.
        let mut remaining = new_specs;
        while !remaining.is_empty() {
            let ready_at: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.requires
                        .iter()
                        .all(|r| trial.specs.contains_key(r) || !new_ids.contains(r))
                })
                .map(|(i, _)| i)
                .collect();
            if ready_at.is_empty() {
                let cycle: Vec<String> = remaining.iter().map(|s| s.id.clone()).collect();
                return Err(EngineError::CyclicDependency { cycle });
            }
            for i in ready_at.into_iter().rev() {
                let spec = remaining.swap_remove(i);
                trial.add(spec)?;
            }
        }
        trial.validate()?;
        trial.execution_waves()?;

        debug!(added = new_ids.len(), total = trial.specs.len(), "graph extension accepted");
        trial.frozen = self.frozen;
        trial.discovery_rounds = self.discovery_rounds + 1;
        *self = trial;
        self.remaining_waves(completed)
    }

    /// Mermaid rendering for plan inspection.
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];
        let mut ids: Vec<&String> = self.specs.keys().collect();
        ids.sort();
        for id in ids {
            let spec = &self.specs[id];
            let label: String = spec.description.chars().take(30).collect();
            lines.push(format!("    {}[\"{}: {}\"]", id, id, label.replace('"', "'")));
            for dep in &spec.requires {
                lines.push(format!("    {} --> {}", dep, id));
            }
        }
        lines.join("\n")
    }
}

impl TryFrom<GraphData> for ArtifactGraph {
    type Error = EngineError;

    fn try_from(data: GraphData) -> Result<Self> {
        let mut graph = ArtifactGraph::new();
        for spec in data.artifacts.into_values() {
            graph.add(spec)?;
        }
        Ok(graph)
    }
}

impl From<ArtifactGraph> for GraphData {
    fn from(graph: ArtifactGraph) -> Self {
        GraphData {
            artifacts: graph
                .specs
                .into_iter()
                .collect::<BTreeMap<String, ArtifactSpec>>(),
        }
    }
}

/// Tier selection as a pure function of graph position: leaves need no
/// context, shallow dependents need a little, convergence points need the
/// most capable model.
pub fn select_tier(spec: &ArtifactSpec, graph: &ArtifactGraph) -> ModelTier {
    if graph.depth(&spec.id) == 0 {
        ModelTier::Small
    } else if graph.fan_in(&spec.id) <= 2 {
        ModelTier::Medium
    } else {
        ModelTier::Large
    }
}

/// Count of artifacts per tier, for cost estimation.
pub fn tier_distribution(graph: &ArtifactGraph) -> BTreeMap<ModelTier, usize> {
    let mut out = BTreeMap::new();
    out.insert(ModelTier::Small, 0);
    out.insert(ModelTier::Medium, 0);
    out.insert(ModelTier::Large, 0);
    for id in graph.ids() {
        if let Ok(spec) = graph.get(id) {
            *out.entry(select_tier(spec, graph)).or_insert(0) += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(id: &str, requires: &[&str]) -> ArtifactSpec {
        ArtifactSpec::new(id, format!("artifact {id}"))
            .with_contract(format!("contract for {id}"))
            .with_requires(requires.iter().copied())
    }

    fn chain_graph() -> ArtifactGraph {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("schema", &[])).unwrap();
        graph.add(spec("model", &["schema"])).unwrap();
        graph.add(spec("api", &["model"])).unwrap();
        graph
    }

    #[test]
    fn test_duplicate_add_fails() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("a", &[])).unwrap();
        let err = graph.add(spec("a", &[])).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateArtifact { .. }));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut graph = ArtifactGraph::new();
        let err = graph.add(spec("a", &["a"])).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("a", &["b"])).unwrap();
        graph.add(spec("b", &["c"])).unwrap();
        let err = graph.add(spec("c", &["a"])).unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { .. }));

        // Construction is atomic: "c" left no trace and the survivors
        // still produce waves once the dangling ref resolves.
        assert_eq!(graph.len(), 2);
        graph.add(spec("c", &[])).unwrap();
        let waves = graph.execution_waves().unwrap();
        assert_eq!(waves, vec![vec!["c".to_string()], vec!["b".into()], vec!["a".into()]]);
    }

    #[test]
    fn test_waves_for_linear_chain() {
        let graph = chain_graph();
        let waves = graph.execution_waves().unwrap();
        assert_eq!(
            waves,
            vec![
                vec!["schema".to_string()],
                vec!["model".to_string()],
                vec!["api".to_string()],
            ]
        );
    }

    #[test]
    fn test_waves_partition_and_order() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("a", &[])).unwrap();
        graph.add(spec("b", &[])).unwrap();
        graph.add(spec("c", &["a", "b"])).unwrap();
        graph.add(spec("d", &["a"])).unwrap();
        graph.add(spec("e", &["c", "d"])).unwrap();

        let waves = graph.execution_waves().unwrap();

        // Partition: each node appears exactly once.
        let mut seen: Vec<&String> = waves.iter().flatten().collect();
        seen.sort();
        assert_eq!(seen.len(), 5);

        // Each node's wave index strictly exceeds every dependency's.
        let wave_of = |id: &str| waves.iter().position(|w| w.iter().any(|n| n == id)).unwrap();
        for id in graph.ids() {
            let spec = graph.get(id).unwrap();
            for dep in &spec.requires {
                assert!(wave_of(id) > wave_of(dep), "{id} not after {dep}");
            }
        }
    }

    #[test]
    fn test_dangling_reference_is_construction_error() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("b", &["missing"])).unwrap();
        let err = graph.freeze().unwrap_err();
        assert!(matches!(err, EngineError::MissingDependency { .. }));
    }

    #[test]
    fn test_frozen_graph_rejects_add() {
        let mut graph = chain_graph();
        graph.freeze().unwrap();
        assert!(matches!(
            graph.add(spec("x", &[])).unwrap_err(),
            EngineError::GraphFrozen
        ));
    }

    #[test]
    fn test_subgraph_closes_over_dependencies() {
        let graph = chain_graph();
        let ids: HashSet<String> = ["api".to_string()].into_iter().collect();
        let sub = graph.subgraph(&ids).unwrap();
        assert_eq!(sub.len(), 3);
        assert!(sub.contains("schema"));
    }

    #[test]
    fn test_depth_and_tier_selection() {
        let mut graph = ArtifactGraph::new();
        graph.add(spec("p1", &[])).unwrap();
        graph.add(spec("p2", &[])).unwrap();
        graph.add(spec("p3", &[])).unwrap();
        graph.add(spec("impl", &["p1"])).unwrap();
        graph.add(spec("app", &["p1", "p2", "p3"])).unwrap();

        assert_eq!(graph.depth("p1"), 0);
        assert_eq!(graph.depth("impl"), 1);

        assert_eq!(select_tier(graph.get("p1").unwrap(), &graph), ModelTier::Small);
        assert_eq!(select_tier(graph.get("impl").unwrap(), &graph), ModelTier::Medium);
        assert_eq!(select_tier(graph.get("app").unwrap(), &graph), ModelTier::Large);

        let dist = tier_distribution(&graph);
        assert_eq!(dist[&ModelTier::Small], 3);
        assert_eq!(dist[&ModelTier::Medium], 1);
        assert_eq!(dist[&ModelTier::Large], 1);
    }

    #[test]
    fn test_extension_accepts_valid_batch() {
        let mut graph = chain_graph();
        graph.freeze().unwrap();

        let completed: HashSet<String> = ["schema".to_string()].into_iter().collect();
        let waves = graph
            .propose_extension(vec![spec("docs", &["api"])], &completed)
            .unwrap();

        assert!(graph.contains("docs"));
        assert_eq!(waves.last().unwrap(), &vec!["docs".to_string()]);
        // Still frozen after the extension.
        assert!(graph.is_frozen());
    }

    #[test]
    fn test_extension_rejects_cycle_atomically() {
        let mut graph = chain_graph();
        let completed = HashSet::new();
        let err = graph
            .propose_extension(
                vec![spec("x", &["y"]), spec("y", &["x"])],
                &completed,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::CyclicDependency { .. }));
        assert!(!graph.contains("x"));
        assert!(!graph.contains("y"));
    }

    #[test]
    fn test_extension_respects_size_limit() {
        let mut graph = ArtifactGraph::with_limit(2);
        graph.add(spec("a", &[])).unwrap();
        let err = graph
            .propose_extension(vec![spec("b", &[]), spec("c", &[])], &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphExplosion { .. }));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_depth_limit_enforced_at_freeze() {
        let mut limits = crate::core::limits::ExecutionLimits::default();
        limits.max_depth = 2;

        let mut graph = ArtifactGraph::with_limits(&limits);
        graph.add(spec("a", &[])).unwrap();
        graph.add(spec("b", &["a"])).unwrap();
        graph.add(spec("c", &["b"])).unwrap();
        graph.freeze().unwrap();

        let mut deep = ArtifactGraph::with_limits(&limits);
        deep.add(spec("a", &[])).unwrap();
        deep.add(spec("b", &["a"])).unwrap();
        deep.add(spec("c", &["b"])).unwrap();
        deep.add(spec("d", &["c"])).unwrap();
        let err = deep.freeze().unwrap_err();
        assert!(matches!(
            err,
            EngineError::DepthExceeded { depth: 3, limit: 2, .. }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_discovery_round_limit_caps_extensions() {
        let mut limits = crate::core::limits::ExecutionLimits::default();
        limits.max_discovery_rounds = 2;

        let mut graph = ArtifactGraph::with_limits(&limits);
        graph.add(spec("a", &[])).unwrap();
        let completed = HashSet::new();

        graph.propose_extension(vec![spec("b", &["a"])], &completed).unwrap();
        graph.propose_extension(vec![spec("c", &["b"])], &completed).unwrap();
        let err = graph
            .propose_extension(vec![spec("d", &["c"])], &completed)
            .unwrap_err();
        assert!(matches!(err, EngineError::ExtensionRejected { .. }));
        assert!(!graph.contains("d"));
    }

    #[test]
    fn test_leaves_and_roots() {
        let graph = chain_graph();
        assert_eq!(graph.leaves(), vec!["schema".to_string()]);
        assert_eq!(graph.roots(), vec!["api".to_string()]);
    }

    #[test]
    fn test_graph_serde_round_trip() {
        let graph = chain_graph();
        let json = serde_json::to_string(&graph).unwrap();
        let back: ArtifactGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.execution_waves().unwrap(), graph.execution_waves().unwrap());
    }

    #[test]
    fn test_mermaid_contains_edges() {
        let graph = chain_graph();
        let mermaid = graph.to_mermaid();
        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("schema --> model"));
    }
}
