//! Content-hash change detection and incremental planning.
//!
//! An artifact's inputs are its own spec plus the output hashes of its
//! dependencies, so any upstream change cascades through the hash chain
//! and invalidates every transitive dependent. Unchanged subtrees are
//! hydrated from the previous execution instead of re-created.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::errors::Result;
use crate::executor::ArtifactResult;
use crate::graph::{ArtifactGraph, ArtifactSpec};
use crate::persistence::SavedExecution;

/// Hash of produced content.
pub fn hash_content(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Hash of an on-disk output file.
pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash of the spec's own fields, independent of dependency outputs.
/// Dependency ids are included so rewiring counts as a change even when
/// the wording stays identical.
pub fn spec_hash(spec: &ArtifactSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(spec.description.as_bytes());
    hasher.update(b"\x00");
    hasher.update(spec.contract.as_bytes());
    hasher.update(b"\x00");
    if let Some(path) = &spec.produces_file {
        hasher.update(path.to_string_lossy().as_bytes());
    }
    hasher.update(b"\x00");
    for dep in &spec.requires {
        // BTreeSet iteration is already sorted.
        hasher.update(dep.as_bytes());
        hasher.update(b"\x01");
    }
    hex::encode(hasher.finalize())
}

/// Full input identity: the spec hash plus the sorted output hashes of
/// dependencies. Two artifacts with equal input hashes would produce
/// equivalent work.
pub fn input_hash(spec: &ArtifactSpec, dep_hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec_hash(spec).as_bytes());
    for (dep, hash) in dep_hashes {
        hasher.update(b"\x00");
        hasher.update(dep.as_bytes());
        hasher.update(b"=");
        hasher.update(hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// What changed between a previous execution and the current graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// New in the current graph.
    pub added: HashSet<String>,
    /// Present in the snapshot, gone from the graph.
    pub removed: HashSet<String>,
    /// Same id, different description/contract/output path.
    pub contract_changed: HashSet<String>,
    /// Same id, different `requires` set.
    pub deps_changed: HashSet<String>,
    /// Output file on disk no longer matches the recorded content hash.
    pub output_modified: HashSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.contract_changed.is_empty()
            && self.deps_changed.is_empty()
            && self.output_modified.is_empty()
    }

    /// Every id that must itself re-execute (removed ids are not in the
    /// graph anymore and cannot).
    pub fn all_changed(&self) -> HashSet<String> {
        self.added
            .iter()
            .chain(&self.contract_changed)
            .chain(&self.deps_changed)
            .chain(&self.output_modified)
            .cloned()
            .collect()
    }
}

/// Compares the current graph against a previous execution snapshot.
pub struct ChangeDetector {
    /// Also hash `produces_file` outputs on disk, catching out-of-band
    /// edits to generated files.
    pub check_output_files: bool,
    /// Root that relative `produces_file` paths resolve against.
    pub workspace_root: PathBuf,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            check_output_files: false,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl ChangeDetector {
    pub fn with_output_checks(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            check_output_files: true,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn detect(&self, graph: &ArtifactGraph, previous: &SavedExecution) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for id in graph.ids() {
            let Ok(current) = graph.get(id) else { continue };
            let Ok(prior) = previous.graph.get(id) else {
                changes.added.insert(id.to_string());
                continue;
            };

            if current.requires != prior.requires {
                changes.deps_changed.insert(id.to_string());
            } else if spec_hash(current) != spec_hash(prior) {
                changes.contract_changed.insert(id.to_string());
            }

            if self.check_output_files {
                if let Some(modified) = self.output_drifted(current, previous) {
                    if modified {
                        changes.output_modified.insert(id.to_string());
                    }
                }
            }
        }

        for id in previous.graph.ids() {
            if !graph.contains(id) {
                changes.removed.insert(id.to_string());
            }
        }

        debug!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            contract_changed = changes.contract_changed.len(),
            deps_changed = changes.deps_changed.len(),
            output_modified = changes.output_modified.len(),
            "change detection complete"
        );
        changes
    }

    /// `Some(true)` if the on-disk output no longer matches the recorded
    /// hash (a missing file counts as drift); `None` when there is nothing
    /// to compare.
    fn output_drifted(&self, spec: &ArtifactSpec, previous: &SavedExecution) -> Option<bool> {
        let rel = spec.produces_file.as_ref()?;
        let record = previous.completed.get(&spec.id)?;
        let path = self.workspace_root.join(rel);
        match hash_file(&path) {
            Ok(hash) => Some(hash != record.content_hash),
            Err(_) => Some(true),
        }
    }
}

/// Changed ids plus every transitive dependent, via BFS over the
/// dependency graph's forward edges.
pub fn invalidated(graph: &ArtifactGraph, changed: &HashSet<String>) -> HashSet<String> {
    let mut out: HashSet<String> = changed
        .iter()
        .filter(|id| graph.contains(id))
        .cloned()
        .collect();
    let mut queue: Vec<String> = out.iter().cloned().collect();
    while let Some(id) = queue.pop() {
        for dependent in graph.dependents(&id) {
            if out.insert(dependent.clone()) {
                queue.push(dependent);
            }
        }
    }
    out
}

/// Partition of the graph into work and reuse for one incremental run.
#[derive(Debug, Clone)]
pub struct IncrementalPlan {
    pub to_execute: HashSet<String>,
    pub to_skip: HashSet<String>,
    /// Results hydrated from the previous execution for skipped ids.
    pub hydrated: HashMap<String, ArtifactResult>,
}

impl IncrementalPlan {
    /// Fraction of the graph satisfied from cache.
    pub fn skip_ratio(&self, graph: &ArtifactGraph) -> f64 {
        if graph.is_empty() {
            return 0.0;
        }
        self.to_skip.len() as f64 / graph.len() as f64
    }
}

/// Build the incremental plan: invalidated artifacts re-execute, the rest
/// hydrate from the snapshot. Anything the previous run left incomplete or
/// failed re-executes regardless of change detection.
pub fn plan_incremental(
    graph: &ArtifactGraph,
    changes: &ChangeSet,
    previous: &SavedExecution,
) -> IncrementalPlan {
    let mut to_execute = invalidated(graph, &changes.all_changed());
    for id in graph.ids() {
        if !previous.completed.contains_key(id) {
            to_execute.insert(id.to_string());
        }
    }

    let mut to_skip = HashSet::new();
    let mut hydrated = HashMap::new();
    for id in graph.ids() {
        if to_execute.contains(id) {
            continue;
        }
        // Not invalidated and not incomplete, so a record exists.
        if let Some(record) = previous.completed.get(id) {
            to_skip.insert(id.to_string());
            hydrated.insert(id.to_string(), record.hydrate());
        }
    }

    info!(
        to_execute = to_execute.len(),
        to_skip = to_skip.len(),
        "incremental plan built"
    );
    IncrementalPlan {
        to_execute,
        to_skip,
        hydrated,
    }
}
