//! Batch helpers for the orchestration layer.
//!
//! - [`run_batch`] fans independent completion requests out over rayon's
//!   pool, all sharing one [`RequestExecutor`] (and so one key pool), and
//!   returns outcomes in submission order.
//! - [`ModelInference`] is the model-backed [`RelationInference`]: it asks
//!   the orchestration layer's [`PromptSource`] for prompts about community
//!   gaps and folds the salvaged answers back as triples.
//! - [`CheckpointWriter`] persists accumulated triples between batches.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::config::ModelSettings;
use crate::error::{CheckpointError, CheckpointResult, GatewayError};
use crate::extract::{self, Extraction, Provenance};
use crate::gateway::{CancelToken, CompletionRequest, RequestExecutor};
use crate::graph::community::{self, Community};
use crate::graph::consolidate::RelationInference;
use crate::graph::{Namespace, NodeId, Triple};
use crate::salvage::{self, ParseFailure};

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One request and the provenance to stamp on its triples.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub request: CompletionRequest,
    pub provenance: Provenance,
}

/// What became of one batch item.
#[derive(Debug)]
pub enum ItemOutcome {
    Extracted(Extraction),
    /// The call succeeded but nothing could be salvaged from the reply.
    Unparsed(ParseFailure),
    Failed(GatewayError),
}

/// Per-item outcomes, in submission order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    /// All extracted triples, in submission order.
    pub fn triples(&self) -> Vec<Triple> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ItemOutcome::Extracted(extraction) => Some(extraction.triples.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn into_triples(self) -> Vec<Triple> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o {
                ItemOutcome::Extracted(extraction) => Some(extraction.triples),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    pub fn unparsed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Unparsed(_)))
    }

    pub fn rejected_records(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                ItemOutcome::Extracted(extraction) => extraction.rejected,
                _ => 0,
            })
            .sum()
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Run every item, salvage each reply and convert it into fact triples.
///
/// A failed call or unparsable reply is logged and recorded; it never aborts
/// the batch.
pub fn run_batch(
    executor: &RequestExecutor,
    items: &[BatchItem],
    max_predicate_words: usize,
    cancel: &CancelToken,
) -> BatchReport {
    let outcomes: Vec<ItemOutcome> = items
        .par_iter()
        .enumerate()
        .map(|(position, item)| {
            match executor.execute_with_cancel(&item.request, cancel) {
                Ok(text) => match salvage::parse(&text) {
                    Ok(value) => {
                        let records = match value {
                            serde_json::Value::Array(items) => items,
                            other => vec![other],
                        };
                        ItemOutcome::Extracted(extract::triples_from_value(
                            &records,
                            &item.provenance,
                            max_predicate_words,
                        ))
                    }
                    Err(failure) => {
                        tracing::warn!(item = position, reason = %failure.reason, "no records salvaged");
                        ItemOutcome::Unparsed(failure)
                    }
                },
                Err(err) => {
                    tracing::warn!(item = position, kind = err.kind(), error = %err, "batch item skipped");
                    ItemOutcome::Failed(err)
                }
            }
        })
        .collect();

    let report = BatchReport { outcomes };
    let extracted: usize = report
        .outcomes
        .iter()
        .map(|o| match o {
            ItemOutcome::Extracted(extraction) => extraction.triples.len(),
            _ => 0,
        })
        .sum();
    tracing::info!(
        items = items.len(),
        triples = extracted,
        failed = report.failed(),
        unparsed = report.unparsed(),
        "batch complete"
    );
    report
}

// ---------------------------------------------------------------------------
// Model-backed inference
// ---------------------------------------------------------------------------

/// Prompt text for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

/// Supplies prompt wording; implemented by the orchestration layer.
pub trait PromptSource {
    /// Ask for relations between members of two disconnected communities.
    fn bridge(&self, first: &Community, second: &Community, context: &[&Triple]) -> Prompt;

    /// Ask for relations between unlinked node pairs of one community.
    fn within(&self, pairs: &[(NodeId, NodeId)], context: &[&Triple]) -> Prompt;
}

/// Caps on how much inference work one pass may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceLimits {
    pub max_community_pairs: usize,
    pub max_pairs_within: usize,
    /// Triples of context included with each prompt.
    pub context_triples: usize,
}

impl Default for InferenceLimits {
    fn default() -> Self {
        Self {
            max_community_pairs: 5,
            max_pairs_within: 10,
            context_triples: 20,
        }
    }
}

/// [`RelationInference`] that asks the model through a [`RequestExecutor`].
pub struct ModelInference<'a> {
    executor: &'a RequestExecutor,
    prompts: &'a dyn PromptSource,
    settings: ModelSettings,
    limits: InferenceLimits,
    namespace: Namespace,
    max_predicate_words: usize,
    cancel: CancelToken,
}

impl<'a> ModelInference<'a> {
    pub fn new(
        executor: &'a RequestExecutor,
        prompts: &'a dyn PromptSource,
        settings: ModelSettings,
    ) -> Self {
        Self {
            executor,
            prompts,
            settings,
            limits: InferenceLimits::default(),
            namespace: Namespace::Entity,
            max_predicate_words: 3,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_limits(mut self, limits: InferenceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Namespace of the edges that define "directly linked" (default: entities).
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn max_predicate_words(mut self, words: usize) -> Self {
        self.max_predicate_words = words;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn request(&self, prompt: Prompt) -> CompletionRequest {
        let request = self.settings.request(prompt.user);
        match prompt.system {
            Some(system) => request.with_system(system),
            None => request,
        }
    }

    fn prompts_for(&self, triples: &[Triple], communities: &[Community]) -> Vec<Prompt> {
        let mut prompts = Vec::new();

        for (first, second) in community::bridge_pairs(communities, self.limits.max_community_pairs) {
            let nodes: BTreeSet<NodeId> = first.members.union(&second.members).cloned().collect();
            let context = community::context_triples(triples, &nodes, self.limits.context_triples);
            prompts.push(self.prompts.bridge(first, second, &context));
        }

        let edges = crate::graph::same_namespace_edges(triples, self.namespace);
        for community in communities {
            let pairs = community::unconnected_pairs(community, &edges, self.limits.max_pairs_within);
            if pairs.is_empty() {
                continue;
            }
            let nodes: BTreeSet<NodeId> = pairs
                .iter()
                .flat_map(|(a, b)| [a.clone(), b.clone()])
                .collect();
            let context = community::context_triples(triples, &nodes, self.limits.context_triples);
            prompts.push(self.prompts.within(&pairs, &context));
        }
        prompts
    }
}

impl RelationInference for ModelInference<'_> {
    fn infer(&self, triples: &[Triple], communities: &[Community]) -> Vec<Triple> {
        let items: Vec<BatchItem> = self
            .prompts_for(triples, communities)
            .into_iter()
            .map(|prompt| BatchItem {
                request: self.request(prompt),
                provenance: Provenance::default(),
            })
            .collect();
        if items.is_empty() {
            return Vec::new();
        }

        tracing::info!(calls = items.len(), "requesting relation inference");
        let report = run_batch(self.executor, &items, self.max_predicate_words, &self.cancel);
        report.into_triples()
    }
}

// ---------------------------------------------------------------------------
// Checkpoints and triple files
// ---------------------------------------------------------------------------

/// Persists accumulated triples between batches.
pub trait CheckpointWriter {
    fn write(&self, batch: usize, triples: &[Triple]) -> CheckpointResult<()>;
}

/// Writes `<dir>/<prefix>-<batch>.json`, one pretty JSON array per batch.
#[derive(Debug, Clone)]
pub struct JsonCheckpoint {
    dir: PathBuf,
    prefix: String,
}

impl JsonCheckpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: "checkpoint".into(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn path_for(&self, batch: usize) -> PathBuf {
        self.dir.join(format!("{}-{batch:04}.json", self.prefix))
    }

    /// Highest-numbered checkpoint present, if any.
    pub fn latest(&self) -> Option<(usize, PathBuf)> {
        let entries = fs::read_dir(&self.dir).ok()?;
        let prefix = format!("{}-", self.prefix);
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let batch = name.strip_prefix(&prefix)?.strip_suffix(".json")?.parse().ok()?;
                Some((batch, entry.path()))
            })
            .max_by_key(|(batch, _)| *batch)
    }
}

impl CheckpointWriter for JsonCheckpoint {
    fn write(&self, batch: usize, triples: &[Triple]) -> CheckpointResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;
        let path = self.path_for(batch);
        write_triples(&path, triples)?;
        tracing::info!(batch, triples = triples.len(), path = %path.display(), "checkpoint written");
        Ok(())
    }
}

/// Write triples as a pretty JSON array, via a temporary file and rename.
pub fn write_triples(path: &Path, triples: &[Triple]) -> CheckpointResult<()> {
    let json = serde_json::to_string_pretty(triples).map_err(|e| CheckpointError::Serialize {
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| CheckpointError::Io {
        path: tmp.display().to_string(),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| CheckpointError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Read a JSON array of triple records.
pub fn read_triples(path: &Path) -> CheckpointResult<Vec<Triple>> {
    let content = fs::read_to_string(path).map_err(|e| CheckpointError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| CheckpointError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
