//! End-to-end integration tests for kg-loom.
//!
//! These tests drive the public API the way the orchestration layer does:
//! a scripted transport behind the key pool and executor, salvaged replies
//! turned into triples, and the consolidation pass over the result.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kg_loom::config::ModelSettings;
use kg_loom::error::GatewayError;
use kg_loom::extract::{self, Provenance};
use kg_loom::gateway::{
    CancelToken, CompletionRequest, HttpReply, KeyPool, ManualClock, RequestExecutor,
    RetryPolicy, Transport, TransportFailure,
};
use kg_loom::graph::community::{self, Community};
use kg_loom::graph::consolidate::{ConsolidationPass, StandardizationMapping};
use kg_loom::graph::store::GraphStore;
use kg_loom::graph::{Namespace, NodeId, Triple};
use kg_loom::pipeline::{
    self, BatchItem, CheckpointWriter, JsonCheckpoint, ModelInference, Prompt, PromptSource,
};
use kg_loom::salvage;

/// Replies with the first canned body whose marker occurs in the request.
struct Canned {
    replies: Vec<(&'static str, HttpReply)>,
    fallback: HttpReply,
    keys: Mutex<Vec<String>>,
}

impl Canned {
    fn always(reply: HttpReply) -> Arc<Self> {
        Self::by_marker(vec![], reply)
    }

    fn by_marker(replies: Vec<(&'static str, HttpReply)>, fallback: HttpReply) -> Arc<Self> {
        Arc::new(Self {
            replies,
            fallback,
            keys: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

impl Transport for Canned {
    fn post_json(&self, _url: &str, bearer: &str, body: &str) -> Result<HttpReply, TransportFailure> {
        self.keys.lock().unwrap().push(bearer.to_string());
        Ok(self
            .replies
            .iter()
            .find(|(marker, _)| body.contains(marker))
            .map_or_else(|| self.fallback.clone(), |(_, reply)| reply.clone()))
    }
}

fn completion(content: &str) -> HttpReply {
    let body = serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    });
    HttpReply::new(200, body.to_string())
}

fn executor(keys: &[&str], transport: Arc<Canned>, max_attempts: u32) -> RequestExecutor {
    let clock = Arc::new(ManualClock::new());
    let pool = KeyPool::with_clock(keys, Duration::from_secs(60), clock.clone())
        .unwrap()
        .with_jitter_ratio(0.0);
    let policy = RetryPolicy {
        max_attempts,
        ..RetryPolicy::default()
    }
    .without_jitter();
    RequestExecutor::new("http://mock/v1/chat/completions", Arc::new(pool), transport, policy)
        .with_clock(clock)
}

fn settings() -> ModelSettings {
    ModelSettings {
        model: "mock-model".into(),
        max_tokens: 500,
        temperature: 0.0,
    }
}

fn triple(s: &str, p: &str, o: &str) -> Triple {
    Triple::parse(s, p, o).unwrap()
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[test]
fn rate_limited_pool_exhausts_after_budget() {
    let transport = Canned::always(HttpReply::new(429, r#"{"error":"rate limited"}"#));
    let exec = executor(&["key-a", "key-b"], transport.clone(), 5);

    let err = exec
        .execute(&CompletionRequest::new("mock-model", "hello"))
        .unwrap_err();

    assert!(matches!(err, GatewayError::AllKeysExhausted { attempts: 5 }));
    assert_eq!(err.kind(), "all_keys_exhausted");
    assert_eq!(transport.calls(), 5);

    let stats = exec.pool().stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.error_count >= 2));
    assert_eq!(stats.iter().map(|s| s.error_count).sum::<u64>(), 5);
}

#[test]
fn rejected_request_is_not_retried() {
    let transport = Canned::always(HttpReply::new(400, r#"{"error":"bad model"}"#));
    let exec = executor(&["key-a"], transport.clone(), 5);

    let err = exec
        .execute(&CompletionRequest::new("mock-model", "hello"))
        .unwrap_err();

    assert!(matches!(err, GatewayError::RequestRejected { status: 400, .. }));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn cancelled_before_start_makes_no_call() {
    let transport = Canned::always(completion("[]"));
    let exec = executor(&["key-a"], transport.clone(), 5);
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = exec
        .execute_with_cancel(&CompletionRequest::new("mock-model", "hello"), &cancel)
        .unwrap_err();

    assert!(matches!(err, GatewayError::Cancelled { .. }));
    assert_eq!(transport.calls(), 0);
}

// ---------------------------------------------------------------------------
// Salvage -> extract -> store -> consolidate
// ---------------------------------------------------------------------------

#[test]
fn truncated_completion_flows_into_consolidated_graph() {
    let reply = "Here are the facts:\n```json\n[\n\
        {\"subject\": \"Marie Curie\", \"predicate\": \"won\", \"object\": \"Nobel Prize\", \"time\": \"1903\"},\n\
        {subject: \"Marie Curie\", \"predicate\": \"was born in\", \"object\": \"Warsaw\",},\n\
        {\"subject\": \"Pierre";

    let records = salvage::parse_array(reply);
    assert_eq!(records.len(), 2);

    let first = extract::triples_from_value(&records, &Provenance::claim("c1").with_chunk(0), 3);
    assert_eq!(first.triples.len(), 2);
    assert_eq!(first.rejected, 0);
    assert_eq!(
        first.triples[0].attribute("time"),
        Some(&serde_json::json!("1903"))
    );

    let second_reply = r#"[
        {"subject": "M. Curie", "predicate": "won", "object": "Nobel Prize"},
        {"subject": "Warsaw", "predicate": "is", "object": "Warsaw"},
        {"subject": "", "predicate": "is", "object": "nothing"}
    ]"#;
    let second = extract::triples_from_value(
        &salvage::parse_array(second_reply),
        &Provenance::claim("c2").with_chunk(1),
        3,
    );
    assert_eq!(second.triples.len(), 2);
    assert_eq!(second.rejected, 1);

    let mut store = GraphStore::new();
    store.extend(first.triples);
    store.extend(second.triples);
    assert_eq!(store.len(), 4);

    let mapping = StandardizationMapping::from_groups([("Marie Curie", vec!["M. Curie"])]);
    let report = ConsolidationPass::new().with_mapping(&mapping).apply(&mut store);

    assert_eq!(report.input, 4);
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(report.self_references_removed, 1);
    assert_eq!(report.output, 2);

    let triples = store.snapshot();
    // The first occurrence keeps its provenance.
    assert_eq!(triples[0].attribute("claim"), Some(&serde_json::json!("c1")));
    assert!(store
        .unique_nodes(Some(Namespace::Entity))
        .iter()
        .all(|n| n.label() != "M. Curie"));
}

#[test]
fn unrecoverable_completion_yields_no_records() {
    assert!(salvage::parse("I could not find any facts in this passage.").is_err());
    assert!(salvage::parse_array("[{\"subject\": \"only half").is_empty());
}

// ---------------------------------------------------------------------------
// Communities
// ---------------------------------------------------------------------------

#[test]
fn event_edges_split_into_two_communities() {
    let store = GraphStore::from_triples(vec![
        triple("EVENT|a", "precedes", "EVENT|b"),
        triple("EVENT|b", "precedes", "EVENT|c"),
        triple("EVENT|x", "causes", "EVENT|y"),
        triple("EVENT|a", "happened at", "LOCATION|Paris"),
    ]);

    let mut communities = community::detect_in(&store, Namespace::Event);
    community::sort_largest_first(&mut communities);

    let labels: Vec<BTreeSet<&str>> = communities
        .iter()
        .map(|c| c.members.iter().map(NodeId::label).collect())
        .collect();
    assert_eq!(
        labels,
        vec![
            BTreeSet::from(["a", "b", "c"]),
            BTreeSet::from(["x", "y"]),
        ]
    );
    assert!(communities
        .iter()
        .flat_map(|c| c.members.iter())
        .all(|n| n.namespace() == Namespace::Event));
}

// ---------------------------------------------------------------------------
// Model-backed inference
// ---------------------------------------------------------------------------

struct MarkerPrompts;

impl PromptSource for MarkerPrompts {
    fn bridge(&self, first: &Community, second: &Community, _context: &[&Triple]) -> Prompt {
        Prompt {
            system: Some("You connect knowledge graph communities.".into()),
            user: format!("BRIDGE {} {}", first.size(), second.size()),
        }
    }

    fn within(&self, pairs: &[(NodeId, NodeId)], _context: &[&Triple]) -> Prompt {
        Prompt {
            system: None,
            user: format!("WITHIN {}", pairs.len()),
        }
    }
}

#[test]
fn inference_bridges_disconnected_communities() {
    let transport = Canned::by_marker(
        vec![(
            "BRIDGE",
            completion(
                r#"```json
[{"subject": "ENTITY|France", "predicate": "shares a border with", "object": "ENTITY|Germany"}]
```"#,
            ),
        )],
        completion("[]"),
    );
    let exec = executor(&["key-a", "key-b"], transport.clone(), 3);
    let prompts = MarkerPrompts;
    let inference = ModelInference::new(&exec, &prompts, settings()).max_predicate_words(3);

    let input = vec![
        triple("ENTITY|Paris", "capital of", "ENTITY|France"),
        triple("ENTITY|Berlin", "capital of", "ENTITY|Germany"),
    ];
    let (output, report) = ConsolidationPass::new()
        .with_inference(&inference)
        .run(input);

    assert_eq!(report.communities, 2);
    assert_eq!(report.inferred_added, 1);
    assert_eq!(report.output, 3);
    assert_eq!(transport.calls(), 1);

    let inferred = output.iter().find(|t| t.is_inferred()).unwrap();
    assert_eq!(inferred.subject.label(), "France");
    assert_eq!(inferred.predicate, "shares a border");
    assert_eq!(inferred.object.label(), "Germany");
}

#[test]
fn batch_keeps_submission_order_and_isolates_failures() {
    let transport = Canned::by_marker(
        vec![
            (
                "chunk zero",
                completion(r#"[{"subject":"A","predicate":"knows","object":"B"}]"#),
            ),
            ("chunk one", HttpReply::new(401, "unauthorized")),
            ("chunk two", completion("no json here")),
            (
                "chunk three",
                completion(r#"{"subject":"C","predicate":"knows","object":"D"}"#),
            ),
        ],
        completion("[]"),
    );
    let exec = executor(&["key-a"], transport, 2);
    let items: Vec<BatchItem> = ["zero", "one", "two", "three"]
        .iter()
        .enumerate()
        .map(|(chunk, name)| BatchItem {
            request: settings().request(format!("chunk {name}")),
            provenance: Provenance::claim("claim-1").with_chunk(chunk),
        })
        .collect();

    let report = pipeline::run_batch(&exec, &items, 3, &CancelToken::new());

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.unparsed(), 1);
    let subjects: Vec<String> = report
        .triples()
        .iter()
        .map(|t| t.subject.label().to_string())
        .collect();
    assert_eq!(subjects, vec!["A", "C"]);
    assert_eq!(
        report.triples()[1].attribute("chunk"),
        Some(&serde_json::json!(3))
    );
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[test]
fn checkpoints_persist_and_reload_triples() {
    let dir = tempfile::TempDir::new().unwrap();
    let checkpoint = JsonCheckpoint::new(dir.path().join("checkpoints")).with_prefix("facts");

    assert!(checkpoint.latest().is_none());

    let batch_one = vec![triple("ENTITY|Ada", "wrote", "ENTITY|Notes")];
    let mut batch_two = batch_one.clone();
    batch_two.push(
        triple("EVENT|launch", "occurred on", "TIME|1843")
            .with_attribute("claim", "c9")
            .mark_inferred(),
    );

    checkpoint.write(1, &batch_one).unwrap();
    checkpoint.write(2, &batch_two).unwrap();

    let (batch, path) = checkpoint.latest().unwrap();
    assert_eq!(batch, 2);
    assert_eq!(path, checkpoint.path_for(2));

    let restored = pipeline::read_triples(&path).unwrap();
    assert_eq!(restored, batch_two);
    assert!(restored[1].is_inferred());
    assert_eq!(restored[1].object.namespace(), Namespace::Time);
}

#[test]
fn reading_a_non_triple_file_is_a_parse_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, r#"{"not": "an array"}"#).unwrap();

    let err = pipeline::read_triples(&path).unwrap_err();
    assert!(matches!(err, kg_loom::error::CheckpointError::Parse { .. }));
}

#[test]
fn triples_file_with_blank_predicate_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("blank.json");
    std::fs::write(
        &path,
        r#"[{"subject": "ENTITY|a", "predicate": "", "object": "ENTITY|b"}]"#,
    )
    .unwrap();

    let err = pipeline::read_triples(&path).unwrap_err();
    assert!(matches!(err, kg_loom::error::CheckpointError::Parse { .. }));
}
