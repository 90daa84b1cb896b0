//! Conversion of salvaged records into graph triples.
//!
//! Four record shapes come back from extraction prompts:
//!
//! - fact records `{subject, predicate, object, ...extra}`
//! - event records `{claim_index, event_type, description, participants, action_verb}`,
//!   later enriched with `{time, time_type, time_precision, location}`
//! - event relations `{source_event, relation_type, target_event, confidence?}`
//! - event durations `{event_id, relation_type, duration_value, reference_event?}`
//!
//! Records that cannot become a valid [`Triple`] are counted and skipped,
//! never fatal.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::consolidate::limit_predicate_length;
use crate::graph::{Namespace, NodeId, Triple};
use crate::salvage;

/// Attribute holding the claim text a triple was extracted from.
pub const CLAIM: &str = "claim";
/// Attribute holding the 1-based input chunk number.
pub const CHUNK: &str = "chunk";
/// Attribute holding the event a duration is relative to (may be null).
pub const REFERENCE_EVENT: &str = "reference_event";
/// Attribute holding an event relation's confidence label.
pub const CONFIDENCE: &str = "confidence";

/// Where a batch of records came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub claim: Option<String>,
    pub chunk: Option<usize>,
}

impl Provenance {
    pub fn claim(claim: impl Into<String>) -> Self {
        Self {
            claim: Some(claim.into()),
            chunk: None,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }

    fn stamp(&self, triple: Triple) -> Triple {
        let triple = match &self.claim {
            Some(claim) => triple.with_attribute(CLAIM, claim.as_str()),
            None => triple,
        };
        match self.chunk {
            Some(chunk) => triple.with_attribute(CHUNK, chunk),
            None => triple,
        }
    }
}

/// Triples built from one batch of records, plus how many were rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub triples: Vec<Triple>,
    pub rejected: usize,
}

impl Extraction {
    fn push(&mut self, triple: Option<Triple>) {
        match triple {
            Some(triple) => self.triples.push(triple),
            None => self.rejected += 1,
        }
    }

    fn log(self, kind: &'static str) -> Self {
        if self.rejected > 0 {
            tracing::warn!(
                kind,
                kept = self.triples.len(),
                rejected = self.rejected,
                "filtered out records missing required fields"
            );
        }
        self
    }
}

fn text_field<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Event ids may arrive with or without the `EVENT|` tag.
fn event_id(raw: &str) -> &str {
    raw.split_once('|')
        .filter(|(tag, _)| tag.eq_ignore_ascii_case(Namespace::Event.as_str()))
        .map_or(raw, |(_, id)| id)
        .trim()
}

// ---------------------------------------------------------------------------
// Fact records
// ---------------------------------------------------------------------------

/// Convert fact records into triples.
///
/// Each record needs non-empty `subject`, `predicate` and `object` strings.
/// Other fields (`location`, `time`, ...) are kept as attributes, then the
/// provenance attributes are attached. Predicates are cut to
/// `max_predicate_words` words (`0` keeps them whole).
pub fn triples_from_value(
    records: &[Value],
    provenance: &Provenance,
    max_predicate_words: usize,
) -> Extraction {
    let mut extraction = Extraction::default();
    for record in records {
        extraction.push(fact_triple(record, max_predicate_words).map(|t| provenance.stamp(t)));
    }
    extraction.log("fact")
}

fn fact_triple(record: &Value, max_predicate_words: usize) -> Option<Triple> {
    let record = record.as_object()?;
    let subject: NodeId = text_field(record, "subject")?.parse().ok()?;
    let object: NodeId = text_field(record, "object")?.parse().ok()?;
    let predicate = limit_predicate_length(text_field(record, "predicate")?, max_predicate_words);
    let mut triple = Triple::new(subject, predicate, object).ok()?;

    for (key, value) in record {
        if !matches!(key.as_str(), "subject" | "predicate" | "object") {
            triple.attributes.insert(key.clone(), value.clone());
        }
    }
    Some(triple)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// `time_type` / `time_precision` value when the reply says nothing.
pub const UNKNOWN: &str = "unknown";
/// Predicate linking a participant to an event.
pub const PARTICIPATES_IN: &str = "participates in";
/// Predicate linking an event to its time.
pub const OCCURRED_AT: &str = "occurred at";
/// Predicate linking an event to its location.
pub const LOCATED_AT: &str = "located at";

/// When and where an event happened.
///
/// `time_type` is one of `specific`, `relative`, `period`, `frequency` or
/// `unknown`; `time_precision` one of `exact`, `day`, `month`, `year`,
/// `approximate` or `vague`. Both default to `unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttributes {
    pub time: Option<String>,
    pub location: Option<String>,
    pub time_type: String,
    pub time_precision: String,
}

impl Default for EventAttributes {
    fn default() -> Self {
        Self {
            time: None,
            location: None,
            time_type: UNKNOWN.to_string(),
            time_precision: UNKNOWN.to_string(),
        }
    }
}

impl EventAttributes {
    /// Read an attribute object. Anything but an object yields the defaults.
    pub fn from_value(value: &Value) -> Self {
        let Some(record) = value.as_object() else {
            return Self::default();
        };
        let label = |key: &str| text_field(record, key).map(str::to_string);
        Self {
            time: label("time"),
            location: label("location"),
            time_type: label("time_type").unwrap_or_else(|| UNKNOWN.to_string()),
            time_precision: label("time_precision").unwrap_or_else(|| UNKNOWN.to_string()),
        }
    }

    /// Salvage an attribute reply. An unrecoverable reply yields the defaults.
    pub fn from_reply(reply: &str) -> Self {
        match salvage::parse_object(reply) {
            Ok(salvaged) => Self::from_value(&salvaged.value),
            Err(failure) => {
                tracing::warn!(reason = %failure.reason, "event attributes not recovered");
                Self::default()
            }
        }
    }
}

/// An event found in a batch of claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// `event_<n>`, unique across batches sharing one [`EventNumbering`].
    pub event_id: String,
    pub event_type: String,
    pub description: String,
    pub participants: Vec<String>,
    /// Claim the event was found in, when its index was in range.
    pub claim: Option<String>,
    pub action_verb: Option<String>,
    #[serde(default)]
    pub attributes: EventAttributes,
}

impl EventRecord {
    pub fn with_attributes(mut self, attributes: EventAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Participant, time and location triples around `EVENT|<event_id>`.
    ///
    /// The time triple carries `time_type` and `time_precision`. Every
    /// triple carries the event's claim when known.
    pub fn to_triples(&self) -> Vec<Triple> {
        let Ok(event) = NodeId::event(self.event_id.as_str()) else {
            return Vec::new();
        };
        let mut triples: Vec<Triple> = self
            .participants
            .iter()
            .filter_map(|p| p.parse::<NodeId>().ok())
            .filter_map(|p| Triple::new(p, PARTICIPATES_IN, event.clone()).ok())
            .collect();

        let attributes = &self.attributes;
        if let Some(time) = &attributes.time {
            if let Ok(triple) = NodeId::new(Namespace::Time, time.as_str())
                .and_then(|time| Triple::new(event.clone(), OCCURRED_AT, time))
            {
                triples.push(
                    triple
                        .with_attribute("time_type", attributes.time_type.as_str())
                        .with_attribute("time_precision", attributes.time_precision.as_str()),
                );
            }
        }
        if let Some(location) = &attributes.location {
            if let Ok(triple) = NodeId::new(Namespace::Location, location.as_str())
                .and_then(|location| Triple::new(event.clone(), LOCATED_AT, location))
            {
                triples.push(triple);
            }
        }

        let provenance = Provenance {
            claim: self.claim.clone(),
            chunk: None,
        };
        triples.into_iter().map(|t| provenance.stamp(t)).collect()
    }
}

/// Hands out `event_<n>` ids, counting on across batches.
#[derive(Debug, Clone, Default)]
pub struct EventNumbering {
    next: usize,
}

impl EventNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids handed out so far.
    pub fn assigned(&self) -> usize {
        self.next
    }

    fn next_id(&mut self) -> String {
        let id = format!("event_{}", self.next);
        self.next += 1;
        id
    }
}

/// Events from one batch of claims, plus how many records were rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub events: Vec<EventRecord>,
    pub rejected: usize,
}

/// Convert event records from one batch of claims.
///
/// A record needs a non-empty `event_type`. Accepted records take the next
/// id from `numbering`. `claim_index` (0-based, default 0) maps back into
/// `claims`; an index out of range leaves the claim unset.
pub fn events_from_value<S: AsRef<str>>(
    records: &[Value],
    claims: &[S],
    numbering: &mut EventNumbering,
) -> EventBatch {
    let mut batch = EventBatch::default();
    for record in records {
        match event_record(record, claims, numbering) {
            Some(event) => batch.events.push(event),
            None => batch.rejected += 1,
        }
    }
    if batch.rejected > 0 {
        tracing::warn!(
            kind = "event",
            kept = batch.events.len(),
            rejected = batch.rejected,
            "filtered out records missing required fields"
        );
    }
    batch
}

fn event_record<S: AsRef<str>>(
    record: &Value,
    claims: &[S],
    numbering: &mut EventNumbering,
) -> Option<EventRecord> {
    let record = record.as_object()?;
    let event_type = text_field(record, "event_type")?.to_string();

    let claim_index = match record.get("claim_index") {
        None => Some(0),
        Some(index) => index.as_u64(),
    };
    let claim = claim_index
        .and_then(|i| usize::try_from(i).ok())
        .and_then(|i| claims.get(i))
        .map(|claim| claim.as_ref().to_string());

    let participants = record
        .get("participants")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(EventRecord {
        event_id: numbering.next_id(),
        event_type,
        description: text_field(record, "description").unwrap_or_default().to_string(),
        participants,
        claim,
        action_verb: text_field(record, "action_verb").map(str::to_string),
        attributes: EventAttributes::default(),
    })
}

/// Ids of `events`, for validating relation and duration records.
pub fn known_event_ids<'a>(events: impl IntoIterator<Item = &'a EventRecord>) -> HashSet<String> {
    events.into_iter().map(|e| e.event_id.clone()).collect()
}

// ---------------------------------------------------------------------------
// Event relations
// ---------------------------------------------------------------------------

/// Convert event relation records into `EVENT -> EVENT` triples.
///
/// Records naming an event outside `known_events`, or relating an event to
/// itself, are rejected.
pub fn event_relations_from_value(records: &[Value], known_events: &HashSet<String>) -> Extraction {
    let mut extraction = Extraction::default();
    for record in records {
        extraction.push(event_relation(record, known_events));
    }
    extraction.log("event_relation")
}

fn event_relation(record: &Value, known_events: &HashSet<String>) -> Option<Triple> {
    let record = record.as_object()?;
    let source = event_id(text_field(record, "source_event")?);
    let target = event_id(text_field(record, "target_event")?);
    if source == target || !known_events.contains(source) || !known_events.contains(target) {
        return None;
    }
    let relation = text_field(record, "relation_type")?;

    let triple = Triple::new(NodeId::event(source).ok()?, relation, NodeId::event(target).ok()?).ok()?;
    Some(match record.get(CONFIDENCE) {
        Some(confidence) if !confidence.is_null() => {
            triple.with_attribute(CONFIDENCE, confidence.clone())
        }
        _ => triple,
    })
}

// ---------------------------------------------------------------------------
// Event durations
// ---------------------------------------------------------------------------

/// How an event relates to a span or point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationRelation {
    LastFor,
    StartAt,
    EndAt,
    Until,
    FromTo,
    Intermittent,
}

impl DurationRelation {
    pub const ALL: [DurationRelation; 6] = [
        Self::LastFor,
        Self::StartAt,
        Self::EndAt,
        Self::Until,
        Self::FromTo,
        Self::Intermittent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastFor => "LAST_FOR",
            Self::StartAt => "START_AT",
            Self::EndAt => "END_AT",
            Self::Until => "UNTIL",
            Self::FromTo => "FROM_TO",
            Self::Intermittent => "INTERMITTENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for DurationRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated duration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationRecord {
    pub event_id: String,
    pub relation: DurationRelation,
    pub value: String,
    pub reference_event: Option<String>,
}

impl DurationRecord {
    pub fn from_value(record: &Value) -> Option<Self> {
        let record = record.as_object()?;
        let value = match record.get("duration_value")? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        if value.is_empty() {
            return None;
        }
        Some(Self {
            event_id: event_id(text_field(record, "event_id")?).to_string(),
            relation: DurationRelation::parse(text_field(record, "relation_type")?)?,
            value,
            reference_event: text_field(record, REFERENCE_EVENT).map(|r| event_id(r).to_string()),
        })
    }

    /// `EVENT|id --RELATION--> TIME|value`, with `reference_event` kept as an
    /// attribute that is null when absent.
    pub fn to_triple(&self) -> Option<Triple> {
        let triple = Triple::new(
            NodeId::event(self.event_id.as_str()).ok()?,
            self.relation.as_str(),
            NodeId::new(Namespace::Time, self.value.as_str()).ok()?,
        )
        .ok()?;
        let reference = self
            .reference_event
            .as_ref()
            .map_or(Value::Null, |r| Value::String(r.clone()));
        Some(triple.with_attribute(REFERENCE_EVENT, reference))
    }
}

/// Convert duration records into triples. When `known_events` is given,
/// records for other events are rejected.
pub fn durations_from_value(records: &[Value], known_events: Option<&HashSet<String>>) -> Extraction {
    let mut extraction = Extraction::default();
    for record in records {
        let triple = DurationRecord::from_value(record)
            .filter(|d| known_events.is_none_or(|known| known.contains(&d.event_id)))
            .and_then(|d| d.to_triple());
        extraction.push(triple);
    }
    extraction.log("duration")
}
