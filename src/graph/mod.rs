//! Graph data model: namespaced nodes and attributed triples.
//!
//! On the wire a node is the tagged string `NAMESPACE|label`; in memory it is
//! a [`NodeId`] so code never re-parses prefixes. Conversion happens only in
//! `FromStr`/`Display` and the serde impls.
//!
//! - [`store`]: accumulating, lock-protected triple collection with queries
//! - [`community`]: weakly-connected components and gap discovery
//! - [`consolidate`]: standardization, deduplication and self-loop removal

pub mod community;
pub mod consolidate;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GraphError, GraphResult};

/// Attribute flagging a triple contributed by an inference pass.
pub const INFERRED: &str = "inferred";

/// Separator between namespace tag and label in the wire form.
pub const SEPARATOR: char = '|';

/// The kind of thing a node denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Namespace {
    Entity,
    Event,
    Time,
    Location,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [Self::Entity, Self::Event, Self::Time, Self::Location];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "ENTITY",
            Self::Event => "EVENT",
            Self::Time => "TIME",
            Self::Location => "LOCATION",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ns| ns.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GraphError::InvalidNode { raw: s.to_string() })
    }
}

/// A node identifier: namespace plus non-empty label.
///
/// Ordering is by namespace, then label, which keeps community member sets
/// and reports stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    namespace: Namespace,
    label: String,
}

impl NodeId {
    pub fn new(namespace: Namespace, label: impl Into<String>) -> GraphResult<Self> {
        let label = label.into();
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(GraphError::InvalidNode {
                raw: format!("{namespace}{SEPARATOR}{label}"),
            });
        }
        Ok(Self {
            namespace,
            label: trimmed.to_string(),
        })
    }

    pub fn entity(label: impl Into<String>) -> GraphResult<Self> {
        Self::new(Namespace::Entity, label)
    }

    pub fn event(label: impl Into<String>) -> GraphResult<Self> {
        Self::new(Namespace::Event, label)
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Same namespace, different label.
    pub fn with_label(&self, label: impl Into<String>) -> GraphResult<Self> {
        Self::new(self.namespace, label)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.namespace, self.label)
    }
}

impl FromStr for NodeId {
    type Err = GraphError;

    /// Parse `NAMESPACE|label`. A string without a recognised namespace tag
    /// is an entity label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, label) = match s.split_once(SEPARATOR) {
            Some((tag, rest)) => match tag.parse::<Namespace>() {
                Ok(ns) => (ns, rest),
                Err(_) => (Namespace::Entity, s),
            },
            None => (Namespace::Entity, s),
        };
        if label.trim().is_empty() {
            return Err(GraphError::InvalidNode { raw: s.to_string() });
        }
        Self::new(namespace, label)
    }
}

impl TryFrom<String> for NodeId {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(node: NodeId) -> Self {
        node.to_string()
    }
}

/// Identity of a triple for deduplication.
pub type TripleKey = (NodeId, String, NodeId);

/// A subject-predicate-object fact with open attributes.
///
/// Attributes are flattened next to the three core fields on the wire, so a
/// record like `{"subject": .., "predicate": .., "object": .., "time": ..}`
/// round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTriple")]
pub struct Triple {
    pub subject: NodeId,
    pub predicate: String,
    pub object: NodeId,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Wire form of a [`Triple`], checked through [`Triple::new`] on the way in.
#[derive(Deserialize)]
struct RawTriple {
    subject: NodeId,
    predicate: String,
    object: NodeId,
    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl TryFrom<RawTriple> for Triple {
    type Error = GraphError;

    fn try_from(raw: RawTriple) -> GraphResult<Self> {
        let mut triple = Triple::new(raw.subject, raw.predicate, raw.object)?;
        triple.attributes = raw.attributes;
        Ok(triple)
    }
}

impl Triple {
    /// Build a triple. The predicate must be non-empty after trimming.
    pub fn new(subject: NodeId, predicate: impl Into<String>, object: NodeId) -> GraphResult<Self> {
        let predicate = predicate.into();
        let predicate = predicate.trim();
        if predicate.is_empty() {
            return Err(GraphError::EmptyField { field: "predicate" });
        }
        Ok(Self {
            subject,
            predicate: predicate.to_string(),
            object,
            attributes: Map::new(),
        })
    }

    /// Parse the wire form of both endpoints and build a triple.
    pub fn parse(subject: &str, predicate: &str, object: &str) -> GraphResult<Self> {
        Self::new(subject.parse()?, predicate, object.parse()?)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn is_inferred(&self) -> bool {
        self.attributes
            .get(INFERRED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_inferred(self) -> Self {
        self.with_attribute(INFERRED, true)
    }

    pub fn key(&self) -> TripleKey {
        (
            self.subject.clone(),
            self.predicate.clone(),
            self.object.clone(),
        )
    }

    pub fn is_self_reference(&self) -> bool {
        self.subject == self.object
    }

    /// A copy with new endpoints and the same predicate and attributes.
    pub fn relabeled(&self, subject: NodeId, object: NodeId) -> Self {
        Self {
            subject,
            predicate: self.predicate.clone(),
            object,
            attributes: self.attributes.clone(),
        }
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --{}--> {}", self.subject, self.predicate, self.object)
    }
}

/// Directed `(subject, object)` edges of the triples whose endpoints are both
/// in `namespace`.
pub fn same_namespace_edges(triples: &[Triple], namespace: Namespace) -> Vec<(NodeId, NodeId)> {
    triples
        .iter()
        .filter(|t| t.subject.namespace() == namespace && t.object.namespace() == namespace)
        .map(|t| (t.subject.clone(), t.object.clone()))
        .collect()
}
