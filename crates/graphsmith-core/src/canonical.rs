//! # Canonical Graph Form
//!
//! Deterministic, bit-exact representation of a graph.
//!
//! The canonical form is the single source of truth for:
//! - **Fingerprints**: a BLAKE3 hash over the canonical form, used for
//!   deduplication, tie-breaking and provenance linking.
//! - **Export**: a postcard stream with a small header, round-tripping
//!   a graph bit-exactly (used to persist best designs next to provenance).
//!
//! Canonicalisation sorts nodes by id, properties by key and edges by
//! `(source, kind, target, props)`. Edge ids and id counters are dropped;
//! `-0.0` is folded into `0.0` and every NaN into one bit pattern.

use crate::graph::{Graph, Node};
use crate::{Fingerprint, GraphsmithError, NodeId, PropValue, primitives};
use serde::{Deserialize, Serialize};

/// Domain separation tag mixed into every fingerprint.
const FINGERPRINT_DOMAIN: &[u8] = b"graphsmith:graph:v1";

// =============================================================================
// CANONICAL VALUES
// =============================================================================

/// A property value with a total order.
///
/// Numbers are stored as normalised IEEE-754 bits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CanonicalValue {
    Number(u64),
    Category(String),
}

impl From<&PropValue> for CanonicalValue {
    fn from(value: &PropValue) -> Self {
        match value {
            PropValue::Number(n) => Self::Number(normalize_bits(*n)),
            PropValue::Category(s) => Self::Category(s.clone()),
        }
    }
}

impl From<&CanonicalValue> for PropValue {
    fn from(value: &CanonicalValue) -> Self {
        match value {
            CanonicalValue::Number(bits) => PropValue::Number(f64::from_bits(*bits)),
            CanonicalValue::Category(s) => PropValue::Category(s.clone()),
        }
    }
}

fn normalize_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

/// A node in canonical form (sorted by id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalNode {
    pub id: String,
    pub kind: String,
    pub props: Vec<(String, CanonicalValue)>,
}

/// An edge in canonical form (sorted by source, kind, target, props).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalEdge {
    pub source: String,
    pub kind: String,
    pub target: String,
    pub props: Vec<(String, CanonicalValue)>,
}

// =============================================================================
// CANONICAL GRAPH
// =============================================================================

/// A graph in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalGraph {
    pub nodes: Vec<CanonicalNode>,
    pub edges: Vec<CanonicalEdge>,
}

impl CanonicalGraph {
    /// Canonicalise a graph. Nodes already iterate in id order; edges are sorted here.
    #[must_use]
    pub fn from_graph(graph: &Graph) -> Self {
        let nodes = graph
            .nodes()
            .map(|n| CanonicalNode {
                id: n.id.0.clone(),
                kind: n.kind.clone(),
                props: canonical_props(&n.props),
            })
            .collect();

        let mut edges: Vec<CanonicalEdge> = graph
            .edges()
            .map(|e| CanonicalEdge {
                source: e.source.0.clone(),
                kind: e.kind.clone(),
                target: e.target.0.clone(),
                props: canonical_props(&e.props),
            })
            .collect();
        edges.sort();

        Self { nodes, edges }
    }

    /// Rebuild a graph. Edge ids are reassigned in canonical order.
    pub fn to_graph(&self) -> Result<Graph, GraphsmithError> {
        let mut graph = Graph::new();
        for cn in &self.nodes {
            let mut node = Node::new(cn.id.as_str(), cn.kind.as_str());
            for (key, value) in &cn.props {
                node.props.insert(key.clone(), PropValue::from(value));
            }
            graph.insert_node(node)?;
        }
        for ce in &self.edges {
            let id = graph.add_edge(
                &NodeId::from(ce.source.as_str()),
                &NodeId::from(ce.target.as_str()),
                ce.kind.as_str(),
            )?;
            for (key, value) in &ce.props {
                graph.set_edge_prop(id, key.as_str(), PropValue::from(value))?;
            }
        }
        Ok(graph)
    }

    /// BLAKE3 over a length-prefixed walk of the canonical form.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hash_len(&mut hasher, self.nodes.len());
        for node in &self.nodes {
            hash_str(&mut hasher, &node.id);
            hash_str(&mut hasher, &node.kind);
            hash_props(&mut hasher, &node.props);
        }
        hash_len(&mut hasher, self.edges.len());
        for edge in &self.edges {
            hash_str(&mut hasher, &edge.source);
            hash_str(&mut hasher, &edge.kind);
            hash_str(&mut hasher, &edge.target);
            hash_props(&mut hasher, &edge.props);
        }
        Fingerprint(*hasher.finalize().as_bytes())
    }
}

fn canonical_props(
    props: &std::collections::BTreeMap<String, PropValue>,
) -> Vec<(String, CanonicalValue)> {
    props
        .iter()
        .map(|(k, v)| (k.clone(), CanonicalValue::from(v)))
        .collect()
}

fn hash_len(hasher: &mut blake3::Hasher, len: usize) {
    hasher.update(&(len as u64).to_le_bytes());
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    hash_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

fn hash_props(hasher: &mut blake3::Hasher, props: &[(String, CanonicalValue)]) {
    hash_len(hasher, props.len());
    for (key, value) in props {
        hash_str(hasher, key);
        match value {
            CanonicalValue::Number(bits) => {
                hasher.update(&[0u8]);
                hasher.update(&bits.to_le_bytes());
            }
            CanonicalValue::Category(s) => {
                hasher.update(&[1u8]);
                hash_str(hasher, s);
            }
        }
    }
}

// =============================================================================
// EXPORT / IMPORT
// =============================================================================

/// Header preceding an exported canonical graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ExportHeader {
    magic: [u8; 4],
    version: u8,
    node_count: u64,
    edge_count: u64,
    fingerprint: [u8; 32],
}

/// Export a graph as `[header_len: u32][header][canonical graph]`, all postcard.
pub fn export_graph(graph: &Graph) -> Result<Vec<u8>, GraphsmithError> {
    let canonical = CanonicalGraph::from_graph(graph);
    let header = ExportHeader {
        magic: *primitives::GRAPH_MAGIC,
        version: primitives::GRAPH_FORMAT_VERSION,
        node_count: canonical.nodes.len() as u64,
        edge_count: canonical.edges.len() as u64,
        fingerprint: canonical.fingerprint().0,
    };

    let header_bytes = postcard::to_allocvec(&header)
        .map_err(|e| GraphsmithError::Serialization(format!("Header: {}", e)))?;
    let data_bytes = postcard::to_allocvec(&canonical)
        .map_err(|e| GraphsmithError::Serialization(format!("Data: {}", e)))?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + data_bytes.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&data_bytes);
    Ok(out)
}

/// Import a graph exported by [`export_graph`], verifying header and fingerprint.
pub fn import_graph(data: &[u8]) -> Result<Graph, GraphsmithError> {
    if data.len() < 4 {
        return Err(GraphsmithError::Serialization(
            "Data too short".to_string(),
        ));
    }
    let header_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let body_start = 4usize.saturating_add(header_len);
    if data.len() < body_start {
        return Err(GraphsmithError::Serialization(
            "Data too short for header".to_string(),
        ));
    }

    let header: ExportHeader = postcard::from_bytes(&data[4..body_start])
        .map_err(|e| GraphsmithError::Serialization(format!("Header: {}", e)))?;
    if &header.magic != primitives::GRAPH_MAGIC {
        return Err(GraphsmithError::Serialization(
            "Invalid file format".to_string(),
        ));
    }
    if header.version != primitives::GRAPH_FORMAT_VERSION {
        return Err(GraphsmithError::Serialization(
            "Unsupported file version".to_string(),
        ));
    }

    let canonical: CanonicalGraph = postcard::from_bytes(&data[body_start..])
        .map_err(|e| GraphsmithError::Serialization(format!("Data: {}", e)))?;

    if canonical.nodes.len() as u64 != header.node_count
        || canonical.edges.len() as u64 != header.edge_count
    {
        return Err(GraphsmithError::Serialization(
            "Count mismatch".to_string(),
        ));
    }
    if canonical.fingerprint().0 != header.fingerprint {
        return Err(GraphsmithError::Serialization(
            "Fingerprint mismatch".to_string(),
        ));
    }

    canonical.to_graph()
}

// =============================================================================
// TESTS
// =============================================================================
