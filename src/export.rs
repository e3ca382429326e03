//! Cytoscape-style JSON view of the idea graph.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::backend::{EdgeType, Idea, OwnerScope};
use crate::db::IdeaStore;

/// Edges scanned when building a view.
pub const EDGE_SCAN_LIMIT: usize = 1000;

const LABEL_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Serialize)]
pub struct NodeData {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_cluster: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeData {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub weight: f64,
    pub distance: Option<f64>,
    pub tag_overlap: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Element<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize)]
pub struct Elements {
    pub nodes: Vec<Element<NodeData>>,
    pub edges: Vec<Element<EdgeData>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counts {
    pub nodes: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    pub elements: Elements,
    pub counts: Counts,
}

/// Display label: the title, else the content cut to 60 characters, else
/// "Untitled".
pub fn label_for(idea: &Idea) -> String {
    let title = idea.title.trim();
    if !title.is_empty() {
        return title.to_string();
    }
    let content = idea.content.trim();
    if content.is_empty() {
        return "Untitled".to_string();
    }
    if content.chars().count() > LABEL_MAX_CHARS {
        let head: String = content.chars().take(LABEL_MAX_CHARS).collect();
        format!("{head}…")
    } else {
        content.to_string()
    }
}

/// The `limit` newest ideas as nodes, plus every cluster node referenced by
/// a membership edge. Edges are deduplicated per (source, target, type) and
/// dropped when either end is not in the view.
pub fn graph_view(store: &IdeaStore, limit: usize) -> rusqlite::Result<GraphView> {
    let ideas = store.list_ideas(limit, &OwnerScope::any())?;
    let edges = store.list_all_edges(EDGE_SCAN_LIMIT)?;

    let mut seen = HashSet::new();
    let mut cluster_nodes: BTreeMap<String, String> = BTreeMap::new();
    let mut edge_elems = Vec::new();
    for e in edges {
        if !seen.insert((e.src_id.clone(), e.dst_id.clone(), e.edge_type)) {
            continue;
        }
        if e.edge_type == EdgeType::ClusterMember && e.src_id.starts_with("cluster:") {
            let label = e
                .metadata
                .label()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or(&e.src_id)
                .to_string();
            cluster_nodes.insert(e.src_id.clone(), label);
        }
        edge_elems.push(Element {
            data: EdgeData {
                distance: e.metadata.distance(),
                tag_overlap: e.metadata.tag_overlap(),
                id: e.edge_id,
                source: e.src_id,
                target: e.dst_id,
                edge_type: e.edge_type,
                weight: e.weight,
            },
        });
    }

    let mut nodes: Vec<Element<NodeData>> = ideas
        .iter()
        .map(|idea| Element {
            data: NodeData {
                id: idea.node_id.clone(),
                label: label_for(idea),
                is_cluster: false,
                created_at: Some(idea.created_at.format("%Y-%m-%dT%H:%M:%S").to_string()),
            },
        })
        .collect();
    nodes.extend(cluster_nodes.into_iter().map(|(id, label)| Element {
        data: NodeData {
            id,
            label,
            is_cluster: true,
            created_at: None,
        },
    }));

    let node_ids: HashSet<&str> = nodes.iter().map(|n| n.data.id.as_str()).collect();
    edge_elems.retain(|e| {
        node_ids.contains(e.data.source.as_str()) && node_ids.contains(e.data.target.as_str())
    });

    Ok(GraphView {
        counts: Counts {
            nodes: nodes.len(),
            edges: edge_elems.len(),
        },
        elements: Elements {
            nodes,
            edges: edge_elems,
        },
    })
}
