//! Collaborator seams for the linking and clustering engine.
//!
//! The engine never talks to SQLite, the HNSW graph or the hashing embedder
//! directly. It is handed something implementing [`RelationalStore`],
//! [`VectorIndex`] and [`EmbeddingProvider`], so tests can substitute
//! scripted fakes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::similarity::parse_tags;

// ---------------------------------------------------------------------------
// Ideas and ownership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Idea {
    pub node_id: String,
    pub user_id: Option<String>,
    pub voice_profile_id: Option<String>,
    pub title: String,
    pub content: String,
    /// Raw tags in the order they were written.
    pub tags: Vec<String>,
    pub created_at: NaiveDateTime,
}

impl Idea {
    /// Lowercased tag set used for overlap scoring.
    pub fn tag_set(&self) -> BTreeSet<String> {
        parse_tags(&self.tags.join(","))
    }

    pub fn scope(&self) -> OwnerScope {
        OwnerScope {
            user_id: self.user_id.clone(),
            voice_profile_id: self.voice_profile_id.clone(),
        }
    }
}

/// The (user, voice profile) pair partitioning ideas by writing-style owner.
/// An absent component matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerScope {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub voice_profile_id: Option<String>,
}

impl OwnerScope {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.voice_profile_id.is_none()
    }

    /// Equality predicate for the vector index. The voice profile is the
    /// narrower key, so it wins when both are present.
    pub fn index_filter(&self) -> Option<IndexFilter> {
        let non_blank = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        if let Some(vp) = non_blank(&self.voice_profile_id) {
            return Some(IndexFilter::VoiceProfile(vp));
        }
        non_blank(&self.user_id).map(IndexFilter::User)
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Similar,
    ClusterMember,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Similar => "similar",
            EdgeType::ClusterMember => "cluster_member",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "similar" => Ok(EdgeType::Similar),
            "cluster_member" => Ok(EdgeType::ClusterMember),
            other => Err(format!("unknown edge type: {other}")),
        }
    }
}

/// Metadata carried by an edge, stored as JSON next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeMetadata {
    Similar {
        distance: Option<f64>,
        tag_overlap: Option<usize>,
        src_tags: BTreeSet<String>,
        dst_tags: BTreeSet<String>,
    },
    Cluster {
        label: String,
    },
}

impl EdgeMetadata {
    pub fn distance(&self) -> Option<f64> {
        match self {
            EdgeMetadata::Similar { distance, .. } => *distance,
            EdgeMetadata::Cluster { .. } => None,
        }
    }

    pub fn tag_overlap(&self) -> Option<usize> {
        match self {
            EdgeMetadata::Similar { tag_overlap, .. } => *tag_overlap,
            EdgeMetadata::Cluster { .. } => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            EdgeMetadata::Cluster { label } => Some(label),
            EdgeMetadata::Similar { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub edge_id: String,
    pub src_id: String,
    pub dst_id: String,
    pub edge_type: EdgeType,
    pub weight: f64,
    pub metadata: EdgeMetadata,
    pub created_at: NaiveDateTime,
}

// ---------------------------------------------------------------------------
// Vector index records
// ---------------------------------------------------------------------------

/// Per-record metadata kept next to each indexed embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub voice_profile_id: Option<String>,
}

impl IndexMetadata {
    pub fn for_idea(idea: &Idea) -> Self {
        Self {
            title: idea.title.clone(),
            tags: idea.tags.clone(),
            user_id: idea.user_id.clone(),
            voice_profile_id: idea.voice_profile_id.clone(),
        }
    }
}

/// Equality predicate applied to index metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFilter {
    User(String),
    VoiceProfile(String),
}

impl IndexFilter {
    pub fn matches(&self, md: &IndexMetadata) -> bool {
        match self {
            IndexFilter::User(u) => md.user_id.as_deref() == Some(u.as_str()),
            IndexFilter::VoiceProfile(v) => md.voice_profile_id.as_deref() == Some(v.as_str()),
        }
    }
}

/// One hit from a nearest-neighbour query. Distance is whatever the index
/// reports and is not assumed to equal `1 - cosine`.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: IndexMetadata,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Text → fixed-dimension unit-normalized vector.
pub trait EmbeddingProvider {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
    fn dim(&self) -> usize;
}

/// Approximate nearest-neighbour storage over idea embeddings.
pub trait VectorIndex {
    /// Up to `n_results` neighbours of `embedding`, closest first.
    fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<Neighbor>>;

    /// Records for the given ids, or every record when `ids` is `None`.
    /// Unknown ids are skipped.
    fn get(&self, ids: Option<&[String]>) -> Result<Vec<IndexRecord>>;

    fn add(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        content: &str,
        metadata: IndexMetadata,
    ) -> Result<()>;

    /// Stored embedding for a single id, if any.
    fn embedding_for(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let records = self.get(Some(&[id.to_string()]))?;
        Ok(records
            .into_iter()
            .next()
            .map(|r| r.embedding)
            .filter(|e| !e.is_empty()))
    }
}

/// Idea and edge persistence.
pub trait RelationalStore {
    fn get_idea(&self, node_id: &str) -> Result<Option<Idea>>;

    /// The `limit` most recently created ideas in `scope`, newest first.
    fn list_ideas(&self, limit: usize, scope: &OwnerScope) -> Result<Vec<Idea>>;

    fn edge_exists(&self, src_id: &str, dst_id: &str, edge_type: EdgeType) -> Result<bool>;

    /// Insert an edge and return its id.
    fn create_edge(
        &self,
        src_id: &str,
        dst_id: &str,
        edge_type: EdgeType,
        weight: f64,
        metadata: &EdgeMetadata,
    ) -> Result<String>;

    fn list_edges_for_node(&self, node_id: &str, limit: usize) -> Result<Vec<Edge>>;
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------
