//! Getting ideas in and out of the store and the index: adding, re-embedding,
//! resetting, and free-text lookups. None of this runs inside a linking pass.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::GraphAgent;
use crate::backend::{EmbeddingProvider, Idea, IndexMetadata, VectorIndex};
use crate::cluster::ClusterParams;
use crate::config::Config;
use crate::db::{IdeaStore, NewIdea};
use crate::embeddings::{HashingEmbedder, HnswConfig, HnswIndex};
use crate::error::Result;

/// One hit for a free-text lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextHit {
    pub node_id: String,
    pub distance: Option<f64>,
    pub document: Option<String>,
}

/// Embed an idea's content and put it in the index. Ideas with blank content
/// are left out, so they never get a derived embedding.
pub fn index_idea(
    index: &mut dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    idea: &Idea,
) -> Result<bool> {
    let content = idea.content.trim();
    if content.is_empty() {
        debug!(node_id = %idea.node_id, "blank content; not indexed");
        return Ok(false);
    }
    let embedding = embedder.embed_text(content)?;
    index.add(
        &idea.node_id,
        embedding,
        &idea.content,
        IndexMetadata::for_idea(idea),
    )?;
    Ok(true)
}

/// Store a new idea and index its content. Returns the new node id.
pub fn add_idea(
    store: &IdeaStore,
    index: &mut dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    new: &NewIdea,
) -> Result<String> {
    let node_id = store.create_idea(new)?;
    if let Some(idea) = store.get_idea(&node_id)? {
        index_idea(index, embedder, &idea)?;
    }
    info!(%node_id, "added idea");
    Ok(node_id)
}

/// Re-embed every stored idea into the index. Returns how many were indexed.
pub fn reindex(
    store: &IdeaStore,
    index: &mut dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
) -> Result<usize> {
    let mut added = 0;
    for idea in store.all_ideas()? {
        if index_idea(index, embedder, &idea)? {
            added += 1;
        }
    }
    info!(added, "reindexed ideas");
    Ok(added)
}

/// Delete every edge and idea and empty the index.
pub fn reset(store: &IdeaStore, index: &mut HnswIndex) -> Result<()> {
    let edges = store.delete_all_edges()?;
    let ideas = store.delete_all_ideas()?;
    index.clear();
    info!(edges, ideas, "reset ideas and graph");
    Ok(())
}

/// The `top_k` indexed ideas nearest to free text.
pub fn context_map(
    index: &dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    text: &str,
    top_k: usize,
) -> Result<Vec<ContextHit>> {
    let embedding = embedder.embed_text(text)?;
    let hits = index.query(&embedding, top_k, None)?;
    let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
    let records = index.get(Some(&ids))?;
    Ok(hits
        .into_iter()
        .map(|h| {
            let document = records
                .iter()
                .find(|r| r.id == h.id)
                .map(|r| r.document.clone());
            ContextHit {
                node_id: h.id,
                distance: h.distance,
                document,
            }
        })
        .collect())
}

/// Held from reloading the index file to writing it back, so writers in this
/// process never save over each other's additions.
static INDEX_WRITES: Mutex<()> = Mutex::new(());

/// The on-disk store, the persisted index and the embedder, opened together.
pub struct Workspace {
    pub store: IdeaStore,
    pub index: HnswIndex,
    pub embedder: HashingEmbedder,
    index_path: PathBuf,
    index_config: HnswConfig,
    fallback_pool: usize,
    cluster: ClusterParams,
}

impl Workspace {
    pub fn open(db_path: &Path, index_path: &Path, config: &Config) -> Result<Self> {
        let index = HnswIndex::load_or_new(index_path, config.index.clone())?;
        let embedder = HashingEmbedder::new(config.embedding.dim);
        if let Some(dim) = index.dim().filter(|&d| d != embedder.dim()) {
            warn!(
                index = dim,
                embedder = embedder.dim(),
                "index dimension differs from the embedder; run `ideon reindex`"
            );
        }
        Ok(Self {
            store: IdeaStore::open(db_path)?,
            index,
            embedder,
            index_path: index_path.to_path_buf(),
            index_config: config.index.clone(),
            fallback_pool: config.link.fallback_pool,
            cluster: config.cluster.clone(),
        })
    }

    pub fn save_index(&self) -> Result<()> {
        self.index.save(&self.index_path)
    }

    pub fn agent(&self) -> GraphAgent<'_> {
        GraphAgent::new(&self.index, &self.store, &self.embedder)
            .with_fallback_pool(self.fallback_pool)
            .with_cluster_params(self.cluster.clone())
    }

    /// Apply `f` to the latest index on disk and save the result. The copy
    /// loaded at open may be stale if another workspace has written since.
    fn update_index<T>(
        &mut self,
        f: impl FnOnce(&IdeaStore, &mut HnswIndex, &HashingEmbedder) -> Result<T>,
    ) -> Result<T> {
        let _guard = INDEX_WRITES.lock().unwrap_or_else(PoisonError::into_inner);
        self.index = HnswIndex::load_or_new(&self.index_path, self.index_config.clone())?;
        let out = f(&self.store, &mut self.index, &self.embedder)?;
        self.save_index()?;
        Ok(out)
    }

    pub fn add_idea(&mut self, new: &NewIdea) -> Result<String> {
        self.update_index(|store, index, embedder| add_idea(store, index, embedder, new))
    }

    pub fn reindex(&mut self) -> Result<usize> {
        self.update_index(|store, index, embedder| reindex(store, index, embedder))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.update_index(|store, index, _| reset(store, index))
    }

    pub fn context_map(&self, text: &str, top_k: usize) -> Result<Vec<ContextHit>> {
        context_map(&self.index, &self.embedder, text, top_k)
    }
}
