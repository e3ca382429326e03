//! `GraphAgent`: the entry point wiring the linker and the cluster engine to
//! one set of collaborators.

use serde::Serialize;
use tracing::info;

use crate::backend::{EmbeddingProvider, OwnerScope, RelationalStore, VectorIndex};
use crate::cluster::{ClusterEngine, ClusterParams, ClusterReport};
use crate::error::Result;
use crate::linker::{CreatedEdge, LinkPolicy, SimilarityLinker, DEFAULT_FALLBACK_POOL};

/// Edges created for one idea during a batch pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLinkReport {
    pub node_id: String,
    pub created_edges: Vec<CreatedEdge>,
}

pub struct GraphAgent<'a> {
    index: &'a dyn VectorIndex,
    store: &'a dyn RelationalStore,
    embedder: &'a dyn EmbeddingProvider,
    fallback_pool: usize,
    cluster: ClusterParams,
}

impl<'a> GraphAgent<'a> {
    pub fn new(
        index: &'a dyn VectorIndex,
        store: &'a dyn RelationalStore,
        embedder: &'a dyn EmbeddingProvider,
    ) -> Self {
        Self {
            index,
            store,
            embedder,
            fallback_pool: DEFAULT_FALLBACK_POOL,
            cluster: ClusterParams::default(),
        }
    }

    pub fn with_fallback_pool(mut self, size: usize) -> Self {
        self.fallback_pool = size;
        self
    }

    pub fn with_cluster_params(mut self, params: ClusterParams) -> Self {
        self.cluster = params;
        self
    }

    fn linker(&self) -> SimilarityLinker<'a> {
        SimilarityLinker::new(self.index, self.store, self.embedder)
            .with_fallback_pool(self.fallback_pool)
    }

    pub fn autolink_for_node(
        &self,
        node_id: &str,
        policy: &LinkPolicy,
        scope: Option<&OwnerScope>,
    ) -> Result<Vec<CreatedEdge>> {
        self.linker().autolink_for_node(node_id, policy, scope)
    }

    /// Link each of the `limit` newest ideas in `scope` independently. Each
    /// idea searches within its own owner scope.
    pub fn autolink_recent(
        &self,
        limit: usize,
        policy: &LinkPolicy,
        scope: &OwnerScope,
    ) -> Result<Vec<NodeLinkReport>> {
        let linker = self.linker();
        let ideas = self.store.list_ideas(limit, scope)?;
        let mut out = Vec::with_capacity(ideas.len());
        for idea in ideas {
            let created_edges = linker.autolink_for_node(&idea.node_id, policy, None)?;
            out.push(NodeLinkReport {
                node_id: idea.node_id,
                created_edges,
            });
        }
        let created: usize = out.iter().map(|r| r.created_edges.len()).sum();
        info!(ideas = out.len(), created, "autolinked recent ideas");
        Ok(out)
    }

    pub fn cluster_ideas(&self, k: usize) -> Result<ClusterReport> {
        ClusterEngine::new(self.index, self.store)
            .with_params(self.cluster.clone())
            .cluster_ideas(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FixedEmbedder, ScriptedIndex};
    use crate::backend::{EdgeType, IndexMetadata};
    use crate::db::{IdeaStore, NewIdea};

    fn add(
        store: &IdeaStore,
        index: &mut ScriptedIndex,
        title: &str,
        tags: &[&str],
        user: &str,
        v: Vec<f32>,
    ) -> String {
        let id = store
            .create_idea(&NewIdea {
                title: title.into(),
                content: title.into(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                user_id: Some(user.into()),
                voice_profile_id: None,
            })
            .unwrap();
        index.insert(
            &id,
            v,
            IndexMetadata {
                title: title.into(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                user_id: Some(user.into()),
                voice_profile_id: None,
            },
        );
        id
    }

    #[test]
    fn test_autolink_recent_reports_every_idea() {
        let store = IdeaStore::open_in_memory().unwrap();
        let mut index = ScriptedIndex::new();
        let a = add(&store, &mut index, "garden plan", &["garden"], "u1", vec![1.0, 0.0]);
        let b = add(&store, &mut index, "garden tools", &["garden"], "u1", vec![0.9, 0.4358899]);
        let c = add(&store, &mut index, "tax forms", &["money"], "u1", vec![0.0, -1.0]);
        let embedder = FixedEmbedder::default();
        let agent = GraphAgent::new(&index, &store, &embedder);

        let report = agent
            .autolink_recent(10, &LinkPolicy::recent(), &OwnerScope::any())
            .unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(report[0].node_id, c);

        let by_id = |id: &str| report.iter().find(|r| r.node_id == id).unwrap();
        assert_eq!(by_id(a.as_str()).created_edges.len(), 1);
        assert_eq!(by_id(a.as_str()).created_edges[0].dst_id, b);
        assert_eq!(by_id(b.as_str()).created_edges.len(), 1);
        assert_eq!(by_id(b.as_str()).created_edges[0].dst_id, a);
        assert!(by_id(c.as_str()).created_edges.is_empty());

        // A second pass finds the same pairs and creates nothing new.
        let again = agent
            .autolink_recent(10, &LinkPolicy::recent(), &OwnerScope::any())
            .unwrap();
        assert!(again.iter().all(|r| r.created_edges.is_empty()));
    }

    #[test]
    fn test_autolink_recent_respects_limit_and_scope() {
        let store = IdeaStore::open_in_memory().unwrap();
        let mut index = ScriptedIndex::new();
        add(&store, &mut index, "one", &[], "u1", vec![1.0, 0.0]);
        add(&store, &mut index, "two", &[], "u2", vec![1.0, 0.0]);
        let three = add(&store, &mut index, "three", &[], "u1", vec![1.0, 0.0]);
        let embedder = FixedEmbedder::default();
        let agent = GraphAgent::new(&index, &store, &embedder);

        let scope = OwnerScope {
            user_id: Some("u1".into()),
            voice_profile_id: None,
        };
        let report = agent
            .autolink_recent(1, &LinkPolicy::default(), &scope)
            .unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].node_id, three);
        // Only the other u1 idea is reachable.
        assert_eq!(report[0].created_edges.len(), 1);
        let dst = &report[0].created_edges[0].dst_id;
        assert_eq!(store.get_idea(dst).unwrap().unwrap().title, "one");
    }

    #[test]
    fn test_agent_clusters_with_params() {
        let store = IdeaStore::open_in_memory().unwrap();
        let mut index = ScriptedIndex::new();
        let a = add(&store, &mut index, "alpha", &[], "u1", vec![1.0, 0.0]);
        add(&store, &mut index, "beta", &[], "u1", vec![0.0, 1.0]);
        let embedder = FixedEmbedder::default();
        let agent = GraphAgent::new(&index, &store, &embedder).with_cluster_params(ClusterParams {
            k: 2,
            max_iter: 10,
            seed: 1,
        });

        let report = agent.cluster_ideas(2).unwrap();
        assert_eq!(report.clusters.len(), 2);
        let edges = store.list_edges_for_node(&a, 10).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::ClusterMember);
    }
}
