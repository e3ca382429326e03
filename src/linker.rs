//! Similarity linking: decide which ideas an idea should connect to, and
//! persist those connections as `similar` edges.
//!
//! A candidate passes if any of several overlapping screens fire: the
//! reported distance is within `max_distance`, it is within the
//! unconditional `close_override_distance`, tags corroborate a slightly
//! relaxed distance, or the independently computed cosine clears
//! `min_cosine`. An optional mutual-nearest-neighbour gate can still veto it.
//!
//! Links are directed. Linking A→B does not create B→A.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{
    EdgeMetadata, EdgeType, EmbeddingProvider, Idea, Neighbor, OwnerScope, RelationalStore,
    VectorIndex,
};
use crate::error::Result;
use crate::similarity::{cosine_similarity, tag_overlap, weight_from_distance};

/// How far past `max_distance` a candidate may sit when tags corroborate it.
pub const TAG_RELAXED_MARGIN: f64 = 0.10;

/// Size of the recent-idea pool scanned when the index cannot answer.
pub const DEFAULT_FALLBACK_POOL: usize = 200;

/// Acceptance thresholds for one linking pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkPolicy {
    pub top_k: usize,
    pub exclude_self: bool,
    pub max_distance: f64,
    pub require_tag_overlap: bool,
    pub min_tag_overlap: usize,
    pub close_override_distance: f64,
    pub min_cosine: f64,
    pub require_mutual: bool,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            top_k: 5,
            exclude_self: true,
            max_distance: 0.85,
            require_tag_overlap: false,
            min_tag_overlap: 1,
            close_override_distance: 0.35,
            min_cosine: 0.55,
            require_mutual: false,
        }
    }
}

impl LinkPolicy {
    /// Stricter thresholds used when linking a batch of recent ideas.
    pub fn recent() -> Self {
        Self {
            max_distance: 0.6,
            require_tag_overlap: true,
            close_override_distance: 0.3,
            ..Self::default()
        }
    }

    /// Neighbours to request; one extra slot is reserved for the node itself.
    fn query_size(&self) -> usize {
        self.top_k + usize::from(self.exclude_self)
    }

    /// Whether a candidate passes the distance, tag and cosine screens.
    /// Any single screen is enough.
    pub fn accepts(&self, distance: Option<f64>, cosine: Option<f64>, overlap: usize) -> bool {
        let by_distance = distance.is_some_and(|d| {
            d <= self.max_distance
                || d <= self.close_override_distance
                || (self.require_tag_overlap
                    && overlap >= self.min_tag_overlap
                    && d <= self.max_distance + TAG_RELAXED_MARGIN)
        });
        let by_cosine = cosine.is_some_and(|c| c >= self.min_cosine);
        by_distance || by_cosine
    }
}

/// One `similar` edge created by a linking pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedEdge {
    pub edge_id: String,
    pub dst_id: String,
    pub weight: f64,
    pub distance: Option<f64>,
    pub tag_overlap: usize,
}

pub struct SimilarityLinker<'a> {
    index: &'a dyn VectorIndex,
    store: &'a dyn RelationalStore,
    embedder: &'a dyn EmbeddingProvider,
    fallback_pool: usize,
}

impl<'a> SimilarityLinker<'a> {
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
        }
    }

    pub fn with_fallback_pool(mut self, size: usize) -> Self {
        self.fallback_pool = size;
        self
    }

    /// Embedding for an idea: the indexed vector if there is one, otherwise
    /// one derived from its content. `None` when neither is available.
    pub fn idea_embedding(&self, node_id: &str, idea: Option<&Idea>) -> Result<Option<Vec<f32>>> {
        match self.index.embedding_for(node_id) {
            Ok(Some(v)) => return Ok(Some(v)),
            Ok(None) => {}
            Err(e) => warn!(node_id, error = %e, "index lookup failed; embedding from content"),
        }
        let Some(content) = idea.map(|i| i.content.trim()).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        let v = self.embedder.embed_text(content)?;
        Ok(Some(v).filter(|v| !v.is_empty()))
    }

    /// Link `node_id` to its qualifying neighbours and return the edges
    /// created. `scope` defaults to the source idea's own owner keys.
    pub fn autolink_for_node(
        &self,
        node_id: &str,
        policy: &LinkPolicy,
        scope: Option<&OwnerScope>,
    ) -> Result<Vec<CreatedEdge>> {
        let src = self.store.get_idea(node_id)?;
        let Some(emb) = self.idea_embedding(node_id, src.as_ref())? else {
            debug!(node_id, "no embedding available; nothing to link");
            return Ok(vec![]);
        };
        let src_tags = src.as_ref().map(Idea::tag_set).unwrap_or_default();
        let scope = scope
            .cloned()
            .or_else(|| src.as_ref().map(Idea::scope))
            .unwrap_or_default();

        let candidates = self.candidates(node_id, &emb, policy, &scope)?;

        let mut created = Vec::new();
        for hit in candidates {
            if policy.exclude_self && hit.id == node_id {
                continue;
            }

            let dst = self.store.get_idea(&hit.id)?;
            let dst_tags = dst.as_ref().map(Idea::tag_set).unwrap_or_default();
            let overlap = tag_overlap(&src_tags, &dst_tags);

            // The index distance and the cosine are not guaranteed to agree.
            let dst_emb = match self.idea_embedding(&hit.id, dst.as_ref()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(src = node_id, dst = %hit.id, error = %e, "candidate has no usable embedding");
                    None
                }
            };
            let cosine = dst_emb.as_ref().map(|v| cosine_similarity(&emb, v));

            if !policy.accepts(hit.distance, cosine, overlap) {
                debug!(src = node_id, dst = %hit.id, distance = ?hit.distance, cosine = ?cosine, overlap, "rejected");
                continue;
            }
            if policy.require_mutual {
                if let Some(v) = &dst_emb {
                    if !self.is_mutual(node_id, v, policy) {
                        debug!(src = node_id, dst = %hit.id, "not a mutual neighbour");
                        continue;
                    }
                }
            }
            if self.store.edge_exists(node_id, &hit.id, EdgeType::Similar)? {
                continue;
            }

            let weight = match hit.distance {
                Some(_) => weight_from_distance(hit.distance),
                None => cosine.unwrap_or(0.0),
            }
            .clamp(0.0, 1.0);
            let metadata = EdgeMetadata::Similar {
                distance: hit.distance,
                tag_overlap: Some(overlap),
                src_tags: src_tags.clone(),
                dst_tags,
            };
            let edge_id =
                self.store
                    .create_edge(node_id, &hit.id, EdgeType::Similar, weight, &metadata)?;
            created.push(CreatedEdge {
                edge_id,
                dst_id: hit.id,
                weight,
                distance: hit.distance,
                tag_overlap: overlap,
            });
        }

        info!(node_id, created = created.len(), "autolink finished");
        Ok(created)
    }

    /// Index neighbours, or an exact scan of recent ideas when the index
    /// fails or comes back short.
    fn candidates(
        &self,
        node_id: &str,
        emb: &[f32],
        policy: &LinkPolicy,
        scope: &OwnerScope,
    ) -> Result<Vec<Neighbor>> {
        let filter = scope.index_filter();
        let hits = match self.index.query(emb, policy.query_size(), filter.as_ref()) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(node_id, error = %e, "index query failed");
                vec![]
            }
        };
        let usable = hits
            .iter()
            .filter(|h| !(policy.exclude_self && h.id == node_id))
            .count();
        if usable >= policy.top_k {
            return Ok(hits);
        }

        debug!(node_id, usable, top_k = policy.top_k, "index short; using exact search");
        let exact = self.exact_neighbours(node_id, emb, policy, scope)?;
        if exact.is_empty() {
            Ok(hits)
        } else {
            Ok(exact)
        }
    }

    /// Cosine-ranked neighbours among the most recent ideas in `scope`, with
    /// `distance = 1 - cosine`.
    fn exact_neighbours(
        &self,
        node_id: &str,
        emb: &[f32],
        policy: &LinkPolicy,
        scope: &OwnerScope,
    ) -> Result<Vec<Neighbor>> {
        let pool = self.store.list_ideas(self.fallback_pool, scope)?;
        let mut sims: Vec<(String, f64)> = Vec::with_capacity(pool.len());
        for idea in &pool {
            if policy.exclude_self && idea.node_id == node_id {
                continue;
            }
            match self.idea_embedding(&idea.node_id, Some(idea)) {
                Ok(Some(v)) => sims.push((idea.node_id.clone(), cosine_similarity(emb, &v))),
                Ok(None) => {}
                Err(e) => warn!(node_id = %idea.node_id, error = %e, "skipping unembeddable idea"),
            }
        }
        sims.sort_by(|a, b| b.1.total_cmp(&a.1));
        sims.truncate(policy.top_k);
        Ok(sims
            .into_iter()
            .map(|(id, cos)| Neighbor {
                id,
                distance: Some((1.0 - cos).max(0.0)),
            })
            .collect())
    }

    /// Whether `node_id` shows up among the neighbours of `candidate_emb`.
    /// An index failure here does not veto the link.
    fn is_mutual(&self, node_id: &str, candidate_emb: &[f32], policy: &LinkPolicy) -> bool {
        match self.index.query(candidate_emb, policy.query_size(), None) {
            Ok(hits) => hits.iter().any(|h| h.id == node_id),
            Err(e) => {
                warn!(node_id, error = %e, "mutual-neighbour query failed; keeping candidate");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FixedEmbedder, ScriptedIndex};
    use crate::backend::IndexMetadata;
    use crate::db::{IdeaStore, NewIdea};

    const B_VEC: [f32; 2] = [0.9, 0.435_889_9];

    struct Fixture {
        store: IdeaStore,
        index: ScriptedIndex,
        embedder: FixedEmbedder,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: IdeaStore::open_in_memory().unwrap(),
                index: ScriptedIndex::new(),
                embedder: FixedEmbedder::default(),
            }
        }

        /// Store an idea and index it under `v` when given.
        fn idea(&mut self, title: &str, tags: &[&str], vp: &str, v: Option<Vec<f32>>) -> String {
            let new = NewIdea {
                title: title.to_string(),
                content: title.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                user_id: Some("u1".into()),
                voice_profile_id: Some(vp.into()),
            };
            let id = self.store.create_idea(&new).unwrap();
            if let Some(v) = v {
                let md = IndexMetadata {
                    voice_profile_id: Some(vp.into()),
                    ..Default::default()
                };
                self.index.insert(&id, v, md);
            }
            id
        }

        fn linker(&self) -> SimilarityLinker<'_> {
            SimilarityLinker::new(&self.index, &self.store, &self.embedder)
        }
    }

    fn top1() -> LinkPolicy {
        LinkPolicy {
            top_k: 1,
            ..LinkPolicy::default()
        }
    }

    /// Two indexed ideas A=[1,0] and B=B_VEC, with A's query answer scripted.
    fn pair(distance: f64) -> (Fixture, String, String) {
        let mut fx = Fixture::new();
        let a = fx.idea("A", &[], "vp1", Some(vec![1.0, 0.0]));
        let b = fx.idea("B", &[], "vp1", Some(B_VEC.to_vec()));
        fx.index.script(vec![1.0, 0.0], &[(&a, 0.0), (&b, distance)]);
        (fx, a, b)
    }

    #[test]
    fn test_policy_screens() {
        let p = LinkPolicy::default();
        assert!(p.accepts(Some(0.85), None, 0));
        assert!(!p.accepts(Some(0.9), Some(0.1), 0));
        assert!(p.accepts(Some(5.0), Some(0.55), 0));
        assert!(!p.accepts(None, None, 3));

        let tags = LinkPolicy {
            require_tag_overlap: true,
            ..LinkPolicy::default()
        };
        assert!(tags.accepts(Some(0.9), None, 1));
        assert!(!tags.accepts(Some(0.9), None, 0));
        assert!(!tags.accepts(Some(0.96), None, 1));
    }

    #[test]
    fn test_close_override_ignores_other_settings() {
        let p = LinkPolicy {
            max_distance: 0.0,
            min_cosine: 2.0,
            require_tag_overlap: true,
            min_tag_overlap: 10,
            ..LinkPolicy::default()
        };
        assert!(p.accepts(Some(0.35), Some(-1.0), 0));
        assert!(!p.accepts(Some(0.36), Some(-1.0), 0));
    }

    #[test]
    fn test_missing_embedding_returns_empty() {
        let mut fx = Fixture::new();
        let new = NewIdea {
            title: "blank".into(),
            ..Default::default()
        };
        let id = fx.store.create_idea(&new).unwrap();
        fx.idea("other", &[], "vp1", Some(vec![1.0, 0.0]));
        let linker = fx.linker();
        assert!(linker
            .autolink_for_node(&id, &LinkPolicy::default(), None)
            .unwrap()
            .is_empty());
        assert!(linker
            .autolink_for_node("no-such-idea", &LinkPolicy::default(), None)
            .unwrap()
            .is_empty());
        assert_eq!(fx.index.queries.get(), 0);
    }

    #[test]
    fn test_end_to_end_single_edge() {
        let (fx, a, b) = pair(0.1);
        let created = fx
            .linker()
            .autolink_for_node(&a, &LinkPolicy::default(), None)
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].dst_id, b);
        assert!((created[0].weight - 0.909).abs() < 1e-3);
        assert!((created[0].distance.unwrap() - 0.1).abs() < 1e-6);

        let edges = fx.store.list_edges_for_node(&a, 10).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].src_id, a);
        assert_eq!(edges[0].edge_type, EdgeType::Similar);
    }

    #[test]
    fn test_repeated_calls_do_not_duplicate() {
        let (fx, a, _) = pair(0.1);
        let linker = fx.linker();
        assert_eq!(linker.autolink_for_node(&a, &top1(), None).unwrap().len(), 1);
        assert!(linker.autolink_for_node(&a, &top1(), None).unwrap().is_empty());
        assert!(linker
            .autolink_for_node(&a, &LinkPolicy::default(), None)
            .unwrap()
            .is_empty());
        assert_eq!(fx.store.list_all_edges(10).unwrap().len(), 1);
    }

    #[test]
    fn test_linking_is_directed() {
        let (fx, a, b) = pair(0.1);
        fx.linker().autolink_for_node(&a, &top1(), None).unwrap();
        assert!(fx.store.edge_exists(&a, &b, EdgeType::Similar).unwrap());
        assert!(!fx.store.edge_exists(&b, &a, EdgeType::Similar).unwrap());
    }

    #[test]
    fn test_close_override_accepts_low_cosine() {
        let mut fx = Fixture::new();
        let a = fx.idea("A", &[], "vp1", Some(vec![1.0, 0.0]));
        let b = fx.idea("B", &[], "vp1", Some(vec![0.0, 1.0]));
        fx.index.script(vec![1.0, 0.0], &[(&a, 0.0), (&b, 0.3)]);
        let policy = LinkPolicy {
            top_k: 1,
            max_distance: 0.1,
            min_cosine: 0.99,
            ..LinkPolicy::default()
        };
        let created = fx.linker().autolink_for_node(&a, &policy, None).unwrap();
        assert_eq!(created.len(), 1);
        assert!((created[0].weight - 1.0 / 1.3).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_path_accepts_far_distance() {
        let (fx, a, b) = pair(2.0);
        let created = fx.linker().autolink_for_node(&a, &top1(), None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].dst_id, b);
        // Weight still follows the reported distance.
        assert!((created[0].weight - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_qualifies() {
        let mut fx = Fixture::new();
        let a = fx.idea("A", &["x"], "vp1", Some(vec![1.0, 0.0]));
        let b = fx.idea("B", &["y"], "vp1", Some(vec![0.0, 1.0]));
        fx.index.script(vec![1.0, 0.0], &[(&a, 0.0), (&b, 0.9)]);
        let created = fx.linker().autolink_for_node(&a, &top1(), None).unwrap();
        assert!(created.is_empty());
        assert!(fx.store.list_all_edges(10).unwrap().is_empty());
    }

    #[test]
    fn test_tag_overlap_relaxes_distance() {
        let mut fx = Fixture::new();
        let a = fx.idea("A", &["Garden", "food"], "vp1", Some(vec![1.0, 0.0]));
        let b = fx.idea("B", &["garden"], "vp1", Some(vec![0.0, 1.0]));
        let c = fx.idea("C", &["music"], "vp1", Some(vec![0.0, -1.0]));
        fx.index
            .script(vec![1.0, 0.0], &[(&a, 0.0), (&b, 0.9), (&c, 0.9)]);
        let policy = LinkPolicy {
            top_k: 2,
            require_tag_overlap: true,
            ..LinkPolicy::default()
        };
        let created = fx.linker().autolink_for_node(&a, &policy, None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].dst_id, b);
        assert_eq!(created[0].tag_overlap, 1);

        let edge = &fx.store.list_edges_for_node(&b, 10).unwrap()[0];
        match &edge.metadata {
            EdgeMetadata::Similar {
                src_tags, dst_tags, ..
            } => {
                assert!(src_tags.contains("garden") && src_tags.contains("food"));
                assert_eq!(dst_tags.len(), 1);
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[test]
    fn test_mutual_gate_rejects_one_sided_neighbour() {
        let (mut fx, a, _) = pair(0.1);
        let c = fx.idea("C", &[], "vp1", Some(vec![0.8, 0.6]));
        // B's own neighbourhood does not include A.
        fx.index.script(B_VEC.to_vec(), &[(&c, 0.0), (&c, 0.01)]);
        let policy = LinkPolicy {
            require_mutual: true,
            ..top1()
        };
        assert!(fx.linker().autolink_for_node(&a, &policy, None).unwrap().is_empty());
    }

    #[test]
    fn test_mutual_gate_keeps_reciprocal_neighbour() {
        let (mut fx, a, b) = pair(0.1);
        fx.index.script(B_VEC.to_vec(), &[(&b, 0.0), (&a, 0.1)]);
        let policy = LinkPolicy {
            require_mutual: true,
            ..top1()
        };
        let created = fx.linker().autolink_for_node(&a, &policy, None).unwrap();
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn test_index_failure_falls_back_to_exact_search() {
        let (mut fx, a, b) = pair(0.1);
        fx.index.fail_queries = true;
        let created = fx.linker().autolink_for_node(&a, &top1(), None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].dst_id, b);
        assert!((created[0].distance.unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_fallback_embeds_unindexed_ideas_within_scope() {
        let mut fx = Fixture::new();
        let a = fx.idea("alpha", &[], "vp1", Some(vec![1.0, 0.0]));
        let b = fx.idea("beta", &[], "vp1", None);
        let c = fx.idea("gamma", &[], "vp2", None);
        fx.embedder = FixedEmbedder::default()
            .with("beta", B_VEC.to_vec())
            .with("gamma", vec![1.0, 0.0]);
        let created = fx
            .linker()
            .autolink_for_node(&a, &LinkPolicy::default(), None)
            .unwrap();
        let dsts: Vec<&str> = created.iter().map(|c| c.dst_id.as_str()).collect();
        assert_eq!(dsts, vec![b.as_str()]);
        assert!(!dsts.contains(&c.as_str()));
    }

    #[test]
    fn test_fallback_pool_is_bounded() {
        let mut fx = Fixture::new();
        fx.idea("B", &[], "vp1", Some(B_VEC.to_vec()));
        let a = fx.idea("A", &[], "vp1", Some(vec![1.0, 0.0]));
        fx.index.fail_queries = true;
        // The newest idea is A itself, so a pool of one finds nothing.
        let created = fx
            .linker()
            .with_fallback_pool(1)
            .autolink_for_node(&a, &LinkPolicy::default(), None)
            .unwrap();
        assert!(created.is_empty());

        let created = fx
            .linker()
            .autolink_for_node(&a, &LinkPolicy::default(), None)
            .unwrap();
        assert_eq!(created.len(), 1);
    }

    #[test]
    fn test_unknown_distance_weights_by_cosine() {
        let (mut fx, a, b) = pair(0.1);
        fx.index.scripted.clear();
        fx.index.scripted.push((
            vec![1.0, 0.0],
            vec![Neighbor {
                id: b.clone(),
                distance: None,
            }],
        ));
        let created = fx.linker().autolink_for_node(&a, &top1(), None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].distance, None);
        assert!((created[0].weight - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_unembeddable_candidate_is_judged_on_distance() {
        let mut fx = Fixture::new();
        let a = fx.idea("A", &[], "vp1", Some(vec![1.0, 0.0]));
        // Stored but not indexed, and the embedder has no vector for it.
        let b = fx.idea("B", &[], "vp1", None);
        fx.index.script(vec![1.0, 0.0], &[(&a, 0.0), (&b, 0.1)]);
        let created = fx.linker().autolink_for_node(&a, &top1(), None).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].dst_id, b);
        assert!((created[0].weight - 0.909).abs() < 1e-3);
    }

    #[test]
    fn test_persistence_failure_propagates() {
        let (fx, a, _) = pair(0.1);
        fx.store
            .with_conn(|c| c.execute_batch("DROP TABLE edges"))
            .unwrap();
        assert!(fx.linker().autolink_for_node(&a, &top1(), None).is_err());
    }
}
