//! K-means grouping of indexed ideas into labelled topical clusters.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{EdgeMetadata, EdgeType, RelationalStore, VectorIndex};
use crate::error::Result;
use crate::similarity::{cosine_similarity, top_tokens};

// ---------------------------------------------------------------------------
// K-Means clustering
// ---------------------------------------------------------------------------

/// Clustering run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    pub k: usize,
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            k: 3,
            max_iter: 25,
            seed: 42,
        }
    }
}

/// Cluster assignment result.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// cluster index for each input vector (parallel to input).
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
}

/// Run k-means under cosine distance. `k` is clamped to `[1, n]`; the same
/// input and seed always give the same labels.
pub fn kmeans(vectors: &[Vec<f32>], k: usize, max_iter: usize, seed: u64) -> KMeansResult {
    let n = vectors.len();
    if n == 0 {
        return KMeansResult {
            labels: vec![],
            centroids: vec![],
        };
    }
    let k = k.clamp(1, n);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut centroids: Vec<Vec<f32>> = rand::seq::index::sample(&mut rng, n, k)
        .into_iter()
        .map(|i| vectors[i].clone())
        .collect();
    let mut labels = vec![0usize; n];

    for _ in 0..max_iter {
        // Assign
        let mut changes = 0;
        for (i, v) in vectors.iter().enumerate() {
            let mut best = (0usize, f64::INFINITY);
            for (ci, c) in centroids.iter().enumerate() {
                let d = 1.0 - cosine_similarity(v, c);
                if d < best.1 {
                    best = (ci, d);
                }
            }
            if labels[i] != best.0 {
                labels[i] = best.0;
                changes += 1;
            }
        }
        if changes == 0 {
            break;
        }

        // Recompute centroids (mean of assigned vectors).
        let dim = vectors[0].len();
        let mut sums = vec![vec![0.0f64; dim]; k];
        let mut counts = vec![0usize; k];
        for (v, &label) in vectors.iter().zip(&labels) {
            counts[label] += 1;
            for (s, &x) in sums[label].iter_mut().zip(v) {
                *s += x as f64;
            }
        }
        for (ci, centroid) in centroids.iter_mut().enumerate() {
            *centroid = if counts[ci] == 0 {
                vectors[rng.random_range(0..n)].clone()
            } else {
                let c = counts[ci] as f64;
                sums[ci].iter().map(|s| (s / c) as f32).collect()
            };
        }
    }

    KMeansResult { labels, centroids }
}

// ---------------------------------------------------------------------------
// Cluster engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    /// Synthetic node id, `cluster:<k>:<index>`.
    pub cluster_id: String,
    pub label: String,
    pub size: usize,
    pub sample_titles: Vec<String>,
    pub top_tags: Vec<(String, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterReport {
    pub k: usize,
    pub clusters: Vec<ClusterSummary>,
}

#[derive(Default)]
struct Members {
    ids: Vec<String>,
    titles: Vec<String>,
    tags: Vec<String>,
}

pub fn cluster_node_id(k: usize, index: usize) -> String {
    format!("cluster:{k}:{index}")
}

/// Label from member titles: the top three tokens, else the first title,
/// else `cluster-<index>`.
pub fn cluster_label(titles: &[String], index: usize) -> String {
    let tokens = top_tokens(titles, 3);
    if !tokens.is_empty() {
        return tokens.join(" / ");
    }
    titles
        .first()
        .cloned()
        .unwrap_or_else(|| format!("cluster-{index}"))
}

/// The `n` most frequent tags with counts. Ties keep first-seen order.
fn top_tags(tags: &[String], n: usize) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for t in tags {
        match counts.iter_mut().find(|(tag, _)| tag == t) {
            Some((_, c)) => *c += 1,
            None => counts.push((t.clone(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(n);
    counts
}

pub struct ClusterEngine<'a> {
    index: &'a dyn VectorIndex,
    store: &'a dyn RelationalStore,
    params: ClusterParams,
}

impl<'a> ClusterEngine<'a> {
    pub fn new(index: &'a dyn VectorIndex, store: &'a dyn RelationalStore) -> Self {
        Self {
            index,
            store,
            params: ClusterParams::default(),
        }
    }

    pub fn with_params(mut self, params: ClusterParams) -> Self {
        self.params = params;
        self
    }

    /// Cluster every indexed idea into at most `k` groups and record a
    /// `cluster_member` edge from each synthetic cluster node to its members.
    /// Running it again adds a fresh set of edges.
    pub fn cluster_ideas(&self, k: usize) -> Result<ClusterReport> {
        let records: Vec<_> = self
            .index
            .get(None)?
            .into_iter()
            .filter(|r| !r.embedding.is_empty())
            .collect();
        if records.is_empty() {
            return Ok(ClusterReport {
                k,
                clusters: vec![],
            });
        }

        let vectors: Vec<Vec<f32>> = records.iter().map(|r| r.embedding.clone()).collect();
        let result = kmeans(&vectors, k, self.params.max_iter, self.params.seed);
        let groups = result.labels.iter().copied().max().map_or(0, |m| m + 1);

        let mut members: Vec<Members> = (0..groups).map(|_| Members::default()).collect();
        for (record, &label) in records.iter().zip(&result.labels) {
            let m = &mut members[label];
            m.ids.push(record.id.clone());
            let title = record.metadata.title.trim();
            if !title.is_empty() {
                m.titles.push(title.to_string());
            }
            m.tags.extend(
                record
                    .metadata
                    .tags
                    .iter()
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .map(String::from),
            );
        }

        let mut clusters = Vec::with_capacity(groups);
        for (index, m) in members.into_iter().enumerate() {
            let label = cluster_label(&m.titles, index);
            let cluster_id = cluster_node_id(k, index);
            let metadata = EdgeMetadata::Cluster {
                label: label.clone(),
            };
            for id in &m.ids {
                self.store
                    .create_edge(&cluster_id, id, EdgeType::ClusterMember, 1.0, &metadata)?;
            }
            clusters.push(ClusterSummary {
                cluster_id,
                label,
                size: m.ids.len(),
                sample_titles: m.titles.iter().take(3).cloned().collect(),
                top_tags: top_tags(&m.tags, 3),
            });
        }

        info!(k, ideas = records.len(), clusters = clusters.len(), "clustered ideas");
        Ok(ClusterReport { k, clusters })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::ScriptedIndex;
    use crate::backend::IndexMetadata;
    use crate::db::IdeaStore;

    fn md(title: &str, tags: &[&str]) -> IndexMetadata {
        IndexMetadata {
            title: title.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn two_groups() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.0],
            vec![0.98, 0.05],
            vec![0.95, 0.1],
            vec![0.0, 1.0],
            vec![0.05, 0.97],
            vec![0.1, 0.9],
        ]
    }

    #[test]
    fn test_kmeans_reseeds_empty_clusters() {
        // Duplicates leave one centroid with no members after the first pass.
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]];
        for seed in 0..20 {
            let first = kmeans(&vectors, 3, 25, seed);
            let again = kmeans(&vectors, 3, 25, seed);
            assert_eq!(first.labels, again.labels);
            assert_eq!(first.centroids.len(), 3);
            assert!(first.labels.iter().all(|&l| l < 3));
            assert_eq!(first.labels[0], first.labels[1]);
            assert_ne!(first.labels[0], first.labels[2]);
        }
    }

    #[test]
    fn test_kmeans_k_clamped_to_input_size() {
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![-1.0, 0.0],
            vec![0.0, -1.0],
        ];
        let result = kmeans(&vectors, 10, 25, 42);
        assert_eq!(result.labels.len(), 4);
        assert!(result.centroids.len() <= 4);
        assert!(result.labels.iter().all(|&l| l < 4));
    }

    #[test]
    fn test_kmeans_zero_k_becomes_one() {
        let result = kmeans(&two_groups(), 0, 25, 42);
        assert_eq!(result.centroids.len(), 1);
        assert!(result.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_kmeans_empty_input() {
        let result = kmeans(&[], 3, 25, 42);
        assert!(result.labels.is_empty());
        assert!(result.centroids.is_empty());
    }

    #[test]
    fn test_kmeans_deterministic_for_seed() {
        let a = kmeans(&two_groups(), 2, 25, 7);
        let b = kmeans(&two_groups(), 2, 25, 7);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_kmeans_separates_directions() {
        let labels = kmeans(&two_groups(), 2, 25, 42).labels;
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_cluster_label_fallbacks() {
        let titles = vec![
            "Improve onboarding flow".to_string(),
            "Onboarding checklist for new hires".to_string(),
        ];
        assert!(cluster_label(&titles, 0).contains("onboarding"));
        assert_eq!(cluster_label(&["Go".to_string()], 1), "Go");
        assert_eq!(cluster_label(&[], 2), "cluster-2");
    }

    #[test]
    fn test_top_tags_counts() {
        let tags: Vec<String> = ["ux", "hr", "ux", "ops", "hr", "ux", "misc"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        assert_eq!(
            top_tags(&tags, 3),
            vec![
                ("ux".to_string(), 3),
                ("hr".to_string(), 2),
                ("ops".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_cluster_ideas_empty_index() {
        let index = ScriptedIndex::new();
        let store = IdeaStore::open_in_memory().unwrap();
        let report = ClusterEngine::new(&index, &store).cluster_ideas(3).unwrap();
        assert_eq!(report.k, 3);
        assert!(report.clusters.is_empty());
    }

    #[test]
    fn test_cluster_ideas_labels_and_edges() {
        let mut index = ScriptedIndex::new();
        let titles = [
            "Improve onboarding flow",
            "Onboarding checklist for new hires",
            "Onboarding buddy program",
            "Quarterly budget review",
            "Budget forecast tooling",
            "Budget approvals",
        ];
        for (i, (v, title)) in two_groups().into_iter().zip(titles).enumerate() {
            let tags: &[&str] = if i < 3 { &["hr", "people"] } else { &["finance"] };
            index.insert(&format!("n{i}"), v, md(title, tags));
        }
        let store = IdeaStore::open_in_memory().unwrap();

        let report = ClusterEngine::new(&index, &store).cluster_ideas(2).unwrap();
        assert_eq!(report.k, 2);
        assert_eq!(report.clusters.len(), 2);
        let total: usize = report.clusters.iter().map(|c| c.size).sum();
        assert_eq!(total, 6);

        let onboarding = report
            .clusters
            .iter()
            .find(|c| c.label.contains("onboarding"))
            .unwrap();
        assert_eq!(onboarding.size, 3);
        assert_eq!(onboarding.sample_titles.len(), 3);
        assert_eq!(onboarding.top_tags[0], ("hr".to_string(), 3));
        assert!(onboarding.cluster_id.starts_with("cluster:2:"));

        let budget = report
            .clusters
            .iter()
            .find(|c| c.label.starts_with("budget"))
            .unwrap();
        assert_eq!(budget.top_tags, vec![("finance".to_string(), 3)]);

        let edges = store.list_edges_for_node("n0", 10).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::ClusterMember);
        assert_eq!(edges[0].src_id, onboarding.cluster_id);
        assert_eq!(edges[0].weight, 1.0);
        assert_eq!(edges[0].metadata.label(), Some(onboarding.label.as_str()));
    }

    #[test]
    fn test_cluster_ideas_is_additive() {
        let mut index = ScriptedIndex::new();
        index.insert("a", vec![1.0, 0.0], md("alpha", &[]));
        index.insert("b", vec![0.0, 1.0], md("", &[]));
        let store = IdeaStore::open_in_memory().unwrap();
        let engine = ClusterEngine::new(&index, &store);

        engine.cluster_ideas(1).unwrap();
        let report = engine.cluster_ideas(1).unwrap();
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].label, "alpha");
        assert_eq!(report.clusters[0].sample_titles, vec!["alpha".to_string()]);
        assert_eq!(store.list_edges_for_node("a", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_untitled_cluster_gets_numbered_label() {
        let mut index = ScriptedIndex::new();
        index.insert("a", vec![1.0, 0.0], md("", &[]));
        let store = IdeaStore::open_in_memory().unwrap();
        let report = ClusterEngine::new(&index, &store).cluster_ideas(5).unwrap();
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].label, "cluster-0");
        assert_eq!(report.clusters[0].cluster_id, "cluster:5:0");
    }
}
