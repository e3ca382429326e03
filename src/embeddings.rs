//! Hashing embedder and a dense-vector HNSW index.
//!
//! No external ML models: ideas are embedded by hashing their tokens into a
//! fixed number of buckets, and neighbours are found on a navigable small
//! world graph persisted as JSON.

use std::collections::{HashMap, HashSet};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::{
    EmbeddingProvider, IndexFilter, IndexMetadata, IndexRecord, Neighbor, VectorIndex,
};
use crate::error::{Error, Result};
use crate::similarity::cosine_similarity;

// ---------------------------------------------------------------------------
// Hashing embedder
// ---------------------------------------------------------------------------

/// Deterministic token-hashing embedder.
///
/// Every whitespace token is hashed with SHA-256; the digest (read as a
/// big-endian integer `h`) picks bucket `h mod dim` and contributes
/// `((h >> 8) mod 1000) / 1000 - 0.5` to it. The result is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

/// Big-endian digest bytes reduced modulo `m`.
fn digest_mod(bytes: &[u8], m: u64) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| (acc * 256 + b as u64) % m)
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.trim();
        let mut vec = vec![0.0f32; self.dim];
        if text.is_empty() {
            vec[0] = 1.0;
            return Ok(vec);
        }

        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let idx = digest_mod(&digest, self.dim as u64) as usize;
            // Dropping the last byte is `h >> 8`.
            let bucket = digest_mod(&digest[..digest.len() - 1], 1000);
            vec[idx] += bucket as f32 / 1000.0 - 0.5;
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm = if norm == 0.0 { 1.0 } else { norm };
        Ok(vec.into_iter().map(|x| x / norm).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// HNSW Index
// ---------------------------------------------------------------------------

/// Configuration for the HNSW index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Max connections per node per layer.
    pub m: usize,
    /// Max connections for layer 0 (typically 2*M).
    pub m_max0: usize,
    /// Size of dynamic candidate list during construction.
    pub ef_construction: usize,
    /// Size of dynamic candidate list during search.
    pub ef_search: usize,
    /// Normalisation factor for level generation.
    pub ml: f64,
    /// Seed for level generation, mixed with the insertion position.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
            ef_search: 50,
            ml: 1.0 / (16_f64).ln(),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HnswNode {
    id: String,
    vector: Vec<f32>,
    document: String,
    metadata: IndexMetadata,
    /// neighbours[layer] = internal indices.
    neighbours: Vec<Vec<usize>>,
    max_layer: usize,
}

/// Hierarchical Navigable Small World index over idea embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndex {
    config: HnswConfig,
    nodes: Vec<HnswNode>,
    id_to_idx: HashMap<String, usize>,
    max_layer: usize,
    entry_point: Option<usize>,
}

impl Default for HnswIndex {
    fn default() -> Self {
        Self::new(HnswConfig::default())
    }
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            id_to_idx: HashMap::new(),
            max_layer: 0,
            entry_point: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dimension of the stored vectors, if anything is stored.
    pub fn dim(&self) -> Option<usize> {
        self.nodes.first().map(|n| n.vector.len())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.id_to_idx.clear();
        self.max_layer = 0;
        self.entry_point = None;
    }

    fn random_level(&self, position: usize) -> usize {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(position as u64));
        // (0, 1], so ln never sees zero.
        let r: f64 = 1.0 - rng.random::<f64>();
        (-r.ln() * self.config.ml).floor() as usize
    }

    /// Insert a record, or replace vector, document and metadata in place
    /// when the id is already indexed.
    pub fn insert(
        &mut self,
        id: String,
        vector: Vec<f32>,
        document: String,
        metadata: IndexMetadata,
    ) {
        if let Some(&existing) = self.id_to_idx.get(&id) {
            let node = &mut self.nodes[existing];
            node.vector = vector;
            node.document = document;
            node.metadata = metadata;
            return;
        }

        let idx = self.nodes.len();
        let level = self.random_level(idx);
        self.nodes.push(HnswNode {
            id: id.clone(),
            vector,
            document,
            metadata,
            neighbours: vec![Vec::new(); level + 1],
            max_layer: level,
        });
        self.id_to_idx.insert(id, idx);

        let Some(ep) = self.entry_point else {
            self.entry_point = Some(idx);
            self.max_layer = level;
            return;
        };

        let target = self.nodes[idx].vector.clone();
        let mut current = ep;
        let top = self.max_layer;
        for layer in (level + 1..=top).rev() {
            current = self.greedy_closest(current, &target, layer);
        }

        for layer in (0..=level.min(top)).rev() {
            let m_max = if layer == 0 {
                self.config.m_max0
            } else {
                self.config.m
            };
            let candidates =
                self.search_layer(current, &target, self.config.ef_construction, layer);
            let neighbours: Vec<usize> = candidates
                .iter()
                .filter(|&&(n, _)| n != idx)
                .take(m_max)
                .map(|&(n, _)| n)
                .collect();

            self.nodes[idx].neighbours[layer] = neighbours.clone();
            for &nb in &neighbours {
                self.nodes[nb].neighbours[layer].push(idx);
                if self.nodes[nb].neighbours[layer].len() > m_max {
                    self.prune_neighbours(nb, layer, m_max);
                }
            }

            if let Some(&(closest, _)) = candidates.first() {
                current = closest;
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(idx);
        }
    }

    fn greedy_closest(&self, ep: usize, target: &[f32], layer: usize) -> usize {
        let mut current = ep;
        let mut best = distance(target, &self.nodes[current].vector);
        loop {
            let mut changed = false;
            if let Some(nbs) = self.nodes[current].neighbours.get(layer) {
                for &nb in nbs {
                    let d = distance(target, &self.nodes[nb].vector);
                    if d < best {
                        best = d;
                        current = nb;
                        changed = true;
                    }
                }
            }
            if !changed {
                return current;
            }
        }
    }

    /// Up to `ef` closest nodes on one layer as (idx, distance), closest first.
    fn search_layer(&self, ep: usize, target: &[f32], ef: usize, layer: usize) -> Vec<(usize, f64)> {
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(ep);

        let ep_dist = distance(target, &self.nodes[ep].vector);
        let mut candidates: Vec<(usize, f64)> = vec![(ep, ep_dist)];
        let mut results: Vec<(usize, f64)> = vec![(ep, ep_dist)];

        while let Some(pos) = candidates
            .iter()
            .enumerate()
            .min_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
            .map(|(i, _)| i)
        {
            let (c_idx, c_dist) = candidates.remove(pos);
            let worst = results.last().map(|r| r.1).unwrap_or(f64::MAX);
            if c_dist > worst && results.len() >= ef {
                break;
            }

            let Some(nbs) = self.nodes[c_idx].neighbours.get(layer) else {
                continue;
            };
            for &nb in nbs {
                if !visited.insert(nb) {
                    continue;
                }
                let d = distance(target, &self.nodes[nb].vector);
                let worst = results.last().map(|r| r.1).unwrap_or(f64::MAX);
                if d < worst || results.len() < ef {
                    candidates.push((nb, d));
                    results.push((nb, d));
                    results.sort_by(|a, b| a.1.total_cmp(&b.1));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results
    }

    fn prune_neighbours(&mut self, node: usize, layer: usize, m_max: usize) {
        let node_vec = self.nodes[node].vector.clone();
        let mut scored: Vec<(usize, f64)> = self.nodes[node].neighbours[layer]
            .iter()
            .map(|&nb| (nb, distance(&node_vec, &self.nodes[nb].vector)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(m_max);
        self.nodes[node].neighbours[layer] = scored.into_iter().map(|(n, _)| n).collect();
    }

    /// The `k` nearest records to `query` as (id, distance), optionally
    /// restricted to records whose metadata passes `filter`.
    pub fn search(&self, query: &[f32], k: usize, filter: Option<&IndexFilter>) -> Vec<(String, f64)> {
        let Some(ep) = self.entry_point else {
            return vec![];
        };
        let mut current = ep;
        for layer in (1..=self.max_layer).rev() {
            current = self.greedy_closest(current, query, layer);
        }

        // Over-fetch when filtering; rejected records still take up slots.
        let ef = match filter {
            Some(_) => self.config.ef_search.max(k.saturating_mul(4)),
            None => self.config.ef_search.max(k),
        };
        self.search_layer(current, query, ef, 0)
            .into_iter()
            .filter(|(idx, _)| filter.map_or(true, |f| f.matches(&self.nodes[*idx].metadata)))
            .take(k)
            .map(|(idx, d)| (self.nodes[idx].id.clone(), d))
            .collect()
    }

    /// Write the index to `path`. The file is replaced in one rename, so a
    /// reader never sees a half-written index.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&data)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut f = std::fs::File::open(path)?;
        let mut data = Vec::new();
        f.read_to_end(&mut data)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load the index at `path`, or start an empty one with `config` when the
    /// file does not exist yet.
    pub fn load_or_new(path: &Path, config: HnswConfig) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(config))
        }
    }

    fn record(&self, node: &HnswNode) -> IndexRecord {
        IndexRecord {
            id: node.id.clone(),
            embedding: node.vector.clone(),
            document: node.document.clone(),
            metadata: node.metadata.clone(),
        }
    }
}

impl VectorIndex for HnswIndex {
    fn query(
        &self,
        embedding: &[f32],
        n_results: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<Neighbor>> {
        if let Some(dim) = self.dim() {
            if dim != embedding.len() {
                return Err(Error::Index(format!(
                    "query has dimension {}, index holds {dim}",
                    embedding.len()
                )));
            }
        }
        Ok(self
            .search(embedding, n_results, filter)
            .into_iter()
            .map(|(id, d)| Neighbor {
                id,
                distance: Some(d),
            })
            .collect())
    }

    fn get(&self, ids: Option<&[String]>) -> Result<Vec<IndexRecord>> {
        Ok(match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.id_to_idx.get(id))
                .map(|&idx| self.record(&self.nodes[idx]))
                .collect(),
            None => self.nodes.iter().map(|n| self.record(n)).collect(),
        })
    }

    fn add(
        &mut self,
        id: &str,
        embedding: Vec<f32>,
        content: &str,
        metadata: IndexMetadata,
    ) -> Result<()> {
        self.insert(id.to_string(), embedding, content.to_string(), metadata);
        Ok(())
    }
}

/// Distance metric: 1 - cosine_similarity (so 0 = identical).
fn distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
