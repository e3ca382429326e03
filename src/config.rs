use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cluster::ClusterParams;
use crate::embeddings::HnswConfig;
use crate::linker::{LinkPolicy, DEFAULT_FALLBACK_POOL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the idea database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to the persisted vector index.
    #[serde(default = "default_index_path")]
    pub index_path: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub recent: RecentConfig,

    #[serde(default)]
    pub cluster: ClusterParams,

    #[serde(default)]
    pub index: HnswConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Output dimension of the hashing embedder.
    #[serde(default = "default_dim")]
    pub dim: usize,
}

/// Defaults for linking a single idea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(flatten)]
    pub policy: LinkPolicy,

    /// Recent ideas scanned by exact search when the index comes up short.
    #[serde(default = "default_fallback_pool")]
    pub fallback_pool: usize,
}

/// Defaults for linking the newest ideas in one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentConfig {
    #[serde(default = "default_recent_limit")]
    pub limit: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_recent_max_distance")]
    pub max_distance: f64,
    #[serde(default = "default_true")]
    pub require_tag_overlap: bool,
    #[serde(default = "default_min_tag_overlap")]
    pub min_tag_overlap: usize,
    #[serde(default = "default_recent_close_override")]
    pub close_override_distance: f64,
    #[serde(default = "default_min_cosine")]
    pub min_cosine: f64,
    #[serde(default)]
    pub require_mutual: bool,
}

// ── defaults ──

fn default_db_path() -> String {
    "ideon.db".to_string()
}
fn default_index_path() -> String {
    "ideon-index.json".to_string()
}
fn default_dim() -> usize {
    384
}
fn default_fallback_pool() -> usize {
    DEFAULT_FALLBACK_POOL
}
fn default_recent_limit() -> usize {
    10
}
fn default_top_k() -> usize {
    LinkPolicy::recent().top_k
}
fn default_recent_max_distance() -> f64 {
    LinkPolicy::recent().max_distance
}
fn default_true() -> bool {
    true
}
fn default_min_tag_overlap() -> usize {
    LinkPolicy::recent().min_tag_overlap
}
fn default_recent_close_override() -> f64 {
    LinkPolicy::recent().close_override_distance
}
fn default_min_cosine() -> f64 {
    LinkPolicy::recent().min_cosine
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            index_path: default_index_path(),
            embedding: EmbeddingConfig::default(),
            link: LinkConfig::default(),
            recent: RecentConfig::default(),
            cluster: ClusterParams::default(),
            index: HnswConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dim: default_dim() }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            policy: LinkPolicy::default(),
            fallback_pool: default_fallback_pool(),
        }
    }
}

impl Default for RecentConfig {
    fn default() -> Self {
        let policy = LinkPolicy::recent();
        Self {
            limit: default_recent_limit(),
            top_k: policy.top_k,
            max_distance: policy.max_distance,
            require_tag_overlap: policy.require_tag_overlap,
            min_tag_overlap: policy.min_tag_overlap,
            close_override_distance: policy.close_override_distance,
            min_cosine: policy.min_cosine,
            require_mutual: policy.require_mutual,
        }
    }
}

impl RecentConfig {
    pub fn policy(&self) -> LinkPolicy {
        LinkPolicy {
            top_k: self.top_k,
            exclude_self: true,
            max_distance: self.max_distance,
            require_tag_overlap: self.require_tag_overlap,
            min_tag_overlap: self.min_tag_overlap,
            close_override_distance: self.close_override_distance,
            min_cosine: self.min_cosine,
            require_mutual: self.require_mutual,
        }
    }
}

impl Config {
    /// Default config file path: `~/.ideon/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ideon")
            .join("config.toml")
    }

    /// Load config from the default path, falling back to defaults if the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load config from an explicit path (falls back to defaults when missing).
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let cfg: Config =
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            Ok(cfg)
        } else {
            Ok(Config::default())
        }
    }

    /// Write the default config to `~/.ideon/config.toml`, creating the
    /// directory if needed. Returns the path written.
    pub fn write_default() -> Result<PathBuf> {
        let path = Self::default_path();
        Self::default().write_to(&path)?;
        Ok(path)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("serialising config")?;
        std::fs::write(path, &text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
