use chrono::{NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Result, Row};
use std::path::Path;

use crate::backend::{Edge, EdgeMetadata, EdgeType, Idea, OwnerScope, RelationalStore};

pub struct IdeaStore {
    conn: Connection,
}

pub struct Stats {
    pub idea_count: usize,
    pub similar_count: usize,
    pub cluster_member_count: usize,
    pub db_size: String,
}

/// Input for a new idea row.
#[derive(Debug, Clone, Default)]
pub struct NewIdea {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    pub voice_profile_id: Option<String>,
}

const IDEA_COLUMNS: &str =
    "node_id, user_id, voice_profile_id, title, content, tags, created_at";
const EDGE_COLUMNS: &str =
    "edge_id, src_id, dst_id, edge_type, weight, metadata, created_at";

impl IdeaStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = IdeaStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = IdeaStore { conn };
        store.init_schema()?;
        Ok(store)
    }

    // Edges deliberately carry no UNIQUE constraint; callers dedup through
    // `edge_exists`.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS ideas (
                node_id TEXT PRIMARY KEY,
                user_id TEXT,
                voice_profile_id TEXT,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS edges (
                edge_id TEXT PRIMARY KEY,
                src_id TEXT NOT NULL,
                dst_id TEXT NOT NULL,
                edge_type TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ideas_created ON ideas(created_at);
            CREATE INDEX IF NOT EXISTS idx_ideas_owner ON ideas(user_id, voice_profile_id);
            CREATE INDEX IF NOT EXISTS idx_edges_pair ON edges(src_id, dst_id, edge_type);
            CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst_id);
            ",
        )
    }

    pub fn create_idea(&self, idea: &NewIdea) -> Result<String> {
        let node_id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO ideas (node_id, user_id, voice_profile_id, title, content, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node_id,
                idea.user_id,
                idea.voice_profile_id,
                idea.title,
                idea.content,
                idea.tags.join(","),
                now_str()
            ],
        )?;
        Ok(node_id)
    }

    pub fn get_idea(&self, node_id: &str) -> Result<Option<Idea>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {IDEA_COLUMNS} FROM ideas WHERE node_id = ?1"))?;
        let mut rows = stmt.query_map(params![node_id], idea_from_row)?;
        rows.next().transpose()
    }

    /// Most recent first. Ties on the timestamp fall back to insertion order.
    pub fn list_ideas(&self, limit: usize, scope: &OwnerScope) -> Result<Vec<Idea>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {IDEA_COLUMNS} FROM ideas
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR voice_profile_id = ?2)
             ORDER BY created_at DESC, rowid DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![scope.user_id, scope.voice_profile_id, limit as i64],
            idea_from_row,
        )?;
        rows.collect()
    }

    pub fn all_ideas(&self) -> Result<Vec<Idea>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {IDEA_COLUMNS} FROM ideas ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], idea_from_row)?;
        rows.collect()
    }

    pub fn count_ideas(&self) -> Result<usize> {
        self.conn
            .query_row("SELECT COUNT(*) FROM ideas", [], |r| r.get(0))
    }

    pub fn edge_exists(&self, src_id: &str, dst_id: &str, edge_type: EdgeType) -> Result<bool> {
        self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM edges WHERE src_id = ?1 AND dst_id = ?2 AND edge_type = ?3)",
            params![src_id, dst_id, edge_type.as_str()],
            |r| r.get(0),
        )
    }

    pub fn create_edge(
        &self,
        src_id: &str,
        dst_id: &str,
        edge_type: EdgeType,
        weight: f64,
        metadata: &EdgeMetadata,
    ) -> Result<String> {
        let edge_id = uuid::Uuid::new_v4().to_string();
        let md = serde_json::to_string(metadata)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT INTO edges (edge_id, src_id, dst_id, edge_type, weight, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![edge_id, src_id, dst_id, edge_type.as_str(), weight, md, now_str()],
        )?;
        Ok(edge_id)
    }

    /// Edges touching `node_id` at either end, newest first.
    pub fn list_edges_for_node(&self, node_id: &str, limit: usize) -> Result<Vec<Edge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges
             WHERE src_id = ?1 OR dst_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![node_id, limit as i64], edge_from_row)?;
        rows.collect()
    }

    pub fn list_all_edges(&self, limit: usize) -> Result<Vec<Edge>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], edge_from_row)?;
        rows.collect()
    }

    pub fn delete_all_edges(&self) -> Result<usize> {
        self.conn.execute("DELETE FROM edges", [])
    }

    pub fn delete_all_ideas(&self) -> Result<usize> {
        self.conn.execute("DELETE FROM ideas", [])
    }

    #[cfg(test)]
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        f(&self.conn)
    }

    pub fn stats(&self) -> Result<Stats> {
        let idea_count = self.count_ideas()?;
        let count_edges = |t: EdgeType| -> Result<usize> {
            self.conn.query_row(
                "SELECT COUNT(*) FROM edges WHERE edge_type = ?1",
                params![t.as_str()],
                |r| r.get(0),
            )
        };
        let similar_count = count_edges(EdgeType::Similar)?;
        let cluster_member_count = count_edges(EdgeType::ClusterMember)?;
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let page_count: i64 = self.conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let bytes = page_size * page_count;
        let db_size = if bytes > 1_048_576 {
            format!("{:.1} MB", bytes as f64 / 1_048_576.0)
        } else {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        };
        Ok(Stats {
            idea_count,
            similar_count,
            cluster_member_count,
            db_size,
        })
    }
}

impl RelationalStore for IdeaStore {
    fn get_idea(&self, node_id: &str) -> crate::error::Result<Option<Idea>> {
        Ok(IdeaStore::get_idea(self, node_id)?)
    }

    fn list_ideas(&self, limit: usize, scope: &OwnerScope) -> crate::error::Result<Vec<Idea>> {
        Ok(IdeaStore::list_ideas(self, limit, scope)?)
    }

    fn edge_exists(
        &self,
        src_id: &str,
        dst_id: &str,
        edge_type: EdgeType,
    ) -> crate::error::Result<bool> {
        Ok(IdeaStore::edge_exists(self, src_id, dst_id, edge_type)?)
    }

    fn create_edge(
        &self,
        src_id: &str,
        dst_id: &str,
        edge_type: EdgeType,
        weight: f64,
        metadata: &EdgeMetadata,
    ) -> crate::error::Result<String> {
        Ok(IdeaStore::create_edge(
            self, src_id, dst_id, edge_type, weight, metadata,
        )?)
    }

    fn list_edges_for_node(&self, node_id: &str, limit: usize) -> crate::error::Result<Vec<Edge>> {
        Ok(IdeaStore::list_edges_for_node(self, node_id, limit)?)
    }
}

fn idea_from_row(row: &Row<'_>) -> Result<Idea> {
    let tags: String = row.get(5)?;
    Ok(Idea {
        node_id: row.get(0)?,
        user_id: row.get(1)?,
        voice_profile_id: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        tags: tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        created_at: parse_dt(6, &row.get::<_, String>(6)?)?,
    })
}

fn edge_from_row(row: &Row<'_>) -> Result<Edge> {
    let edge_type: String = row.get(3)?;
    let edge_type = edge_type.parse::<EdgeType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
    })?;
    let md: String = row.get(5)?;
    let metadata = serde_json::from_str(&md)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(Edge {
        edge_id: row.get(0)?,
        src_id: row.get(1)?,
        dst_id: row.get(2)?,
        edge_type,
        weight: row.get(4)?,
        metadata,
        created_at: parse_dt(6, &row.get::<_, String>(6)?)?,
    })
}

fn now_str() -> String {
    Utc::now()
        .naive_utc()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

fn parse_dt(col: usize, s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}
