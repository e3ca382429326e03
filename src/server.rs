use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::agent::NodeLinkReport;
use crate::backend::OwnerScope;
use crate::cluster::ClusterReport;
use crate::config::Config;
use crate::db::NewIdea;
use crate::export::{self, GraphView};
use crate::ingest::{ContextHit, Workspace};
use crate::linker::LinkPolicy;

/// Shared application state. Every request opens its own workspace; index
/// writes reload and save the index file under a process-wide lock.
struct AppState {
    db_path: PathBuf,
    index_path: PathBuf,
    config: Config,
}

impl AppState {
    fn workspace(&self) -> Result<Workspace, ApiError> {
        Workspace::open(&self.db_path, &self.index_path, &self.config).map_err(internal)
    }
}

// ---------- request / response types ----------

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal(e: impl Display) -> ApiError {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn bad_request(msg: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

#[derive(Deserialize)]
pub struct GraphParams {
    limit: Option<usize>,
}

/// Policy fields default to the single-node policy, tag overlap optional.
#[derive(Deserialize, Default)]
pub struct AutolinkRequest {
    #[serde(flatten)]
    policy: LinkPolicy,
    #[serde(flatten)]
    scope: OwnerScope,
}

#[derive(Serialize)]
pub struct AutolinkResponse {
    created: usize,
    detail: Vec<NodeLinkReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ClusterRequest {
    k: Option<usize>,
}

#[derive(Deserialize, Default)]
pub struct ContextMapRequest {
    text: Option<String>,
    top_k: Option<usize>,
}

#[derive(Serialize)]
pub struct ContextMapResponse {
    results: Vec<ContextHit>,
}

#[derive(Deserialize)]
pub struct AddIdeaRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    user_id: Option<String>,
    voice_profile_id: Option<String>,
    /// Link the new idea to its neighbours right away.
    #[serde(default = "default_true")]
    autolink: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
pub struct AddIdeaResponse {
    node_id: String,
    created_edges: usize,
}

#[derive(Serialize)]
pub struct ResetResponse {
    ok: bool,
    message: String,
}

#[derive(Serialize)]
pub struct StatsResponse {
    ideas: usize,
    indexed: usize,
    similar_edges: usize,
    cluster_edges: usize,
    db_size: String,
}

// ---------- handlers ----------

async fn handle_graph(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GraphParams>,
) -> Result<Json<GraphView>, ApiError> {
    let ws = state.workspace()?;
    let view = export::graph_view(&ws.store, params.limit.unwrap_or(200)).map_err(internal)?;
    Ok(Json(view))
}

async fn handle_autolink(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AutolinkRequest>,
) -> Result<Json<AutolinkResponse>, ApiError> {
    let ws = state.workspace()?;
    let existing = ws.store.list_ideas(2, &body.scope).map_err(internal)?;
    if existing.len() < 2 {
        return Ok(Json(AutolinkResponse {
            created: 0,
            detail: vec![],
            message: Some("Need at least 2 ideas to autolink.".to_string()),
            error: None,
        }));
    }
    let limit = state.config.recent.limit;
    // Failures come back as a structured body so the client can show them.
    let resp = match ws.agent().autolink_recent(limit, &body.policy, &body.scope) {
        Ok(detail) => AutolinkResponse {
            created: detail.iter().map(|r| r.created_edges.len()).sum(),
            detail,
            message: None,
            error: None,
        },
        Err(e) => {
            warn!(error = %e, "autolink failed");
            AutolinkResponse {
                created: 0,
                detail: vec![],
                message: None,
                error: Some(e.to_string()),
            }
        }
    };
    Ok(Json(resp))
}

async fn handle_cluster(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClusterRequest>,
) -> Result<Json<ClusterReport>, ApiError> {
    let ws = state.workspace()?;
    let k = body.k.unwrap_or(state.config.cluster.k);
    let report = ws.agent().cluster_ideas(k).map_err(internal)?;
    Ok(Json(report))
}

async fn handle_context_map(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContextMapRequest>,
) -> Result<Json<ContextMapResponse>, ApiError> {
    let text = body.text.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(bad_request("Missing text"));
    }
    let ws = state.workspace()?;
    let results = ws
        .context_map(&text, body.top_k.unwrap_or(5))
        .map_err(internal)?;
    Ok(Json(ContextMapResponse { results }))
}

async fn handle_add_idea(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddIdeaRequest>,
) -> Result<Json<AddIdeaResponse>, ApiError> {
    if body.title.trim().is_empty() && body.content.trim().is_empty() {
        return Err(bad_request("Missing title or content"));
    }
    let mut ws = state.workspace()?;
    let node_id = ws
        .add_idea(&NewIdea {
            title: body.title,
            content: body.content,
            tags: body.tags,
            user_id: body.user_id,
            voice_profile_id: body.voice_profile_id,
        })
        .map_err(internal)?;

    // The idea is stored either way; a failed link pass only costs the edges.
    let created_edges = if body.autolink {
        match ws
            .agent()
            .autolink_for_node(&node_id, &state.config.link.policy, None)
        {
            Ok(edges) => edges.len(),
            Err(e) => {
                warn!(%node_id, error = %e, "autolink after add failed");
                0
            }
        }
    } else {
        0
    };
    Ok(Json(AddIdeaResponse {
        node_id,
        created_edges,
    }))
}

async fn handle_reset(State(state): State<Arc<AppState>>) -> Result<Json<ResetResponse>, ApiError> {
    let mut ws = state.workspace()?;
    ws.reset().map_err(internal)?;
    Ok(Json(ResetResponse {
        ok: true,
        message: "Ideas and graph have been reset.".to_string(),
    }))
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let ws = state.workspace()?;
    let s = ws.store.stats().map_err(internal)?;
    Ok(Json(StatsResponse {
        ideas: s.idea_count,
        indexed: ws.index.len(),
        similar_edges: s.similar_count,
        cluster_edges: s.cluster_member_count,
        db_size: s.db_size,
    }))
}

// ---------- router ----------

pub fn build_router(db_path: &Path, index_path: &Path, config: Config) -> Router {
    let state = Arc::new(AppState {
        db_path: db_path.to_path_buf(),
        index_path: index_path.to_path_buf(),
        config,
    });

    Router::new()
        .route("/api/graph", get(handle_graph))
        .route("/api/graph/autolink", post(handle_autolink))
        .route("/api/graph/cluster", post(handle_cluster))
        .route("/api/graph/context_map", post(handle_context_map))
        .route("/api/graph/reset", post(handle_reset))
        .route("/api/ideas", post(handle_add_idea))
        .route("/api/stats", get(handle_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server on the given port.
pub async fn run_server(
    db_path: PathBuf,
    index_path: PathBuf,
    config: Config,
    port: u16,
) -> anyhow::Result<()> {
    let app = build_router(&db_path, &index_path, config);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, db = %db_path.display(), "listening");
    println!("🌐 Serving on http://0.0.0.0:{port}");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
