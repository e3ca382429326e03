mod agent;
mod backend;
mod cluster;
mod config;
mod db;
mod embeddings;
mod error;
mod export;
mod ingest;
mod linker;
mod server;
mod similarity;

use std::io;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use crate::backend::OwnerScope;
use crate::db::NewIdea;
use crate::ingest::Workspace;
use crate::linker::LinkPolicy;

#[derive(Parser)]
#[command(
    name = "ideon",
    version,
    about = "Links related ideas and groups them into topics."
)]
struct Cli {
    /// Path to the idea database (defaults to `db_path` from the config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Path to the vector index file (defaults to `index_path` from the config)
    #[arg(long)]
    index: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for individual linking thresholds.
#[derive(Args, Default)]
struct PolicyArgs {
    /// Neighbours to consider per idea
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    max_distance: Option<f64>,
    #[arg(long)]
    require_tag_overlap: Option<bool>,
    #[arg(long)]
    min_tag_overlap: Option<usize>,
    /// Distance under which a neighbour is always linked
    #[arg(long)]
    close_override_distance: Option<f64>,
    #[arg(long)]
    min_cosine: Option<f64>,
    /// Only link when the neighbour also has this idea among its neighbours
    #[arg(long)]
    require_mutual: Option<bool>,
}

impl PolicyArgs {
    fn apply(&self, mut policy: LinkPolicy) -> LinkPolicy {
        if let Some(v) = self.top_k {
            policy.top_k = v;
        }
        if let Some(v) = self.max_distance {
            policy.max_distance = v;
        }
        if let Some(v) = self.require_tag_overlap {
            policy.require_tag_overlap = v;
        }
        if let Some(v) = self.min_tag_overlap {
            policy.min_tag_overlap = v;
        }
        if let Some(v) = self.close_override_distance {
            policy.close_override_distance = v;
        }
        if let Some(v) = self.min_cosine {
            policy.min_cosine = v;
        }
        if let Some(v) = self.require_mutual {
            policy.require_mutual = v;
        }
        policy
    }
}

#[derive(Args, Default)]
struct ScopeArgs {
    /// Restrict to ideas owned by this user
    #[arg(long)]
    user: Option<String>,
    /// Restrict to ideas written in this voice profile
    #[arg(long)]
    voice_profile: Option<String>,
}

impl ScopeArgs {
    fn scope(&self) -> OwnerScope {
        OwnerScope {
            user_id: self.user.clone(),
            voice_profile_id: self.voice_profile.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default config at ~/.ideon/config.toml
    Init,
    /// Store and index a new idea
    Add {
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        /// Comma-separated tags
        #[arg(long, default_value = "")]
        tags: String,
        #[command(flatten)]
        owner: ScopeArgs,
        /// Skip linking the new idea to its neighbours
        #[arg(long)]
        no_autolink: bool,
    },
    /// Link one idea to its nearest neighbours
    Autolink {
        node_id: String,
        #[command(flatten)]
        policy: PolicyArgs,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Link the most recently added ideas
    AutolinkRecent {
        #[arg(long)]
        limit: Option<usize>,
        #[command(flatten)]
        policy: PolicyArgs,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Group indexed ideas into labelled clusters
    Cluster {
        #[arg(long)]
        k: Option<usize>,
    },
    /// Show edges touching an idea
    Edges {
        node_id: String,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Find the ideas nearest to some text
    Context {
        text: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
    /// Re-embed every stored idea into the index
    Reindex,
    /// Print the graph view as JSON
    Export {
        #[arg(long, default_value = "200")]
        limit: usize,
    },
    /// Delete all ideas and edges and empty the index
    Reset,
    /// Show idea and edge counts
    Stats,
    /// Launch HTTP API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

fn parse_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ideon=info"));
    fmt().with_writer(io::stderr).with_env_filter(filter).init();

    let cli = Cli::parse();

    // Handle init before loading config (it creates the config file).
    if matches!(cli.command, Commands::Init) {
        let path = config::Config::write_default()?;
        println!("✅ Default config written to {}", path.display());
        return Ok(());
    }

    let cfg = config::Config::load()?;
    let db_path = cli.db.unwrap_or_else(|| PathBuf::from(&cfg.db_path));
    let index_path = cli.index.unwrap_or_else(|| PathBuf::from(&cfg.index_path));

    if let Commands::Serve { port } = cli.command {
        server::run_server(db_path, index_path, cfg, port).await?;
        return Ok(());
    }

    let mut ws = Workspace::open(&db_path, &index_path, &cfg)?;

    match cli.command {
        Commands::Add {
            title,
            content,
            tags,
            owner,
            no_autolink,
        } => {
            let node_id = ws.add_idea(&NewIdea {
                title,
                content,
                tags: parse_tag_list(&tags),
                user_id: owner.user,
                voice_profile_id: owner.voice_profile,
            })?;
            println!("💡 Added idea {node_id}");
            if !no_autolink {
                let created = ws
                    .agent()
                    .autolink_for_node(&node_id, &cfg.link.policy, None)?;
                println!("   Linked to {} neighbours", created.len());
            }
        }
        Commands::Autolink {
            node_id,
            policy,
            scope,
        } => {
            let policy = policy.apply(cfg.link.policy.clone());
            let scope = scope.scope();
            let scope = (!scope.is_empty()).then_some(&scope);
            let created = ws.agent().autolink_for_node(&node_id, &policy, scope)?;
            if created.is_empty() {
                println!("🤷 Nothing new qualified for {node_id}.");
            } else {
                println!("🔗 Linked {node_id}:\n");
                for e in created {
                    println!(
                        "  → {}  weight {:.3}  distance {}  tags {}",
                        e.dst_id,
                        e.weight,
                        e.distance
                            .map(|d| format!("{d:.3}"))
                            .unwrap_or_else(|| "-".into()),
                        e.tag_overlap
                    );
                }
            }
        }
        Commands::AutolinkRecent {
            limit,
            policy,
            scope,
        } => {
            let limit = limit.unwrap_or(cfg.recent.limit);
            let policy = policy.apply(cfg.recent.policy());
            let report = ws
                .agent()
                .autolink_recent(limit, &policy, &scope.scope())?;
            let created: usize = report.iter().map(|r| r.created_edges.len()).sum();
            println!(
                "🔗 Linked {} recent ideas, {created} new edges",
                report.len()
            );
            for r in report.iter().filter(|r| !r.created_edges.is_empty()) {
                println!("  {} → {} edges", r.node_id, r.created_edges.len());
            }
        }
        Commands::Cluster { k } => {
            let report = ws.agent().cluster_ideas(k.unwrap_or(cfg.cluster.k))?;
            if report.clusters.is_empty() {
                println!("🤷 No indexed ideas to cluster yet.");
            } else {
                println!("🗂️  {} clusters:\n", report.clusters.len());
                for c in report.clusters {
                    let tags: Vec<String> = c
                        .top_tags
                        .iter()
                        .map(|(t, n)| format!("{t} ({n})"))
                        .collect();
                    println!("  {} [{}] size {}", c.label, c.cluster_id, c.size);
                    if !tags.is_empty() {
                        println!("     tags: {}", tags.join(", "));
                    }
                }
            }
        }
        Commands::Edges { node_id, limit } => {
            let edges = ws.store.list_edges_for_node(&node_id, limit)?;
            if edges.is_empty() {
                println!("🤷 No edges for {node_id}.");
            } else {
                for e in edges {
                    println!(
                        "  {} -[{} {:.3}]-> {}  ({})",
                        e.src_id,
                        e.edge_type,
                        e.weight,
                        e.dst_id,
                        e.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
        Commands::Context { text, top_k } => {
            let hits = ws.context_map(&text, top_k)?;
            if hits.is_empty() {
                println!("🤷 Nothing indexed yet.");
            } else {
                for h in hits {
                    let d = h
                        .distance
                        .map(|d| format!("{d:.3}"))
                        .unwrap_or_else(|| "-".into());
                    println!("  {d}  {}  {}", h.node_id, h.document.unwrap_or_default());
                }
            }
        }
        Commands::Reindex => {
            let n = ws.reindex()?;
            println!("🔄 Reindexed {n} ideas");
        }
        Commands::Export { limit } => {
            let view = export::graph_view(&ws.store, limit)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Reset => {
            ws.reset()?;
            println!("🧹 Ideas and graph have been reset.");
        }
        Commands::Stats => {
            let stats = ws.store.stats()?;
            println!("📊 Idea graph:\n");
            println!("  Ideas:           {}", stats.idea_count);
            println!("  Indexed:         {}", ws.index.len());
            println!("  Similar edges:   {}", stats.similar_count);
            println!("  Cluster edges:   {}", stats.cluster_member_count);
            println!("  DB size:         {}", stats.db_size);
        }
        Commands::Init | Commands::Serve { .. } => {}
    }
    Ok(())
}
