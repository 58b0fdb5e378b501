//! `serve` - run the clustered replication service.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use freightliner_core::config::ServiceConfig;
use freightliner_core::service::ClusterService;

/// Arguments for `serve`
#[derive(Args)]
pub struct ServeArgs {
    /// Path to the service YAML config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Node identifier (overrides the config)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Mesh bind address (overrides the config)
    #[arg(long)]
    pub mesh_bind: Option<String>,

    /// API bind address (overrides the config)
    #[arg(long)]
    pub api_bind: Option<String>,

    /// Data directory (overrides the config)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Run the service until interrupted
pub async fn execute(args: ServeArgs) -> Result<i32> {
    let mut config = match &args.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("loading service config {}", path.display()))?,
        None => {
            let node_id = args
                .node_id
                .clone()
                .unwrap_or_else(|| format!("node-{}", uuid_suffix()));
            serde_yaml::from_str(&format!("node_id: {node_id}"))
                .context("building default service config")?
        }
    };

    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(mesh_bind) = args.mesh_bind {
        config.mesh_bind = mesh_bind;
    }
    if let Some(api_bind) = args.api_bind {
        config.api_bind = api_bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir.to_string_lossy().to_string();
    }

    let service = Arc::new(ClusterService::new(config)?);
    let shutdown = super::cancellation_token();

    info!("service starting; ctrl-c to stop");
    service.run(shutdown).await?;
    Ok(0)
}

fn uuid_suffix() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    id.split('-').next().unwrap_or("0").to_string()
}
