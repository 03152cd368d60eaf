use std::sync::Arc;

use crate::common::{Config, Result};
use crate::fallback::FallbackKVDatabase;
use crate::kv::SimpleKVDatabase;
use crate::raft::{HttpTransport, RaftKVDatabase, RaftNode};

use super::http::{create_router, NodeState};

/// One cluster member: Raft engine, standalone store, fallback coordinator and HTTP server
pub struct Node {
    config: Config,
}

impl Node {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open every store and wire the components together, without serving yet
    pub fn build(&self) -> Result<NodeState> {
        let config = &self.config;
        let transport = Arc::new(HttpTransport::new(
            &config.peers,
            config.raft.rpc_timeout(),
            config.raft.commit_timeout(),
        )?);
        let raft = RaftNode::from_config(config, transport)?;
        let standalone = SimpleKVDatabase::open(
            config.standalone_dir(),
            config.raft.sync_policy,
            config.raft.snapshot_threshold as usize,
        )?;
        let db = FallbackKVDatabase::from_config(config, RaftKVDatabase::new(raft.clone()), standalone)?;
        Ok(NodeState { raft, db })
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting quorumkv node: {}", self.config.node_id);
        tracing::info!("  HTTP: {}", self.config.bind_addr);
        tracing::info!("  Data: {}", self.config.data_dir.display());
        tracing::info!("  Peers: {:?}", self.config.peer_ids());

        let state = self.build()?;
        state.raft.start();
        state.db.start();

        let router = create_router(state.clone());
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Node {} ready ({})", self.config.node_id, state.raft.get_role());

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        };
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        state.db.shutdown();
        state.raft.shutdown();
        if let Err(e) = served {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}
