pub mod cache;
pub mod codec;
pub mod db;
pub mod gateway;
pub mod model;
pub mod permissions;
pub mod rate_limit;
pub mod rest;
pub mod sync;

use std::path::PathBuf;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] db::DbError),
    #[error(transparent)]
    Rest(#[from] rest::RestError),
    #[error(transparent)]
    Gateway(#[from] gateway::GatewayError),
    #[error("malformed dispatch payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct Config {
    pub tokens: Vec<String>,
    pub database_path: PathBuf,
    pub options: sync::SyncOptions,
}

/// Open the store, connect every account, and run the orchestrator until
/// the shutdown token fires or a fatal error surfaces.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), Error> {
    let db = db::open(&config.database_path)?;
    let orchestrator = sync::Orchestrator::new(db, &config.tokens, config.options, shutdown)?;
    orchestrator.run().await
}
