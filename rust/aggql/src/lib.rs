pub mod aggregation;
pub mod config;
pub mod error;
pub mod expr;
pub mod filter;
pub mod pancake;
pub mod query;
pub mod schema;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Boots the aggregation translation service from `AGGQL_*` environment
/// variables.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
