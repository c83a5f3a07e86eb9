use aggql::telemetry;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    aggql::run().await.inspect_err(|err| {
        error!(error = ?err, "aggql stopped");
    })
}
