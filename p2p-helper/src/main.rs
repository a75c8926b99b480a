use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the RPC pipe, so logs must go to stderr. The host
    // consumes them as structured JSON.
    let filter = EnvFilter::from_default_env().add_directive("p2p_helper=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    tracing::info!("p2p helper starting");

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let result = p2p_helper::dispatch::run(stdin, stdout).await;
    if let Err(ref e) = result {
        tracing::error!("helper terminating: {e:#}");
    }
    result
}
