use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (LANLINK_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("LANLINK_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("lanlink_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Bad flags exit 2 via clap; init failures below exit 1.
    let config = lanlink_server::config::ServerConfig::parse();
    tracing::info!(
        "starting control server on {} (db: {})",
        config.listen_addr,
        config.database_path
    );

    let server = lanlink_server::server::Server::new(config);
    server.run().await
}
