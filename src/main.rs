use clap::Parser;
use reading_gateway::config::Args;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // parse cli arguments
    let args = Args::parse();

    reading_gateway::run(args).await
}
