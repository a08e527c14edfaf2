mod config;
mod dialect;
mod error;
mod logger;
mod models;
mod prompt;
mod relay;
mod router;
mod stream;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use config::Args;
use router::{run_router, RouterState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // .env is optional; real environment variables win
  let _ = dotenvy::dotenv();
  let args = Args::parse();
  logger::init(args.debug);

  let config = args.app_config().context("invalid default LLM settings")?;
  info!(
    endpoint = %config.defaults.api_endpoint,
    model = %config.defaults.model_name,
    format = %config.defaults.api_format,
    "chatrelay starting up"
  );

  let listener = std::net::TcpListener::bind((args.host.as_str(), args.port))
    .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

  run_router(listener, RouterState::new(config)).await
}
