use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tutorstream::config::Config;
use tutorstream::logging::init_tracing;
use tutorstream::relay::build_router;
use tutorstream::relay::upstream::{ChatBackend, HttpChatBackend};

#[derive(Parser)]
#[command(name = "tutor-relay", about = "Validating NDJSON relay for tutor chat")]
struct Cli {
    /// Address to listen on (overrides TUTOR_RELAY_ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// Base URL of the tutor backend (overrides TUTOR_BACKEND_URL)
    #[arg(long)]
    backend_url: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(addr) = cli.addr {
        config.relay_addr = addr;
    }
    if let Some(backend_url) = cli.backend_url {
        config.backend_url = backend_url;
    }
    config.log_json |= cli.log_json;
    config.validate()?;

    init_tracing(config.log_json);

    let addr = config.bind_addr()?;
    let backend: Arc<dyn ChatBackend> = Arc::new(HttpChatBackend::new(&config.backend_url));
    let app = build_router(backend, config.default_retrieval_k);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    tracing::info!(
        %addr,
        backend = %config.backend_url,
        default_retrieval_k = config.default_retrieval_k,
        "tutor relay listening"
    );

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
