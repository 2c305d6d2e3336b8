//! Serves `POST /generate` over the Anthropic Messages API.
//!
//! Environment: `ANTHROPIC_API_KEY` (required), `ANTHROPIC_MODEL`,
//! `FANOUT_ADDR`, `FANOUT_TEMPLATE_DIR`, `RUST_LOG`.

use anyhow::{Context, anyhow};
use llm_fanout::backend::{AnthropicBackend, RetryBackend};
use llm_fanout::config::ServerConfig;
use llm_fanout::generator::Generator;
use llm_fanout::observability::{self, ObservabilityConfig};
use llm_fanout::server;
use llm_fanout::template::{DirectorySource, TemplateStore};
use std::sync::Arc;

const BACKEND_RETRIES: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init(ObservabilityConfig::default()).map_err(|e| anyhow!(e))?;

    let config = ServerConfig::from_env()?;
    let store = Arc::new(TemplateStore::new(DirectorySource::new(config.template_dir.clone())));
    let backend = AnthropicBackend::try_from_env().context("Anthropic backend is not configured")?;
    let generator = Arc::new(Generator::new(
        store,
        Arc::new(RetryBackend::new(backend, BACKEND_RETRIES)),
    ));

    let app = server::router(generator);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .context("bind server listener failed")?;
    tracing::info!(
        addr = %config.addr,
        templates = %config.template_dir.display(),
        "fanout-server listening"
    );
    axum::serve(listener, app)
        .await
        .context("server terminated with error")
}
