use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use engine::languages::LanguageTable;
use engine::policy::PolicyTable;
use engine::worker::QueueWorker;
use engine::{api, Engine, EngineConfig, SandboxMode};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("engine=info".parse()?),
        )
        .init();

    let config = EngineConfig::from_env().context("Failed to load configuration")?;

    let languages = match &config.languages_config {
        Some(path) => {
            let table = LanguageTable::from_file(path)?;
            info!("Loaded language configurations from {}", path.display());
            table
        }
        None => LanguageTable::embedded()?,
    };
    let policies = PolicyTable::embedded()?;
    policies.ensure_covers(languages.iter().map(|config| config.language))?;
    info!(
        "Loaded {} languages ({})",
        languages.len(),
        languages
            .iter()
            .map(|config| config.language.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mode = SandboxMode::detect(&config, &languages).await;
    info!("Sandbox mode: {}", mode);

    let bind_addr = config.bind_addr;
    let redis_url = config.redis_url.clone();
    let engine = Arc::new(Engine::new(config, mode, Arc::new(languages), Arc::new(policies)));

    if let Some(url) = redis_url {
        let worker = QueueWorker::connect(&url, Arc::clone(&engine)).await?;
        tokio::spawn(worker.run());
    }

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on {}", bind_addr);

    if let Err(e) = axum::serve(listener, api::router(engine)).await {
        error!("HTTP server stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
