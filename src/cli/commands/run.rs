//! `run`: start the dispatcher loop with the production runner.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::application::runner::AgentRunner;
use crate::domain::models::Config;
use crate::infrastructure::artifacts::HttpArtifactStore;
use crate::infrastructure::llm::HttpLlmClient;
use crate::infrastructure::logging::SecretRedactor;
use crate::services::dispatcher::Dispatcher;
use crate::services::pool::RepoPoolManager;
use crate::services::registry::TaskRegistry;

pub async fn handle_run(config: Config, max_concurrency: Option<usize>) -> Result<()> {
    let mut dispatcher_config = config.dispatcher.clone();
    if let Some(cap) = max_concurrency {
        dispatcher_config.max_concurrency = cap;
    }

    let api_key = std::env::var(&config.secrets.llm_api_key_env).with_context(|| {
        format!("missing LLM API key in ${}", config.secrets.llm_api_key_env)
    })?;

    let registry = Arc::new(TaskRegistry::new(&config.registry));
    let pool = Arc::new(
        RepoPoolManager::new(config.pool.clone()).with_events(registry.event_log()),
    );
    let llm = Arc::new(HttpLlmClient::new(&config.llm, api_key)?);
    let artifacts = Arc::new(HttpArtifactStore::new(&config.artifact_store)?);
    let redactor = SecretRedactor::from_config(&config.secrets);

    let runner = Arc::new(AgentRunner::new(
        registry.clone(),
        llm,
        artifacts,
        config.runner.clone(),
        redactor,
    ));

    let mut dispatcher = Dispatcher::new(registry, pool, runner, dispatcher_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    dispatcher.run(shutdown_rx).await;
    Ok(())
}
