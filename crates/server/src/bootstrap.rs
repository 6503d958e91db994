use std::sync::Arc;

use leadflow_agent::{
    CompletionError, ConversationRuntime, OpenAiCompatibleClient, ResponseGenerator, RuntimeError,
};
use leadflow_core::audit::TracingAuditSink;
use leadflow_core::config::{AppConfig, ConfigError, LlmConfig, LoadOptions};
use leadflow_core::workflow::{WorkflowEngine, WorkflowError, WorkflowGraph};
use leadflow_crm::{HttpSmsSender, SmsSender, TokenError, TokenManager};
use leadflow_db::{connect_with_settings, migrations, DbPool, SqlConversationRepository};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<ConversationRuntime>,
    /// Present only when CRM delivery is enabled.
    pub sms_sender: Option<Arc<dyn SmsSender>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("workflow definition rejected: {0}")]
    Workflow(#[from] WorkflowError),
    #[error("completion client setup failed: {0}")]
    Completion(#[source] CompletionError),
    #[error("crm credential setup failed: {0}")]
    Credentials(#[source] TokenError),
    #[error("conversation runtime setup failed: {0}")]
    Runtime(#[source] RuntimeError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let graph = WorkflowGraph::load(&config.workflow.path)?;
    info!(
        event_name = "system.bootstrap.workflow_loaded",
        correlation_id = "bootstrap",
        workflow_path = %config.workflow.path.display(),
        node_count = graph.node_count(),
        entry_node = %graph.entry(),
        "workflow definition loaded"
    );

    let generator = response_generator(&config.llm).map_err(BootstrapError::Completion)?;
    let runtime = ConversationRuntime::new(
        WorkflowEngine::new(graph),
        generator,
        Arc::new(SqlConversationRepository::new(db_pool.clone())),
        Arc::new(TracingAuditSink),
        config.workflow.default_pipeline_stage.clone(),
    )
    .map_err(BootstrapError::Runtime)?;

    let sms_sender = if config.crm.enabled {
        let client = reqwest::Client::new();
        let tokens = TokenManager::from_config(&config.crm, client.clone())
            .map_err(BootstrapError::Credentials)?;
        let sender: Arc<dyn SmsSender> =
            Arc::new(HttpSmsSender::new(client, config.crm.base_url.clone(), Arc::new(tokens)));
        Some(sender)
    } else {
        None
    };
    info!(
        event_name = "system.bootstrap.sms_delivery",
        correlation_id = "bootstrap",
        enabled = sms_sender.is_some(),
        "sms delivery configured"
    );

    Ok(Application { config, db_pool, runtime: Arc::new(runtime), sms_sender })
}

/// The generator deadline spans the client's whole retry sequence, so a
/// timed-out first attempt still leaves room for the retries.
fn response_generator(config: &LlmConfig) -> Result<ResponseGenerator, CompletionError> {
    let provider = OpenAiCompatibleClient::from_config(config)?;
    let budget = provider.generation_budget();
    Ok(ResponseGenerator::new(Arc::new(provider), budget, config.max_tokens))
}
