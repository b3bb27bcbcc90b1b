use anyhow::{Context, Result};
use fundsync_core::HandlerResponse;
use fundsync_sync::{handler_from_config, wants_json_logs, QueueBatch, SyncConfig, LOG_FORMAT_VAR};
use lambda_runtime::{service_fn, LambdaEvent};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(wants_json_logs(std::env::var(LOG_FORMAT_VAR).ok().as_deref()));

    let config = SyncConfig::from_env();
    info!(
        max_batch_size = config.max_batch_size,
        local_store = config.local_store_root.is_some(),
        "starting fund-data sync worker"
    );
    let handler = handler_from_config(&config)
        .await
        .context("wiring queue batch handler")?;
    let handler = &handler;

    lambda_runtime::run(service_fn(move |event: LambdaEvent<QueueBatch>| async move {
        let response: HandlerResponse = handler.handle_batch(&event.payload).await;
        Ok::<_, lambda_runtime::Error>(response)
    }))
    .await
    .map_err(|err| anyhow::anyhow!(err))
}
