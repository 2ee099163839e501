use std::sync::Arc;

use spark_engine::{
    config::AppConfig,
    context::AppContext,
    logger::init_tracing,
    metrics::counters::Counters,
    notify::BroadcastNotifier,
    store::pagination::PageParams,
};
use tokio::sync::broadcast::error::RecvError;

/// Forwards batch notifications to the log until the notifier is dropped.
fn start_notification_log(notifier: &BroadcastNotifier) {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(n) => tracing::debug!(
                    target: "notify",
                    event = n.event.as_str(),
                    client_id = %n.client_id,
                    "notification published"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "notify", skipped, "notification log lagging")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting spark engine...");

    let cfg = AppConfig::from_env();
    cfg.print_usage();

    tokio::fs::create_dir_all(&cfg.upload_path).await?;

    let notifier = Arc::new(BroadcastNotifier::default());
    start_notification_log(&notifier);

    let ctx = AppContext::builder(cfg).notifier(notifier).build();

    let modules = ctx.wasm.get_wasm_data(PageParams::default()).await;
    tracing::info!(
        registered = modules.pagination.total_items,
        "module registry loaded"
    );
    for m in &modules.content {
        tracing::debug!(version_id = %m.version_id, file_path = %m.file_path, "module registered");
    }

    let storage = ctx.wasm.storage_health().await;
    tracing::info!(
        size_bytes = ?storage.size_bytes,
        threshold_mb = storage.threshold_mb,
        healthy = storage.healthy,
        "upload dir checked"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    ctx.cache.clear().await;

    let c = &ctx.counters;
    tracing::info!(
        cache_hits = Counters::get(&c.cache_hits),
        cache_misses = Counters::get(&c.cache_misses),
        cache_evictions = Counters::get(&c.cache_evictions),
        batches_completed = Counters::get(&c.batches_completed),
        batches_failed = Counters::get(&c.batches_failed),
        records_executed = Counters::get(&c.records_executed),
        "final counters"
    );

    Ok(())
}
