use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use spark_engine::config::AppConfig;
use spark_engine::context::AppContext;
use spark_engine::error::AppError;
use spark_engine::runner::ExecutionUnit;
use spark_engine::spark::types::{
    ExecuteRequest, ExecutionRequest, ExecutionResult, ModuleHandle, ResponseData, ResponseMeta,
};
use spark_engine::store::pagination::{PageParams, SortOrder};
use spark_engine::wasm::WasmData;

fn context(dir: &std::path::Path, cache_size: usize) -> AppContext {
    let mut cfg = AppConfig::for_dir(dir);
    cfg.cache_size = cache_size;
    AppContext::new(cfg)
}

async fn register(ctx: &AppContext, version_id: &str) {
    let file = format!("{version_id}.wasm");
    std::fs::write(ctx.store.path(&file), b"\0asm").unwrap();
    ctx.wasm
        .save_wasm(WasmData::new(version_id, file, 4))
        .await
        .unwrap();
}

#[tokio::test]
async fn single_execution_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;

    let result = ctx
        .wasm
        .execute("v1", ExecuteRequest::new(json!({ "a": 1 })))
        .await
        .unwrap();
    assert_eq!(result.outputs(), &json!({ "a": 1 }));
    assert!(result.response_meta.process_time.is_some());

    let history = ctx.wasm.get_history("v1", PageParams::default()).await;
    assert_eq!(history.pagination.total_items, 1);
    assert_eq!(history.content[0].inputs, json!({ "a": 1 }));
    assert_eq!(history.content[0].version_id, "v1");

    let csv = String::from_utf8(ctx.wasm.download_history("v1").await.unwrap()).unwrap();
    assert!(csv.starts_with("version_id|inputs|outputs|executed_at|execution_time"));
}

#[tokio::test]
async fn columnar_and_shared_inputs_are_expanded() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;

    let result = ctx
        .wasm
        .execute("v1", ExecuteRequest::new(json!([["a", "b"], [1, 2]])))
        .await
        .unwrap();
    assert_eq!(result.outputs(), &json!({ "a": 1, "b": 2 }));

    let result = ctx
        .wasm
        .execute(
            "v1",
            ExecuteRequest::new(json!({ "b": 2 })).with_shared(json!({ "b": 9, "c": 3 })),
        )
        .await
        .unwrap();
    assert_eq!(result.outputs(), &json!({ "b": 2, "c": 3 }));
}

#[tokio::test]
async fn execute_many_rolls_up_and_records_each_input() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;

    let data = ctx
        .wasm
        .execute_many("v1", ExecuteRequest::new(json!([{ "n": 1 }, { "n": 2 }, { "n": 3 }])))
        .await
        .unwrap();

    assert_eq!(data.version_id, "v1");
    assert_eq!(data.outputs.len(), 3);
    assert_eq!(data.execution_times.len(), 3);
    assert!(data.executed_at.is_some());

    let single = ctx
        .wasm
        .execute_many("v1", ExecuteRequest::new(json!({ "n": 4 })))
        .await
        .unwrap();
    assert_eq!(single.outputs, vec![json!({ "n": 4 })]);

    let history = ctx.wasm.get_history("v1", PageParams::default()).await;
    assert_eq!(history.pagination.total_items, 4);
}

#[tokio::test]
async fn history_is_paginated() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;

    for n in 0..25 {
        ctx.wasm
            .execute("v1", ExecuteRequest::new(json!({ "n": n })))
            .await
            .unwrap();
    }

    let page = ctx.wasm.get_history("v1", PageParams::new(2, 10)).await;
    assert_eq!(page.pagination.total_pages, 3);
    assert_eq!(page.pagination.number_of_items, 10);
    assert_eq!(page.content[0].inputs, json!({ "n": 10 }));

    let newest = ctx
        .wasm
        .get_history("v1", PageParams::new(1, 1).with_order(SortOrder::Desc))
        .await;
    assert_eq!(newest.content[0].inputs, json!({ "n": 24 }));

    let none = ctx.wasm.get_history("unknown", PageParams::default()).await;
    assert!(none.content.is_empty());
    assert_eq!(none.pagination.total_items, 0);
}

#[tokio::test]
async fn unknown_module_never_touches_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);

    let err = ctx
        .wasm
        .execute("ghost", ExecuteRequest::new(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(ctx.cache.is_empty());
}

#[tokio::test]
async fn cache_evicts_oldest_module() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 2);
    for id in ["v1", "v2", "v3"] {
        register(&ctx, id).await;
        ctx.wasm
            .execute(id, ExecuteRequest::new(json!({ "id": id })))
            .await
            .unwrap();
    }

    assert_eq!(ctx.cache.keys(), vec!["v2", "v3"]);

    // Reloads transparently after eviction.
    ctx.wasm
        .execute("v1", ExecuteRequest::new(json!({})))
        .await
        .unwrap();
    assert_eq!(ctx.cache.keys(), vec!["v3", "v1"]);
}

#[tokio::test]
async fn registry_listing_download_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;
    register(&ctx, "v2").await;

    let listing = ctx
        .wasm
        .get_wasm_data(PageParams::default().with_order(SortOrder::Desc))
        .await;
    let ids: Vec<&str> = listing.content.iter().map(|w| w.version_id.as_str()).collect();
    assert_eq!(ids, vec!["v2", "v1"]);

    assert_eq!(ctx.wasm.download_wasm("v1").await.unwrap(), b"\0asm");

    let err = ctx
        .wasm
        .save_wasm(WasmData::new("v1", "other.wasm", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationFailed(_)));
}

#[tokio::test]
async fn delete_wasm_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;
    register(&ctx, "v2").await;

    ctx.wasm
        .execute("v1", ExecuteRequest::new(json!({ "a": 1 })))
        .await
        .unwrap();
    assert!(ctx.cache.contains("v1"));

    ctx.wasm.delete_wasm("v1").await.unwrap();

    assert!(!ctx.cache.contains("v1"));
    assert!(!dir.path().join("v1.wasm").exists());
    assert!(!dir.path().join("v1.csv").exists());
    assert!(matches!(
        ctx.wasm.download_history("v1").await,
        Err(AppError::NotFound(_))
    ));

    let listing = ctx.wasm.get_wasm_data(PageParams::default()).await;
    assert_eq!(listing.pagination.total_items, 1);
    assert_eq!(listing.content[0].version_id, "v2");

    assert!(matches!(
        ctx.wasm.delete_wasm("v1").await,
        Err(AppError::NotFound(_))
    ));
}

/// Echo unit that takes 50ms per record.
struct SlowUnit {
    version_id: String,
}

#[async_trait]
impl ExecutionUnit for SlowUnit {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, request: &ExecutionRequest) -> anyhow::Result<ExecutionResult> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ExecutionResult {
            response_data: ResponseData {
                outputs: request.inputs().clone(),
                ..Default::default()
            },
            response_meta: ResponseMeta {
                version_id: self.version_id.clone(),
                ..Default::default()
            },
        })
    }

    async fn remove(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn eviction_waits_for_a_running_execute_many() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig::for_dir(dir.path());
    cfg.cache_size = 1;
    let ctx = AppContext::builder(cfg)
        .factory(Arc::new(|m: &ModuleHandle| {
            Arc::new(SlowUnit {
                version_id: m.version_id.clone(),
            }) as Arc<dyn ExecutionUnit>
        }))
        .build();
    register(&ctx, "v1").await;
    register(&ctx, "v2").await;

    let records: Vec<Value> = (0..6).map(|n| json!({ "n": n })).collect();
    let wasm = ctx.wasm.clone();
    let request = ExecuteRequest::new(Value::Array(records.clone()));
    let many = tokio::spawn(async move { wasm.execute_many("v1", request).await });

    // v1 is mid-loop when v2 pushes it out of the single cache slot.
    tokio::time::sleep(Duration::from_millis(75)).await;
    let other = ctx
        .wasm
        .execute("v2", ExecuteRequest::new(json!({ "id": "v2" })))
        .await
        .unwrap();
    assert_eq!(other.outputs(), &json!({ "id": "v2" }));

    let data = many.await.unwrap().unwrap();
    assert_eq!(data.outputs, records);
    assert!(
        data.errors
            .iter()
            .all(|e| e.as_array().is_some_and(|list| list.is_empty())),
        "unexpected errors: {:?}",
        data.errors
    );
    assert_eq!(ctx.cache.keys(), vec!["v2"]);
}

#[tokio::test]
async fn version_ids_cannot_shadow_store_files() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), 4);
    register(&ctx, "v1").await;

    for id in ["wasm-data", "batch-data", "b_123", "../escape", "a/b", ""] {
        let err = ctx
            .wasm
            .save_wasm(WasmData::new(id, "m.wasm", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(_)), "{id}");
    }
    let err = ctx
        .wasm
        .save_wasm(WasmData::new("v2", "batch-data.csv", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationFailed(_)));

    // The registry is intact and the first module still resolves.
    assert!(ctx.wasm.find_wasm("v1").await.is_ok());
    let listing = ctx.wasm.get_wasm_data(PageParams::default()).await;
    assert_eq!(listing.pagination.total_items, 1);

    assert!(matches!(
        ctx.wasm.download_history("../wasm-data").await,
        Err(AppError::NotFound(_))
    ));
    assert!(ctx.wasm.get_history("wasm-data", PageParams::default()).await.content.is_empty());
}

#[tokio::test]
async fn storage_health_tracks_the_upload_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig::for_dir(dir.path());
    cfg.wasm_data_threshold_mb = 1;
    let ctx = AppContext::new(cfg);
    register(&ctx, "v1").await;

    let health = ctx.wasm.storage_health().await;
    assert!(health.healthy);
    assert!(health.size_bytes.is_some_and(|b| b > 0));

    std::fs::write(dir.path().join("big.wasm"), vec![0u8; 1024 * 1024]).unwrap();
    let health = ctx.wasm.storage_health().await;
    assert!(!health.healthy);
    assert_eq!(health.threshold_mb, 1);
}
