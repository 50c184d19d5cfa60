//! Hive - 编排核心演示入口
//!
//! 用法：`hive [--json-log] <任务内容>`。注册一个内置 echo 服务，加载配置目录下的插件，
//! 处理一个任务后以 JSON 打印结果与编排器状态。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use hive::context::CallerMetadata;
use hive::core::TaskRequest;
use hive::registry::{Service, ServiceCallContext};
use hive::{observability, OrchestratorBuilder};

/// 把输入原样返回的演示服务
struct EchoService;

#[async_trait]
impl Service for EchoService {
    fn id(&self) -> &str {
        "echo"
    }

    async fn execute(&self, input: Value, ctx: &ServiceCallContext) -> anyhow::Result<Value> {
        Ok(json!({ "echo": input, "operation": ctx.operation }))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["general".into()]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(pos) = args.iter().position(|a| a == "--json-log") {
        args.remove(pos);
        observability::init_json();
    } else {
        observability::init();
    }

    let content = if args.is_empty() {
        "hello from hive".to_string()
    } else {
        args.join(" ")
    };

    let orchestrator = OrchestratorBuilder::from_config_path(None)
        .with_service(Arc::new(EchoService))
        .build()
        .await
        .context("Failed to build orchestrator")?;

    let report = orchestrator.init().await.context("Failed to initialize orchestrator")?;
    if !report.failed.is_empty() || !report.skipped.is_empty() {
        tracing::warn!(
            "{} plugins failed, {} skipped",
            report.failed.len(),
            report.skipped.len()
        );
    }

    let caller = CallerMetadata::default().with_origin("cli");
    let outcome = match orchestrator.process_task(TaskRequest::new(content), caller).await {
        Ok(outcome) => serde_json::to_value(&outcome)?,
        Err(failure) => serde_json::to_value(&failure)?,
    };
    let status = orchestrator.get_status().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "outcome": outcome, "status": status }))?
    );

    orchestrator.shutdown().await;
    Ok(())
}
