//! Sample app process: registers calculator tools with a running broker and
//! serves them until interrupted.

use std::sync::Arc;

use anyhow::Result;
use broker_config::LoggingConfig;
use broker_primitives::{AppName, ToolDefinition};
use broker_tools::{AppClient, ExecutorResult, Parameters, ToolError, ToolExecutor};
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "calc-app", about = "Serves calculator tools to a tool broker")]
struct Cli {
    /// Broker app listener address.
    #[arg(long, default_value = "127.0.0.1:7420")]
    broker: String,

    /// Name to register under; tools appear as `<name>:<tool>`.
    #[arg(long, default_value = "Calc")]
    app_name: String,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    broker_telemetry::init(&LoggingConfig {
        level: cli.log_level.clone(),
        ..LoggingConfig::default()
    })?;

    let executor = Arc::new(calculator(AppName::new(cli.app_name)?)?);
    info!(app = %executor.app_name(), tools = executor.definitions().len(), "tools ready");

    let client = AppClient::new(cli.broker, executor);
    client
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn integer(parameters: &Parameters, key: &str) -> ExecutorResult<i64> {
    parameters
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ToolError::execution(format!("`{key}` must be an integer")))
}

fn number_schema(fields: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|field| ((*field).to_owned(), json!({ "type": "integer" })))
        .collect();
    json!({ "type": "object", "properties": properties, "required": fields })
}

fn calculator(app: AppName) -> Result<ToolExecutor> {
    let executor = ToolExecutor::new(app);

    executor.register_tool(
        ToolDefinition::new("Add", "Adds two integers").with_input_schema(number_schema(&["a", "b"])),
        |parameters: Parameters| async move {
            let a = integer(&parameters, "a")?;
            let b = integer(&parameters, "b")?;
            a.checked_add(b)
                .map(|sum| json!(sum))
                .ok_or_else(|| ToolError::execution("integer overflow"))
        },
    )?;

    executor.register_tool(
        ToolDefinition::new("Divide", "Divides `a` by `b`")
            .with_input_schema(number_schema(&["a", "b"])),
        |parameters: Parameters| async move {
            let a = integer(&parameters, "a")?;
            let b = integer(&parameters, "b")?;
            if b == 0 {
                return Err(ToolError::execution("division by zero"));
            }
            #[allow(clippy::cast_precision_loss)]
            let quotient = a as f64 / b as f64;
            Ok::<_, ToolError>(json!(quotient))
        },
    )?;

    executor.register_tool(
        ToolDefinition::new("Echo", "Returns its arguments unchanged"),
        |parameters: Parameters| async move { Ok::<_, ToolError>(Value::Object(parameters)) },
    )?;

    Ok(executor)
}
