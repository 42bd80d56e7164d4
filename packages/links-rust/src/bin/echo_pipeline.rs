//! Runs one request through the full pipeline against an in-process echo
//! service and prints every result as JSON.

use std::convert::Infallible;

use clap::Parser;
use linkchain_core::{FetchResult, GraphQLRequest, Operation, Variables};
use linkchain_links::{build_pipeline, init_tracing, LogFormat, PipelineConfig, RetryConfig, ServiceLink};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "echo-pipeline")]
#[command(about = "Execute an Echo query through the linkchain middleware pipeline")]
struct Args {
    /// Message echoed back by the service
    #[arg(long, default_value = "hello")]
    msg: String,

    /// Default operation timeout in milliseconds
    #[arg(long, env = "LINKCHAIN_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Total attempts, including the first, before an error is reported
    #[arg(long, env = "LINKCHAIN_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Disable in-flight deduplication
    #[arg(long)]
    no_dedup: bool,

    /// Send persisted-query hashes
    #[arg(long)]
    persisted_queries: bool,

    /// Log output format
    #[arg(long, value_enum, env = "LINKCHAIN_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn echo_document() -> Value {
    json!({
        "kind": "Document",
        "definitions": [{
            "kind": "OperationDefinition",
            "operation": "query",
            "name": {"kind": "Name", "value": "Echo"},
            "selectionSet": {
                "kind": "SelectionSet",
                "selections": [{"kind": "Field", "name": {"kind": "Name", "value": "echo"}}]
            }
        }]
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let config = PipelineConfig {
        default_timeout_ms: args.timeout_ms,
        retry: RetryConfig {
            max_attempts: args.max_attempts,
            ..RetryConfig::default()
        },
        dedup: !args.no_dedup,
        persisted_queries: args.persisted_queries,
        ..PipelineConfig::default()
    };

    let echo = ServiceLink::new(tower::service_fn(|op: Operation| async move {
        let msg = op.variables.get("msg").cloned().unwrap_or(Value::Null);
        Ok::<_, Infallible>(FetchResult::data(json!({ "echo": msg })))
    }))
    .into_link();
    let chain = build_pipeline(echo, &config)?;

    let mut variables = Variables::new();
    variables.insert("msg".to_string(), Value::String(args.msg));
    let request = GraphQLRequest::new(echo_document()).with_variables(variables);

    for result in chain.execute(request).collect().await? {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}
