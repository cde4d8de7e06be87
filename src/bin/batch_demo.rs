//! batch-demo: runs an aggregator against an in-process dispatcher and prints
//! the resulting statistics.
//!
//! Usage:
//!   batch-demo dashboard [--fail-metrics]      Fetch the composite dashboard once
//!   batch-demo burst [<calls>] [--policies <file>]  Fire concurrent calls and report batching
//!   batch-demo help                            Show usage
//!
//! Logging is controlled through `RUST_LOG` (e.g. `RUST_LOG=ipc_batch=debug`).

use anyhow::{bail, Context};
use ipc_batch::aggregator::{AggregatorConfig, BatchConfigSet, DASHBOARD_METHODS};
use ipc_batch::dispatcher::DispatcherConfig;
use ipc_batch::transport::InProcessTransport;
use ipc_batch::{Dispatcher, RequestAggregator, RequestOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ipc_batch=info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("dashboard") => cmd_dashboard(&args[1..]).await,
        Some("burst") => cmd_burst(&args[1..]).await,
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!(
        r#"batch-demo {}

USAGE:
    batch-demo <COMMAND> [OPTIONS]

COMMANDS:
    dashboard [--fail-metrics]          Fetch the composite dashboard once
    burst [<calls>] [--policies <file>] Fire concurrent calls and report batching
    help                                Show this help message

ENVIRONMENT:
    IPC_BATCH_MAX_CONCURRENCY           Dispatcher slot count
    IPC_BATCH_MAX_BATCH_SIZE            Default policy batch size
    IPC_BATCH_MAX_WAIT_MS               Default policy wait time
    RUST_LOG                            Log filter"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn demo_dispatcher(fail_metrics: bool) -> Arc<Dispatcher> {
    let dispatcher = Arc::new(Dispatcher::with_config(DispatcherConfig::from_env()));
    for method in DASHBOARD_METHODS {
        if fail_metrics && method == "get_metrics" {
            dispatcher.register_fn(method, |_| async move {
                Err::<serde_json::Value, _>(anyhow::anyhow!("metrics collector unavailable"))
            });
            continue;
        }
        dispatcher.register_fn(method, move |_| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!({ "source": method, "ok": true }))
        });
    }
    dispatcher.register_fn("lookup", |params| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(json!({ "key": params.first().cloned().unwrap_or_default() }))
    });
    dispatcher
}

async fn cmd_dashboard(args: &[String]) -> anyhow::Result<()> {
    let fail_metrics = args.iter().any(|a| a == "--fail-metrics");
    let dispatcher = demo_dispatcher(fail_metrics);
    let aggregator = RequestAggregator::builder(Arc::new(InProcessTransport::new(dispatcher)))
        .config(AggregatorConfig::from_env())
        .build()?;

    let data = aggregator.execute_dashboard_batch().await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    println!("{}", serde_json::to_string_pretty(&aggregator.stats())?);
    aggregator.shutdown().await;
    Ok(())
}

async fn cmd_burst(args: &[String]) -> anyhow::Result<()> {
    let mut calls = 50usize;
    let mut policies = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--policies" => {
                let path = args.get(i + 1).context("--policies needs a file")?;
                policies = Some(
                    BatchConfigSet::from_file(path)
                        .with_context(|| format!("loading batch policies from {path}"))?,
                );
                i += 2;
            }
            n => {
                calls = n.parse().with_context(|| format!("invalid call count '{n}'"))?;
                i += 1;
            }
        }
    }

    let dispatcher = demo_dispatcher(false);
    let aggregator =
        RequestAggregator::builder(Arc::new(InProcessTransport::new(dispatcher.clone()).with_wire_round_trip(true)))
            .config(AggregatorConfig::from_env())
            .build()?;
    if let Some(set) = policies {
        aggregator.add_batch_configs(set)?;
    }

    let started = Instant::now();
    let results = futures::future::join_all((0..calls).map(|n| {
        let aggregator = aggregator.clone();
        async move {
            aggregator
                .execute_request("lookup", vec![json!(n)], RequestOptions::new())
                .await
        }
    }))
    .await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    aggregator.shutdown().await;

    println!(
        "{calls} calls in {:.1}ms, {failed} failed",
        started.elapsed().as_secs_f64() * 1000.0
    );
    println!("aggregator: {}", serde_json::to_string_pretty(&aggregator.stats())?);
    println!("dispatcher: {}", serde_json::to_string_pretty(&dispatcher.stats())?);
    Ok(())
}
