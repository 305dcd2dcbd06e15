//! apiguard demo: drives a simulated monitoring API through the gateway and
//! prints what the middleware observed.
//!
//! `RUST_LOG` controls verbosity (default `info`); `APIGUARD_LOG_JSON=1`
//! switches to JSON log lines. Configuration comes from an optional
//! `apiguard.toml` and `APIGUARD__*` variables.

use std::time::Duration;

use anyhow::Context;
use apiguard::{
    Arguments, BatchItem, CallOptions, Gateway, GatewayConfig, RemoteError, SimulatedTransport,
};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const HOSTS: usize = 2_500;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("APIGUARD_LOG_JSON").is_ok_and(|v| v == "1");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn inventory() -> SimulatedTransport {
    let sim = SimulatedTransport::new();
    sim.set_collection(
        "list-hosts",
        (0..HOSTS)
            .map(|i| json!({"name": format!("host-{i:04}"), "folder": "/prod", "state": "up"}))
            .collect(),
    );
    sim.set_response("list-folders", json!({"value": ["/prod", "/staging"]}));
    sim.set_default_latency(Duration::from_millis(2));
    sim.fail_next("get-host", 2, RemoteError::network("connection reset by peer"));
    sim.fail_when(
        "get-host",
        "name",
        "host-0013",
        RemoteError::from_status(404, "host not found"),
    );
    sim
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;
    telemetry::describe_metrics();

    let config = GatewayConfig::load().context("loading configuration")?;
    let sim = inventory();
    let gateway = Gateway::new(sim.clone(), config)?;

    // Cached read: the second call never reaches the remote.
    let folders_args = Arguments::new();
    for _ in 0..2 {
        gateway
            .invoke("list-folders", &folders_args, &CallOptions::cached())
            .await?;
    }
    tracing::info!(remote_calls = sim.calls("list-folders"), "folders read twice");

    // Bounded-memory walk over the whole inventory.
    let mut items = Box::pin(
        gateway
            .open_stream("list-hosts", Arguments::new().with("folder", "/prod"), 0)
            .into_item_stream(),
    );
    let mut streamed = 0usize;
    while let Some(item) = items.next().await {
        item?;
        streamed += 1;
    }
    tracing::info!(streamed, pages = sim.calls("list-hosts"), "inventory streamed");

    // Fan-out with partial failures.
    let batch: Vec<BatchItem> = (0..50)
        .map(|i| {
            let name = format!("host-{i:04}");
            BatchItem::new(name.clone(), "get-host", Arguments::new().with("name", name))
        })
        .collect();
    let report = gateway
        .submit_batch(batch, gateway.batch_options().with_preserve_order(true))
        .await;
    for failure in report.failures() {
        if let Err(error) = &failure.result {
            tracing::warn!(item = %failure.item.id, error = %error, "batch item failed");
        }
    }

    // A write drops the cached reads it affects.
    gateway
        .invoke_write(
            "update-folder",
            &Arguments::new().with("folder", "/prod").with("title", "Production"),
            &["list-folders"],
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&gateway.snapshot())?);
    println!("{}", serde_json::to_string_pretty(&gateway.cache_stats())?);
    println!("{}", prometheus.render());
    Ok(())
}
