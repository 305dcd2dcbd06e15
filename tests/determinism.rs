//! Request identity and reporting must not depend on argument order, task
//! scheduling or map iteration order.

use std::time::Duration;

use apiguard::{
    Arguments, CacheKey, CallOptions, Gateway, GatewayConfig, RetryPolicy, SimulatedTransport,
};
use serde_json::json;

#[tokio::test]
async fn argument_order_does_not_change_the_cache_key() {
    let sim = SimulatedTransport::new();
    let gateway = Gateway::new(sim.clone(), GatewayConfig::default()).unwrap();

    let forward = Arguments::new()
        .with("folder", "/prod")
        .with("site", "main")
        .with("filter", json!({ "state": "up", "tags": ["linux", "web"] }));
    let backward = Arguments::new()
        .with("filter", json!({ "tags": ["linux", "web"], "state": "up" }))
        .with("site", "main")
        .with("folder", "/prod");

    gateway.invoke("list-hosts", &forward, &CallOptions::cached()).await.unwrap();
    gateway.invoke("list-hosts", &backward, &CallOptions::cached()).await.unwrap();

    assert_eq!(sim.calls("list-hosts"), 1);
    assert_eq!(CacheKey::new("list-hosts", &forward), CacheKey::new("list-hosts", &backward));
}

#[tokio::test]
async fn array_order_and_values_still_distinguish_requests() {
    let sim = SimulatedTransport::new();
    let gateway = Gateway::new(sim.clone(), GatewayConfig::default()).unwrap();

    let requests = [
        Arguments::new().with("tags", json!(["linux", "web"])),
        Arguments::new().with("tags", json!(["web", "linux"])),
        Arguments::new().with("tags", json!(["web"])),
        Arguments::new().with("tags", "web"),
    ];
    for args in &requests {
        gateway.invoke("list-hosts", args, &CallOptions::cached()).await.unwrap();
    }
    assert_eq!(sim.calls("list-hosts"), 4);
}

#[test]
fn cache_key_text_is_stable() {
    let args = Arguments::new()
        .with("b", json!({ "z": 1, "a": [2, 1] }))
        .with("a", true);
    assert_eq!(
        CacheKey::new("get-host", &args).as_str(),
        r#"get-host?{"a":true,"b":{"a":[2,1],"z":1}}"#
    );
}

#[tokio::test]
async fn snapshot_lists_operations_in_name_order() {
    let sim = SimulatedTransport::new();
    let gateway = Gateway::new(sim, GatewayConfig::default()).unwrap();
    for op in ["list-services", "get-host", "list-folders", "activate-changes"] {
        gateway.invoke(op, &Arguments::new(), &CallOptions::new()).await.unwrap();
    }

    let names: Vec<String> = gateway.snapshot().operations.into_keys().collect();
    assert_eq!(
        names,
        vec!["activate-changes", "get-host", "list-folders", "list-services"]
    );
}

#[test]
fn backoff_without_jitter_is_reproducible() {
    let policy = RetryPolicy::default()
        .with_base_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(500))
        .with_jitter(0.0);

    let delays: Vec<Duration> = (1..=5).map(|n| policy.jittered_delay(n)).collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(500),
            Duration::from_millis(500),
        ]
    );
}

#[tokio::test]
async fn batch_with_preserved_order_is_identical_across_runs() {
    let sim = SimulatedTransport::new();
    let gateway = Gateway::new(sim, GatewayConfig::default()).unwrap();
    let items = || {
        (0..30)
            .map(|i| apiguard::BatchItem::new(i.to_string(), "get-host", Arguments::new().with("n", i)))
            .collect::<Vec<_>>()
    };

    let run = |gateway: Gateway| async move {
        let options = gateway.batch_options().with_concurrency(6).with_preserve_order(true);
        gateway
            .submit_batch(items(), options)
            .await
            .results
            .into_iter()
            .map(|r| r.result.unwrap())
            .collect::<Vec<_>>()
    };

    let first = run(gateway.clone()).await;
    let second = run(gateway).await;
    assert_eq!(first, second);
}
