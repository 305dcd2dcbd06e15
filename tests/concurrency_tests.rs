//! Concurrent use of one gateway from many tasks.

use std::sync::Arc;
use std::time::Duration;

use apiguard::{
    Arguments, CallOptions, CircuitState, Gateway, GatewayConfig, GatewayError, MetricsCollector,
    RemoteError, RetryPolicy, SimulatedTransport,
};
use futures::future::join_all;

fn gateway_with(sim: &SimulatedTransport, tweak: impl FnOnce(&mut GatewayConfig)) -> Gateway {
    let mut config = GatewayConfig::default();
    config.retry = RetryPolicy::no_retry();
    tweak(&mut config);
    Gateway::new(sim.clone(), config).expect("valid config")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clones_share_cache_and_metrics_across_tasks() {
    let sim = SimulatedTransport::new();
    let gateway = gateway_with(&sim, |_| {});

    let mut handles = Vec::new();
    for task in 0..8 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..100 {
                let args = Arguments::new().with("name", format!("host-{task}-{i}"));
                gateway
                    .invoke("get-host", &args, &CallOptions::cached())
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(sim.calls("get-host"), 800);
    let ops = gateway.snapshot().operation("get-host").cloned().unwrap();
    assert_eq!(ops.calls, 800);
    assert_eq!(ops.successes, 800);
    assert_eq!(ops.cache_misses, 800);
    assert_eq!(ops.latency.count, 800);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_entry_serves_every_concurrent_reader() {
    let sim = SimulatedTransport::new();
    let gateway = gateway_with(&sim, |_| {});
    let args = Arguments::new().with("folder", "/");
    gateway.invoke("list-folders", &args, &CallOptions::cached()).await.unwrap();

    let readers = (0..50).map(|_| {
        let gateway = gateway.clone();
        let args = args.clone();
        tokio::spawn(async move {
            gateway
                .invoke("list-folders", &args, &CallOptions::cached())
                .await
        })
    });
    for result in join_all(readers).await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(sim.calls("list-folders"), 1);
    assert_eq!(gateway.snapshot().operation("list-folders").unwrap().cache_hits, 50);
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_exactly_one_concurrent_trial() {
    let sim = SimulatedTransport::new();
    let gateway = gateway_with(&sim, |c| {
        c.breaker.failure_threshold = 1;
        c.breaker.cooldown = Duration::from_secs(1);
    });
    sim.fail_next("get-host", 1, RemoteError::network("reset"));
    let _ = gateway.invoke("get-host", &Arguments::new(), &CallOptions::new()).await;
    assert_eq!(gateway.breaker_state("get-host"), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(1)).await;
    sim.set_latency("get-host", Duration::from_millis(100));

    let options = CallOptions::new();
    let args = Arguments::new();
    let callers = (0..10).map(|_| gateway.invoke("get-host", &args, &options));
    let results = join_all(callers).await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(GatewayError::CircuitOpen { .. })))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(rejected, 9);
    assert_eq!(sim.calls("get-host"), 2);
    assert_eq!(gateway.breaker_state("get-host"), CircuitState::Closed);
}

#[tokio::test]
async fn breakers_are_independent_per_operation() {
    let sim = SimulatedTransport::new();
    let gateway = gateway_with(&sim, |c| c.breaker.failure_threshold = 2);
    sim.fail_always("get-host", RemoteError::network("down"));

    for _ in 0..3 {
        let _ = gateway.invoke("get-host", &Arguments::new(), &CallOptions::new()).await;
    }
    gateway
        .invoke("list-folders", &Arguments::new(), &CallOptions::new())
        .await
        .unwrap();

    assert_eq!(
        gateway.breaker_states(),
        vec![
            ("get-host".to_string(), CircuitState::Open),
            ("list-folders".to_string(), CircuitState::Closed),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_collector_aggregates_two_gateways() {
    let sim = SimulatedTransport::new();
    let metrics = Arc::new(MetricsCollector::default());
    let first = Gateway::builder(sim.clone()).metrics(metrics.clone()).build().unwrap();
    let second = Gateway::builder(sim.clone()).metrics(metrics.clone()).build().unwrap();

    let a = tokio::spawn(async move {
        for _ in 0..25 {
            first.invoke("get-host", &Arguments::new(), &CallOptions::new()).await.unwrap();
        }
    });
    let b = tokio::spawn(async move {
        for _ in 0..25 {
            second.invoke("get-host", &Arguments::new(), &CallOptions::new()).await.unwrap();
        }
    });
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(metrics.operation("get-host").unwrap().calls, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_keep_their_own_results() {
    let sim = SimulatedTransport::new();
    let gateway = gateway_with(&sim, |_| {});

    let runs = (0..4).map(|batch| {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let items = (0..25)
                .map(|i| {
                    apiguard::BatchItem::new(
                        format!("{batch}-{i}"),
                        "get-host",
                        Arguments::new().with("batch", batch).with("item", i),
                    )
                })
                .collect();
            gateway
                .submit_batch(items, gateway.batch_options().with_preserve_order(true))
                .await
        })
    });

    for (batch, report) in join_all(runs).await.into_iter().enumerate() {
        let report = report.unwrap();
        assert_eq!(report.succeeded, 25);
        for (i, result) in report.results.iter().enumerate() {
            assert_eq!(result.item.id, format!("{batch}-{i}"));
        }
    }
    assert_eq!(sim.calls("get-host"), 100);
}
