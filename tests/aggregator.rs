//! Integration tests for request aggregation over pluggable transports.

use async_trait::async_trait;
use ipc_batch::aggregator::{
    AggregatorConfig, BatchConfig, BatchConfigSet, MethodDescriptor, DASHBOARD_METHODS,
};
use ipc_batch::protocol::{ErrorKind, RequestBatch, ResponseBatch};
use ipc_batch::resilience::retry::RetryConfig;
use ipc_batch::transport::{BatchTransport, InProcessTransport, TransportError};
use ipc_batch::{Dispatcher, Error, RequestAggregator, RequestOptions, Result};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn dispatcher() -> Arc<Dispatcher> {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_fn("square", |params| async move {
        let n = params.first().and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(json!(n * n))
    });
    dispatcher.register_fn("fail", |_| async move {
        Err::<serde_json::Value, _>(anyhow::anyhow!("handler exploded"))
    });
    for method in DASHBOARD_METHODS {
        dispatcher.register_fn(method, move |_| async move { Ok(json!({ "source": method })) });
    }
    dispatcher
}

/// Forwards to a dispatcher, counts submissions and reverses the response order.
struct ReorderingTransport {
    dispatcher: Arc<Dispatcher>,
    submissions: AtomicUsize,
    sizes: Mutex<Vec<usize>>,
}

impl ReorderingTransport {
    fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            submissions: AtomicUsize::new(0),
            sizes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BatchTransport for ReorderingTransport {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.sizes.lock().unwrap().push(batch.len());
        let mut response = self.dispatcher.process_batch(batch).await?;
        response.responses.reverse();
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "reordering"
    }
}

struct UnreachableTransport {
    attempts: AtomicUsize,
}

#[async_trait]
impl BatchTransport for UnreachableTransport {
    async fn send(&self, _batch: RequestBatch) -> Result<ResponseBatch> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Unavailable {
            endpoint: "http://127.0.0.1:3001/api/batch".into(),
            reason: "connection refused".into(),
        }
        .into())
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

/// Rejects multi-entry batches, forwards single calls.
struct SingleCallOnlyTransport {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl BatchTransport for SingleCallOnlyTransport {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        if batch.len() > 1 {
            return Err(TransportError::Status {
                status: 413,
                body: "payload too large".into(),
            }
            .into());
        }
        self.dispatcher.process_batch(batch).await
    }

    fn name(&self) -> &'static str {
        "single_call_only"
    }
}

/// Answers with a different batch id than the one submitted.
struct MismatchedIdTransport {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl BatchTransport for MismatchedIdTransport {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        let mut response = self.dispatcher.process_batch(batch).await?;
        response.batch_id = "someone-else".into();
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "mismatched"
    }
}

/// Drops the first response entry of every batch.
struct LossyTransport {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl BatchTransport for LossyTransport {
    async fn send(&self, batch: RequestBatch) -> Result<ResponseBatch> {
        let first = batch.requests.first().map(|r| r.id.clone());
        let mut response = self.dispatcher.process_batch(batch).await?;
        response.responses.retain(|r| Some(&r.id) != first.as_ref());
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "lossy"
    }
}

fn pair_policy() -> BatchConfig {
    BatchConfig::new("pair")
        .with_max_batch_size(2)
        .with_max_wait_time(Duration::from_secs(10))
}

#[tokio::test]
async fn test_full_queue_is_one_submission_demuxed_by_id() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator.add_batch_config("pair", pair_policy()).unwrap();

    let opts = RequestOptions::new().with_batch_key("pair");
    let (a, b) = tokio::join!(
        aggregator.execute_request("square", vec![json!(3)], opts.clone()),
        aggregator.execute_request("square", vec![json!(4)], opts),
    );

    assert_eq!(a.unwrap(), json!(9));
    assert_eq!(b.unwrap(), json!(16));
    assert_eq!(transport.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(*transport.sizes.lock().unwrap(), vec![2]);

    let stats = aggregator.stats();
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.total_requests, 2);
    assert!((stats.average_batch_size - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_failures_reach_only_their_caller() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator.add_batch_config("pair", pair_policy()).unwrap();

    let opts = RequestOptions::new().with_batch_key("pair");
    let (ok, bad) = tokio::join!(
        aggregator.execute_request("square", vec![json!(5)], opts.clone()),
        aggregator.execute_request("fail", vec![], opts),
    );
    assert_eq!(ok.unwrap(), json!(25));
    let err = bad.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::HandlerError));
    assert!(err.to_string().contains("handler exploded"));
    assert!((aggregator.stats().error_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_unreachable_dispatcher_rejects_every_queued_caller() {
    let transport = Arc::new(UnreachableTransport {
        attempts: AtomicUsize::new(0),
    });
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator
        .add_batch_config("trio", BatchConfig::new("trio").with_max_batch_size(3))
        .unwrap();

    let opts = RequestOptions::new().with_batch_key("trio");
    let results = tokio::time::timeout(
        Duration::from_secs(2),
        futures::future::join_all(
            (0..3).map(|n| aggregator.execute_request("square", vec![json!(n)], opts.clone())),
        ),
    )
    .await
    .expect("no caller may be left pending");

    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    for result in results {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::HandlerError));
        assert!(err.to_string().contains("connection refused"));
    }
    let stats = aggregator.stats();
    assert_eq!(stats.total_requests, 3);
    assert!((stats.error_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_wait_time_flushes_partial_queue() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator
        .add_batch_config(
            "lazy",
            BatchConfig::new("lazy")
                .with_max_batch_size(50)
                .with_max_wait_time(Duration::from_millis(30)),
        )
        .unwrap();

    let started = Instant::now();
    let value = aggregator
        .execute_request("square", vec![json!(7)], RequestOptions::new().with_batch_key("lazy"))
        .await
        .unwrap();
    assert_eq!(value, json!(49));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(transport.submissions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_keys_flush_independently() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator.add_batch_config("left", pair_policy()).unwrap();
    aggregator.add_batch_config("right", pair_policy()).unwrap();

    let left = RequestOptions::new().with_batch_key("left");
    let right = RequestOptions::new().with_batch_key("right");
    let (a, b, c, d) = tokio::join!(
        aggregator.execute_request("square", vec![json!(1)], left.clone()),
        aggregator.execute_request("square", vec![json!(2)], right.clone()),
        aggregator.execute_request("square", vec![json!(3)], left),
        aggregator.execute_request("square", vec![json!(4)], right),
    );
    assert_eq!(
        [a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()],
        [json!(1), json!(4), json!(9), json!(16)]
    );
    assert_eq!(transport.submissions.load(Ordering::SeqCst), 2);
    assert_eq!(*transport.sizes.lock().unwrap(), vec![2, 2]);
}

#[tokio::test]
async fn test_mismatched_batch_id_rejects_callers() {
    let aggregator = RequestAggregator::new(Arc::new(MismatchedIdTransport {
        dispatcher: dispatcher(),
    }));
    aggregator.add_batch_config("pair", pair_policy()).unwrap();
    let opts = RequestOptions::new().with_batch_key("pair");
    let (a, b) = tokio::join!(
        aggregator.execute_request("square", vec![json!(1)], opts.clone()),
        aggregator.execute_request("square", vec![json!(2)], opts),
    );
    for err in [a.unwrap_err(), b.unwrap_err()] {
        assert_eq!(err.kind(), Some(ErrorKind::HandlerError));
        assert!(err.to_string().contains("does not match"));
    }
}

#[tokio::test]
async fn test_missing_response_entry_fails_only_that_caller() {
    let aggregator = RequestAggregator::new(Arc::new(LossyTransport {
        dispatcher: dispatcher(),
    }));
    aggregator.add_batch_config("pair", pair_policy()).unwrap();
    let opts = RequestOptions::new().with_batch_key("pair");
    let (a, b) = tokio::join!(
        aggregator.execute_request("square", vec![json!(6)], opts.clone()),
        aggregator.execute_request("square", vec![json!(8)], opts),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_err()).count(), 1);
    let err = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(err.kind(), Some(ErrorKind::HandlerError));
    assert!(err.to_string().contains("no entry"));
}

#[tokio::test]
async fn test_cacheable_results_skip_the_transport() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::builder(transport.clone())
        .config(AggregatorConfig::new().with_cache_ttl(Duration::from_secs(60)))
        .batch_config(
            "kb",
            BatchConfig::new("kb")
                .with_max_batch_size(1)
                .with_method(MethodDescriptor::new("square").cacheable(true)),
        )
        .build()
        .unwrap();

    let opts = RequestOptions::new().with_batch_key("kb");
    for _ in 0..3 {
        let v = aggregator
            .execute_request("square", vec![json!(12)], opts.clone())
            .await
            .unwrap();
        assert_eq!(v, json!(144));
    }
    // different params miss
    aggregator
        .execute_request("square", vec![json!(2)], opts)
        .await
        .unwrap();

    assert_eq!(transport.submissions.load(Ordering::SeqCst), 2);
    let stats = aggregator.stats();
    assert_eq!(stats.total_requests, 4);
    assert!((stats.cache_hit_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_cache_entries_expire() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::builder(transport.clone())
        .config(AggregatorConfig::new().with_cache_ttl(Duration::from_millis(20)))
        .batch_config(
            "kb",
            BatchConfig::new("kb")
                .with_max_batch_size(1)
                .with_method(MethodDescriptor::new("square").cacheable(true)),
        )
        .build()
        .unwrap();

    let opts = RequestOptions::new().with_batch_key("kb");
    aggregator.execute_request("square", vec![json!(3)], opts.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    aggregator.execute_request("square", vec![json!(3)], opts).await.unwrap();
    assert_eq!(transport.submissions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_policies_loaded_from_yaml() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    let set = BatchConfigSet::from_yaml_str(
        "batches:\n  - name: quad\n    maxBatchSize: 4\n    maxWaitTime: 10000\n",
    )
    .unwrap();
    aggregator.add_batch_configs(set).unwrap();
    assert_eq!(aggregator.batch_config("quad").max_batch_size, 4);

    let opts = RequestOptions::new().with_batch_key("quad");
    let results = futures::future::join_all(
        (0..4).map(|n| aggregator.execute_request("square", vec![json!(n)], opts.clone())),
    )
    .await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(*transport.sizes.lock().unwrap(), vec![4]);
}

#[tokio::test]
async fn test_shutdown_flushes_outstanding_queues() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator
        .add_batch_config(
            "parked",
            BatchConfig::new("parked")
                .with_max_batch_size(100)
                .with_max_wait_time(Duration::from_secs(60)),
        )
        .unwrap();

    let caller = {
        let aggregator = aggregator.clone();
        tokio::spawn(async move {
            aggregator
                .execute_request("square", vec![json!(9)], RequestOptions::new().with_batch_key("parked"))
                .await
        })
    };
    while aggregator.pending_requests("parked") == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(aggregator.total_pending(), 1);

    aggregator.shutdown().await;
    assert_eq!(caller.await.unwrap().unwrap(), json!(81));
    assert_eq!(aggregator.total_pending(), 0);

    let err = aggregator
        .execute_request("square", vec![json!(1)], RequestOptions::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("shut down"));
}

#[tokio::test]
async fn test_flush_all_settles_parked_callers() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());
    aggregator
        .add_batch_config(
            "parked",
            BatchConfig::new("parked")
                .with_max_batch_size(100)
                .with_max_wait_time(Duration::from_secs(60)),
        )
        .unwrap();

    let opts = RequestOptions::new().with_batch_key("parked");
    let calls = futures::future::join_all(
        (0..3).map(|n| aggregator.execute_request("square", vec![json!(n)], opts.clone())),
    );
    let flusher = async {
        while aggregator.pending_requests("parked") < 3 {
            tokio::task::yield_now().await;
        }
        aggregator.flush_all().await
    };
    let (results, flushed) = tokio::join!(calls, flusher);

    assert_eq!(flushed, 1);
    assert!(results.into_iter().all(|r| r.is_ok()));
    assert_eq!(*transport.sizes.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn test_shutdown_waits_for_flush_all_in_progress() {
    let dispatcher = dispatcher();
    dispatcher.register_fn("slow", |_| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!("done"))
    });
    let aggregator = RequestAggregator::new(Arc::new(InProcessTransport::new(dispatcher)));
    aggregator
        .add_batch_config(
            "parked",
            BatchConfig::new("parked")
                .with_max_batch_size(100)
                .with_max_wait_time(Duration::from_secs(60)),
        )
        .unwrap();

    let caller = tokio::spawn({
        let aggregator = aggregator.clone();
        async move {
            aggregator
                .execute_request("slow", vec![], RequestOptions::new().with_batch_key("parked"))
                .await
        }
    });
    while aggregator.pending_requests("parked") < 1 {
        tokio::task::yield_now().await;
    }

    let flushing = aggregator.flush_all();
    tokio::pin!(flushing);
    // first poll drains the queue and starts its flush
    assert!(futures::poll!(flushing.as_mut()).is_pending());
    assert_eq!(aggregator.total_pending(), 0);

    aggregator.shutdown().await;
    assert_eq!(aggregator.stats().total_batches, 1);
    assert_eq!(flushing.await, 1);
    assert_eq!(caller.await.unwrap().unwrap(), json!("done"));
}

#[tokio::test]
async fn test_dashboard_in_one_round_trip() {
    let transport = Arc::new(ReorderingTransport::new(dispatcher()));
    let aggregator = RequestAggregator::new(transport.clone());

    let data = aggregator.execute_dashboard_batch().await.unwrap();
    assert!(!data.degraded);
    assert!(data.failed_sources.is_empty());
    assert_eq!(data.metrics, Some(json!({ "source": "get_metrics" })));
    assert_eq!(data.storage_info, Some(json!({ "source": "get_storage_info" })));
    assert_eq!(transport.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(*transport.sizes.lock().unwrap(), vec![6]);
}

#[tokio::test]
async fn test_dashboard_reuses_cached_sources() {
    let dispatcher = dispatcher();
    let kb_calls = Arc::new(AtomicUsize::new(0));
    {
        let kb_calls = kb_calls.clone();
        dispatcher.register_fn("get_kb_stats", move |_| {
            let kb_calls = kb_calls.clone();
            async move {
                kb_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "documents": 42 }))
            }
        });
    }
    let transport = Arc::new(ReorderingTransport::new(dispatcher));
    let aggregator = RequestAggregator::new(transport.clone());

    let first = aggregator.execute_dashboard_batch().await.unwrap();
    let second = aggregator.execute_dashboard_batch().await.unwrap();

    assert_eq!(first.kb_stats, Some(json!({ "documents": 42 })));
    assert_eq!(second.kb_stats, first.kb_stats);
    assert_eq!(second.storage_info, Some(json!({ "source": "get_storage_info" })));
    assert_eq!(kb_calls.load(Ordering::SeqCst), 1);
    // kb_stats and storage_info travel only the first time
    assert_eq!(*transport.sizes.lock().unwrap(), vec![6, 4]);

    let stats = aggregator.stats();
    assert!((stats.cache_hit_rate - 0.5).abs() < 1e-9);
    assert_eq!(stats.total_requests, 12);
}

#[tokio::test]
async fn test_dashboard_falls_back_to_individual_calls() {
    let dispatcher = dispatcher();
    dispatcher.register_fn("get_metrics", |_| async move {
        Err::<serde_json::Value, _>(anyhow::anyhow!("collector offline"))
    });
    let aggregator = RequestAggregator::builder(Arc::new(SingleCallOnlyTransport { dispatcher }))
        .config(
            AggregatorConfig::new().with_retry(
                RetryConfig::new()
                    .with_max_retries(1)
                    .with_delays(Duration::from_millis(1), Duration::from_millis(2)),
            ),
        )
        .build()
        .unwrap();

    let data = aggregator.execute_dashboard_batch().await.unwrap();
    assert!(data.degraded);
    assert_eq!(data.failed_sources, vec!["get_metrics".to_string()]);
    assert_eq!(data.health_status, Some(json!({ "source": "get_health_status" })));

    let metrics = data.metrics.unwrap();
    assert_eq!(metrics["derived"], json!(true));
    assert_eq!(metrics["availableSources"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_dashboard_errors_when_every_source_fails() {
    let transport = Arc::new(UnreachableTransport {
        attempts: AtomicUsize::new(0),
    });
    let aggregator = RequestAggregator::builder(transport.clone())
        .config(
            AggregatorConfig::new().with_retry(
                RetryConfig::new()
                    .with_max_retries(2)
                    .with_delays(Duration::from_millis(1), Duration::from_millis(2)),
            ),
        )
        .build()
        .unwrap();

    let err = aggregator.execute_dashboard_batch().await.unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));
    // one batch plus six sources, each tried three times
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1 + 6 * 3);
}

#[tokio::test]
async fn test_aggregator_over_wire_codec() {
    let transport = InProcessTransport::new(dispatcher()).with_wire_round_trip(true);
    let aggregator = RequestAggregator::new(Arc::new(transport));
    aggregator.add_batch_config("pair", pair_policy()).unwrap();

    let opts = RequestOptions::new().with_batch_key("pair");
    let (a, b) = tokio::join!(
        aggregator.execute_request("square", vec![json!(10)], opts.clone()),
        aggregator.execute_request("nope", vec![], opts),
    );
    assert_eq!(a.unwrap(), json!(100));
    assert_eq!(b.unwrap_err().kind(), Some(ErrorKind::HandlerNotFound));
}
