//! End-to-end tests of a process group running in one process.

mod common;

use common::{
    Double, FailOn, Flaky, IndexedSum, ShiftByMean, SleepOn, registry, start_group,
    start_group_with, stop_group, test_config,
};
use parallel_core::{
    Backend, BackendConfig, BackendError, ExecutorConfig, FailurePolicy, FunctionRegistry,
    LocalTransport, Provenance, Transport, Worker,
};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_over_four_ranks() {
    let (mut backend, workers) = start_group(4).await;

    let pds = backend.parallelize((0..10).collect::<Vec<i64>>()).await.unwrap();
    assert_eq!(pds.layout().sizes(), &[3, 3, 2, 2]);
    assert_eq!(backend.count(&pds).unwrap(), 10);

    let doubled = backend.map(&Double, &pds).await.unwrap();
    let result = backend.collect(&doubled).await.unwrap();
    assert_eq!(result, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_and_indices_for_many_group_sizes() {
    for world_size in [1, 2, 3, 5] {
        let (mut backend, workers) = start_group(world_size).await;
        for len in [0usize, 1, 4, 7, 23] {
            let data: Vec<i64> = (0..len as i64).map(|x| x * 10).collect();
            let pds = backend.parallelize(data.clone()).await.unwrap();

            let sizes = pds.layout().sizes().to_vec();
            assert_eq!(sizes.len(), world_size);
            assert_eq!(sizes.iter().sum::<usize>(), len);
            let (floor, ceil) = (len / world_size, len.div_ceil(world_size));
            assert!(sizes.iter().all(|&s| s == floor || s == ceil));

            assert_eq!(backend.collect(&pds).await.unwrap(), data);

            let mapped = backend.map(&IndexedSum, &pds).await.unwrap();
            let result = backend.collect(&mapped).await.unwrap();
            assert_eq!(result.len(), len);
            for (index, (rank, value)) in result.into_iter().enumerate() {
                assert_eq!(value, index as i64 + data[index]);
                assert_eq!(Some(rank), pds.layout().shard_of(index));
            }
        }
        stop_group(backend, workers).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_record_aborts_map_by_default() {
    let (mut backend, workers) = start_group(4).await;
    let pds = backend.parallelize((0..10).collect::<Vec<i64>>()).await.unwrap();

    let err = backend.map(&FailOn { index: 5 }, &pds).await.unwrap_err();
    match &err {
        BackendError::WorkerExecution(aggregate) => {
            assert_eq!(aggregate.indices(), vec![5]);
            assert_eq!(aggregate.failures[0].rank, 1);
            assert_eq!(aggregate.function, "fail_on");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("index 5"));
    assert!(err.to_string().contains("refusing record 5"));
    assert!(!err.is_fatal());

    // The session survives a record failure.
    assert!(!backend.is_aborted());
    assert_eq!(backend.failure_stats().tasks_failed, 1);
    assert_eq!(backend.failure_stats().failed_records_per_rank, vec![0, 1, 0, 0]);
    let doubled = backend.map(&Double, &pds).await.unwrap();
    assert_eq!(backend.collect(&doubled).await.unwrap().len(), 10);

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_skip_and_continue_taints_dataset() {
    let (mut backend, workers) = start_group(3).await;
    let pds = backend.parallelize((0..10).collect::<Vec<i64>>()).await.unwrap();

    let tainted = backend
        .map_with_policy(&FailOn { index: 5 }, &pds, FailurePolicy::SkipAndContinue)
        .await
        .unwrap();
    assert!(tainted.is_tainted());
    assert_eq!(backend.count(&tainted).unwrap(), 10);

    let err = backend.collect(&tainted).await.unwrap_err();
    assert!(matches!(&err, BackendError::WorkerExecution(a) if a.indices() == vec![5]));

    let partial = backend.collect_partial(&tainted).await.unwrap();
    assert_eq!(partial.len(), 10);
    for (index, record) in partial.iter().enumerate() {
        match record {
            Ok(value) => assert_eq!(*value, index as i64),
            Err(failure) => {
                assert_eq!(index, 5);
                assert_eq!(failure.index, 5);
                assert_eq!(failure.attempts, 1);
            }
        }
    }

    // The taint follows the data downstream.
    let downstream = backend.map(&Double, &tainted).await.unwrap();
    assert_eq!(downstream.failures().map(|f| f.indices()), Some(vec![5]));
    let partial = backend.collect_partial(&downstream).await.unwrap();
    assert!(partial[5].is_err());
    assert_eq!(partial[6].as_ref().ok(), Some(&12));

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_policy() {
    let (mut backend, workers) = start_group(2).await;
    let pds = backend.parallelize(vec![1i64, 2, 3]).await.unwrap();

    let retried = backend
        .map_with_policy(&Flaky { failures: 2 }, &pds, FailurePolicy::Retry { max_attempts: 3 })
        .await
        .unwrap();
    assert_eq!(backend.collect(&retried).await.unwrap(), vec![3, 3, 3]);

    let err = backend
        .map_with_policy(&Flaky { failures: 2 }, &pds, FailurePolicy::Retry { max_attempts: 2 })
        .await
        .unwrap_err();
    match err {
        BackendError::WorkerExecution(aggregate) => {
            // Each rank stops at its first exhausted record.
            assert_eq!(aggregate.indices(), vec![0, 2]);
            assert!(aggregate.failures.iter().all(|f| f.attempts == 2));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = backend
        .map_with_policy(&Double, &pds, FailurePolicy::Retry { max_attempts: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Configuration(_)));

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_configured_default_policy() {
    let config = BackendConfig {
        failure_policy: FailurePolicy::SkipAndContinue,
        ..test_config()
    };
    let (mut backend, workers) = start_group_with(config, 2).await;
    let pds = backend.parallelize((0..4).collect::<Vec<i64>>()).await.unwrap();

    let mapped = backend.map(&FailOn { index: 0 }, &pds).await.unwrap();
    assert!(mapped.is_tainted());

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_values_reach_every_rank() {
    let (mut backend, workers) = start_group(3).await;
    let pds = backend.parallelize(vec![0.0f64; 6]).await.unwrap();

    let first = backend.broadcast(vec![1.0f64, 2.0, 3.0]).await.unwrap();
    let second = backend.broadcast(vec![10.0f64, 30.0]).await.unwrap();
    assert!(second.generation() > first.generation());
    assert_eq!(*first.value().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(*backend.value(&second).unwrap(), vec![10.0, 30.0]);
    // Reads are local and repeatable.
    assert_eq!(backend.value(&second).unwrap(), backend.value(&second).unwrap());

    let shifted = backend
        .map(&ShiftByMean { sample: first.clone() }, &pds)
        .await
        .unwrap();
    assert_eq!(backend.collect(&shifted).await.unwrap(), vec![2.0; 6]);

    let shifted = backend
        .map(&ShiftByMean { sample: second.clone() }, &pds)
        .await
        .unwrap();
    assert_eq!(backend.collect(&shifted).await.unwrap(), vec![20.0; 6]);

    backend.release_broadcast(first.clone()).unwrap();
    assert!(matches!(backend.value(&first), Err(BackendError::StaleHandle(_))));
    assert!(matches!(first.value(), Err(BackendError::StaleHandle(_))));
    let err = backend
        .map(&ShiftByMean { sample: first }, &pds)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Stale handle"));

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_rejects_stale_handles() {
    let (mut backend, workers) = start_group(2).await;
    let pds = backend.parallelize(vec![1i64, 2, 3]).await.unwrap();
    let handle = backend.broadcast(vec![1.0f64]).await.unwrap();
    let old_session = backend.session();

    backend.reset().await.unwrap();
    assert_ne!(backend.session(), old_session);

    assert!(matches!(
        backend.map(&Double, &pds).await,
        Err(BackendError::StaleHandle(_))
    ));
    assert!(matches!(backend.collect(&pds).await, Err(BackendError::StaleHandle(_))));
    assert!(matches!(backend.value(&handle), Err(BackendError::StaleHandle(_))));
    assert!(matches!(handle.value(), Err(BackendError::StaleHandle(_))));

    // Fresh handles work, and generations keep counting.
    let fresh = backend.broadcast(vec![5.0f64]).await.unwrap();
    assert!(fresh.generation() > handle.generation());
    let pds = backend.parallelize(vec![4.0f64, 6.0]).await.unwrap();
    let shifted = backend
        .map(&ShiftByMean { sample: fresh }, &pds)
        .await
        .unwrap();
    assert_eq!(backend.collect(&shifted).await.unwrap(), vec![9.0, 11.0]);

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lineage_and_release() {
    let (mut backend, workers) = start_group(2).await;
    let source = backend.parallelize(vec![1i64, 2]).await.unwrap();
    let once = backend.map(&Double, &source).await.unwrap();
    let twice = backend.map(&Double, &once).await.unwrap();

    let lineage = backend.lineage(&twice).unwrap();
    assert_eq!(
        lineage.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        vec![twice.id(), once.id(), source.id()]
    );
    assert_eq!(lineage[2].1, Provenance::Parallelized { records: 2 });

    // Dropping the intermediate handle releases it with the next command;
    // its descendants stay readable.
    drop(once);
    backend.barrier().await.unwrap();
    assert_eq!(backend.lineage(&twice).unwrap().len(), 1);
    assert_eq!(backend.collect(&twice).await.unwrap(), vec![4, 8]);

    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_record_threads_keep_order() {
    let config = BackendConfig {
        executor: ExecutorConfig { record_threads: 4 },
        ..test_config()
    };
    let (mut backend, workers) = start_group_with(config, 3).await;
    let data: Vec<i64> = (0..100).collect();
    let pds = backend.parallelize(data.clone()).await.unwrap();
    let doubled = backend.map(&Double, &pds).await.unwrap();
    assert_eq!(
        backend.collect(&doubled).await.unwrap(),
        data.iter().map(|x| x * 2).collect::<Vec<_>>()
    );
    stop_group(backend, workers).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_mismatch_fails_start() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut endpoints = LocalTransport::group(2).unwrap();
    let worker = Worker::new(
        Box::new(endpoints.pop().unwrap()),
        FunctionRegistry::new().register::<Double>(),
        &test_config(),
    )
    .unwrap();
    let worker = tokio::spawn(worker.run());

    let err = Backend::start(Box::new(endpoints.pop().unwrap()), registry(), test_config())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ProtocolMismatch { rank: 1, .. }));
    assert!(err.to_string().contains("functions [double]"));

    // Root is gone, so the worker leaves with a transport error.
    assert!(matches!(
        worker.await.unwrap(),
        Err(BackendError::Transport(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_roles_are_enforced() {
    let mut endpoints = LocalTransport::group(2).unwrap();
    let worker_endpoint: Box<dyn Transport> = Box::new(endpoints.pop().unwrap());
    let err = Backend::start(worker_endpoint, registry(), test_config())
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidRole(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_worker_times_out() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut endpoints = LocalTransport::group(2).unwrap();
    // Rank 1 is connected but never runs the worker loop.
    let _silent = endpoints.pop().unwrap();
    let config = BackendConfig {
        collective_timeout_ms: 100,
        ..test_config()
    };

    let err = Backend::start(Box::new(endpoints.pop().unwrap()), registry(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Timeout { rank: 1, .. }));
    assert!(err.is_fatal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_task_times_out_and_aborts_session() {
    let config = BackendConfig {
        task_timeout_ms: Some(100),
        ..test_config()
    };
    let (mut backend, _workers) = start_group_with(config, 2).await;
    let pds = backend.parallelize(vec![1i64, 2, 3, 4]).await.unwrap();

    let err = backend
        .map(&SleepOn { rank: 1, millis: 500 }, &pds)
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Timeout { rank: 1, timeout_ms: 100, .. }));
    assert!(backend.is_aborted());
    assert!(matches!(
        backend.collect(&pds).await,
        Err(BackendError::SessionAborted(_))
    ));
    assert!(matches!(
        backend.map(&Double, &pds).await,
        Err(BackendError::SessionAborted(_))
    ));
    assert!(matches!(backend.shutdown().await, Err(BackendError::SessionAborted(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_worker_aborts_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = test_config();
    let mut endpoints = LocalTransport::group(3).unwrap().into_iter();
    let root = endpoints.next().unwrap();
    let mut workers = Vec::new();
    for endpoint in endpoints {
        let worker = Worker::new(Box::new(endpoint), registry(), &config).unwrap();
        workers.push(tokio::spawn(worker.run()));
    }

    let mut backend = Backend::start(Box::new(root), registry(), config).await.unwrap();
    let pds = backend.parallelize(vec![1i64, 2, 3]).await.unwrap();

    let lost = workers.pop().unwrap();
    lost.abort();
    assert!(lost.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = backend.map(&Double, &pds).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(backend.is_aborted());
    assert!(matches!(
        backend.collect(&pds).await,
        Err(BackendError::SessionAborted(_))
    ));
    assert!(matches!(backend.shutdown().await, Err(BackendError::SessionAborted(_))));
}
