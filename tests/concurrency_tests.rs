//! Concurrent producers and workers over the in-memory transport.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use tasker_session_queue::dispatch::{DispatchOutcome, SessionClosePolicy};
use tasker_session_queue::error::TaskerError;
use tasker_session_queue::session::SessionStrategy;
use tasker_session_queue::state_machine::EndpointState;
use tasker_session_queue::transport::{Transport, TransportError, TransportTransaction};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_sends_share_one_session() {
    let queue = TestQueue::new();

    let mut producers = Vec::new();
    for i in 0..8 {
        let producer = queue.producer.clone();
        producers.push(tokio::spawn(async move {
            producer
                .enqueue(
                    QUEUE,
                    SessionStrategy::PersistentReuse,
                    &[envelope("ship", &format!("T{i}"))],
                )
                .await
        }));
    }
    for producer in producers {
        producer.await.unwrap().unwrap();
    }

    let records = queue.broker.session_records();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_resolved());
    assert_eq!(queue.broker.open_endpoints().len(), 2);
    assert_eq!(queue.broker.queue_depth(QUEUE), 8);

    let handler = RecordingHandler::new();
    let dispatcher = queue.dispatcher(
        registry_with(&["ship"], handler.clone()),
        SessionClosePolicy::KeepOpen,
        1,
    );
    drain(&dispatcher).await;
    let sessions: HashSet<_> = handler.deliveries().iter().map(|d| d.session_id).collect();
    assert_eq!(sessions.len(), 1);
    assert_eq!(Some(*sessions.iter().next().unwrap()), records[0].session_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_delivers_exactly_once_in_session_order() {
    const SESSIONS: usize = 6;
    const PER_SESSION: usize = 5;

    let queue = TestQueue::new();
    let handler = RecordingHandler::new();
    let dispatcher = queue.dispatcher(
        registry_with(&["ship"], handler.clone()),
        SessionClosePolicy::CloseWhenDrained,
        4,
    );
    let replies = queue.reply_dispatcher();
    dispatcher.start();
    replies.start();
    assert_eq!(dispatcher.active_workers(), 4);

    for s in 0..SESSIONS {
        let batch: Vec<_> = (0..PER_SESSION)
            .map(|i| envelope("ship", &format!("s{s}-{i}")))
            .collect();
        queue
            .producer
            .enqueue(QUEUE, SessionStrategy::time_boxed_seconds(60), &batch)
            .await
            .unwrap();
    }

    let total = SESSIONS * PER_SESSION;
    assert!(wait_for(Duration::from_secs(10), || handler.count() >= total).await);
    assert!(
        wait_for(Duration::from_secs(10), || queue.broker.open_endpoints().is_empty()).await,
        "every drained session should be reclaimed"
    );
    dispatcher.shutdown().await;
    replies.shutdown().await;

    let deliveries = handler.deliveries();
    assert_eq!(deliveries.len(), total);
    let unique: HashSet<_> = deliveries.iter().map(|d| d.locator.clone()).collect();
    assert_eq!(unique.len(), total);

    let mut per_session: HashMap<_, Vec<String>> = HashMap::new();
    for delivery in &deliveries {
        per_session
            .entry(delivery.session_id)
            .or_default()
            .push(delivery.locator.clone());
    }
    assert_eq!(per_session.len(), SESSIONS);
    for locators in per_session.values() {
        let prefix = locators[0].split('-').next().unwrap().to_string();
        let expected: Vec<String> = (0..PER_SESSION).map(|i| format!("{prefix}-{i}")).collect();
        assert_eq!(locators, &expected);
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.processed, total as u64);
    assert_eq!(stats.sessions_closed, SESSIONS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poison_messages_never_stall_the_pool() {
    let queue = TestQueue::new();
    let handler = RecordingHandler::new();
    let dispatcher = queue.dispatcher(
        registry_with(&["ship"], handler.clone()),
        SessionClosePolicy::CloseWhenDrained,
        2,
    );
    dispatcher.start();

    for i in 0..4 {
        queue
            .producer
            .enqueue(
                QUEUE,
                SessionStrategy::time_boxed_seconds(60),
                &[
                    envelope("Unknown", &format!("P{i}")),
                    envelope("ship", &format!("T{i}")),
                ],
            )
            .await
            .unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || handler.count() == 4).await);
    dispatcher.shutdown().await;

    let stats = dispatcher.stats();
    assert_eq!(stats.poison, 4);
    assert_eq!(stats.processed, 4);
    assert_eq!(queue.broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn test_uncommitted_send_keeps_session_open() {
    let queue = TestQueue::new();
    let handler = RecordingHandler::new();
    let dispatcher = queue.dispatcher(
        registry_with(&["ship"], handler.clone()),
        SessionClosePolicy::CloseWhenDrained,
        1,
    );

    let mut first = queue.broker.begin().await.unwrap();
    let mut handle = queue
        .producer
        .acquire_send_handle(&mut *first, QUEUE, SessionStrategy::time_boxed_seconds(60))
        .await
        .unwrap();
    queue
        .producer
        .send(&mut *first, &mut handle, &envelope("ship", "T1"))
        .await
        .unwrap();
    first.commit().await.unwrap();

    // A second send on the same conversation is in flight while T1 is handled
    let mut in_flight = queue.broker.begin().await.unwrap();
    queue
        .producer
        .send(&mut *in_flight, &mut handle, &envelope("ship", "T2"))
        .await
        .unwrap();

    let outcome = dispatcher.process_next(0).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Processed {
            type_tag: "ship".to_string(),
            session_closed: false,
        }
    );

    in_flight.commit().await.unwrap();
    let outcome = dispatcher.process_next(0).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Processed {
            type_tag: "ship".to_string(),
            session_closed: true,
        }
    );
    assert_eq!(handler.locators(), vec!["T1", "T2"]);
}

#[tokio::test]
async fn test_send_after_close_fails_instead_of_vanishing() {
    let queue = TestQueue::new();
    let dispatcher = queue.dispatcher(
        registry_with(&["ship"], RecordingHandler::new()),
        SessionClosePolicy::CloseWhenDrained,
        1,
    );

    let mut tx = queue.broker.begin().await.unwrap();
    let mut handle = queue
        .producer
        .acquire_send_handle(&mut *tx, QUEUE, SessionStrategy::time_boxed_seconds(60))
        .await
        .unwrap();
    queue
        .producer
        .send(&mut *tx, &mut handle, &envelope("ship", "T1"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let outcome = dispatcher.process_next(0).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Processed {
            session_closed: true,
            ..
        }
    ));

    let mut late = queue.broker.begin().await.unwrap();
    let err = queue
        .producer
        .send(&mut *late, &mut handle, &envelope("ship", "T2"))
        .await
        .unwrap_err();
    match err {
        TaskerError::TransportUnavailable { source, .. } => {
            assert!(matches!(
                source,
                TransportError::DialogClosed {
                    state: EndpointState::Ending,
                    ..
                }
            ));
        }
        other => panic!("unexpected error {other:?}"),
    }
    late.rollback().await.unwrap();
    assert_eq!(queue.broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn test_send_racing_a_drained_close_is_rejected() {
    let queue = TestQueue::new();

    let mut tx = queue.broker.begin().await.unwrap();
    let mut handle = queue
        .producer
        .acquire_send_handle(&mut *tx, QUEUE, SessionStrategy::time_boxed_seconds(60))
        .await
        .unwrap();
    queue
        .producer
        .send(&mut *tx, &mut handle, &envelope("ship", "T1"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // Worker has drained the conversation and is about to close it
    let mut worker = queue.broker.begin().await.unwrap();
    let message = worker
        .receive(QUEUE, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.pending_messages(message.handle).await.unwrap(), 0);

    let producer = queue.producer.clone();
    let broker = queue.broker.clone();
    let racing = tokio::spawn(async move {
        let mut tx = broker.begin().await.unwrap();
        let result = producer
            .send(&mut *tx, &mut handle, &envelope("ship", "T2"))
            .await;
        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| TaskerError::transport("commit", e)),
            Err(err) => {
                tx.rollback().await.unwrap();
                Err(err)
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!racing.is_finished(), "send must wait for the conversation lock");

    worker
        .close(message.handle, tasker_session_queue::transport::CloseMode::Graceful)
        .await
        .unwrap();
    worker.commit().await.unwrap();

    let err = racing.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        TaskerError::TransportUnavailable {
            source: TransportError::DialogClosed { .. },
            ..
        }
    ));

    let replies = queue.reply_dispatcher();
    drain(&replies).await;
    assert_eq!(queue.broker.queue_depth(QUEUE), 0);
    assert!(queue.broker.open_endpoints().is_empty());
}

#[tokio::test]
async fn test_disabled_dispatcher_starts_no_workers() {
    let queue = TestQueue::new();
    let mut config = dispatcher_config(3);
    config.enabled = false;
    let dispatcher = Arc::new(tasker_session_queue::dispatch::Dispatcher::new(
        Arc::new(queue.broker.clone()),
        Arc::new(registry_with(&["ship"], RecordingHandler::new())),
        QUEUE,
        SessionClosePolicy::CloseWhenDrained,
        config,
    ));
    dispatcher.start();
    assert_eq!(dispatcher.active_workers(), 0);
    dispatcher.shutdown().await;
}
