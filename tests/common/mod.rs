#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tasker_session_queue::config::{DispatcherConfig, QueueRoute};
use tasker_session_queue::constants::transport::MAX_MESSAGE_BODY_BYTES;
use tasker_session_queue::dispatch::{
    DispatchOutcome, Dispatcher, HandlerContext, HandlerError, SessionClosePolicy, TaskHandler,
    TaskHandlerRegistry,
};
use tasker_session_queue::messaging::{ClaimCheck, TaskEnvelope, TaskType};
use tasker_session_queue::session::{RouteTable, SessionLifecycleManager};
use tasker_session_queue::transport::{InMemoryBroker, SessionId};

pub const QUEUE: &str = "orders";

pub fn orders_route() -> QueueRoute {
    QueueRoute::new(QUEUE, "orders_producer", "orders_worker", "task_contract")
}

/// In-memory broker with one routed queue and a producer bound to it
pub struct TestQueue {
    pub broker: InMemoryBroker,
    pub route: QueueRoute,
    pub producer: Arc<SessionLifecycleManager>,
}

impl TestQueue {
    pub fn new() -> Self {
        let route = orders_route();
        let broker = InMemoryBroker::new();
        broker.ensure_route(&route);
        let producer = Arc::new(SessionLifecycleManager::new(
            Arc::new(broker.clone()),
            Arc::new(RouteTable::new([route.clone()])),
            false,
            MAX_MESSAGE_BODY_BYTES,
        ));
        Self {
            broker,
            route,
            producer,
        }
    }

    pub fn dispatcher(
        &self,
        registry: TaskHandlerRegistry,
        close_policy: SessionClosePolicy,
        workers: usize,
    ) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(self.broker.clone()),
            Arc::new(registry),
            QUEUE,
            close_policy,
            dispatcher_config(workers),
        ))
    }

    pub fn reply_dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::for_replies(
            Arc::new(self.broker.clone()),
            self.route.reply_queue(),
            dispatcher_config(1),
        ))
    }
}

pub fn dispatcher_config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        enabled: true,
        max_concurrent_workers: workers,
        receive_wait_ms: 20,
        error_backoff_ms: 10,
    }
}

pub fn envelope(type_tag: &str, locator: &str) -> TaskEnvelope {
    TaskEnvelope::for_tag(type_tag, ClaimCheck::new(locator)).unwrap()
}

/// One handler invocation as seen by [`RecordingHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub type_tag: String,
    pub locator: String,
    pub session_id: SessionId,
    pub worker_id: usize,
}

/// Records every envelope it handles; optionally fails the first attempts
/// for chosen locators
#[derive(Default)]
pub struct RecordingHandler {
    deliveries: Mutex<Vec<Delivery>>,
    fail_once: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_once(locators: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
            fail_once: Mutex::new(locators.iter().map(|l| l.to_string()).collect()),
        })
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn locators(&self) -> Vec<String> {
        self.deliveries.lock().iter().map(|d| d.locator.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().len()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(
        &self,
        envelope: &TaskEnvelope,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let locator = envelope.payload().locator.clone();
        {
            let mut fail_once = self.fail_once.lock();
            if let Some(pos) = fail_once.iter().position(|l| *l == locator) {
                fail_once.remove(pos);
                return Err(HandlerError::retry(format!("transient failure for {locator}")));
            }
        }
        self.deliveries.lock().push(Delivery {
            type_tag: envelope.type_tag().to_string(),
            locator,
            session_id: ctx.session_id,
            worker_id: ctx.worker_id,
        });
        Ok(())
    }
}

pub fn registry_with(type_tags: &[&str], handler: Arc<RecordingHandler>) -> TaskHandlerRegistry {
    let mut registry = TaskHandlerRegistry::new();
    for tag in type_tags {
        registry.register(TaskType::new(*tag).unwrap(), handler.clone());
    }
    registry
}

/// Run `process_next` on worker 0 until the queue reports idle
pub async fn drain(dispatcher: &Dispatcher) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::new();
    loop {
        match dispatcher.process_next(0).await {
            Ok(DispatchOutcome::Idle) => return outcomes,
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => panic!("unexpected dispatch error: {e}"),
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
