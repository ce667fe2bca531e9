//! Work items: tagged envelopes dispatched to registered handlers with
//! progress reporting over the message bus.
//!
//! The envelope's `type_name` is a stable string, so producers and consumers
//! can evolve their in-process types independently of the wire format.

use crate::queue_job::{QueueEntryContext, QueueEntryProcessor};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use plinth_core::error::{Error, Result};
use plinth_core::serializer::Serializer;
use plinth_messaging::{Message, MessageBus, MessageBusExt};
use plinth_queues::{EnqueueOptions, Queue};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Queue payload wrapping a typed work item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItemEnvelope {
    #[serde(rename = "type")]
    pub type_name: String,
    pub correlation_id: Option<String>,
    pub send_progress_reports: bool,
    /// Serializer-encoded payload
    pub data: Vec<u8>,
}

/// Progress message published on the bus while a work item runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItemStatus {
    pub work_item_id: String,
    pub type_name: String,
    /// 0..=100
    pub progress: u8,
    pub message: Option<String>,
}

impl Message for WorkItemStatus {
    fn message_type() -> &'static str {
        "work-item-status"
    }
}

/// A typed payload that can travel as a work item
pub trait WorkItemPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name used to resolve the handler
    fn type_name() -> &'static str;
}

/// Context handed to work item handlers
#[derive(Clone)]
pub struct WorkItemContext {
    work_item_id: String,
    type_name: String,
    correlation_id: Option<String>,
    send_progress_reports: bool,
    bus: Arc<dyn MessageBus>,
    cancellation: CancellationToken,
    completion_published: Arc<AtomicBool>,
}

impl WorkItemContext {
    pub fn work_item_id(&self) -> &str {
        &self.work_item_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Publish a progress report; no-op unless the envelope asked for them.
    /// The 100% completion report is published at most once.
    pub async fn report_progress(&self, progress: u8, message: Option<String>) -> Result<()> {
        if !self.send_progress_reports {
            return Ok(());
        }

        let progress = progress.min(100);
        if progress == 100 && self.completion_published.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.bus
            .publish(WorkItemStatus {
                work_item_id: self.work_item_id.clone(),
                type_name: self.type_name.clone(),
                progress,
                message,
            })
            .await
    }
}

type WorkItemHandlerFn =
    Arc<dyn Fn(WorkItemContext, Vec<u8>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registry mapping work item type names to their handlers
pub struct WorkItemHandlers {
    handlers: DashMap<String, WorkItemHandlerFn>,
    serializer: Serializer,
}

impl WorkItemHandlers {
    pub fn new(serializer: Serializer) -> Self {
        Self {
            handlers: DashMap::new(),
            serializer,
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Register a typed handler for `T::type_name()`
    pub fn register<T, F, Fut>(&self, handler: F)
    where
        T: WorkItemPayload,
        F: Fn(T, WorkItemContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let serializer = self.serializer;
        let boxed: WorkItemHandlerFn = Arc::new(move |context, data| {
            match serializer.deserialize::<T>(&data) {
                Ok(payload) => handler(payload, context).boxed(),
                Err(error) => futures::future::ready(Err(error)).boxed(),
            }
        });
        self.handlers.insert(T::type_name().to_string(), boxed);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    fn get(&self, type_name: &str) -> Option<WorkItemHandlerFn> {
        self.handlers.get(type_name).map(|h| h.clone())
    }
}

/// Queue-entry processor resolving envelopes against a handler registry
pub struct WorkItemJob {
    handlers: Arc<WorkItemHandlers>,
    bus: Arc<dyn MessageBus>,
}

impl WorkItemJob {
    pub fn new(handlers: Arc<WorkItemHandlers>, bus: Arc<dyn MessageBus>) -> Self {
        Self { handlers, bus }
    }
}

#[async_trait]
impl QueueEntryProcessor for WorkItemJob {
    type Payload = WorkItemEnvelope;

    async fn process(&self, context: &QueueEntryContext<WorkItemEnvelope>) -> Result<()> {
        let entry = context.entry();
        let envelope = entry.value();

        let handler = self.handlers.get(&envelope.type_name).ok_or_else(|| {
            Error::handler(format!(
                "no handler registered for work item type '{}'",
                envelope.type_name
            ))
        })?;

        let work_context = WorkItemContext {
            work_item_id: entry.id().to_string(),
            type_name: envelope.type_name.clone(),
            correlation_id: envelope.correlation_id.clone(),
            send_progress_reports: envelope.send_progress_reports,
            bus: self.bus.clone(),
            cancellation: context.cancellation().clone(),
            completion_published: Arc::new(AtomicBool::new(false)),
        };

        handler(work_context.clone(), envelope.data.clone()).await?;

        // Completion report; the shared flag keeps it to exactly one even if
        // the handler already reported 100%.
        work_context.report_progress(100, None).await?;
        Ok(())
    }
}

/// Build and enqueue a work item envelope
pub async fn enqueue_work_item<T: WorkItemPayload>(
    queue: &dyn Queue<WorkItemEnvelope>,
    serializer: Serializer,
    payload: &T,
    send_progress_reports: bool,
) -> Result<String> {
    enqueue_work_item_with_options(
        queue,
        serializer,
        payload,
        send_progress_reports,
        EnqueueOptions::default(),
    )
    .await
}

/// Build and enqueue a work item envelope with queue options; the enqueue
/// option's correlation id is copied into the envelope.
pub async fn enqueue_work_item_with_options<T: WorkItemPayload>(
    queue: &dyn Queue<WorkItemEnvelope>,
    serializer: Serializer,
    payload: &T,
    send_progress_reports: bool,
    options: EnqueueOptions,
) -> Result<String> {
    let envelope = WorkItemEnvelope {
        type_name: T::type_name().to_string(),
        correlation_id: options.correlation_id.clone(),
        send_progress_reports,
        data: serializer.serialize(payload)?,
    };
    queue.enqueue_with_options(envelope, options).await
}
