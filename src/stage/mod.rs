//! Stages
//!
//! A stage is a named set of worker tasks, each draining its own bounded
//! queue. Events are routed by an ordering key: events with the same key
//! land on the same worker and are handled in the order they were added.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Processes the events of one stage
#[async_trait]
pub trait EventHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, event: T) -> Result<()>;
}

/// Cloneable handle for adding events to a stage
pub struct StageSink<T> {
    name: Arc<str>,
    queues: Arc<[mpsc::Sender<T>]>,
}

impl<T> Clone for StageSink<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<T: Send + 'static> StageSink<T> {
    fn queue_for<K: Hash + ?Sized>(&self, key: &K) -> &mpsc::Sender<T> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.queues.len() as u64) as usize;
        &self.queues[index]
    }

    /// Queue `event` behind every earlier event with the same key
    pub async fn add<K: Hash + ?Sized>(&self, key: &K, event: T) -> Result<()> {
        self.queue_for(key)
            .send(event)
            .await
            .map_err(|_| Error::StageClosed(self.name.to_string()))
    }
}

/// A running stage
pub struct Stage<T> {
    sink: StageSink<T>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Stage<T> {
    /// Spawn `workers` tasks (at least one), each with a queue of `queue_size`
    pub fn start<H>(name: &str, workers: usize, queue_size: usize, handler: Arc<H>) -> Self
    where
        H: EventHandler<T>,
    {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (sender, receiver) = mpsc::channel(queue_size.max(1));
            queues.push(sender);
            handles.push(tokio::spawn(Self::worker_task(
                name.to_string(),
                index,
                Arc::clone(&handler),
                receiver,
            )));
        }

        tracing::debug!(stage = name, workers, queue_size, "Stage started");

        Self {
            sink: StageSink {
                name: Arc::from(name),
                queues: queues.into(),
            },
            workers: handles,
        }
    }

    pub fn sink(&self) -> StageSink<T> {
        self.sink.clone()
    }

    /// Stop accepting events and wait for queued ones to drain.
    /// Sinks cloned from this stage must be dropped for the workers to exit.
    pub async fn shutdown(self) {
        let Stage { sink, workers } = self;
        let name = sink.name.to_string();
        drop(sink);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(stage = %name, "Stage worker failed: {}", e);
            }
        }
        tracing::debug!(stage = %name, "Stage stopped");
    }

    async fn worker_task<H: EventHandler<T>>(
        name: String,
        index: usize,
        handler: Arc<H>,
        mut receiver: mpsc::Receiver<T>,
    ) {
        while let Some(event) = receiver.recv().await {
            match handler.handle(event).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(stage = %name, worker = index, "Event handling failed, may recover: {}", e);
                }
                Err(e) => {
                    tracing::error!(stage = %name, worker = index, "Event handling failed: {}", e);
                }
            }
        }
    }
}
