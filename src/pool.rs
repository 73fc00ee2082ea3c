//! Bounded worker pool.
//!
//! A fixed number of workers drain one FIFO queue, so at most `size` tasks
//! run concurrently and tasks are picked up in submission order. Exactly
//! one of `on_finish`/`on_error` fires per task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;

/// A unit of work owned by the pool for its whole lifetime.
#[async_trait]
pub trait Task: Send + 'static {
    async fn run(&mut self, cancel: CancellationToken) -> Result<(), Error>;

    /// Called after `run` returned Ok.
    fn on_finish(&mut self) {}

    /// Called after `run` returned an error.
    fn on_error(&mut self, _err: Error) {}
}

pub struct WorkerPool {
    queue: mpsc::Sender<Box<dyn Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing one queue. The cancellation token is
    /// handed down to every task.
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        let (queue, receiver) = mpsc::channel::<Box<dyn Task>>(size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker| {
                let receiver = receiver.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(mut task) = next else {
                            debug!(worker, "queue closed, worker exiting");
                            break;
                        };
                        match task.run(cancel.child_token()).await {
                            Ok(()) => task.on_finish(),
                            Err(err) => task.on_error(err),
                        }
                    }
                })
            })
            .collect();

        Self { queue, workers }
    }

    /// Enqueue a task; blocks while the queue is full.
    pub async fn add(&self, task: Box<dyn Task>) -> Result<(), Error> {
        self.queue
            .send(task)
            .await
            .map_err(|_| Error::WorkerPoolStopped)
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}
