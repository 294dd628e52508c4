/// Work queue for step continuations
///
/// Items are pushed onto an unbounded channel and handed to a worker task,
/// which spawns one task per item under a semaphore. `wait_idle` resolves once
/// every enqueued item has been fully processed, including items enqueued by
/// the handlers themselves.

use anyhow::Result;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex, Notify, Semaphore},
    task::JoinHandle,
};

pub struct WorkQueue<T> {
    sender: mpsc::UnboundedSender<T>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    concurrency: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            concurrency: concurrency.max(1),
            worker: Mutex::new(None),
        }
    }

    /// Queue an item; items enqueued before `start` are held until it runs
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(item).is_err() {
            self.release();
            anyhow::bail!("work queue is closed");
        }
        Ok(())
    }

    /// Queue an item once `delay` has elapsed; it counts as pending meanwhile
    pub fn enqueue_after(&self, item: T, delay: Duration) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sender = self.sender.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(item).is_err() && in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Spawn the worker loop; calling it twice is a no-op
    pub async fn start<F, Fut>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            tracing::warn!("⚠️ Work queue already started");
            return;
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);

        let worker = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let task = tokio::spawn(handler(item));
                let in_flight = Arc::clone(&in_flight);
                let idle = Arc::clone(&idle);
                tokio::spawn(async move {
                    if let Err(e) = task.await {
                        tracing::error!("❌ Work item handler aborted: {}", e);
                    }
                    drop(permit);
                    if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        idle.notify_waiters();
                    }
                });
            }
            tracing::debug!("🛑 Work queue worker stopped");
        });

        *self.worker.lock().await = Some(worker);
    }

    /// Items enqueued and not yet finished
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work from the channel; tasks already spawned finish on their own
    pub async fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}
