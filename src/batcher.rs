//! Request batching with a coalescing window.
//!
//! Delivery requests landing within `coalescing_window_ms` of each other are
//! flushed together; a request that brings the queue to `max_batch_size`
//! flushes immediately instead. Flushes group requests by file path, sort
//! each group by descending priority, and dispatch groups independently so a
//! failure in one group never affects another's results.
//!
//! The batcher task awaits each flush inline: only one flush is ever in
//! flight, and requests arriving during a flush sit in the channel until the
//! next cycle.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BatcherConfig;
use crate::models::{BatchRequest, Chunk, DeliveryResult};

/// Sends one file group's chunks and returns a result per chunk, in order.
#[async_trait]
pub trait BatchDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, file_path: &Path, chunks: &[Chunk]) -> Vec<DeliveryResult>;
}

enum BatcherCommand {
    Add {
        request: BatchRequest,
        reply: oneshot::Sender<Vec<DeliveryResult>>,
    },
    Flush,
    Shutdown,
}

#[derive(Clone)]
pub struct RequestBatcher {
    tx: mpsc::UnboundedSender<BatcherCommand>,
    queued: Arc<AtomicUsize>,
}

impl RequestBatcher {
    pub fn new(config: &BatcherConfig, dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn(batch_loop(
            rx,
            dispatcher,
            Duration::from_millis(config.coalescing_window_ms),
            config.max_batch_size.max(1),
            Arc::clone(&queued),
        ));
        Self { tx, queued }
    }

    /// Enqueue a request and wait for its batch to be flushed.
    ///
    /// Resolves to one [`DeliveryResult`] per chunk, in the request's chunk
    /// order. Fails when the batcher has shut down.
    pub async fn add_request(&self, request: BatchRequest) -> anyhow::Result<Vec<DeliveryResult>> {
        let (reply, rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(BatcherCommand::Add { request, reply })
            .is_err()
        {
            // Never reached the loop; undo the count so queue_size stays
            // honest after shutdown.
            self.queued.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("request batcher is shut down");
        }
        match rx.await {
            Ok(results) => Ok(results),
            Err(_) => {
                // The loop dropped the command without flushing or failing it.
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("request batcher dropped the request"))
            }
        }
    }

    /// Force-drain the current queue without waiting for the window.
    pub fn flush(&self) {
        let _ = self.tx.send(BatcherCommand::Flush);
    }

    /// Requests accepted but not yet flushed.
    pub fn queue_size(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Stop the batcher; all pending requests fail.
    pub fn shutdown(&self) {
        let _ = self.tx.send(BatcherCommand::Shutdown);
    }
}

type Pending = Vec<(BatchRequest, oneshot::Sender<Vec<DeliveryResult>>)>;

async fn batch_loop(
    mut rx: mpsc::UnboundedReceiver<BatcherCommand>,
    dispatcher: Arc<dyn BatchDispatcher>,
    window: Duration,
    max_batch_size: usize,
    queued: Arc<AtomicUsize>,
) {
    let mut pending: Pending = Vec::new();
    // Set when the first request lands in an empty queue; cleared on flush.
    let mut deadline: Option<Instant> = None;

    loop {
        let cmd = match deadline {
            Some(at) => {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                    _ = tokio::time::sleep_until(at) => {
                        flush_pending(&mut pending, &dispatcher, &queued).await;
                        deadline = None;
                        continue;
                    }
                }
            }
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            BatcherCommand::Add { request, reply } => {
                if pending.is_empty() {
                    deadline = Some(Instant::now() + window);
                }
                pending.push((request, reply));
                if pending.len() >= max_batch_size {
                    // Size threshold beats the window.
                    flush_pending(&mut pending, &dispatcher, &queued).await;
                    deadline = None;
                }
            }
            BatcherCommand::Flush => {
                flush_pending(&mut pending, &dispatcher, &queued).await;
                deadline = None;
            }
            BatcherCommand::Shutdown => {
                fail_pending(&mut pending, &queued);
                return;
            }
        }
    }

    // Channel closed: nothing more can arrive, fail whatever is left.
    fail_pending(&mut pending, &queued);
}

async fn flush_pending(
    pending: &mut Pending,
    dispatcher: &Arc<dyn BatchDispatcher>,
    queued: &Arc<AtomicUsize>,
) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    queued.fetch_sub(batch.len(), Ordering::SeqCst);
    debug!(requests = batch.len(), "flushing batch");

    // Group by file path, preserving arrival order within each group.
    let mut groups: HashMap<PathBuf, Pending> = HashMap::new();
    for (request, reply) in batch {
        groups
            .entry(request.file_path.clone())
            .or_default()
            .push((request, reply));
    }

    let futures: Vec<_> = groups
        .into_iter()
        .map(|(path, group)| dispatch_group(path, group, Arc::clone(dispatcher)))
        .collect();
    // Groups run independently; one group's failure cannot leak into another.
    for fut in futures {
        fut.await;
    }
}

async fn dispatch_group(path: PathBuf, mut group: Pending, dispatcher: Arc<dyn BatchDispatcher>) {
    // Higher priority dispatches first; stable sort keeps arrival order within
    // a priority level.
    group.sort_by(|a, b| b.0.priority.cmp(&a.0.priority));

    let chunks: Vec<Chunk> = group
        .iter()
        .flat_map(|(req, _)| req.chunks.iter().cloned())
        .collect();

    let mut results = dispatcher.dispatch(&path, &chunks).await;
    if results.len() != chunks.len() {
        warn!(
            path = %path.display(),
            expected = chunks.len(),
            got = results.len(),
            "dispatcher returned wrong result count, padding with failures"
        );
        results.resize_with(chunks.len(), || {
            DeliveryResult::failure("dispatcher returned no result for this chunk")
        });
    }

    let mut results = results.into_iter();
    for (request, reply) in group {
        let per_request: Vec<DeliveryResult> = results.by_ref().take(request.chunks.len()).collect();
        let _ = reply.send(per_request);
    }
}

fn fail_pending(pending: &mut Pending, queued: &Arc<AtomicUsize>) {
    let batch = std::mem::take(pending);
    queued.fetch_sub(batch.len(), Ordering::SeqCst);
    for (request, reply) in batch {
        let results = request
            .chunks
            .iter()
            .map(|_| DeliveryResult::failure("batcher shut down before flush"))
            .collect();
        let _ = reply.send(results);
    }
}
