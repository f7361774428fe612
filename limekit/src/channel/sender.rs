//! The send pipeline.
//!
//! All sends funnel through one batcher task, which is the single writer
//! to the transport. Envelopes accumulate into a batch that is flushed
//! when full or when the flush interval elapses since the first queued
//! envelope; a batch size of 1 flushes immediately. Batching is purely a
//! throughput concern: the transport still receives one envelope per
//! `send` call, in order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::ChannelError;
use super::events::PipelineFailure;
use crate::envelope::Envelope;
use crate::transport::Transport;

/// Parameters of the batcher task.
#[derive(Debug, Clone)]
pub(crate) struct BatcherConfig {
    pub(crate) batch_size: usize,
    pub(crate) flush_interval: std::time::Duration,
    pub(crate) queue_capacity: usize,
}

/// One envelope queued for the wire, with an optional completion the
/// caller awaits.
pub(crate) struct SendItem {
    envelope: Envelope,
    completion: Option<oneshot::Sender<Result<(), ChannelError>>>,
}

/// Cloneable producer side of the send pipeline.
///
/// Callers go through [`SenderHandle::send`]; built-in modules enqueue
/// fire-and-forget replies through [`SenderHandle::send_detached`].
#[derive(Clone)]
pub(crate) struct SenderHandle {
    tx: mpsc::Sender<SendItem>,
}

impl SenderHandle {
    /// Enqueues an envelope and awaits its handoff to the wire.
    pub(crate) async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let (completion_tx, completion_rx) = oneshot::channel();
        self.tx
            .send(SendItem {
                envelope,
                completion: Some(completion_tx),
            })
            .await
            .map_err(|_| ChannelError::Closed)?;
        completion_rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Enqueues an envelope without awaiting wire handoff.
    pub(crate) async fn send_detached(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.tx
            .send(SendItem {
                envelope,
                completion: None,
            })
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

/// Spawns the batcher task; the returned handle feeds it.
pub(crate) fn spawn_batcher<T: Transport>(
    transport: Arc<T>,
    config: BatcherConfig,
    shutdown: CancellationToken,
    failures: mpsc::UnboundedSender<PipelineFailure>,
) -> (SenderHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let task = tokio::spawn(run_batcher(transport, config, rx, shutdown, failures));
    (SenderHandle { tx }, task)
}

async fn run_batcher<T: Transport>(
    transport: Arc<T>,
    config: BatcherConfig,
    mut rx: mpsc::Receiver<SendItem>,
    shutdown: CancellationToken,
    failures: mpsc::UnboundedSender<PipelineFailure>,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<SendItem> = Vec::with_capacity(batch_size);
    let mut flush_deadline: Option<Instant> = None;

    debug!(batch_size, "Send batcher started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            item = rx.recv() => {
                let Some(item) = item else { break };
                batch.push(item);

                if batch.len() >= batch_size {
                    flush_deadline = None;
                    if flush_batch(&transport, &mut batch, &shutdown, &failures)
                        .await
                        .is_err()
                    {
                        break;
                    }
                } else if flush_deadline.is_none() {
                    flush_deadline = Some(Instant::now() + config.flush_interval);
                }
            }

            _ = async { tokio::time::sleep_until(flush_deadline.unwrap()).await },
                if flush_deadline.is_some() =>
            {
                flush_deadline = None;
                if flush_batch(&transport, &mut batch, &shutdown, &failures)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    // Anything still queued resolves as closed.
    for item in batch.drain(..) {
        complete(item, Err(ChannelError::Closed));
    }
    while let Ok(item) = rx.try_recv() {
        complete(item, Err(ChannelError::Closed));
    }
    debug!("Send batcher stopped");
}

/// Writes the batch to the transport, one envelope per `send`, in order.
///
/// Returns `Err` when the batcher must stop (transport failure or
/// shutdown mid-flush).
async fn flush_batch<T: Transport>(
    transport: &Arc<T>,
    batch: &mut Vec<SendItem>,
    shutdown: &CancellationToken,
    failures: &mpsc::UnboundedSender<PipelineFailure>,
) -> Result<(), ()> {
    let mut items = batch.drain(..);

    while let Some(SendItem {
        envelope,
        completion,
    }) = items.next()
    {
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                if let Some(completion) = completion {
                    let _ = completion.send(Err(ChannelError::Canceled));
                }
                for rest in items {
                    complete(rest, Err(ChannelError::Closed));
                }
                return Err(());
            }
            sent = transport.send(envelope) => sent,
        };

        match sent {
            Ok(()) => {
                if let Some(completion) = completion {
                    let _ = completion.send(Ok(()));
                }
            }
            Err(err) => {
                warn!(error = %err, "Transport send failed; closing channel");
                let _ = failures.send(PipelineFailure::sender(ChannelError::Transport(
                    err.clone(),
                )));
                if let Some(completion) = completion {
                    let _ = completion.send(Err(ChannelError::Transport(err)));
                }
                for rest in items {
                    complete(rest, Err(ChannelError::Closed));
                }
                return Err(());
            }
        }
    }
    Ok(())
}

fn complete(item: SendItem, result: Result<(), ChannelError>) {
    if let Some(completion) = item.completion {
        let _ = completion.send(result);
    }
}
