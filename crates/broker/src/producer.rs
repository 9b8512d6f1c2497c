use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use sable_metrics::BrokerStats;
use sable_protocol::{CompressionType, LogicalMessage, MessageId};
use sable_storage::{Log, SubscriptionName, Topic};

use crate::BrokerError;
use crate::batch::{BatchContainer, FlushedBatch};
use crate::config::BatchConfig;
use crate::subscription::Subscription;

type Reply = oneshot::Sender<Result<MessageId, BrokerError>>;

pub(crate) enum ProducerCommand {
    Send {
        message: LogicalMessage,
        reply: Reply,
    },
    Flush {
        done: oneshot::Sender<Result<(), BrokerError>>,
    },
}

/// Publishing side of a topic. Messages are batched by a background task
/// and written in the order they were sent.
#[derive(Debug)]
pub struct Producer {
    topic: Topic,
    tx: mpsc::Sender<ProducerCommand>,
}

impl Producer {
    pub(crate) fn new(topic: Topic, tx: mpsc::Sender<ProducerCommand>) -> Self {
        Self { topic, tx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send and wait until the message is persisted. Waits for queue space
    /// instead of failing when too many sends are pending.
    pub async fn send(&self, message: LogicalMessage) -> Result<MessageId, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProducerCommand::Send { message, reply })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;
        rx.await.map_err(|_| BrokerError::ChannelClosed)?
    }

    /// Queue a message and return right away. The future resolves once the
    /// batch holding it is persisted.
    pub fn send_async(&self, message: LogicalMessage) -> SendFuture {
        let (reply, rx) = oneshot::channel();
        let state = match self.tx.try_send(ProducerCommand::Send { message, reply }) {
            Ok(()) => SendState::Pending(rx),
            Err(TrySendError::Full(_)) => SendState::Failed(Some(BrokerError::ProducerQueueFull)),
            Err(TrySendError::Closed(_)) => SendState::Failed(Some(BrokerError::ChannelClosed)),
        };
        SendFuture { state }
    }

    /// Persist everything queued so far.
    pub async fn flush(&self) -> Result<(), BrokerError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(ProducerCommand::Flush { done })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;
        rx.await.map_err(|_| BrokerError::ChannelClosed)?
    }

    pub async fn close(self) -> Result<(), BrokerError> {
        self.flush().await
    }
}

enum SendState {
    Pending(oneshot::Receiver<Result<MessageId, BrokerError>>),
    Failed(Option<BrokerError>),
}

/// Completion of one [`Producer::send_async`].
pub struct SendFuture {
    state: SendState,
}

impl Future for SendFuture {
    type Output = Result<MessageId, BrokerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            SendState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.map_err(|_| BrokerError::ChannelClosed).and_then(|r| r)),
            SendState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(BrokerError::ChannelClosed)))
            }
        }
    }
}

impl std::fmt::Debug for SendFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            SendState::Pending(_) => "pending",
            SendState::Failed(_) => "failed",
        };
        f.debug_struct("SendFuture").field("state", &state).finish()
    }
}

/// Writes flushed batches for one producer.
pub(crate) struct BatchWriter {
    pub topic: Topic,
    pub log: Arc<dyn Log>,
    pub stats: Arc<BrokerStats>,
    pub subscriptions: Arc<DashMap<(Topic, SubscriptionName), Arc<Subscription>>>,
    pub compression: CompressionType,
}

impl BatchWriter {
    async fn write(&self, batches: Vec<FlushedBatch<Reply>>) -> Result<(), BrokerError> {
        let mut result = Ok(());
        for batch in batches {
            if let Err(err) = self.append(batch).await {
                result = Err(err);
            }
        }
        result
    }

    async fn append(&self, batch: FlushedBatch<Reply>) -> Result<(), BrokerError> {
        let batch_size = batch.batch_size();
        let appended = match batch.encode(self.compression) {
            Ok(encoded) => self
                .log
                .append(&self.topic, &encoded)
                .await
                .map(|position| (position, encoded.len()))
                .map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };

        match appended {
            Ok((position, bytes)) => {
                for (i, reply) in batch.tokens.into_iter().enumerate() {
                    let _ = reply.send(Ok(MessageId::new(position, i as u32, batch_size)));
                }
                self.stats.publish_batch(batch_size as usize, bytes);

                for entry in self.subscriptions.iter() {
                    let ((t, _), sub) = entry.pair();
                    if t == &self.topic {
                        sub.wake();
                    }
                }
                Ok(())
            }
            Err(msg) => {
                tracing::error!(topic = %self.topic, batch_size, error = %msg, "batch append failed");
                for reply in batch.tokens {
                    let _ = reply.send(Err(BrokerError::AppendFailed(msg.clone())));
                }
                Err(BrokerError::AppendFailed(msg))
            }
        }
    }
}

pub(crate) async fn run_batcher(
    writer: BatchWriter,
    config: BatchConfig,
    mut rx: mpsc::Receiver<ProducerCommand>,
    shutdown: CancellationToken,
) {
    let mut container: BatchContainer<Reply> = BatchContainer::new(config);
    let mut timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            maybe = rx.recv() => {
                match maybe {
                    Some(ProducerCommand::Send { message, reply }) => {
                        match container.add(message, reply) {
                            Ok(flushed) => {
                                let flushed_any = !flushed.is_empty();
                                let _ = writer.write(flushed).await;
                                // re-arm when the batch was cut, arm on first message
                                if flushed_any || timer.is_none() {
                                    timer = container
                                        .deadline()
                                        .map(|at| Box::pin(tokio::time::sleep_until(at)));
                                }
                            }
                            Err(oversize) => {
                                tracing::warn!(
                                    topic = %writer.topic,
                                    size = oversize.size,
                                    limit = oversize.limit,
                                    "rejecting oversize message"
                                );
                                writer.stats.oversize_rejected();
                                let _ = oversize.token.send(Err(BrokerError::OversizeMessage {
                                    size: oversize.size,
                                    limit: oversize.limit,
                                }));
                            }
                        }
                    }

                    Some(ProducerCommand::Flush { done }) => {
                        let res = writer.write(container.flush()).await;
                        timer = None;
                        let _ = done.send(res);
                    }

                    None => {
                        // producer dropped: flush remaining
                        let _ = writer.write(container.flush()).await;
                        break;
                    }
                }
            }

            _ = async {
                if let Some(t) = timer.as_mut() {
                    t.as_mut().await;
                }
            }, if timer.is_some() => {
                let _ = writer.write(container.flush()).await;
                timer = None;
            }
        }
    }

    for batch in container.flush() {
        for reply in batch.tokens {
            let _ = reply.send(Err(BrokerError::Shutdown));
        }
    }
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            ProducerCommand::Send { reply, .. } => {
                let _ = reply.send(Err(BrokerError::Shutdown));
            }
            ProducerCommand::Flush { done } => {
                let _ = done.send(Err(BrokerError::Shutdown));
            }
        }
    }
    tracing::debug!(topic = %writer.topic, "batcher stopped");
}
