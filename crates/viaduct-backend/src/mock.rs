// In-memory reference backend. Its behavior is the oracle the gateway tests
// pin against: strict in-order acknowledgements on the consume side,
// append-then-confirm on the produce side.
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use viaduct_wire::{Confirmation, Message};

use crate::{
    BackendError, BackendStatus, ConsumeHandler, ConsumerConfig, ProduceHandler, ProducerConfig,
    Result,
};

/// In-memory backend that allows one consumer or publisher at a time and
/// lets tests set the messages to be consumed or check the messages that
/// were produced.
///
/// The topic-map mutex is held for the whole session, which serialises
/// concurrent sessions against the same instance. That is adequate for a
/// test oracle and deliberately not how a production backend should behave.
///
/// ```
/// use viaduct_backend::MockBackend;
/// use viaduct_wire::Message;
///
/// let backend = MockBackend::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     backend
///         .set_topic("orders", vec![Message::new("a", &b"payload"[..])])
///         .await;
///     assert_eq!(backend.topic("orders").await.len(), 1);
/// });
/// ```
#[derive(Debug, Default)]
pub struct MockBackend {
    topics: Mutex<HashMap<String, Vec<Message>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all messages published to a given topic.
    pub async fn topic(&self, topic: &str) -> Vec<Message> {
        self.topics
            .lock()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Sets the messages to be consumed for a given topic.
    pub async fn set_topic(&self, topic: impl Into<String>, messages: Vec<Message>) {
        self.topics.lock().await.insert(topic.into(), messages);
    }
}

// The mock demands acknowledgements in delivery order. Confirmation N must
// name delivered message N, and a confirmation is only expected while a
// delivery is outstanding.
fn check_confirmation(
    messages: &[Message],
    sent: usize,
    acked: usize,
    confirm: &Confirmation,
) -> Result<()> {
    if acked == sent {
        return Err(BackendError::invalid_argument("no acknowledgement expected"));
    }
    if messages[acked].id != confirm.msg_id {
        return Err(BackendError::invalid_argument("wrong acknowledgement"));
    }
    Ok(())
}

#[async_trait]
impl ConsumeHandler for MockBackend {
    async fn handle_consume(
        &self,
        shutdown: CancellationToken,
        config: ConsumerConfig,
        deliveries: mpsc::Sender<Message>,
        mut confirmations: mpsc::Receiver<Confirmation>,
    ) -> Result<()> {
        // Held until the session ends so the snapshot below stays stable.
        let guard = self.topics.lock().await;
        let messages = match guard.get(&config.topic) {
            Some(messages) if !messages.is_empty() => messages.clone(),
            _ => return Ok(()),
        };

        // Invariant: 0 <= acked <= sent <= messages.len().
        let mut sent = 0usize;
        let mut acked = 0usize;

        loop {
            if sent < messages.len() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    res = deliveries.send(messages[sent].clone()) => {
                        if res.is_err() {
                            return Ok(());
                        }
                        sent += 1;
                    }
                    maybe = confirmations.recv() => {
                        let Some(confirm) = maybe else { return Ok(()) };
                        check_confirmation(&messages, sent, acked, &confirm)?;
                        acked += 1;
                        if acked == messages.len() {
                            return Ok(());
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    maybe = confirmations.recv() => {
                        let Some(confirm) = maybe else { return Ok(()) };
                        check_confirmation(&messages, sent, acked, &confirm)?;
                        acked += 1;
                        if acked == messages.len() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn status(&self) -> Result<BackendStatus> {
        unimplemented!("the in-memory backend does not report status")
    }
}

#[async_trait]
impl ProduceHandler for MockBackend {
    async fn handle_produce(
        &self,
        shutdown: CancellationToken,
        config: ProducerConfig,
        confirmations: mpsc::Sender<Confirmation>,
        mut messages: mpsc::Receiver<Message>,
    ) -> Result<()> {
        // Held until the session ends; appends land in the shared map
        // immediately, so a cancelled session keeps what it ingested.
        let mut guard = self.topics.lock().await;
        let stored = guard.entry(config.topic.clone()).or_default();

        // Unconfirmed messages, confirmed strictly in arrival order.
        let mut pending: VecDeque<Confirmation> = VecDeque::new();
        let mut receiving = true;

        loop {
            let next = pending.front().cloned();
            match next {
                None => {
                    if !receiving {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        maybe = messages.recv() => match maybe {
                            None => receiving = false,
                            Some(message) => {
                                pending.push_back(Confirmation::new(message.id.clone()));
                                stored.push(message);
                            }
                        }
                    }
                }
                Some(next) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        maybe = messages.recv(), if receiving => match maybe {
                            None => receiving = false,
                            Some(message) => {
                                pending.push_back(Confirmation::new(message.id.clone()));
                                stored.push(message);
                            }
                        },
                        res = confirmations.send(next) => match res {
                            Ok(()) => {
                                pending.pop_front();
                            }
                            // Nobody is reading confirmations any more; the
                            // appended messages stay committed.
                            Err(_) => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    async fn status(&self) -> Result<BackendStatus> {
        unimplemented!("the in-memory backend does not report status")
    }
}
