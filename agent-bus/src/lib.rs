use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

pub mod backends;
pub mod message;

pub use backends::{BusBackend, FileBackend, MemoryBackend};
pub use message::{Message, MessagePayload, TaskResultStatus};

pub type BusResult<T> = Result<T, BusError>;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("message serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl BusError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Agent Bus - typed message passing between agents.
///
/// Delivery is at-least-once to the addressed agent; ordering is FIFO per
/// `(from, to)` pair with no global guarantee. `poll` long-polls until a
/// batch is available or the timeout elapses.
#[derive(Debug, Clone)]
pub struct AgentBus {
    backend: Arc<dyn BusBackend>,
    notifiers: Arc<DashMap<String, Arc<Notify>>>,
}

impl AgentBus {
    pub fn new(backend: Arc<dyn BusBackend>) -> Self {
        Self {
            backend,
            notifiers: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn send(&self, message: Message) -> BusResult<()> {
        Self::validate(&message)?;
        let to = message.to.clone();
        debug!(from = %message.from, to = %to, kind = message.message_type(), "bus send");
        self.backend.enqueue(&message).await?;
        self.notifier(&to).notify_waiters();
        Ok(())
    }

    /// Blocks until at least one message for `agent_id` is available or the
    /// timeout elapses; returns the batch in FIFO send order. A timeout
    /// yields an empty batch, not an error.
    pub async fn poll(&self, agent_id: &str, timeout: Duration) -> BusResult<Vec<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.notifier(agent_id);

        loop {
            // Register interest before draining so a send racing the drain
            // still wakes this waiter.
            let notified = notify.notified();

            let batch = self.backend.drain(agent_id).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                // Final drain covers a send that landed after the timeout
                // fired but before we returned.
                return self.backend.drain(agent_id).await;
            }
        }
    }

    fn notifier(&self, agent_id: &str) -> Arc<Notify> {
        self.notifiers
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn validate(message: &Message) -> BusResult<()> {
        if message.id.trim().is_empty() {
            return Err(BusError::InvalidMessage("id must be non-empty".to_string()));
        }
        if message.from.trim().is_empty() {
            return Err(BusError::InvalidMessage("from must be non-empty".to_string()));
        }
        if message.to.trim().is_empty() {
            return Err(BusError::InvalidMessage("to must be non-empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;

    fn statement(from: &str, to: &str, text: &str) -> Message {
        Message::new(
            from,
            to,
            MessagePayload::MeetingStatement {
                workflow_id: "wf-00000001".to_string(),
                meeting_id: "meeting-1".to_string(),
                statement: text.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn poll_returns_fifo_batch_per_sender() {
        let bus = AgentBus::in_memory();
        for i in 0..3 {
            bus.send(statement("alice", "engine", &format!("a{i}"))).await.unwrap();
        }
        bus.send(statement("bob", "engine", "b0")).await.unwrap();

        let batch = bus.poll("engine", Duration::from_millis(100)).await.unwrap();
        let texts: Vec<_> = batch
            .iter()
            .filter(|m| m.from == "alice")
            .map(|m| match &m.payload {
                MessagePayload::MeetingStatement { statement, .. } => statement.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["a0", "a1", "a2"]);
        assert_eq!(batch.len(), 4);
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let bus = AgentBus::in_memory();
        let batch = bus.poll("nobody", Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_on_late_send() {
        let bus = AgentBus::in_memory();
        let poller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.poll("engine", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.send(statement("alice", "engine", "late")).await.unwrap();

        let batch = poller.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn send_rejects_empty_addressing() {
        let bus = AgentBus::in_memory();
        let mut msg = statement("alice", "engine", "x");
        msg.to = String::new();
        let err = bus.send(msg).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn file_backend_keeps_per_pair_fifo_with_interleaved_senders() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = AgentBus::new(Arc::new(FileBackend::new(tmp.path()).unwrap()));

        for i in 0..3 {
            bus.send(statement("alice", "engine", &format!("a{i}"))).await.unwrap();
            bus.send(statement("bob", "engine", &format!("b{i}"))).await.unwrap();
        }

        let batch = bus.poll("engine", Duration::from_millis(100)).await.unwrap();
        let per_sender = |sender: &str| -> Vec<String> {
            batch
                .iter()
                .filter(|m| m.from == sender)
                .map(|m| match &m.payload {
                    MessagePayload::MeetingStatement { statement, .. } => statement.clone(),
                    other => panic!("unexpected payload {other:?}"),
                })
                .collect()
        };
        assert_eq!(per_sender("alice"), vec!["a0", "a1", "a2"]);
        assert_eq!(per_sender("bob"), vec!["b0", "b1", "b2"]);
    }

    #[tokio::test]
    async fn file_backed_bus_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = AgentBus::new(Arc::new(FileBackend::new(tmp.path()).unwrap()));
        bus.send(statement("alice", "engine", "persisted")).await.unwrap();

        let batch = bus.poll("engine", Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].from, "alice");
    }
}
