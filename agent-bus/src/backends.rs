use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::message::Message;
use crate::{BusError, BusResult};

/// Storage behind the bus. Implementations keep FIFO order per destination;
/// the file backend additionally survives restarts.
#[async_trait]
pub trait BusBackend: Send + Sync + fmt::Debug {
    async fn enqueue(&self, message: &Message) -> BusResult<()>;

    /// Removes and returns every queued message for `agent_id`, oldest
    /// first. Delivery is at-least-once: a crash between read and removal
    /// re-delivers on the next drain.
    async fn drain(&self, agent_id: &str) -> BusResult<Vec<Message>>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    queues: DashMap<String, Mutex<VecDeque<Message>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusBackend for MemoryBackend {
    async fn enqueue(&self, message: &Message) -> BusResult<()> {
        self.queues
            .entry(message.to.clone())
            .or_default()
            .lock()
            .push_back(message.clone());
        Ok(())
    }

    async fn drain(&self, agent_id: &str) -> BusResult<Vec<Message>> {
        let Some(queue) = self.queues.get(agent_id) else {
            return Ok(Vec::new());
        };
        let drained = queue.lock().drain(..).collect();
        Ok(drained)
    }
}

/// One file per message under `<root>/<destination>/`, named by a
/// process-wide sequence so a directory listing sorts in send order.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    sequence: AtomicU64,
    dest_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> BusResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| BusError::io(&root, e))?;
        let backend = Self {
            root,
            sequence: AtomicU64::new(0),
            dest_locks: DashMap::new(),
        };
        backend.sequence.store(backend.scan_max_sequence()?, Ordering::SeqCst);
        Ok(backend)
    }

    fn scan_max_sequence(&self) -> BusResult<u64> {
        let mut max = 0;
        let entries = std::fs::read_dir(&self.root).map_err(|e| BusError::io(&self.root, e))?;
        for dest in entries.flatten() {
            if !dest.path().is_dir() {
                continue;
            }
            let files = std::fs::read_dir(dest.path()).map_err(|e| BusError::io(&dest.path(), e))?;
            for file in files.flatten() {
                let name = file.file_name().to_string_lossy().to_string();
                if let Some(seq) = name.split('-').next().and_then(|s| s.parse::<u64>().ok()) {
                    max = max.max(seq);
                }
            }
        }
        Ok(max)
    }

    fn dest_dir(&self, agent_id: &str) -> PathBuf {
        // Agent ids are caller-supplied; keep only filesystem-safe chars.
        let safe: String = agent_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn lock_for(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.dest_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl BusBackend for FileBackend {
    async fn enqueue(&self, message: &Message) -> BusResult<()> {
        let lock = self.lock_for(&message.to);
        let _guard = lock.lock().await;

        let dir = self.dest_dir(&message.to);
        std::fs::create_dir_all(&dir).map_err(|e| BusError::io(&dir, e))?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let path = dir.join(format!("{:020}-{}.json", seq, message.id));
        let json = serde_json::to_vec_pretty(message).map_err(BusError::Serde)?;
        std::fs::write(&path, json).map_err(|e| BusError::io(&path, e))?;
        debug!(to = %message.to, id = %message.id, "persisted bus message");
        Ok(())
    }

    async fn drain(&self, agent_id: &str) -> BusResult<Vec<Message>> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let dir = self.dest_dir(agent_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BusError::io(&dir, e)),
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();

        let mut messages = Vec::new();
        for path in paths {
            let bytes = std::fs::read(&path).map_err(|e| BusError::io(&path, e))?;
            match serde_json::from_slice::<Message>(&bytes) {
                Ok(message) => {
                    messages.push(message);
                    std::fs::remove_file(&path).map_err(|e| BusError::io(&path, e))?;
                }
                Err(e) => {
                    // Unreadable file stays for operator inspection; skip it.
                    warn!(path = %path.display(), error = %e, "skipping undecodable bus message");
                }
            }
        }
        Ok(messages)
    }
}
