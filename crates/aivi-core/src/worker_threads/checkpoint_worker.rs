//! Checkpoint worker
//!
//! Flushes the knowledge store and conversation memory to durable storage on a
//! fixed interval, and early when either store signals a change.

use crate::conversation_memory::ConversationMemory;
use crate::knowledge::KnowledgeStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// What one flush pass achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub knowledge_written: usize,
    pub users_written: usize,
    pub errors: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// One pass over both stores. Errors are collected, not propagated, so one store
/// failing does not hold back the other.
pub async fn flush_all(knowledge: &KnowledgeStore, memory: &ConversationMemory) -> FlushReport {
    let mut report = FlushReport::default();

    match knowledge.persist().await {
        Ok(written) => report.knowledge_written = written,
        Err(e) => {
            error!("Knowledge checkpoint failed: {}", e);
            report.errors.push(e.to_string());
        }
    }
    match memory.checkpoint().await {
        Ok(written) => report.users_written = written,
        Err(e) => {
            error!("Conversation checkpoint failed: {}", e);
            report.errors.push(e.to_string());
        }
    }

    if report.knowledge_written > 0 || report.users_written > 0 {
        debug!(
            "Checkpoint wrote {} knowledge entries and {} users",
            report.knowledge_written, report.users_written
        );
    }
    report
}

pub struct CheckpointWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CheckpointWorker {
    pub fn spawn(knowledge: Arc<KnowledgeStore>, memory: Arc<ConversationMemory>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let knowledge_changed = knowledge.change_notifier();
        let memory_changed = memory.change_notifier();

        let handle = tokio::spawn(async move {
            info!("Checkpoint worker started (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = knowledge_changed.notified() => {}
                    _ = memory_changed.notified() => {}
                }
                flush_all(&knowledge, &memory).await;
            }
            info!("Checkpoint worker stopped");
        });

        Self { shutdown, handle }
    }

    /// Stops the loop and waits for an in-progress flush to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Checkpoint worker ended abnormally: {}", e);
        }
    }
}
