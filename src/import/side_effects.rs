//! Post-commit side effects.
//!
//! After a successful import the coordinator queues per-domain
//! notifications and, on request, a broadcast of the whole result. A single
//! background worker drains the queue, so slow sinks never delay the import
//! call itself. When the queue is full or closed the side effect is dropped
//! with a warning.

use crate::import::domain::DomainKey;
use crate::import::result::ImportResult;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink failed: {0}")]
    Failed(String),
}

/// Receives the identifiers written for one domain.
#[rocket::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, domain: DomainKey, identifiers: &[Value]) -> Result<(), SinkError>;
}

/// Receives the merged result of a whole import.
#[rocket::async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn broadcast(&self, result: &ImportResult) -> Result<(), SinkError>;
}

/// Notifier that only logs.
pub struct LogNotifier;

#[rocket::async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, domain: DomainKey, identifiers: &[Value]) -> Result<(), SinkError> {
        log::info!("imported {} {}", identifiers.len(), domain);
        Ok(())
    }
}

/// Fans results out to in-process subscribers.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<ImportResult>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportResult> {
        self.sender.subscribe()
    }
}

#[rocket::async_trait]
impl BroadcastSink for ChannelBroadcaster {
    async fn broadcast(&self, result: &ImportResult) -> Result<(), SinkError> {
        // No subscribers is not an error
        if self.sender.send(result.clone()).is_err() {
            log::debug!("broadcast skipped: no subscribers");
        }
        Ok(())
    }
}

#[derive(Debug)]
enum SideEffect {
    Notify {
        call_id: u64,
        domain: DomainKey,
        identifiers: Vec<Value>,
    },
    Broadcast {
        call_id: u64,
        result: ImportResult,
    },
}

/// Handle to the side effect worker.
#[derive(Clone)]
pub struct SideEffects {
    sender: Option<mpsc::Sender<SideEffect>>,
}

impl SideEffects {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn spawn(
        buffer: usize,
        notifier: Arc<dyn NotificationSink>,
        broadcaster: Arc<dyn BroadcastSink>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SideEffect>(buffer.max(1));

        tokio::spawn(async move {
            while let Some(effect) = receiver.recv().await {
                match effect {
                    SideEffect::Notify {
                        call_id,
                        domain,
                        identifiers,
                    } => {
                        if let Err(err) = notifier.notify(domain, &identifiers).await {
                            log::warn!("import {call_id}: notification for {domain} failed: {err}");
                        }
                    }
                    SideEffect::Broadcast { call_id, result } => {
                        if let Err(err) = broadcaster.broadcast(&result).await {
                            log::warn!("import {call_id}: broadcast failed: {err}");
                        }
                    }
                }
            }
            log::debug!("side effect worker stopped");
        });

        Self {
            sender: Some(sender),
        }
    }

    /// Side effects that are dropped without being queued.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Queue notifications for every non-empty domain of `result`, plus a
    /// broadcast when requested. Never blocks.
    pub fn dispatch(&self, call_id: u64, result: &ImportResult, broadcast: bool) {
        let Some(sender) = &self.sender else {
            return;
        };

        for (domain, identifiers) in result.iter() {
            if identifiers.is_empty() {
                continue;
            }
            enqueue(
                sender,
                call_id,
                SideEffect::Notify {
                    call_id,
                    domain,
                    identifiers: identifiers.to_vec(),
                },
            );
        }

        if broadcast {
            enqueue(
                sender,
                call_id,
                SideEffect::Broadcast {
                    call_id,
                    result: result.clone(),
                },
            );
        }
    }
}

fn enqueue(sender: &mpsc::Sender<SideEffect>, call_id: u64, effect: SideEffect) {
    match sender.try_send(effect) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(effect)) => {
            log::warn!("import {call_id}: side effect queue full, dropping {effect:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::warn!("import {call_id}: side effect worker gone, dropping side effect");
        }
    }
}
