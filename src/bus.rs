//! Communication bus: directed, point-to-point handoffs between streams.
//!
//! Messages carry descriptions of produced interfaces/contracts, not raw
//! artifact content, and only flow at phase boundaries: a send is rejected
//! while any sender-side task of the trigger phase is incomplete.

use crate::error::{OrchestratorError, Result};
use crate::model::{Message, MessageId};
use crate::store::TaskStore;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

pub struct CommunicationBus {
    store: Arc<TaskStore>,
    /// All messages ever sent, by id. Retained after delivery for
    /// retry/audit via `get_message`.
    messages: DashMap<MessageId, Message>,
    /// Per-recipient delivery order.
    inbox: DashMap<String, Vec<MessageId>>,
    /// Wakes receivers parked in `wait_for_message`.
    arrivals: DashMap<String, Arc<Notify>>,
}

impl CommunicationBus {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self {
            store,
            messages: DashMap::new(),
            inbox: DashMap::new(),
            arrivals: DashMap::new(),
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        self.arrivals
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Send a handoff. Fails with `PrematureSend` if any `from_stream` task
    /// at `trigger_phase` is not completed.
    pub fn send(
        &self,
        from_stream: &str,
        to_stream: &str,
        trigger_phase: u32,
        payload: Value,
    ) -> Result<MessageId> {
        if let Some(incomplete) = self
            .store
            .incomplete_in_stream_phase(from_stream, trigger_phase)
        {
            return Err(OrchestratorError::PrematureSend {
                from_stream: from_stream.to_string(),
                trigger_phase,
                incomplete_task: incomplete,
            });
        }

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            from_stream: from_stream.to_string(),
            to_stream: to_stream.to_string(),
            trigger_phase,
            payload,
            delivered: false,
            sent_at: chrono::Utc::now().naive_utc(),
        };
        let id = message.id.clone();
        info!(
            "Message {} sent {} -> {} (trigger phase {})",
            id, from_stream, to_stream, trigger_phase
        );
        self.messages.insert(id.clone(), message);
        self.inbox
            .entry(to_stream.to_string())
            .or_default()
            .push(id.clone());
        self.notifier(to_stream).notify_waiters();
        Ok(id)
    }

    /// Drain undelivered messages addressed to `stream`, marking each as
    /// delivered (at-most-once to the caller). Payloads stay retrievable by
    /// id afterwards.
    pub fn receive(&self, stream: &str) -> Vec<Message> {
        let ids: Vec<MessageId> = self
            .inbox
            .get(stream)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut delivered = Vec::new();
        for id in ids {
            if let Some(mut entry) = self.messages.get_mut(&id) {
                if entry.delivered {
                    continue;
                }
                entry.delivered = true;
                delivered.push(entry.clone());
            }
        }
        if !delivered.is_empty() {
            debug!("Delivered {} message(s) to {}", delivered.len(), stream);
        }
        delivered
    }

    /// Deliver only the oldest matching undelivered message, if any.
    fn take_next(&self, stream: &str, from: &str) -> Option<Message> {
        let ids: Vec<MessageId> = self
            .inbox
            .get(stream)
            .map(|v| v.clone())
            .unwrap_or_default();
        for id in ids {
            if let Some(mut entry) = self.messages.get_mut(&id) {
                if entry.delivered || entry.from_stream != from {
                    continue;
                }
                entry.delivered = true;
                return Some(entry.clone());
            }
        }
        None
    }

    /// Audit/retry lookup: messages are never deleted.
    pub fn get_message(&self, id: &str) -> Result<Message> {
        self.messages
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| OrchestratorError::MessageNotFound {
                message_id: id.to_string(),
            })
    }

    /// Block until a message from `from_stream` arrives for `stream`.
    ///
    /// This is the one true blocking wait in the system: an application-level
    /// dependency layered on top of the phase barrier. It is always bounded
    /// by `timeout`, failing with `MessageTimeout` on expiry.
    pub async fn wait_for_message(
        &self,
        stream: &str,
        from_stream: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.notifier(stream);
        loop {
            // Arm the waiter before checking, so an arrival between the
            // check and the await still wakes us.
            let notified = notify.notified();
            if let Some(message) = self.take_next(stream, from_stream) {
                return Ok(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(OrchestratorError::MessageTimeout {
                    stream: stream.to_string(),
                    from_stream: from_stream.to_string(),
                    timeout,
                });
            }
        }
    }
}
