//! Deferred messages to the engine itself.
//!
//! A timer never calls into session logic directly. When it fires it posts a
//! [`Deferred`] to the engine's inbox; the engine then takes the session lock,
//! checks the ticket is still current and re-validates state before acting.

use crate::live::clock::Clock;
use crate::live::registry::{SessionRegistry, TimerKind};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ShowQuestion { index: i32 },
    EndQuestion { index: i32 },
}

impl SessionCommand {
    pub fn kind(self) -> TimerKind {
        match self {
            SessionCommand::ShowQuestion { .. } => TimerKind::ShowQuestion,
            SessionCommand::EndQuestion { .. } => TimerKind::EndQuestion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferred {
    pub session_id: Uuid,
    pub command: SessionCommand,
    pub ticket: u64,
}

pub struct SessionScheduler {
    clock: Arc<dyn Clock>,
    registry: SessionRegistry,
    outbox: mpsc::UnboundedSender<Deferred>,
    next_ticket: AtomicU64,
}

impl SessionScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        registry: SessionRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<Deferred>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let scheduler = Self {
            clock,
            registry,
            outbox,
            next_ticket: AtomicU64::new(1),
        };
        (scheduler, inbox)
    }

    /// Posts `command` at `at`, replacing any pending timer of the same kind.
    /// Must be called while holding the session's lock.
    pub async fn schedule_at(&self, session_id: Uuid, command: SessionCommand, at: DateTime<Utc>) {
        let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let outbox = self.outbox.clone();
        let deferred = Deferred {
            session_id,
            command,
            ticket,
        };

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if outbox.send(deferred).is_err() {
                tracing::debug!("Engine inbox closed, dropping {:?}", deferred.command);
            }
        });

        self.registry
            .register_timer(session_id, command.kind(), ticket, task.abort_handle())
            .await;
        tracing::debug!(
            "Scheduled {:?} for session {} in {}ms (ticket {})",
            command,
            session_id,
            delay.as_millis(),
            ticket
        );
    }

    pub async fn schedule_after(&self, session_id: Uuid, command: SessionCommand, delay: Duration) {
        let at = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.schedule_at(session_id, command, at).await;
    }

    pub async fn cancel(&self, session_id: Uuid, kind: TimerKind) {
        if self.registry.cancel_timer(session_id, kind).await {
            tracing::debug!("Cancelled {:?} timer for session {}", kind, session_id);
        }
    }
}
