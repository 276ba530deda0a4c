//! Per-session locks and pending timer handles.
//!
//! Created once at engine startup and shared by the orchestrator and the
//! scheduler. Entries are created lazily and dropped when a session reaches a
//! terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ShowQuestion,
    EndQuestion,
}

struct PendingTimer {
    ticket: u64,
    handle: AbortHandle,
}

pub type SessionGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    locks: Arc<RwLock<HashMap<Uuid, Arc<Mutex<()>>>>>,
    timers: Arc<RwLock<HashMap<(Uuid, TimerKind), PendingTimer>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the critical section of `session_id`.
    pub async fn lock(&self, session_id: Uuid) -> SessionGuard {
        let existing = self.locks.read().await.get(&session_id).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => self
                .locks
                .write()
                .await
                .entry(session_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        };
        mutex.lock_owned().await
    }

    /// Registers a timer, aborting whatever was pending for the same kind.
    pub async fn register_timer(&self, session_id: Uuid, kind: TimerKind, ticket: u64, handle: AbortHandle) {
        let previous = self
            .timers
            .write()
            .await
            .insert((session_id, kind), PendingTimer { ticket, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
            tracing::debug!("Replaced pending {:?} timer for session {}", kind, session_id);
        }
    }

    /// Takes the timer out of the registry if `ticket` is still the current one.
    /// A stale ticket means the timer was superseded or cancelled.
    pub async fn claim_timer(&self, session_id: Uuid, kind: TimerKind, ticket: u64) -> bool {
        let mut timers = self.timers.write().await;
        match timers.get(&(session_id, kind)) {
            Some(pending) if pending.ticket == ticket => {
                timers.remove(&(session_id, kind));
                true
            }
            _ => false,
        }
    }

    pub async fn cancel_timer(&self, session_id: Uuid, kind: TimerKind) -> bool {
        match self.timers.write().await.remove(&(session_id, kind)) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self, session_id: Uuid) {
        self.cancel_timer(session_id, TimerKind::ShowQuestion).await;
        self.cancel_timer(session_id, TimerKind::EndQuestion).await;
    }

    pub async fn has_pending_timers(&self, session_id: Uuid) -> bool {
        let timers = self.timers.read().await;
        timers.contains_key(&(session_id, TimerKind::ShowQuestion))
            || timers.contains_key(&(session_id, TimerKind::EndQuestion))
    }

    /// Forgets a finished or cancelled session. Callers hold its lock.
    pub async fn release(&self, session_id: Uuid) {
        self.cancel_all(session_id).await;
        self.locks.write().await.remove(&session_id);
    }

    pub async fn tracked_sessions(&self) -> usize {
        self.locks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
    }

    #[tokio::test]
    async fn lock_serializes_same_session() {
        let registry = SessionRegistry::new();
        let session_id = Uuid::new_v4();

        let guard = registry.lock(session_id).await;
        let contender = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _g = registry.lock(session_id).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(registry.tracked_sessions().await, 1);
    }

    #[tokio::test]
    async fn replacing_a_timer_aborts_the_old_one() {
        let registry = SessionRegistry::new();
        let session_id = Uuid::new_v4();

        let first = sleeper();
        registry
            .register_timer(session_id, TimerKind::EndQuestion, 1, first.abort_handle())
            .await;
        let second = sleeper();
        registry
            .register_timer(session_id, TimerKind::EndQuestion, 2, second.abort_handle())
            .await;

        assert!(first.await.unwrap_err().is_cancelled());
        assert!(!registry.claim_timer(session_id, TimerKind::EndQuestion, 1).await);
        assert!(registry.claim_timer(session_id, TimerKind::EndQuestion, 2).await);
        assert!(!registry.has_pending_timers(session_id).await);
        second.abort();
    }

    #[tokio::test]
    async fn release_cancels_everything() {
        let registry = SessionRegistry::new();
        let session_id = Uuid::new_v4();
        drop(registry.lock(session_id).await);

        let show = sleeper();
        let end = sleeper();
        registry
            .register_timer(session_id, TimerKind::ShowQuestion, 1, show.abort_handle())
            .await;
        registry
            .register_timer(session_id, TimerKind::EndQuestion, 2, end.abort_handle())
            .await;

        registry.release(session_id).await;
        assert!(show.await.unwrap_err().is_cancelled());
        assert!(end.await.unwrap_err().is_cancelled());
        assert!(!registry.has_pending_timers(session_id).await);
        assert_eq!(registry.tracked_sessions().await, 0);
    }
}
