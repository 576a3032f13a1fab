//! Session Registry (C4): process-wide mapping from session id to the
//! running session actor, plus the stale sweep and shutdown teardown paths.

use crate::config;
use crate::error::SpawnFailure;
use crate::session::{self, SessionHandle, SessionId, SessionSummary};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionHandle>>,
    shell_argv: Vec<String>,
    scrollback_capacity: usize,
}

impl SessionRegistry {
    pub fn new(shell_argv: Vec<String>, scrollback_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            shell_argv,
            scrollback_capacity,
        }
    }

    /// Spawn a new session actor and register it. On the actor's own
    /// teardown it removes itself from this map — see the `on_destroyed`
    /// callback passed to `session::spawn`.
    pub fn create(&self, cols: u16, rows: u16) -> Result<SessionHandle, SpawnFailure> {
        let id = SessionId::new();
        let map = Arc::clone(&self.sessions);
        let handle = session::spawn(id, self.shell_argv.clone(), cols, rows, self.scrollback_capacity, move |id| {
            map.remove(&id);
        })?;
        self.sessions.insert(id, handle.clone());
        info!(session_id = %id, "session created");
        Ok(handle)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Remove a handle from the map without destroying the underlying
    /// actor. The normal path is the actor removing itself; this exists for
    /// callers that already know the actor is gone.
    pub fn remove(&self, id: &SessionId) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Destroy every session: used for `POST /restart` and for graceful
    /// shutdown on a termination signal.
    pub async fn destroy_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.destroy().await;
        }
    }

    /// Destroy any session in `detached` state idle for at least
    /// `SESSION_IDLE_TIMEOUT`. Sessions in `attached` are never swept, no
    /// matter how idle, per the lifecycle contract.
    pub async fn sweep_stale(&self) {
        let now = session::unix_now();
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let Some(summary) = handle.summary().await else { continue };
            if summary.state != crate::session::SessionState::Detached {
                continue;
            }
            let Some(last_detached_at) = summary.last_detached_at else { continue };
            let idle_for = now.saturating_sub(last_detached_at);
            if idle_for >= config::SESSION_IDLE_TIMEOUT.as_secs() {
                info!(session_id = %summary.session_id, idle_for, "sweeping stale detached session");
                handle.destroy().await;
            }
        }
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(summary) = handle.summary().await {
                out.push(summary);
            }
        }
        out
    }

    /// Spawn the background task that runs `sweep_stale` every
    /// `SWEEP_INTERVAL`. Call once at process startup.
    pub fn spawn_sweep_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config::SWEEP_INTERVAL.as_secs()));
            loop {
                ticker.tick().await;
                self.sweep_stale().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> SessionRegistry {
        SessionRegistry::new(vec!["sh".to_string(), "-c".to_string(), "cat".to_string()], 4096)
    }

    #[tokio::test]
    async fn create_registers_and_get_finds_it() {
        let registry = test_registry();
        let handle = registry.create(80, 24).unwrap();
        assert!(registry.get(&handle.id).is_some());
        assert_eq!(registry.len(), 1);
        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn get_unknown_session_is_none() {
        let registry = test_registry();
        assert!(registry.get(&SessionId::new()).is_none());
    }

    #[tokio::test]
    async fn destroy_all_empties_registry() {
        let registry = test_registry();
        registry.create(80, 24).unwrap();
        registry.create(80, 24).unwrap();
        registry.destroy_all().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn summaries_reports_one_row_per_session() {
        let registry = test_registry();
        registry.create(80, 24).unwrap();
        registry.create(80, 24).unwrap();
        let summaries = registry.summaries().await;
        assert_eq!(summaries.len(), 2);
        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn repeated_destroy_on_already_dead_session_is_a_no_op() {
        let registry = test_registry();
        let handle = registry.create(80, 24).unwrap();
        handle.destroy().await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        // second destroy targets an actor whose task has already exited;
        // the channel send silently fails, no panic, no effect.
        handle.destroy().await;
    }
}
