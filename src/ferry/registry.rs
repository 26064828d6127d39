use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use tokio::sync::Notify;

use crate::ferry::relay::CloseSignal;

/// What the registry knows about one tunnel: who it is and how to close it.
///
/// The handle does not own the session's sockets; closing it only trips the
/// session's [`CloseSignal`], and the session tears itself down.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    client: String,
    user: OnceLock<String>,
    started_at_unix_ms: u64,
    close: CloseSignal,
}

impl SessionHandle {
    pub fn new(client: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: new_session_id(),
            client: client.into(),
            user: OnceLock::new(),
            started_at_unix_ms: now_unix_ms(),
            close: CloseSignal::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn set_user(&self, user: &str) {
        let _ = self.user.set(user.to_string());
    }

    pub fn user(&self) -> Option<&str> {
        self.user.get().map(String::as_str)
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }

    pub fn close(&self) {
        self.close.close();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            client: self.client.clone(),
            user: self.user().unwrap_or_default().to_string(),
            started_at_unix_ms: self.started_at_unix_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub client: String,
    pub user: String,
    pub started_at_unix_ms: u64,
}

/// Narrow capability sessions use to (de)register themselves.
pub trait Registrar: Send + Sync {
    /// Returns false when the session was not tracked (shutdown already
    /// started, or the id is already present).
    fn add(&self, session: Arc<SessionHandle>) -> bool;

    /// Idempotent; returns true only for the call that removed the entry.
    fn remove(&self, id: &str) -> bool;
}

/// Active authenticated tunnels plus graceful-shutdown coordination.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    active: AtomicUsize,
    shutting_down: AtomicBool,
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out = Vec::with_capacity(self.sessions.len());
        for s in self.sessions.iter() {
            out.push(s.value().info());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    /// Stops accepting registrations, closes every tracked session and waits
    /// until all of them have removed themselves.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let tracked: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        if !tracked.is_empty() {
            tracing::info!(sessions = tracked.len(), "registry: closing sessions");
        }
        for s in &tracked {
            s.close();
        }

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active() == 0 {
                break;
            }
            notified.await;
        }

        tracing::info!("registry: drained");
    }
}

impl Registrar for ConnectionRegistry {
    fn add(&self, session: Arc<SessionHandle>) -> bool {
        if self.is_shutting_down() {
            tracing::debug!(sid=%session.id(), "registry: add ignored during shutdown");
            return false;
        }

        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(sid=%session.id(), "registry: session already registered");
                return false;
            }
            Entry::Vacant(v) => {
                v.insert(session.clone());
            }
        }
        self.active.fetch_add(1, Ordering::SeqCst);

        // Shutdown may have taken its snapshot between the check above and the insert.
        if self.is_shutting_down() {
            session.close();
        }
        true
    }

    fn remove(&self, id: &str) -> bool {
        if self.sessions.remove(id).is_none() {
            return false;
        }
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
        true
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn add_remove_pairs_return_to_zero() {
        let reg = ConnectionRegistry::new();
        for _ in 0..100 {
            let h = SessionHandle::new("127.0.0.1:1");
            assert!(reg.add(h.clone()));
            assert_eq!(reg.active(), 1);
            assert!(reg.remove(h.id()));
        }
        assert_eq!(reg.active(), 0);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let a = SessionHandle::new("a");
        let b = SessionHandle::new("b");
        reg.add(a.clone());
        reg.add(b.clone());

        assert!(reg.remove(a.id()));
        assert!(!reg.remove(a.id()));
        assert!(!reg.remove("never-added"));
        assert_eq!(reg.active(), 1);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let reg = ConnectionRegistry::new();
        let a = SessionHandle::new("a");
        assert!(reg.add(a.clone()));
        assert!(!reg.add(a.clone()));
        assert_eq!(reg.active(), 1);
    }

    #[tokio::test]
    async fn add_after_shutdown_is_noop() {
        let reg = ConnectionRegistry::new();
        reg.shutdown().await;

        let h = SessionHandle::new("late");
        assert!(!reg.add(h.clone()));
        assert_eq!(reg.active(), 0);
        assert!(!h.close_signal().is_closed());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_waits_for_removal() {
        let reg = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..3 {
            let h = SessionHandle::new(format!("10.0.0.{i}:5000"));
            assert!(reg.add(h.clone()));
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                h.close_signal().closed().await;
                // Unwind takes a moment in real sessions.
                tokio::time::sleep(Duration::from_millis(20)).await;
                reg.remove(h.id());
            }));
        }
        assert_eq!(reg.active(), 3);

        tokio::time::timeout(Duration::from_secs(2), reg.shutdown())
            .await
            .expect("shutdown drained");
        assert_eq!(reg.active(), 0);
        for t in tasks {
            t.await.unwrap();
        }

        // Second call returns immediately.
        tokio::time::timeout(Duration::from_millis(100), reg.shutdown())
            .await
            .expect("idempotent shutdown");
    }

    #[test]
    fn snapshot_orders_by_start_time() {
        let reg = ConnectionRegistry::new();
        let a = SessionHandle::new("a");
        a.set_user("alice");
        reg.add(a.clone());
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].user, "alice");
        assert!(snap[0].id.starts_with('s'));
    }
}
