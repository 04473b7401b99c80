// The LeaderHandler component (spec §4.3), grounded on
// leaderhandler/leader.go: creates/reuses a named session, repeatedly tries
// to acquire a lock key under it, and emits LeaderEvents on every state
// transition. Polling is jittered so that a fleet of nodes restarting
// together don't all hammer Consul's lock endpoint in lockstep.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::kv::KvBackend;
use crate::util::ShutdownGuard;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderEvent {
    /// This node's own name when it holds the lock, `None` otherwise. The KV
    /// backend's acquire/release primitives don't surface who else holds a
    /// contested lock, so unlike `is_self_leader` this can't identify a
    /// remote leader -- only confirm the absence of this node as one.
    pub leader_node: Option<String>,
    /// Whether this node currently holds the lock.
    pub is_self_leader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderState {
    Follower,
    Leader,
}

/// Contends for a named lock key, broadcasting `LeaderEvent`s on every
/// follower/leader transition. One session is created at startup (candidates
/// only) and reused across every acquire attempt (spec §4.3: "re-creating the
/// session on every poll would mean every poll briefly drops whatever lock we
/// hold").
///
/// A non-candidate (`is_master_candidate = false`) never creates a session
/// and never calls `acquire` -- it only ever reads `lock_key` and reports
/// whoever else holds it, per spec §4.3: "Non-candidates never attempt
/// acquisition."
pub struct LeaderHandler<K> {
    kv: Arc<K>,
    lock_key: String,
    node_name: String,
    is_master_candidate: bool,
    session_ttl: Duration,
    poll_period: Duration,
    shutdown: ShutdownGuard,
}

impl<K: KvBackend + 'static> LeaderHandler<K> {
    pub fn new(
        kv: Arc<K>,
        lock_key: impl Into<String>,
        node_name: impl Into<String>,
        is_master_candidate: bool,
        session_ttl: Duration,
        poll_period: Duration,
    ) -> Self {
        Self {
            kv,
            lock_key: lock_key.into(),
            node_name: node_name.into(),
            is_master_candidate,
            session_ttl,
            poll_period,
            shutdown: ShutdownGuard::new(),
        }
    }

    /// Runs the election loop until `ct` is cancelled, publishing the
    /// current leadership state via `tx`. On exit (including cancellation),
    /// if this node ever was a candidate its lock is released (best effort)
    /// and its session destroyed, which also releases any lock it held
    /// server-side (spec §4.3: "losing the session must be equivalent to an
    /// explicit release").
    pub async fn run(&self, tx: watch::Sender<LeaderEvent>, ct: CancellationToken) -> anyhow::Result<()> {
        let session_id = if self.is_master_candidate {
            let id = self.kv.session_create(&self.node_name, self.session_ttl).await?;
            info!("leader: created session {id}");
            Some(id)
        } else {
            debug_non_candidate(&self.lock_key);
            None
        };

        let mut state = LeaderState::Follower;
        let mut cached_leader: Option<String> = None;
        let result = self
            .poll_loop(session_id.as_deref(), &mut state, &mut cached_leader, &tx, &ct)
            .await;

        if let Some(session_id) = &session_id {
            if state == LeaderState::Leader {
                if let Err(e) = self.kv.release(&self.lock_key, session_id).await {
                    warn!("leader: failed to release {} on shutdown: {e:#}", self.lock_key);
                }
            }
            if let Err(e) = self.kv.session_destroy(session_id).await {
                warn!("leader: failed to destroy session {session_id} on shutdown: {e:#}");
            }
        }

        result
    }

    async fn poll_loop(
        &self,
        session_id: Option<&str>,
        state: &mut LeaderState,
        cached_leader: &mut Option<String>,
        tx: &watch::Sender<LeaderEvent>,
        ct: &CancellationToken,
    ) -> anyhow::Result<()> {
        // Jittered initial delay so a batch of nodes starting simultaneously
        // spread their first acquire attempt over one full poll period.
        let initial_jitter = Duration::from_millis(rand::thread_rng().gen_range(0..self.poll_period.as_millis() as u64).max(1));
        tokio::select! {
            _ = tokio::time::sleep(initial_jitter) => {}
            _ = ct.cancelled() => return Ok(()),
        }

        loop {
            if ct.is_cancelled() {
                return Ok(());
            }

            // "If candidate and no current leader is observed: attempt
            // acquire. Success is silent (the next poll will observe it and
            // emit the transition)" (spec §4.3).
            if let Some(session_id) = session_id {
                if cached_leader.is_none() {
                    if let Err(e) = self.kv.acquire(&self.lock_key, session_id, self.node_name.as_bytes()).await {
                        warn!("leader: acquire {} failed: {e:#}", self.lock_key);
                    }
                }
            }

            match self.kv.get(&self.lock_key).await {
                Ok(Some(pair)) if pair.held => {
                    let value = String::from_utf8_lossy(&pair.value).into_owned();
                    if cached_leader.as_deref() != Some(value.as_str()) {
                        let is_self_leader = value == self.node_name;
                        info!("leader: {} now held by {value} (self={is_self_leader})", self.lock_key);
                        *cached_leader = Some(value.clone());
                        *state = if is_self_leader { LeaderState::Leader } else { LeaderState::Follower };
                        let _ = tx.send(LeaderEvent {
                            leader_node: Some(value),
                            is_self_leader,
                        });
                    }
                }
                Ok(_) => {
                    // Unheld (missing, or present with no session attached).
                    if cached_leader.as_deref() == Some(self.node_name.as_str()) {
                        info!("leader: {} lost by self", self.lock_key);
                        *cached_leader = None;
                        *state = LeaderState::Follower;
                        let _ = tx.send(LeaderEvent {
                            leader_node: None,
                            is_self_leader: false,
                        });
                    }
                }
                Err(e) => {
                    warn!("leader: reading {} failed: {e:#}", self.lock_key);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_period) => {}
                _ = ct.cancelled() => return Ok(()),
            }
        }
    }

    pub fn shutdown(&self, ct: &CancellationToken) {
        if self.shutdown.first_call() {
            ct.cancel();
        }
    }
}

fn debug_non_candidate(lock_key: &str) {
    info!("leader: not a master candidate, only observing {lock_key}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FakeKv;

    #[tokio::test]
    async fn becomes_leader_when_uncontested() {
        let kv = Arc::new(FakeKv::new());
        let handler = LeaderHandler::new(kv, "lock/leader", "node-a", true, Duration::from_secs(10), Duration::from_millis(5));
        let (tx, mut rx) = watch::channel(LeaderEvent { leader_node: None, is_self_leader: false });
        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { handler.run(tx, ct2).await });

        rx.changed().await.unwrap();
        assert!(rx.borrow().is_self_leader);

        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stays_follower_when_lock_already_held() {
        let kv = Arc::new(FakeKv::new());
        let other_session = kv.session_create("holder", Duration::from_secs(30)).await.unwrap();
        assert!(kv.acquire("lock/leader", &other_session, b"holder").await.unwrap());

        let handler = LeaderHandler::new(
            kv.clone(),
            "lock/leader",
            "node-a",
            true,
            Duration::from_secs(10),
            Duration::from_millis(5),
        );
        let (tx, mut rx) = watch::channel(LeaderEvent { leader_node: None, is_self_leader: false });
        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { handler.run(tx, ct2).await });

        // Observes the other node's leadership but never becomes leader itself.
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().leader_node.as_deref(), Some("holder"));
        assert!(!rx.borrow().is_self_leader);

        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_candidate_never_acquires_but_observes_leader() {
        let kv = Arc::new(FakeKv::new());
        let other_session = kv.session_create("holder", Duration::from_secs(30)).await.unwrap();
        assert!(kv.acquire("lock/leader", &other_session, b"holder").await.unwrap());

        let handler = LeaderHandler::new(
            kv.clone(),
            "lock/leader",
            "node-a",
            false,
            Duration::from_secs(10),
            Duration::from_millis(5),
        );
        let (tx, mut rx) = watch::channel(LeaderEvent { leader_node: None, is_self_leader: false });
        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { handler.run(tx, ct2).await });

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().leader_node.as_deref(), Some("holder"));
        assert!(!rx.borrow().is_self_leader);

        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn releases_lock_on_shutdown() {
        let kv = Arc::new(FakeKv::new());
        let handler = LeaderHandler::new(
            kv.clone(),
            "lock/leader",
            "node-a",
            true,
            Duration::from_secs(10),
            Duration::from_millis(5),
        );
        let (tx, mut rx) = watch::channel(LeaderEvent { leader_node: None, is_self_leader: false });
        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { handler.run(tx, ct2).await });

        rx.changed().await.unwrap();
        assert!(rx.borrow().is_self_leader);

        ct.cancel();
        handle.await.unwrap().unwrap();

        // Session destroyed means a fresh session can now acquire the lock.
        let kv2 = kv.clone();
        let new_session = kv2.session_create("node-b", Duration::from_secs(10)).await.unwrap();
        assert!(kv2.acquire("lock/leader", &new_session, b"node-b").await.unwrap());
    }
}
