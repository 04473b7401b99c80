// The Watcher component (spec §4.1), grounded on watch.go: a long-poll loop
// over a KV prefix that feeds raw (key, value) changes to whoever's
// listening, plus an idempotent shutdown the way watch.go's Shutdown() is
// idempotent via shutdownLock/shutdownCh.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::kv::{KvBackend, KvPair, WatchResult};
use crate::util::ShutdownGuard;

/// One observed change under the watched prefix. The Watcher does no
/// interpretation of keys — that's the Tracker's job (spec §4.2) — it only
/// reports "this key now holds this value" or "this key is gone".
#[derive(Debug, Clone)]
pub enum KvEvent {
    Set(KvPair),
    Deleted(String),
}

/// Watches a KV prefix via repeated long-polling and emits `KvEvent`s for
/// every key whose value or presence changed since the previous poll.
pub struct Watcher<K> {
    kv: Arc<K>,
    prefix: String,
    poll_timeout: Duration,
    shutdown: ShutdownGuard,
}

impl<K: KvBackend + 'static> Watcher<K> {
    pub fn new(kv: Arc<K>, prefix: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            poll_timeout,
            shutdown: ShutdownGuard::new(),
        }
    }

    /// Runs until `ct` is cancelled, sending events to `tx`. Returns `Ok(())`
    /// on clean shutdown. Spec §4.1: "a watch that times out is not an
    /// error" — only a KV-backend error (not a timeout) is ever surfaced as
    /// `Err`.
    pub async fn run(&self, tx: mpsc::Sender<KvEvent>, ct: CancellationToken) -> anyhow::Result<()> {
        let mut index = 0u64;
        // last observed value per key, to suppress events the store repeats
        // spuriously when unrelated keys outside the prefix change the
        // overall index.
        let mut last: std::collections::BTreeMap<String, Vec<u8>> = std::collections::BTreeMap::new();

        loop {
            if ct.is_cancelled() {
                return Ok(());
            }

            let result = tokio::select! {
                result = self.kv.watch_prefix(&self.prefix, index, self.poll_timeout) => result,
                _ = ct.cancelled() => return Ok(()),
            };

            let pairs = match result {
                Ok(WatchResult::TimedOut { index: same }) => {
                    index = same;
                    continue;
                }
                Ok(WatchResult::Pairs { pairs, index: new_index }) => {
                    index = new_index;
                    pairs
                }
                Err(e) => {
                    warn!("watch_prefix({}) failed: {e:#}", self.prefix);
                    return Err(e);
                }
            };

            let mut seen_this_round = std::collections::BTreeSet::new();
            for pair in &pairs {
                seen_this_round.insert(pair.key.clone());
                if last.get(&pair.key) == Some(&pair.value) {
                    continue;
                }
                last.insert(pair.key.clone(), pair.value.clone());
                debug!("watcher: {} changed", pair.key);
                if tx.send(KvEvent::Set(pair.clone())).await.is_err() {
                    return Ok(());
                }
            }

            let removed: Vec<String> = last
                .keys()
                .filter(|k| !seen_this_round.contains(*k))
                .cloned()
                .collect();
            for key in removed {
                last.remove(&key);
                debug!("watcher: {key} removed");
                if tx.send(KvEvent::Deleted(key)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    /// Idempotent shutdown signal, in case a caller wants to stop this
    /// Watcher specifically rather than cancelling the shared token.
    pub fn shutdown(&self, ct: &CancellationToken) {
        if self.shutdown.first_call() {
            ct.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FakeKv;

    #[tokio::test]
    async fn emits_set_then_deleted() {
        let kv = Arc::new(FakeKv::new());
        kv.put("config/global/web1/id", "web1");
        let watcher = Watcher::new(kv.clone(), "config/global", Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(16);
        let ct = CancellationToken::new();

        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { watcher.run(tx, ct2).await });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, KvEvent::Set(p) if p.key == "config/global/web1/id"));

        kv.delete("config/global/web1/id");
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, KvEvent::Deleted(k) if k == "config/global/web1/id"));

        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ignores_unrelated_repeated_polls() {
        let kv = Arc::new(FakeKv::new());
        kv.put("config/global/web1/id", "web1");
        let watcher = Watcher::new(kv.clone(), "config/global", Duration::from_millis(5));
        let (tx, mut rx) = mpsc::channel(16);
        let ct = CancellationToken::new();
        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { watcher.run(tx, ct2).await });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, KvEvent::Set(_)));

        // Bump the index without changing our key's value.
        kv.put("unrelated/key", "x");
        kv.put("config/global/web1/id", "web1");

        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect_err("no event should follow an unchanged value");

        ct.cancel();
        handle.await.unwrap().unwrap();
    }
}
