// The Pusher component (spec §4.5), grounded on conf_pusher.go: drains
// ConfChanges and applies each as one atomic KV transaction that replaces
// everything under `<outputPrefix>/<app_id>/` with the change's bundle
// (or nothing, for a REMOVED's empty bundle).

use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;

use crate::bundle::ConfChange;
use crate::kv::{KvBackend, KvTxnOp};

pub struct Pusher<K> {
    kv: Arc<K>,
    output_prefix: String,
}

impl<K: KvBackend> Pusher<K> {
    pub fn new(kv: Arc<K>, output_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            output_prefix: output_prefix.into(),
        }
    }

    /// Consumes `rx` until the sender side closes. Deliberately does not
    /// select on a cancellation token: shutdown is driven by the Fetcher
    /// closing its end of this channel once it stops producing `ConfChange`s
    /// (spec §5: "applications with in-flight changes at shutdown have their
    /// changes delivered (drain) before the pusher loop returns"), so racing
    /// a `ct` here would risk dropping an already-queued change instead of
    /// draining it. A transaction failure is logged and skipped rather than
    /// propagated: spec §4.5 treats a single bad push as transient (the next
    /// resolved commit for that app will retry), not fatal to the whole
    /// coordinator, which deliberately diverges from conf_pusher.go's
    /// panic-on-failure.
    pub async fn run(&self, mut rx: mpsc::Receiver<ConfChange>) -> anyhow::Result<()> {
        while let Some(change) = rx.recv().await {
            if let Err(e) = self.apply(&change).await {
                error!("pusher: applying change for {} failed: {e:#}", change.app_id);
            } else {
                info!("pusher: published {} keys under {}", change.kvs.len(), change.app_id);
            }
        }
        Ok(())
    }

    async fn apply(&self, change: &ConfChange) -> anyhow::Result<()> {
        let app_prefix = format!("{}/{}/", self.output_prefix, change.app_id);

        let mut ops = vec![KvTxnOp::DeleteTree {
            prefix: app_prefix.clone(),
        }];
        for (path, value) in change.kvs.iter() {
            ops.push(KvTxnOp::Set {
                key: format!("{app_prefix}{path}"),
                value: value.clone(),
            });
        }
        self.kv.txn(ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::SnapshotBundle;
    use crate::kv::FakeKv;

    #[tokio::test]
    async fn applies_a_change_as_delete_then_set() {
        let kv = Arc::new(FakeKv::new());
        kv.put("output/web1/stale", "old");
        let pusher = Pusher::new(kv.clone(), "output");

        let mut bundle = SnapshotBundle::new();
        bundle.insert("a/b".to_owned(), b"1".to_vec());
        pusher
            .apply(&ConfChange {
                app_id: "web1".to_owned(),
                kvs: bundle,
            })
            .await
            .unwrap();

        assert!(kv.get("output/web1/stale").await.unwrap().is_none());
        assert_eq!(kv.get("output/web1/a/b").await.unwrap().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn empty_bundle_clears_the_app_prefix() {
        let kv = Arc::new(FakeKv::new());
        kv.put("output/web1/a/b", "1");
        let pusher = Pusher::new(kv.clone(), "output");

        pusher
            .apply(&ConfChange {
                app_id: "web1".to_owned(),
                kvs: SnapshotBundle::new(),
            })
            .await
            .unwrap();

        assert!(kv.get("output/web1/a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_drains_channel_until_closed() {
        let kv = Arc::new(FakeKv::new());
        let pusher = Pusher::new(kv.clone(), "output");
        let (tx, rx) = mpsc::channel(4);

        let mut bundle = SnapshotBundle::new();
        bundle.insert("x".to_owned(), b"1".to_vec());
        tx.send(ConfChange {
            app_id: "web1".to_owned(),
            kvs: bundle,
        })
        .await
        .unwrap();
        drop(tx);

        pusher.run(rx).await.unwrap();
        assert_eq!(kv.get("output/web1/x").await.unwrap().unwrap().value, b"1");
    }

    #[tokio::test]
    async fn run_drains_queued_changes_sent_just_before_the_sender_closes() {
        let kv = Arc::new(FakeKv::new());
        let pusher = Pusher::new(kv.clone(), "output");
        let (tx, rx) = mpsc::channel(4);

        for id in ["web1", "web2", "web3"] {
            let mut bundle = SnapshotBundle::new();
            bundle.insert("x".to_owned(), b"1".to_vec());
            tx.send(ConfChange {
                app_id: id.to_owned(),
                kvs: bundle,
            })
            .await
            .unwrap();
        }
        drop(tx);

        pusher.run(rx).await.unwrap();
        for id in ["web1", "web2", "web3"] {
            assert_eq!(kv.get(&format!("output/{id}/x")).await.unwrap().unwrap().value, b"1");
        }
    }
}
