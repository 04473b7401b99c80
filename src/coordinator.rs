// Top-level wiring (spec §2/§5): constructs one of each component, pipes
// events Watcher -> Tracker -> Fetcher -> Pusher and LeaderHandler -> both
// Fetcher and (future) Pusher gating, and supervises the lot with an
// ErrGroup the way the teacher's own multi-task commands do.

use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fetcher::{Fetcher, FetcherConfig};
use crate::git::GitBackend;
use crate::githttp;
use crate::kv::KvBackend;
use crate::leader::{LeaderEvent, LeaderHandler};
use crate::pusher::Pusher;
use crate::tracker::Tracker;
use crate::util::ErrGroup;
use crate::watcher::Watcher;

const CHANNEL_CAPACITY: usize = 64;

pub struct Coordinator<K, G> {
    kv: Arc<K>,
    git: Arc<G>,
    config: Config,
}

impl<K: KvBackend + 'static, G: GitBackend + 'static> Coordinator<K, G> {
    pub fn new(kv: Arc<K>, git: Arc<G>, config: Config) -> Self {
        Self { kv, git, config }
    }

    /// Runs every component until `ct` is cancelled (e.g. on SIGINT/SIGTERM,
    /// wired by the caller), returning the first component's error if any of
    /// them fail.
    pub async fn run(&self, ct: CancellationToken) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.repos_dir)?;

        let (kv_tx, kv_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (descriptor_tx, descriptor_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (confchange_tx, confchange_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (leader_tx, leader_rx) = watch::channel(LeaderEvent { leader_node: None, is_self_leader: false });

        let watcher = Watcher::new(self.kv.clone(), self.config.descriptor_prefix.clone(), self.config.watch_period);
        let mut tracker = Tracker::new(self.config.descriptor_prefix.clone());
        let leader_handler = LeaderHandler::new(
            self.kv.clone(),
            self.config.leader_key.clone(),
            self.config.node_name.clone(),
            self.config.master_candidate,
            self.config.session_ttl,
            self.config.watch_period,
        );
        let fetcher = Fetcher::new(
            self.git.clone(),
            FetcherConfig {
                repos_dir: self.config.repos_dir.clone(),
                monitor_period: self.config.monitor_period,
                git_http_base_url: format!("http://{}", self.config.git_http_advertise_addr),
            },
        );
        let pusher = Pusher::new(self.kv.clone(), self.config.output_prefix.clone());

        let mut group = ErrGroup::new(ct.clone());

        {
            let ct = ct.clone();
            group.spawn(async move { watcher.run(kv_tx, ct).await });
        }
        {
            let ct = ct.clone();
            group.spawn(async move {
                tokio::select! {
                    result = tracker.run(kv_rx, descriptor_tx) => result,
                    _ = ct.cancelled() => Ok(()),
                }
            });
        }
        {
            let ct = ct.clone();
            group.spawn(async move { leader_handler.run(leader_tx, ct).await });
        }
        {
            let ct = ct.clone();
            group.spawn(async move { fetcher.run(descriptor_rx, leader_rx, confchange_tx, ct).await });
        }
        // No `ct` here deliberately: the Pusher drains `confchange_rx` until
        // the Fetcher (the sole sender) drops it, rather than racing
        // cancellation against already-queued ConfChanges (spec §5).
        group.spawn(async move { pusher.run(confchange_rx).await });
        {
            let addr: SocketAddr = self
                .config
                .git_http_addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid git_http_addr {:?}: {e}", self.config.git_http_addr))?;
            let repos_dir = self.config.repos_dir.clone();
            let ct = ct.clone();
            group.spawn(async move { githttp::serve(addr, repos_dir, ct).await });
        }

        info!("coordinator: all components started");
        group.wait().await
    }
}
