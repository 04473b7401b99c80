// The Fetcher component (spec §4.4), grounded on conf_fetcher.go: for each
// tracked app, maintains a local bare clone and keeps it synced to its
// descriptor's (repo, branch, rev), re-snapshotting and handing a
// `ConfChange` to the Pusher whenever the resolved commit moves.
//
// Two behaviours here resolve spec §9 Open Questions rather than following
// conf_fetcher.go directly:
//   - REMOVED produces an empty-bundle ConfChange (so the Pusher actually
//     clears `<outputPrefix>/<id>/*`), where the source just stopped pushing
//     and left stale keys behind.
//   - A clone failure on NEW re-enters this same loop as a synthetic
//     REMOVED, rather than being reported upstream to the Tracker, which
//     only ever flows descriptor state forward from the KV store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::bundle::{ConfChange, SnapshotBundle};
use crate::descriptor::{Descriptor, DescriptorEvent, DescriptorEventKind, Rev};
use crate::git::{CommitHash, GitBackend};
use crate::leader::LeaderEvent;
use crate::util::ShutdownGuard;

pub struct FetcherConfig {
    /// Directory under which one bare clone per app_id is kept, at
    /// `<repos_dir>/<app_id>.git`.
    pub repos_dir: PathBuf,
    /// How often an idle sub-agent re-resolves `rev` even with no descriptor
    /// change, to pick up new commits on a tracked branch or tag.
    pub monitor_period: Duration,
    /// Base URL (e.g. `http://host:9418`) at which the git-http collaborator
    /// serves `repos_dir`, published into each bundle's `_meta/repo` (spec
    /// §3/§6: "URL at which downstream nodes can clone the materialized
    /// repository" -- the local mirror, not the original upstream URL).
    pub git_http_base_url: String,
}

enum Command {
    Changed(Descriptor),
    Removed,
}

/// Identifies one app's local bare clone: where it lives on disk, and which
/// remote/branch it currently tracks there. `ShellGitBackend` always uses a
/// single remote named `origin`, so `remote_name` is constant in practice,
/// but keeping it explicit here (rather than hardcoding "origin" at every
/// call site) is what lets a future multi-remote `GitBackend` slot in without
/// touching `SubAgent`.
struct RepoHandle {
    path: PathBuf,
    remote_name: String,
    branch_name: String,
    app_id: String,
}

impl RepoHandle {
    fn new(repos_dir: &std::path::Path, descriptor: &Descriptor) -> Self {
        Self {
            path: repos_dir.join(format!("{}.git", descriptor.id)),
            remote_name: "origin".to_owned(),
            branch_name: descriptor.branch.clone(),
            app_id: descriptor.id.clone(),
        }
    }
}

pub struct Fetcher<G> {
    git: Arc<G>,
    config: FetcherConfig,
    shutdown: ShutdownGuard,
}

impl<G: GitBackend + 'static> Fetcher<G> {
    pub fn new(git: Arc<G>, config: FetcherConfig) -> Self {
        Self {
            git,
            config,
            shutdown: ShutdownGuard::new(),
        }
    }

    /// Consumes descriptor events, emitting one `ConfChange` per resolved
    /// snapshot. Leader-event state is threaded through for logging only --
    /// the current design does not gate on it (spec §4.4/§9). Returns
    /// `Ok(())` on cancellation or the descriptor channel closing.
    pub async fn run(
        &self,
        mut descriptor_rx: mpsc::Receiver<DescriptorEvent>,
        leader_rx: watch::Receiver<LeaderEvent>,
        out_tx: mpsc::Sender<ConfChange>,
        ct: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut sub_agents: HashMap<String, mpsc::Sender<Command>> = HashMap::new();
        let mut tasks = tokio::task::JoinSet::new();
        let (self_tx, mut self_rx) = mpsc::channel::<DescriptorEvent>(64);

        loop {
            let event = tokio::select! {
                _ = ct.cancelled() => break,
                Some(event) = descriptor_rx.recv() => event,
                Some(event) = self_rx.recv() => event,
                Some(_) = tasks.join_next() => continue,
                else => break,
            };

            debug!(
                "fetcher: handling {} for {} (leader={:?}, self_leader={})",
                event_kind_str(&event),
                event.id,
                leader_rx.borrow().leader_node,
                leader_rx.borrow().is_self_leader
            );

            self.handle_event(
                event,
                &mut sub_agents,
                &mut tasks,
                &out_tx,
                &self_tx,
                &leader_rx,
                &ct,
            )
            .await;
        }

        for tx in sub_agents.values() {
            let _ = tx.send(Command::Removed).await;
        }
        drop(sub_agents);
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_event(
        &self,
        event: DescriptorEvent,
        sub_agents: &mut HashMap<String, mpsc::Sender<Command>>,
        tasks: &mut tokio::task::JoinSet<()>,
        out_tx: &mpsc::Sender<ConfChange>,
        self_tx: &mpsc::Sender<DescriptorEvent>,
        leader_rx: &watch::Receiver<LeaderEvent>,
        ct: &CancellationToken,
    ) {
        match event.kind {
            DescriptorEventKind::New | DescriptorEventKind::Changed => {
                let descriptor = event.descriptor.expect("New/Changed always carry a descriptor");
                if let Some(tx) = sub_agents.get(&descriptor.id) {
                    if tx.send(Command::Changed(descriptor)).await.is_err() {
                        sub_agents.remove(&event.id);
                    }
                    return;
                }

                // No running sub-agent: this is either a genuine NEW, or a
                // CHANGED arriving for an id whose sub-agent already exited
                // (e.g. after a prior clone failure) -- either way, spin one
                // up fresh.
                let handle = RepoHandle::new(&self.config.repos_dir, &descriptor);
                match self.git.clone_single_branch(&descriptor.repo, &descriptor.branch, &handle.path).await {
                    Ok(()) => {
                        let (tx, rx) = mpsc::channel(8);
                        sub_agents.insert(descriptor.id.clone(), tx);
                        let sub_agent = SubAgent {
                            git: self.git.clone(),
                            handle,
                            monitor_period: self.config.monitor_period,
                            out_tx: out_tx.clone(),
                            leader_rx: leader_rx.clone(),
                            git_http_base_url: self.config.git_http_base_url.clone(),
                            cached_commit: None,
                        };
                        let ct = ct.clone();
                        tasks.spawn(async move {
                            sub_agent.run(descriptor, rx, ct).await;
                        });
                    }
                    Err(e) => {
                        warn!("fetcher: initial clone for {} failed: {e:#}", descriptor.id);
                        let _ = self_tx.send(DescriptorEvent::removed(descriptor.id)).await;
                    }
                }
            }
            DescriptorEventKind::Removed => {
                if let Some(tx) = sub_agents.remove(&event.id) {
                    let _ = tx.send(Command::Removed).await;
                } else {
                    debug!("fetcher: REMOVED for {} with no running sub-agent, nothing to clean up", event.id);
                }
            }
        }
    }
}

fn event_kind_str(event: &DescriptorEvent) -> &'static str {
    match event.kind {
        DescriptorEventKind::New => "NEW",
        DescriptorEventKind::Changed => "CHANGED",
        DescriptorEventKind::Removed => "REMOVED",
    }
}

/// Owns one app's local clone for its whole lifetime: initial snapshot,
/// periodic re-resolution, descriptor changes, and final teardown.
struct SubAgent<G> {
    git: Arc<G>,
    handle: RepoHandle,
    monitor_period: Duration,
    out_tx: mpsc::Sender<ConfChange>,
    leader_rx: watch::Receiver<LeaderEvent>,
    git_http_base_url: String,
    /// The commit last pushed, so a resolve that lands back on it (a
    /// `latest` branch with no new commits, a pinned rev re-ticked) is a
    /// no-op rather than a redundant push (spec §4.4 step 3a).
    cached_commit: Option<CommitHash>,
}

impl<G: GitBackend> SubAgent<G> {
    async fn run(mut self, mut descriptor: Descriptor, mut cmd_rx: mpsc::Receiver<Command>, ct: CancellationToken) {
        if let Err(e) = self.sync(&descriptor).await {
            warn!("fetcher: initial sync for {} failed: {e:#}", descriptor.id);
        }

        let mut ticker = tokio::time::interval(self.monitor_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ct.cancelled() => {
                    self.clear().await;
                    return;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Changed(new_descriptor)) => {
                        let repo_changed = new_descriptor.repo != descriptor.repo;
                        let branch_changed = new_descriptor.branch != descriptor.branch;
                        descriptor = new_descriptor;

                        let result = if repo_changed {
                            self.recreate(&descriptor).await
                        } else if branch_changed {
                            self.handle.branch_name = descriptor.branch.clone();
                            match self.git.set_branch(&self.handle.path, &descriptor.branch).await {
                                Ok(()) => self.sync(&descriptor).await,
                                Err(e) => Err(e),
                            }
                        } else {
                            self.sync(&descriptor).await
                        };
                        if let Err(e) = result {
                            warn!("fetcher: sync for {} after CHANGED failed: {e:#}", descriptor.id);
                        }
                    }
                    Some(Command::Removed) | None => {
                        self.clear().await;
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !matches!(descriptor.rev(), Rev::Latest) {
                        continue;
                    }
                    if let Err(e) = self.sync(&descriptor).await {
                        warn!("fetcher: periodic sync for {} failed: {e:#}", descriptor.id);
                    }
                }
            }
        }
    }

    async fn recreate(&mut self, descriptor: &Descriptor) -> anyhow::Result<()> {
        let _ = tokio::fs::remove_dir_all(&self.handle.path).await;
        self.git.clone_single_branch(&descriptor.repo, &descriptor.branch, &self.handle.path).await?;
        self.handle.branch_name = descriptor.branch.clone();
        self.cached_commit = None;
        self.sync(descriptor).await
    }

    async fn sync(&mut self, descriptor: &Descriptor) -> anyhow::Result<()> {
        debug!(
            "fetcher: syncing {} (leader={:?}, self_leader={})",
            descriptor.id,
            self.leader_rx.borrow().leader_node,
            self.leader_rx.borrow().is_self_leader
        );
        let commit = self.resolve(descriptor).await?;
        if self.cached_commit.as_ref() == Some(&commit) {
            // Steady state: resolved to the same commit already pushed, so
            // there is nothing new to report (spec §4.4 step 3a: "If equal
            // to c, return without pushing").
            return Ok(());
        }
        let bundle = self.git.walk_tree(&self.handle.path, &commit).await?;
        self.push(descriptor, &commit, bundle).await?;
        self.cached_commit = Some(commit);
        Ok(())
    }

    async fn resolve(&self, descriptor: &Descriptor) -> anyhow::Result<CommitHash> {
        match descriptor.rev() {
            Rev::Latest => self.git.fetch_branch(&self.handle.path, &self.handle.branch_name).await,
            Rev::Tag(tag) => self.git.resolve_tag(&self.handle.path, &tag).await,
            Rev::Commit(commit) => self.git.resolve_commit(&self.handle.path, &commit).await,
        }
    }

    async fn push(&self, descriptor: &Descriptor, commit: &CommitHash, mut bundle: SnapshotBundle) -> anyhow::Result<()> {
        // _meta/repo names where downstream nodes can clone the local
        // mirror this node just synced, not the original upstream URL
        // (spec §3: "URL at which downstream nodes can clone the
        // materialized repository").
        let local_url = format!("{}/{}.git", self.git_http_base_url, descriptor.id);
        bundle.set_meta(&descriptor.branch, &descriptor.rev, commit.as_ref(), &local_url);
        info!("fetcher: {} resolved to {commit}", descriptor.id);
        let _ = self
            .out_tx
            .send(ConfChange {
                app_id: descriptor.id.clone(),
                kvs: bundle,
            })
            .await;
        Ok(())
    }

    /// Removes the local clone and emits an empty bundle so the Pusher
    /// clears whatever this app previously published.
    async fn clear(&self) {
        let _ = tokio::fs::remove_dir_all(&self.handle.path).await;
        let _ = self
            .out_tx
            .send(ConfChange {
                app_id: self.handle.app_id.clone(),
                kvs: SnapshotBundle::new(),
            })
            .await;
    }
}

impl<G> Fetcher<G> {
    pub fn shutdown(&self, ct: &CancellationToken) {
        if self.shutdown.first_call() {
            ct.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_utils::TempRepo;
    use crate::git::ShellGitBackend;

    fn descriptor(id: &str, url: &str, branch: &str, rev: &str) -> Descriptor {
        Descriptor {
            id: id.to_owned(),
            branch: branch.to_owned(),
            repo: url.to_owned(),
            rev: rev.to_owned(),
        }
    }

    #[tokio::test]
    async fn new_event_clones_and_pushes_snapshot() {
        let origin = TempRepo::new().await.unwrap();
        origin.write_file("a", "1").await.unwrap();
        origin.commit("initial").await.unwrap();

        let repos_dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(
            Arc::new(ShellGitBackend::default()),
            FetcherConfig {
                repos_dir: repos_dir.path().to_owned(),
                monitor_period: Duration::from_secs(3600),
                git_http_base_url: "http://localhost:9418".to_owned(),
            },
        );

        let (desc_tx, desc_rx) = mpsc::channel(8);
        let (leader_tx, leader_rx) = watch::channel(LeaderEvent { leader_node: Some("test".to_owned()), is_self_leader: true });
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let ct = CancellationToken::new();

        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { fetcher.run(desc_rx, leader_rx, out_tx, ct2).await });

        desc_tx
            .send(DescriptorEvent::new(descriptor("web1", &origin.url(), "master", "latest")))
            .await
            .unwrap();

        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.app_id, "web1");
        assert_eq!(change.kvs.get("a").map(|v| v.as_slice()), Some(b"1".as_slice()));
        assert!(change.kvs.contains_key("_meta/commit"));
        // _meta/repo names the local mirror this node just synced, not the
        // origin.url() the descriptor pointed at.
        assert_eq!(
            change.kvs.get("_meta/repo").map(|v| v.as_slice()),
            Some(b"http://localhost:9418/web1.git".as_slice())
        );

        drop(leader_tx);
        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn removed_event_emits_empty_bundle() {
        let origin = TempRepo::new().await.unwrap();
        origin.write_file("a", "1").await.unwrap();
        origin.commit("initial").await.unwrap();

        let repos_dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(
            Arc::new(ShellGitBackend::default()),
            FetcherConfig {
                repos_dir: repos_dir.path().to_owned(),
                monitor_period: Duration::from_secs(3600),
                git_http_base_url: "http://localhost:9418".to_owned(),
            },
        );

        let (desc_tx, desc_rx) = mpsc::channel(8);
        let (_leader_tx, leader_rx) = watch::channel(LeaderEvent { leader_node: Some("test".to_owned()), is_self_leader: true });
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let ct = CancellationToken::new();

        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { fetcher.run(desc_rx, leader_rx, out_tx, ct2).await });

        desc_tx
            .send(DescriptorEvent::new(descriptor("web1", &origin.url(), "master", "latest")))
            .await
            .unwrap();
        let _ = out_rx.recv().await.unwrap();

        desc_tx.send(DescriptorEvent::removed("web1")).await.unwrap();
        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.app_id, "web1");
        assert!(change.kvs.is_empty());

        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pinned_rev_ignores_monitor_ticks_and_upstream_changes() {
        let origin = TempRepo::new().await.unwrap();
        origin.write_file("a", "1").await.unwrap();
        let pinned = origin.commit("initial").await.unwrap();

        let repos_dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(
            Arc::new(ShellGitBackend::default()),
            FetcherConfig {
                repos_dir: repos_dir.path().to_owned(),
                monitor_period: Duration::from_millis(10),
                git_http_base_url: "http://localhost:9418".to_owned(),
            },
        );

        let (desc_tx, desc_rx) = mpsc::channel(8);
        let (_leader_tx, leader_rx) = watch::channel(LeaderEvent { leader_node: Some("test".to_owned()), is_self_leader: true });
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let ct = CancellationToken::new();

        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { fetcher.run(desc_rx, leader_rx, out_tx, ct2).await });

        desc_tx
            .send(DescriptorEvent::new(descriptor("web1", &origin.url(), "master", &pinned.to_string())))
            .await
            .unwrap();
        let change = out_rx.recv().await.unwrap();
        assert_eq!(change.app_id, "web1");

        // Upstream moves on, but this descriptor is pinned to `pinned` --
        // several monitor periods must produce no further ConfChange (spec
        // §4.4: tick on a non-`latest` rev does nothing).
        origin.write_file("a", "2").await.unwrap();
        origin.commit("second").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out_rx.try_recv().is_err());

        ct.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn latest_rev_tick_is_idempotent_when_unchanged() {
        let origin = TempRepo::new().await.unwrap();
        origin.write_file("a", "1").await.unwrap();
        origin.commit("initial").await.unwrap();

        let repos_dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(
            Arc::new(ShellGitBackend::default()),
            FetcherConfig {
                repos_dir: repos_dir.path().to_owned(),
                monitor_period: Duration::from_millis(10),
                git_http_base_url: "http://localhost:9418".to_owned(),
            },
        );

        let (desc_tx, desc_rx) = mpsc::channel(8);
        let (_leader_tx, leader_rx) = watch::channel(LeaderEvent { leader_node: Some("test".to_owned()), is_self_leader: true });
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let ct = CancellationToken::new();

        let ct2 = ct.clone();
        let handle = tokio::spawn(async move { fetcher.run(desc_rx, leader_rx, out_tx, ct2).await });

        desc_tx
            .send(DescriptorEvent::new(descriptor("web1", &origin.url(), "master", "latest")))
            .await
            .unwrap();
        let _ = out_rx.recv().await.unwrap();

        // Several ticks with no new upstream commit must not repush
        // (step 3a: "If equal to c, return without pushing").
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(out_rx.try_recv().is_err());

        ct.cancel();
        handle.await.unwrap().unwrap();
    }
}
