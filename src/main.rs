mod bundle;
mod config;
mod coordinator;
mod descriptor;
mod fetcher;
mod git;
mod githttp;
mod kv;
mod leader;
mod process;
mod pusher;
mod tracker;
mod util;
mod watcher;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use flexi_logger::Logger;
use tokio_util::sync::CancellationToken;

use config::{Args, Config};
use coordinator::Coordinator;
use git::ShellGitBackend;
use kv::ConsulKv;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    Logger::try_with_env_or_str("info")
        .context("configuring logger")?
        .start()
        .context("starting logger")?;

    let config = Config::load(&args)?;
    let kv = Arc::new(ConsulKv::new(&config.consul_address));
    let git = Arc::new(ShellGitBackend::default());
    let coordinator = Coordinator::new(kv, git, config);

    let ct = CancellationToken::new();
    let ct_signal = ct.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ct_signal.cancel();
    });

    coordinator.run(ct).await
}
