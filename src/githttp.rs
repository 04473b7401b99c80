// The Git-over-HTTP collaborator surface (spec §6), grounded on githttp.go.
// The source ran a handwritten smart-HTTP handler; here we mount the repos
// directory as a static file tree with tower-http and let any standard Git
// client talk `--dumb-http` to it, which satisfies "downstream nodes can
// clone this node's local copies" without reimplementing the smart-HTTP
// pack-negotiation protocol (an explicit non-goal, see SPEC_FULL.md §6).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use log::info;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

/// Serves `repos_dir` (one bare clone per app, as laid out by the Fetcher)
/// over plain HTTP until `ct` is cancelled.
pub async fn serve(addr: SocketAddr, repos_dir: PathBuf, ct: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().fallback_service(ServeDir::new(&repos_dir));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding git-http listener on {addr}"))?;
    info!("githttp: serving {} on {addr}", repos_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .context("git-http server")?;
    Ok(())
}
