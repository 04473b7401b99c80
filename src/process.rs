use std::process::Output;

use anyhow::{bail, Context};
#[allow(unused_imports)]
use log::debug;

// Extension trait shared by tokio::process::Command and our GitCommand
// wrapper: run the command to completion and fail loudly (including stderr)
// if it didn't exit successfully. Callers who need to inspect the exit code
// themselves (e.g. to special-case Git's "128 means no such rev" behaviour)
// should use plain .output() instead.
pub trait CommandExt {
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for tokio::process::Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {:?}", self.as_std()))?;
        output.ok().with_context(|| format!("running {:?}", self.as_std()))?;
        Ok(output)
    }
}

pub trait OutputExt {
    // Ok(()) if the process exited successfully, otherwise an error
    // containing stderr.
    fn ok(&self) -> anyhow::Result<()>;
}

impl OutputExt for Output {
    fn ok(&self) -> anyhow::Result<()> {
        if self.status.success() {
            return Ok(());
        }
        bail!(
            "exited with {}, stderr:\n{}",
            self.status,
            String::from_utf8_lossy(&self.stderr)
        );
    }
}
