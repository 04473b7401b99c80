// Git collaborator: the primitives this crate treats as delegated to "the
// Git object backend" in the spec (clone, fetch, tag/commit resolution, tree
// walk), plus the newtypes used to talk about the results. Shells out to the
// system `git` binary, in the same spirit as a production checkout tool that
// doesn't want to vendor libgit2 bindings for a handful of plumbing commands.

use core::fmt;
use core::fmt::{Debug, Display};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Write as _;
use std::ops::Deref;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str;
use std::sync::LazyLock;

use anyhow::{anyhow, bail, Context as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::bundle::SnapshotBundle;
use crate::process::CommandExt as _;

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Hash(String);

impl Hash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl AsRef<OsStr> for Hash {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(self.0.as_bytes())
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// A Hash is an ID for referring to an object in a git repository. It's
// infallible to construct: having one doesn't guarantee the object actually
// exists in any particular repo, so callers have to handle that error at the
// point of use just like with any other mutable database.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Caps the number of concurrently running git child processes, so a cluster
// config with hundreds of applications doesn't exhaust file descriptors when
// every sub-agent happens to fetch at once.
static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

/// Primitives this crate delegates to the Git object backend: clone, fetch,
/// commit/tag resolution, and tree walking. A production binary wires this to
/// [`ShellGitBackend`]; tests wire it to an on-disk fixture repo created with
/// the real `git` binary (see [`test_utils`]) since faking plumbing output
/// faithfully is more effort than just using Git.
pub trait GitBackend: Debug + Send + Sync {
    // Clone `remote_url`, fetching only `branch`, into a bare repository at
    // `dest`. `dest`'s parent must already exist; `dest` itself must not.
    async fn clone_single_branch(&self, remote_url: &str, branch: &str, dest: &Path) -> anyhow::Result<()>;

    // Add `branch` to the set of branches fetched from `origin` and point
    // HEAD at it. No-op if already configured this way.
    async fn set_branch(&self, repo_dir: &Path, branch: &str) -> anyhow::Result<()>;

    // Fetch `branch` from `origin` and fast-forward (or create)
    // `refs/heads/<branch>` to match. Returns the new tip.
    async fn fetch_branch(&self, repo_dir: &Path, branch: &str) -> anyhow::Result<CommitHash>;

    // Resolve `refs/tags/<tag>`, peeling annotated tags down to a commit.
    async fn resolve_tag(&self, repo_dir: &Path, tag: &str) -> anyhow::Result<CommitHash>;

    // Confirm `rev` names an object reachable in this repo and return its
    // canonical (40-char) form.
    async fn resolve_commit(&self, repo_dir: &Path, rev: &str) -> anyhow::Result<CommitHash>;

    // Pre-order walk of commit's root tree, producing path -> blob bytes.
    // Submodule (gitlink) and symlink entries are skipped; tree entries
    // contribute only their path components.
    async fn walk_tree(&self, repo_dir: &Path, commit: &CommitHash) -> anyhow::Result<SnapshotBundle>;
}

#[derive(Debug, Clone)]
pub struct ShellGitBackend {
    pub git_binary: PathBuf,
}

impl Default for ShellGitBackend {
    fn default() -> Self {
        Self {
            git_binary: PathBuf::from("git"),
        }
    }
}

impl ShellGitBackend {
    async fn run(
        &self,
        repo_dir: &Path,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    ) -> anyhow::Result<std::process::Output> {
        let _permit = COMMAND_SEM.acquire().await.unwrap();
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg("--git-dir").arg(repo_dir);
        cmd.args(args);
        cmd.execute().await
    }
}

impl GitBackend for ShellGitBackend {
    async fn clone_single_branch(&self, remote_url: &str, branch: &str, dest: &Path) -> anyhow::Result<()> {
        let _permit = COMMAND_SEM.acquire().await.unwrap();
        let mut cmd = Command::new(&self.git_binary);
        cmd.args(["clone", "--bare", "--single-branch", "--branch"])
            .arg(branch)
            .arg(remote_url)
            .arg(dest);
        cmd.execute()
            .await
            .with_context(|| format!("cloning {remote_url} (branch {branch}) into {dest:?}"))?;
        Ok(())
    }

    async fn set_branch(&self, repo_dir: &Path, branch: &str) -> anyhow::Result<()> {
        self.run(repo_dir, ["remote", "set-branches", "--add", "origin", branch])
            .await
            .with_context(|| format!("adding branch {branch} to fetch refspec"))?;
        let target = format!("refs/heads/{branch}");
        self.run(repo_dir, ["symbolic-ref", "HEAD", &target])
            .await
            .with_context(|| format!("pointing HEAD at {target}"))?;
        Ok(())
    }

    async fn fetch_branch(&self, repo_dir: &Path, branch: &str) -> anyhow::Result<CommitHash> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        self.run(repo_dir, ["fetch", "origin", &refspec])
            .await
            .with_context(|| format!("fetching {branch} from origin"))?;
        let tip = self
            .resolve_commit(repo_dir, &format!("refs/remotes/origin/{branch}"))
            .await?;
        self.run(
            repo_dir,
            ["update-ref", &format!("refs/heads/{branch}"), tip.as_ref()],
        )
        .await
        .with_context(|| format!("fast-forwarding refs/heads/{branch}"))?;
        Ok(tip)
    }

    async fn resolve_tag(&self, repo_dir: &Path, tag: &str) -> anyhow::Result<CommitHash> {
        self.run(repo_dir, ["fetch", "origin", "tag", tag, "--no-tags"])
            .await
            .with_context(|| format!("fetching tag {tag}"))?;
        self.resolve_commit(repo_dir, &format!("refs/tags/{tag}^{{commit}}")).await
    }

    async fn resolve_commit(&self, repo_dir: &Path, rev: &str) -> anyhow::Result<CommitHash> {
        let output = self
            .run(repo_dir, ["rev-parse", "--verify", rev])
            .await
            .with_context(|| format!("resolving {rev:?}"))?;
        let out_str = str::from_utf8(&output.stdout)
            .context("non-utf8 rev-parse output")?
            .trim();
        Ok(CommitHash::new(out_str))
    }

    async fn walk_tree(&self, repo_dir: &Path, commit: &CommitHash) -> anyhow::Result<SnapshotBundle> {
        let ls_tree = self
            .run(repo_dir, ["ls-tree", "-r", "-z", "--full-tree", commit.as_ref()])
            .await
            .with_context(|| format!("listing tree for {commit}"))?;
        let listing = str::from_utf8(&ls_tree.stdout).context("non-utf8 ls-tree output")?;

        let mut blob_oids = Vec::new();
        let mut paths = Vec::new();
        for entry in listing.split('\0').filter(|e| !e.is_empty()) {
            // Format: "<mode> <type> <oid>\t<path>"
            let (meta, path) = entry
                .split_once('\t')
                .ok_or_else(|| anyhow!("malformed ls-tree entry {entry:?}"))?;
            let mut meta_parts = meta.split(' ');
            let mode = meta_parts.next().ok_or_else(|| anyhow!("missing mode in {entry:?}"))?;
            let obj_type = meta_parts.next().ok_or_else(|| anyhow!("missing type in {entry:?}"))?;
            let oid = meta_parts.next().ok_or_else(|| anyhow!("missing oid in {entry:?}"))?;

            // Skip gitlinks (submodules, type "commit") and symlinks (mode
            // 120000); only plain blobs become bundle entries.
            if obj_type != "blob" || mode == "120000" {
                continue;
            }
            blob_oids.push(oid.to_owned());
            paths.push(path.to_owned());
        }

        let contents = self.cat_file_batch(repo_dir, &blob_oids).await?;
        let mut bundle = BTreeMap::new();
        for (path, oid) in paths.into_iter().zip(blob_oids.iter()) {
            let bytes = contents
                .get(oid)
                .ok_or_else(|| anyhow!("cat-file --batch didn't return {oid}"))?
                .clone();
            bundle.insert(path, bytes);
        }
        Ok(SnapshotBundle::from(bundle))
    }
}

impl ShellGitBackend {
    // Runs `git cat-file --batch` once, feeding it every requested oid on
    // stdin, and returns their raw contents keyed by oid. Batching avoids
    // spawning one process per blob in a large tree.
    async fn cat_file_batch(
        &self,
        repo_dir: &Path,
        oids: &[String],
    ) -> anyhow::Result<std::collections::HashMap<String, Vec<u8>>> {
        let mut result = std::collections::HashMap::new();
        if oids.is_empty() {
            return Ok(result);
        }

        let _permit = COMMAND_SEM.acquire().await.unwrap();
        let mut cmd = Command::new(&self.git_binary);
        cmd.arg("--git-dir")
            .arg(repo_dir)
            .args(["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("spawning git cat-file --batch")?;

        let mut stdin = child.stdin.take().expect("stdin requested");
        let mut input = String::new();
        for oid in oids {
            input.push_str(oid);
            input.push('\n');
        }
        stdin
            .write_all(input.as_bytes())
            .await
            .context("writing oids to cat-file stdin")?;
        drop(stdin);

        let mut stdout = child.stdout.take().expect("stdout requested");
        let mut buf = Vec::new();
        stdout
            .read_to_end(&mut buf)
            .await
            .context("reading cat-file output")?;

        let status = child.wait().await.context("waiting for cat-file")?;
        if !status.success() {
            bail!("git cat-file --batch exited with {status}");
        }

        // Each record is "<oid> <type> <size>\n<content>\n".
        let mut cursor = 0usize;
        while cursor < buf.len() {
            let header_end = buf[cursor..]
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| anyhow!("truncated cat-file header"))?
                + cursor;
            let header = str::from_utf8(&buf[cursor..header_end]).context("non-utf8 cat-file header")?;
            let mut parts = header.split(' ');
            let oid = parts.next().ok_or_else(|| anyhow!("missing oid in header {header:?}"))?;
            let _obj_type = parts.next();
            let size: usize = parts
                .next()
                .ok_or_else(|| anyhow!("missing size in header {header:?}"))?
                .parse()
                .context("parsing cat-file size")?;
            let content_start = header_end + 1;
            let content_end = content_start + size;
            result.insert(oid.to_owned(), buf[content_start..content_end].to_vec());
            cursor = content_end + 1; // skip the trailing newline after content.
        }
        Ok(result)
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use tempfile::TempDir;

    // A throwaway repo created with the real `git` binary, used as the
    // "remote" end of clone_single_branch/fetch_branch in tests.
    #[derive(Debug)]
    pub struct TempRepo {
        pub dir: TempDir,
        git_binary: PathBuf,
    }

    impl TempRepo {
        pub async fn new() -> anyhow::Result<Self> {
            let dir = TempDir::with_prefix("confd-fixture-").expect("couldn't make tempdir");
            let zelf = Self {
                dir,
                git_binary: PathBuf::from("git"),
            };
            zelf.git(["init", "-b", "master"]).await?;
            zelf.git(["config", "user.email", "test@example.com"]).await?;
            zelf.git(["config", "user.name", "test"]).await?;
            Ok(zelf)
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        pub fn url(&self) -> String {
            format!("file://{}", self.dir.path().display())
        }

        async fn git(
            &self,
            args: impl IntoIterator<Item = impl AsRef<OsStr>>,
        ) -> anyhow::Result<std::process::Output> {
            let mut cmd = Command::new(&self.git_binary);
            cmd.current_dir(self.dir.path()).args(args);
            cmd.execute().await
        }

        pub async fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()> {
            let full = self.dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::File::create(&full)?;
            f.write_all(contents.as_bytes())?;
            Ok(())
        }

        pub async fn commit(&self, message: &str) -> anyhow::Result<CommitHash> {
            self.git(["add", "-A"]).await?;
            self.git(["commit", "-m", message, "--allow-empty"]).await?;
            let output = self.git(["rev-parse", "HEAD"]).await?;
            Ok(CommitHash::new(str::from_utf8(&output.stdout)?.trim().to_owned()))
        }

        pub async fn tag(&self, name: &str) -> anyhow::Result<()> {
            self.git(["tag", name]).await?;
            Ok(())
        }
    }
}
