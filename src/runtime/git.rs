use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::task::{ready, Context as TaskContext, Poll};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::{BundleSink, BundleStream, CodebaseProvider};
use crate::remote::RemoteUpdate;
use crate::types::VersionPair;

/// Thin wrapper running `git` inside one directory.
#[derive(Debug, Clone)]
pub struct GitRepository {
    dir: PathBuf,
}

impl GitRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(".git").exists() || self.dir.join("HEAD").is_file()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.dir).kill_on_drop(true);
        cmd
    }

    /// Run git with `args` and return its trimmed stdout.
    pub async fn exec(&self, args: &[&str]) -> Result<String> {
        debug!("git {} (in {})", args.join(" "), self.dir.display());
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn init(&self, bare: bool) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        if bare {
            self.exec(&["init", "--bare", "--quiet"]).await?;
        } else {
            self.exec(&["init", "--quiet"]).await?;
        }
        Ok(())
    }

    pub async fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        let mut args = vec!["fetch", "--quiet", remote];
        args.extend(refspecs.iter().map(String::as_str));
        self.exec(&args).await.map(|_| ())
    }

    pub async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.exec(&["reset", "--hard", "--quiet", rev]).await.map(|_| ())
    }

    pub async fn clean(&self, directories: bool) -> Result<()> {
        if directories {
            self.exec(&["clean", "-f", "-d"]).await.map(|_| ())
        } else {
            self.exec(&["clean", "-f"]).await.map(|_| ())
        }
    }

    /// Resolve `rev`, `None` when it does not exist.
    pub async fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        if !self.exists() {
            return Ok(None);
        }
        let output = self
            .command()
            .args(["rev-parse", "--verify", "--quiet", rev])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(sha).filter(|s| !s.is_empty()))
    }

    /// Point `HEAD` at `target` unless it already does.
    pub async fn point_head_at(&self, target: &str) -> Result<()> {
        if self.exec(&["symbolic-ref", "HEAD"]).await.ok().as_deref() == Some(target) {
            return Ok(());
        }
        self.exec(&["symbolic-ref", "HEAD", target]).await.map(|_| ())
    }

    /// `git bundle create - <revs>...` writing the bundle to stdout.
    pub fn bundle_create(&self, revs: &[String]) -> Result<Child> {
        self.command()
            .args(["bundle", "create", "-"])
            .args(revs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn git bundle create")
    }

    /// `git bundle unbundle` reading the bundle from stdin.
    pub fn bundle_unbundle(&self) -> Result<Child> {
        self.command()
            .args(["bundle", "unbundle", "/dev/stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn git bundle unbundle")
    }
}

/// Map ref name → sha from `sha ref-name` lines.
pub fn parse_bundle_heads(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let sha = cols.next()?;
            let name = cols.next()?;
            Some((name.to_string(), sha.to_string()))
        })
        .collect()
}

/// Stdout of a child process.
///
/// End of output only reads as EOF once the child exited successfully;
/// otherwise the final read fails with the child's status and stderr.
pub struct ChildOutput {
    stdout: ChildStdout,
    exit: Option<JoinHandle<io::Result<Output>>>,
    name: &'static str,
}

impl ChildOutput {
    pub fn new(mut child: Child, name: &'static str) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{} has no stdout", name))?;
        Ok(Self {
            stdout,
            exit: Some(tokio::spawn(child.wait_with_output())),
            name,
        })
    }
}

impl AsyncRead for ChildOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let filled = buf.filled().len();
        ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > filled || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let name = self.name;
        let Some(exit) = self.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let joined = ready!(Pin::new(exit).poll(cx));
        self.exit = None;
        let output = joined.map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        if output.status.success() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} exited with {}: {}",
                    name,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )))
        }
    }
}

/// Apps kept as bare repositories under one directory.
pub struct GitCodebase {
    root: PathBuf,
    branch: String,
}

impl GitCodebase {
    pub fn new(root: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            branch: branch.into(),
        }
    }

    pub fn repository(&self, app: &str) -> GitRepository {
        GitRepository::new(self.root.join(app))
    }

    /// Fetch the branches announced by a push notification.
    pub async fn apply_update(&self, update: &RemoteUpdate) -> Result<()> {
        let app = update
            .slug()
            .ok_or_else(|| anyhow!("Cannot derive an app name from {}", update.url))?;
        let repo = self.repository(&app);
        if !repo.exists() {
            info!("Creating repository for {} at {}", app, repo.dir().display());
            repo.init(true).await?;
        }
        let refspecs: Vec<String> = update
            .branches
            .keys()
            .map(|branch| format!("+refs/heads/{0}:refs/heads/{0}", branch))
            .collect();
        repo.fetch(&update.url, &refspecs).await?;
        for (branch, commit) in &update.branches {
            match repo.rev_parse(&format!("refs/heads/{}", branch)).await? {
                Some(tip) if &tip == commit => {}
                tip => warn!(
                    "{}: branch {} is at {:?}, notification announced {}",
                    app, branch, tip, commit
                ),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CodebaseProvider for GitCodebase {
    async fn get_current_version(&self, app: &str) -> Result<Option<String>> {
        self.repository(app)
            .rev_parse(&format!("refs/heads/{}", self.branch))
            .await
    }

    async fn create_bundle_stream(&self, app: &str, bundle: &VersionPair) -> Result<BundleStream> {
        let repo = self.repository(app);
        if !repo.exists() {
            bail!("Unknown app {}", app);
        }
        let branch = format!("refs/heads/{}", self.branch);
        let tip = repo
            .rev_parse(&branch)
            .await?
            .ok_or_else(|| anyhow!("{} has no branch {}", app, self.branch))?;
        if tip != bundle.target() {
            bail!("{} {} moved to {}, cannot send {}", app, self.branch, tip, bundle);
        }
        // Installers reset to the bundle's HEAD.
        repo.point_head_at(&branch).await?;

        let mut revs = vec!["HEAD".to_string(), branch];
        if let Some(base) = bundle.base() {
            if repo.rev_parse(&format!("{}^{{commit}}", base)).await?.is_some() {
                revs.push(format!("^{}", base));
            } else {
                warn!("{}: unknown base {}, sending full history", app, base);
            }
        }
        debug!("Bundling {} {}", app, revs.join(" "));
        let child = repo.bundle_create(&revs)?;
        Ok(Box::new(ChildOutput::new(child, "git bundle create")?))
    }
}

/// Pipes bundle bytes into `git bundle unbundle` and resets to its `HEAD`.
pub struct GitBundleInstaller {
    repo: GitRepository,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl GitBundleInstaller {
    pub fn new(repo: GitRepository) -> Self {
        Self {
            repo,
            child: None,
            stdin: None,
        }
    }

    async fn stdin(&mut self) -> Result<&mut ChildStdin> {
        if self.stdin.is_none() {
            if !self.repo.exists() {
                self.repo.init(false).await?;
            }
            let mut child = self.repo.bundle_unbundle()?;
            self.stdin = child.stdin.take();
            self.child = Some(child);
        }
        self.stdin
            .as_mut()
            .ok_or_else(|| anyhow!("git bundle unbundle has no stdin"))
    }
}

#[async_trait]
impl BundleSink for GitBundleInstaller {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.stdin().await?.write_all(chunk).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let child = self
            .child
            .take()
            .ok_or_else(|| anyhow!("Empty bundle, nothing to install"))?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "git bundle unbundle failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let heads = parse_bundle_heads(&String::from_utf8_lossy(&output.stdout));
        let head = heads
            .get("HEAD")
            .ok_or_else(|| anyhow!("Bundle declares no HEAD"))?;
        self.repo.reset_hard(head).await?;
        self.repo.clean(true).await?;
        info!("{} reset to {}", self.repo.dir().display(), head);
        Ok(())
    }
}
