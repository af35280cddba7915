use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use super::git::{GitBundleInstaller, GitRepository};
use super::{BundleSink, ProcessSupervisor};

const JOB_PREFIX: &str = "app/";
const JOB_SUFFIX: &str = ".conf";

pub fn job_key(app: &str, branch: &str) -> String {
    format!("{}{}/{}", JOB_PREFIX, app, branch)
}

/// `start/running, process 123` → running.
pub fn parse_status(output: &str) -> bool {
    let state = output.split(',').next().unwrap_or_default().trim();
    let mut parts = state.split('/');
    matches!((parts.next(), parts.next()), (Some("start"), Some("running")))
}

/// `(app, branch)` pairs of every `app/<app>/<branch>.conf` job.
pub fn parse_job_list(listing: &str) -> Vec<(String, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let job = line
                .trim()
                .strip_prefix(JOB_PREFIX)?
                .strip_suffix(JOB_SUFFIX)?;
            let (app, branch) = job.split_once('/')?;
            Some((app.to_string(), branch.to_string()))
        })
        .collect()
}

/// Apps run as upstart jobs named `app/<app>/<branch>`.
///
/// Working copies live in `apps_dir/<app>`.
pub struct UpstartSupervisor {
    apps_dir: PathBuf,
    init_dir: PathBuf,
}

impl UpstartSupervisor {
    pub fn new(apps_dir: impl Into<PathBuf>) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            init_dir: PathBuf::from("/etc/init"),
        }
    }

    fn working_copy(&self, app: &str) -> GitRepository {
        GitRepository::new(self.apps_dir.join(app))
    }

    async fn initctl(&self, verb: &str, job: &str) -> Result<String> {
        debug!("{} {}", verb, job);
        let output = Command::new(verb)
            .arg(job)
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", verb, job))?;
        if !output.status.success() {
            bail!(
                "Failed to {} the app: {}",
                verb,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn is_running(&self, app: &str, branch: &str) -> Result<bool> {
        let output = self.initctl("status", &job_key(app, branch)).await?;
        Ok(parse_status(&output))
    }

    async fn jobs(&self) -> Result<Vec<(String, String)>> {
        let mut entries = match tokio::fs::read_dir(&self.init_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // Job confs are nested one directory deep: app/<app>/<branch>.conf
        let mut listing = String::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() != "app" || !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut apps = tokio::fs::read_dir(entry.path()).await?;
            while let Some(app) = apps.next_entry().await? {
                if !app.file_type().await?.is_dir() {
                    continue;
                }
                let mut branches = tokio::fs::read_dir(app.path()).await?;
                while let Some(branch) = branches.next_entry().await? {
                    listing.push_str(&format!(
                        "{}{}/{}\n",
                        JOB_PREFIX,
                        app.file_name().to_string_lossy(),
                        branch.file_name().to_string_lossy()
                    ));
                }
            }
        }
        Ok(parse_job_list(&listing))
    }

    /// Running state of every branch of every app.
    pub async fn all_statuses(&self) -> Result<BTreeMap<String, BTreeMap<String, bool>>> {
        let mut statuses: BTreeMap<String, BTreeMap<String, bool>> = BTreeMap::new();
        for (app, branch) in self.jobs().await? {
            let running = self.is_running(&app, &branch).await?;
            statuses.entry(app).or_default().insert(branch, running);
        }
        Ok(statuses)
    }
}

#[async_trait]
impl ProcessSupervisor for UpstartSupervisor {
    async fn start(&self, app: &str, branch: &str) -> Result<()> {
        if self.is_running(app, branch).await.unwrap_or(false) {
            debug!("{} is already running", job_key(app, branch));
            return Ok(());
        }
        self.initctl("start", &job_key(app, branch)).await?;
        info!("Started {}", job_key(app, branch));
        Ok(())
    }

    async fn stop(&self, app: &str, branch: &str) -> Result<()> {
        self.initctl("stop", &job_key(app, branch)).await?;
        info!("Stopped {}", job_key(app, branch));
        Ok(())
    }

    async fn remove(&self, app: &str) -> Result<()> {
        match self.all_statuses().await {
            Ok(statuses) => {
                for (branch, running) in statuses.get(app).into_iter().flatten() {
                    if *running {
                        self.stop(app, branch).await?;
                    }
                }
            }
            Err(e) => warn!("Could not list jobs of {}: {}", app, e),
        }
        let dir = self.apps_dir.join(app);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("Removed working copy {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn get_current_version(&self, app: &str) -> Result<Option<String>> {
        self.working_copy(app).rev_parse("HEAD").await
    }

    async fn installed_apps(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.apps_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut apps = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                apps.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        apps.sort();
        Ok(apps)
    }

    async fn create_bundle_installer(&self, app: &str) -> Result<Box<dyn BundleSink>> {
        tokio::fs::create_dir_all(&self.apps_dir).await?;
        Ok(Box::new(GitBundleInstaller::new(self.working_copy(app))))
    }
}
