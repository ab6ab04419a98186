//! Git command-line collaborator
//!
//! Runs `git -C <repo> ...` through `tokio::process`. Repository identifiers
//! are resolved against `repositories_root` when configured, otherwise they
//! are used as paths directly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    check_ref, BranchInfo, BridgeError, CommitInfo, ConflictReport, FetchInfo, MergeInfo,
    PullInfo, PushInfo, TagInfo, VersionControl,
};
use crate::workflow::GitConfig;

#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
    repositories_root: Option<PathBuf>,
}

struct GitOutput {
    stdout: String,
    code: Option<i32>,
}

impl GitCli {
    /// Locate `git` on PATH
    pub fn new() -> Result<Self, BridgeError> {
        Self::from_config(&GitConfig::default())
    }

    pub fn from_config(config: &GitConfig) -> Result<Self, BridgeError> {
        let binary = match &config.binary {
            Some(binary) => binary.clone(),
            None => which::which("git")
                .map_err(|e| BridgeError::ConfigError(format!("git not found on PATH: {}", e)))?,
        };

        Ok(Self {
            binary,
            repositories_root: config.repositories_root.clone(),
        })
    }

    fn repo_path(&self, repository: &str) -> PathBuf {
        match &self.repositories_root {
            Some(root) => root.join(repository),
            None => PathBuf::from(repository),
        }
    }

    /// Run git and return stdout; non-zero exit is an error
    async fn git(&self, repo: &Path, args: &[&str]) -> Result<String, BridgeError> {
        let output = self.git_raw(repo, args).await?;
        Ok(output.stdout)
    }

    async fn git_raw(&self, repo: &Path, args: &[&str]) -> Result<GitOutput, BridgeError> {
        self.run(repo, args, false).await
    }

    /// Run git, tolerating exit code 1 (used by merge-tree)
    async fn git_allow_one(&self, repo: &Path, args: &[&str]) -> Result<GitOutput, BridgeError> {
        self.run(repo, args, true).await
    }

    async fn run(&self, repo: &Path, args: &[&str], allow_one: bool) -> Result<GitOutput, BridgeError> {
        debug!("git -C {} {}", repo.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .arg("-C")
            .arg(repo)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if output.status.success() || (allow_one && code == Some(1)) {
            return Ok(GitOutput { stdout, code });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(BridgeError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            code,
            stderr: if stderr.is_empty() { stdout } else { stderr },
        })
    }

    async fn head(&self, repo: &Path) -> Result<String, BridgeError> {
        self.git(repo, &["rev-parse", "HEAD"]).await
    }

    async fn current_branch(&self, repo: &Path) -> Result<String, BridgeError> {
        self.git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn create_branch(
        &self,
        repository: &str,
        branch: &str,
        base: Option<&str>,
    ) -> Result<BranchInfo, BridgeError> {
        check_ref("branch", branch)?;
        let repo = self.repo_path(repository);
        let mut args = vec!["checkout", "-b", branch];
        if let Some(base) = base {
            check_ref("base", base)?;
            args.push(base);
        }
        self.git(&repo, &args).await?;
        info!("Created branch {} in {}", branch, repository);

        Ok(BranchInfo {
            repository: repository.to_string(),
            branch: branch.to_string(),
            base: base.map(str::to_string),
            commit: self.head(&repo).await.ok(),
        })
    }

    async fn checkout(&self, repository: &str, branch: &str) -> Result<BranchInfo, BridgeError> {
        check_ref("branch", branch)?;
        let repo = self.repo_path(repository);
        self.git(&repo, &["checkout", branch, "--"]).await?;

        Ok(BranchInfo {
            repository: repository.to_string(),
            branch: branch.to_string(),
            base: None,
            commit: self.head(&repo).await.ok(),
        })
    }

    async fn commit(
        &self,
        repository: &str,
        message: &str,
        files: &[String],
    ) -> Result<CommitInfo, BridgeError> {
        let repo = self.repo_path(repository);

        if files.is_empty() {
            self.git(&repo, &["add", "--all"]).await?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend(files.iter().map(String::as_str));
            self.git(&repo, &args).await?;
        }

        self.git(&repo, &["commit", "-m", message]).await?;
        let sha = self.head(&repo).await?;
        info!("Committed {} in {}", sha, repository);

        Ok(CommitInfo {
            repository: repository.to_string(),
            branch: self.current_branch(&repo).await?,
            sha,
            message: message.to_string(),
        })
    }

    async fn push(
        &self,
        repository: &str,
        branch: &str,
        remote: &str,
    ) -> Result<PushInfo, BridgeError> {
        check_ref("remote", remote)?;
        check_ref("branch", branch)?;
        let repo = self.repo_path(repository);
        self.git(&repo, &["push", "--set-upstream", remote, branch]).await?;

        Ok(PushInfo {
            repository: repository.to_string(),
            branch: branch.to_string(),
            remote: remote.to_string(),
        })
    }

    async fn merge(
        &self,
        repository: &str,
        source: &str,
        target: &str,
    ) -> Result<MergeInfo, BridgeError> {
        check_ref("source", source)?;
        check_ref("target", target)?;
        let repo = self.repo_path(repository);
        self.git(&repo, &["checkout", target, "--"]).await?;

        let message = format!("Merge {} into {}", source, target);
        if let Err(e) = self.git(&repo, &["merge", "--no-ff", "-m", &message, source]).await {
            // Leave the working tree clean for the next step
            let _ = self.git_raw(&repo, &["merge", "--abort"]).await;
            return Err(e);
        }

        Ok(MergeInfo {
            repository: repository.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            sha: self.head(&repo).await?,
        })
    }

    async fn conflicts(
        &self,
        repository: &str,
        source: &str,
        target: &str,
    ) -> Result<ConflictReport, BridgeError> {
        check_ref("source", source)?;
        check_ref("target", target)?;
        let repo = self.repo_path(repository);
        let output = self
            .git_allow_one(
                &repo,
                &["merge-tree", "--write-tree", "--name-only", target, source],
            )
            .await?;

        Ok(ConflictReport {
            repository: repository.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            has_conflicts: output.code == Some(1),
            files: parse_conflicted_files(&output.stdout, output.code == Some(1)),
        })
    }

    async fn pull(
        &self,
        repository: &str,
        branch: &str,
        remote: &str,
    ) -> Result<PullInfo, BridgeError> {
        check_ref("remote", remote)?;
        check_ref("branch", branch)?;
        let repo = self.repo_path(repository);

        let before = self.head(&repo).await.ok();
        self.git(&repo, &["pull", "--ff-only", remote, branch]).await?;
        let head = self.head(&repo).await?;

        let commits = match &before {
            Some(before) if before != &head => {
                let range = format!("{}..{}", before, head);
                self.git(&repo, &["rev-list", "--count", &range])
                    .await?
                    .parse()
                    .unwrap_or_default()
            }
            Some(_) => 0,
            None => self
                .git(&repo, &["rev-list", "--count", "HEAD"])
                .await?
                .parse()
                .unwrap_or_default(),
        };
        info!("Pulled {} commit(s) into {} of {}", commits, branch, repository);

        Ok(PullInfo {
            repository: repository.to_string(),
            branch: branch.to_string(),
            remote: remote.to_string(),
            updated: before.as_deref() != Some(head.as_str()),
            commits,
            head: Some(head),
        })
    }

    async fn fetch(&self, repository: &str, remote: &str) -> Result<FetchInfo, BridgeError> {
        check_ref("remote", remote)?;
        let repo = self.repo_path(repository);
        self.git(&repo, &["fetch", "--prune", remote]).await?;

        Ok(FetchInfo {
            repository: repository.to_string(),
            remote: remote.to_string(),
        })
    }

    async fn tag(
        &self,
        repository: &str,
        tag: &str,
        message: Option<&str>,
    ) -> Result<TagInfo, BridgeError> {
        check_ref("tag", tag)?;
        let repo = self.repo_path(repository);
        match message {
            Some(message) => self.git(&repo, &["tag", "-a", "-m", message, tag]).await?,
            None => self.git(&repo, &["tag", tag]).await?,
        };
        let commit = self.head(&repo).await?;
        info!("Tagged {} as {} in {}", commit, tag, repository);

        Ok(TagInfo {
            repository: repository.to_string(),
            tag: tag.to_string(),
            commit,
            message: message.map(str::to_string),
        })
    }
}

/// `merge-tree --name-only` prints the tree id, then conflicted paths until
/// a blank line, then informational messages
fn parse_conflicted_files(stdout: &str, conflicted: bool) -> Vec<String> {
    if !conflicted {
        return Vec::new();
    }
    let mut files: Vec<String> = stdout
        .lines()
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .collect();
    files.dedup();
    files
}
