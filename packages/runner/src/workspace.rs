// ABOUTME: Per-job clone directories and the git clone wrapper
// ABOUTME: Pins the checkout to the job's commit and initializes submodules

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::job::Repository;

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("failed to create workspace directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to run git: {0}")]
    Spawn(std::io::Error),

    #[error("git {stage} failed: {stderr}")]
    Command { stage: &'static str, stderr: String },
}

/// Create the clone directory for a job, keyed by its secret.
pub fn prepare(repository_dir: &Path, secret: &str) -> Result<PathBuf, CloneError> {
    let path = repository_dir.join(secret);
    std::fs::create_dir_all(&path).map_err(|source| CloneError::CreateDir {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Clones a job's repository into its workspace directory.
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn clone_into(&self, repository: &Repository, dest: &Path) -> Result<(), CloneError>;
}

/// Clones by shelling out to the `git` binary: clone the branch, hard-reset
/// to the pinned commit, then pull in submodules. SSH deploy keys, when the
/// job carries them, are passed through `GIT_SSH_COMMAND`.
pub struct GitCloner;

#[async_trait]
impl Cloner for GitCloner {
    async fn clone_into(&self, repository: &Repository, dest: &Path) -> Result<(), CloneError> {
        let ssh_command = ssh_command(repository);

        debug!(
            origin = %repository.origin,
            commit = %repository.commit,
            dest = %dest.display(),
            "cloning repository"
        );

        run_git(
            "clone",
            &[
                "clone",
                "--branch",
                &repository.branch,
                &repository.origin,
                ".",
            ],
            dest,
            ssh_command.as_deref(),
        )
        .await?;
        run_git(
            "reset",
            &["reset", "--hard", &repository.commit],
            dest,
            ssh_command.as_deref(),
        )
        .await?;
        run_git(
            "submodule update",
            &["submodule", "update", "--init", "--recursive"],
            dest,
            ssh_command.as_deref(),
        )
        .await?;

        Ok(())
    }
}

fn ssh_command(repository: &Repository) -> Option<String> {
    if repository.private_keys.is_empty() {
        return None;
    }

    let mut command = String::from("ssh -o StrictHostKeyChecking=no");
    for key in &repository.private_keys {
        command.push_str(&format!(" -i {}", key.display()));
    }
    Some(command)
}

async fn run_git(
    stage: &'static str,
    args: &[&str],
    cwd: &Path,
    ssh_command: Option<&str>,
) -> Result<(), CloneError> {
    let mut command = Command::new("git");
    command.args(args).current_dir(cwd);
    if let Some(ssh) = ssh_command {
        command.env("GIT_SSH_COMMAND", ssh);
    }

    let output = command.output().await.map_err(CloneError::Spawn)?;
    if !output.status.success() {
        return Err(CloneError::Command {
            stage,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
