// ABOUTME: Top-level runner loop: fetch jobs, bound concurrency, drive sessions, report status
// ABOUTME: Maps every job-scoped failure to a best-effort report; nothing here kills the daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ScriptConfig};
use crate::connection::{Connection, Directive, ReportStatus};
use crate::job::{self, Job};
use crate::lxd::ContainerDriver;
use crate::session::{ExecutionSession, SessionState};
use crate::workspace::{self, Cloner};

/// The daemon's orchestration loop.
///
/// Each fetched job runs on its own task with its own session and clone
/// directory; the only thing jobs share are the immutable collaborators
/// behind `Arc`s. The loop never exits on a job failure, only on shutdown.
#[derive(Clone)]
pub struct Runner {
    connection: Arc<Connection>,
    driver: Arc<dyn ContainerDriver>,
    cloner: Arc<dyn Cloner>,
    shutdown: CancellationToken,
    token: String,
    repository_dir: PathBuf,
    profiles: Vec<String>,
    script_config: ScriptConfig,
    interval: Duration,
    instances: usize,
}

impl Runner {
    pub fn new(
        config: &Config,
        connection: Connection,
        driver: Arc<dyn ContainerDriver>,
        cloner: Arc<dyn Cloner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection: Arc::new(connection),
            driver,
            cloner,
            shutdown,
            token: config.runner.token.clone(),
            repository_dir: config.runner.repository_dir.clone(),
            profiles: config.lxd.profiles.clone(),
            script_config: config.script.clone(),
            interval: config.runner.interval(),
            instances: config.runner.instances,
        }
    }

    /// Poll the queue until shutdown, executing up to `instances` jobs at
    /// once. On shutdown, stops fetching and waits for in-flight jobs to
    /// finish their teardown.
    pub async fn run(&self) {
        let mut jobs: JoinSet<()> = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            // Reap finished workers so the live count stays accurate.
            while jobs.join_next().now_or_never().flatten().is_some() {}

            if jobs.len() >= self.instances {
                tokio::select! {
                    _ = jobs.join_next() => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            }

            let fetched = tokio::select! {
                fetched = self.connection.fetch_job(&self.token) => fetched,
                _ = self.shutdown.cancelled() => break,
            };

            match fetched {
                Err(err) => {
                    warn!(error = %err, "job fetch failed");
                    self.idle().await;
                }
                Ok(None) => {
                    debug!("no job available");
                    self.idle().await;
                }
                Ok(Some(payload)) => match job::parse(&payload) {
                    Ok(job) => {
                        let runner = self.clone();
                        jobs.spawn(async move { runner.execute(job).await });
                    }
                    Err(err) => {
                        match err.secret() {
                            Some(secret) => {
                                warn!(job = %secret, error = %err, "rejecting invalid job");
                                self.report_error(secret).await;
                            }
                            // Without a secret there is nowhere to report.
                            None => warn!(error = %err, "dropping unreportable job payload"),
                        }
                        self.idle().await;
                    }
                },
            }
        }

        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "waiting for running jobs to finish");
        }
        while jobs.join_next().await.is_some() {}
    }

    /// Sleep one polling interval, cut short by shutdown.
    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Run one job start to finish: clone, execute, stream reports, tear
    /// down, and send the terminal status.
    async fn execute(&self, job: Job) {
        let secret = job.secret.clone();

        let clone_dir = match workspace::prepare(&self.repository_dir, &secret) {
            Ok(dir) => dir,
            Err(err) => {
                error!(job = %secret, error = %err, "failed to prepare workspace");
                self.report_error(&secret).await;
                return;
            }
        };

        if let Err(err) = Cloner::clone_into(&*self.cloner, &job.repository, &clone_dir).await {
            warn!(job = %secret, error = %err, "repository clone failed");
            self.report_error(&secret).await;
            return;
        }

        let mut session = ExecutionSession::new(
            self.driver.clone(),
            job,
            clone_dir,
            self.profiles.clone(),
            self.script_config.clone(),
        );

        if let Err(err) = session.start().await {
            error!(job = %secret, error = %err, "failed to start execution session");
            self.report_error(&secret).await;
            return;
        }

        // Interleave bounded polls with RUNNING reports until the job
        // completes, the coordinator tells us to stop, or reporting dies.
        let mut halted = false;
        while session.state() == SessionState::Running {
            if self.shutdown.is_cancelled() {
                info!(job = %secret, "shutdown requested, abandoning job");
                halted = true;
                break;
            }

            session.poll(self.interval).await;
            if session.state() != SessionState::Running {
                break;
            }

            let log = session.pop_output();
            match self
                .connection
                .report(&secret, ReportStatus::Running, Some(log))
                .await
            {
                Ok(Directive::Ok) => {}
                Ok(directive) => {
                    info!(job = %secret, %directive, "coordinator stopped the job");
                    halted = true;
                    break;
                }
                Err(err) => {
                    error!(job = %secret, error = %err, "giving up on status reports");
                    halted = true;
                    break;
                }
            }
        }

        let final_output = session.pop_output();
        let state = session.state();

        if state == SessionState::Completed {
            match session.exit_code().await {
                Ok(code) => debug!(job = %secret, exit_code = code, "job script finished"),
                Err(err) => debug!(job = %secret, error = %err, "exit code unavailable"),
            }
        }

        let teardown = session.close().await;
        if let Err(err) = &teardown {
            error!(job = %secret, error = %err, "session teardown failed");
        }

        // A non-OK directive (or dead reporting) means the coordinator no
        // longer wants updates for this job.
        if halted {
            return;
        }

        if state == SessionState::Error || teardown.is_err() {
            self.report_error(&secret).await;
        } else if let Err(err) = self
            .connection
            .report(&secret, ReportStatus::Completed, Some(final_output))
            .await
        {
            warn!(job = %secret, error = %err, "failed to report job completion");
        }
    }

    /// Best-effort ERROR report; failures end up in the log only.
    async fn report_error(&self, secret: &str) {
        if let Err(err) = self
            .connection
            .report(secret, ReportStatus::Error, None)
            .await
        {
            warn!(job = %secret, error = %err, "failed to report job error");
        }
    }
}
