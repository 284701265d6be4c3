// ABOUTME: Execution session owning one container's full lifecycle for one job
// ABOUTME: Wires exec output channels into the shared buffer and tracks completion

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ScriptConfig;
use crate::job::Job;
use crate::lxd::{
    ByteChannel, ChannelFd, ContainerDriver, ContainerSpec, DriverError, ExecHandle,
    RepositoryMount,
};
use crate::output::OutputBuffer;
use crate::script;

/// How long each poll slice sleeps before rechecking for completion.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("container driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("container teardown failed for {container}: {source}")]
    Teardown {
        container: String,
        source: DriverError,
    },

    #[error("session has no exec operation")]
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Error,
}

/// Counting registry of a session's live output channels.
///
/// Both channel forwarders register on start and deregister when their
/// stream ends; the set reaching empty is the session's completion signal.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelSet {
    live: Arc<AtomicUsize>,
}

impl ChannelSet {
    fn add(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    fn remove(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_empty(&self) -> bool {
        self.live.load(Ordering::SeqCst) == 0
    }
}

/// One container executing one job's compiled script.
///
/// The container's lifetime is bounded by this session: it is created by
/// [`start`] and destroyed by [`close`], which must run on every path that
/// got past creation. `start` tears down after itself when it fails midway.
///
/// [`start`]: ExecutionSession::start
/// [`close`]: ExecutionSession::close
pub struct ExecutionSession {
    driver: Arc<dyn ContainerDriver>,
    job: Job,
    repository_path: PathBuf,
    profiles: Vec<String>,
    script_config: ScriptConfig,
    state: SessionState,
    container: Option<String>,
    exec: Option<ExecHandle>,
    buffer: OutputBuffer,
    channels: ChannelSet,
}

impl ExecutionSession {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        job: Job,
        repository_path: PathBuf,
        profiles: Vec<String>,
        script_config: ScriptConfig,
    ) -> Self {
        Self {
            driver,
            job,
            repository_path,
            profiles,
            script_config,
            state: SessionState::Created,
            container: None,
            exec: None,
            buffer: OutputBuffer::new(),
            channels: ChannelSet::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Create and start the container, then exec the compiled script with
    /// its output channels wired into the session buffer.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let name = format!("kiln-{}", Uuid::new_v4().simple());
        let spec = ContainerSpec {
            name: name.clone(),
            source: self.job.image_source(),
            profiles: self.profiles.clone(),
            repository: RepositoryMount {
                host_path: self.repository_path.clone(),
                container_path: self.script_config.workdir.clone(),
            },
        };

        if let Err(err) = self.driver.create(&spec).await {
            self.state = SessionState::Error;
            return Err(err.into());
        }
        self.container = Some(name.clone());

        match self.wire(&name).await {
            Ok(exec) => {
                self.exec = Some(exec);
                self.state = SessionState::Running;
                info!(container = %name, job = %self.job.secret, "job container started");
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Error;
                if let Err(teardown) = self.close().await {
                    error!(
                        container = %name,
                        error = %teardown,
                        "teardown after failed start also failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn wire(&mut self, name: &str) -> Result<ExecHandle, SessionError> {
        self.driver.start(name).await?;

        let compiled = script::compile(&self.job, &self.script_config);
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), compiled];
        let exec = self
            .driver
            .exec(name, command, self.job.env.clone())
            .await?;

        // The script never reads stdin; open the channel so the operation
        // starts, then shut it straight down.
        let mut stdin = self.driver.open_channel(&exec, ChannelFd::Stdin).await?;
        stdin.close();

        for fd in [ChannelFd::Stdout, ChannelFd::Stderr] {
            let channel = self.driver.open_channel(&exec, fd).await?;
            self.channels.add();
            tokio::spawn(forward(channel, self.buffer.clone(), self.channels.clone()));
        }

        Ok(exec)
    }

    /// Wait up to `timeout` for the job to finish, in bounded slices.
    ///
    /// Returns the moment both output channels have closed (state moves to
    /// `Completed`) and never later than `timeout`, so the caller can
    /// interleave status reports while the job is still running.
    pub async fn poll(&mut self, timeout: Duration) {
        if self.state != SessionState::Running {
            return;
        }

        let mut remaining = timeout;
        loop {
            if self.channels.is_empty() {
                self.state = SessionState::Completed;
                return;
            }
            if remaining.is_zero() {
                return;
            }
            let nap = POLL_SLICE.min(remaining);
            tokio::time::sleep(nap).await;
            remaining = remaining.saturating_sub(nap);
        }
    }

    /// Drain everything the channels produced since the previous drain.
    pub fn pop_output(&self) -> String {
        self.buffer.pop()
    }

    /// The script's exit code, from the exec operation's final result.
    /// Informational only; a nonzero code is not a session error.
    pub async fn exit_code(&self) -> Result<i64, SessionError> {
        let exec = self.exec.as_ref().ok_or(SessionError::NotStarted)?;
        Ok(self.driver.wait_operation(&exec.operation_id).await?)
    }

    /// Tear the container down: best-effort stop, then delete.
    ///
    /// A stop failure is tolerated (the container may already be stopped);
    /// a delete failure is escalated since it leaks a resource. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let Some(name) = self.container.take() else {
            return Ok(());
        };

        if let Err(err) = self.driver.stop(&name).await {
            warn!(container = %name, error = %err, "container stop failed, deleting anyway");
        }

        match self.driver.delete(&name).await {
            Ok(()) => {
                debug!(container = %name, "container deleted");
                Ok(())
            }
            Err(source) => Err(SessionError::Teardown {
                container: name,
                source,
            }),
        }
    }
}

/// Pump one channel into the shared buffer until its stream ends, then
/// leave the completion set.
async fn forward(mut channel: ByteChannel, buffer: OutputBuffer, channels: ChannelSet) {
    while let Some(data) = channel.receiver.recv().await {
        buffer.handle_chunk(&String::from_utf8_lossy(&data));
    }
    channels.remove();
}
