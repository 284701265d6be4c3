// ABOUTME: Shared test doubles: scripted container driver and cloner stubs
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_runner::job::{Job, Repository};
use kiln_runner::lxd::{
    ByteChannel, ChannelFd, ContainerDriver, ContainerSpec, DriverError, ExecHandle, Result,
};
use kiln_runner::workspace::{CloneError, Cloner};

/// Scripted output for one channel: delays before each chunk, plus how long
/// the channel stays open after the last chunk.
#[derive(Debug, Clone, Default)]
pub struct ChannelScript {
    pub chunks: Vec<(Duration, String)>,
    pub linger: Duration,
}

impl ChannelScript {
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            chunks: lines
                .iter()
                .map(|line| (Duration::from_millis(10), format!("{line}\n")))
                .collect(),
            linger: Duration::ZERO,
        }
    }

    pub fn silent_for(linger: Duration) -> Self {
        Self {
            chunks: Vec::new(),
            linger,
        }
    }
}

/// Container driver that plays back scripted channel output instead of
/// talking to a remote API. Records every lifecycle call for assertions.
#[derive(Default)]
pub struct FakeDriver {
    pub stdout: ChannelScript,
    pub stderr: ChannelScript,
    pub exit_code: i64,
    pub fail_create: bool,
    pub fail_exec: bool,
    pub fail_delete: bool,
    pub created: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub exec_commands: Mutex<Vec<Vec<String>>>,
    pub stdin_closed: Arc<AtomicBool>,
}

impl FakeDriver {
    pub fn with_output(stdout: ChannelScript, stderr: ChannelScript) -> Self {
        Self {
            stdout,
            stderr,
            ..Default::default()
        }
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn stopped_names(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        if self.fail_create {
            return Err(DriverError::Api {
                code: 500,
                message: "create refused".to_string(),
            });
        }
        self.created.lock().unwrap().push(spec.name.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.started.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _name: &str,
        command: Vec<String>,
        _env: HashMap<String, String>,
    ) -> Result<ExecHandle> {
        if self.fail_exec {
            return Err(DriverError::Api {
                code: 500,
                message: "exec refused".to_string(),
            });
        }
        self.exec_commands.lock().unwrap().push(command);

        let fds = ["0", "1", "2"]
            .into_iter()
            .map(|fd| (fd.to_string(), format!("secret-{fd}")))
            .collect();
        Ok(ExecHandle {
            operation_id: "op-1".to_string(),
            fds,
        })
    }

    async fn open_channel(&self, _exec: &ExecHandle, fd: ChannelFd) -> Result<ByteChannel> {
        let (tx, mut close_rx, channel) = ByteChannel::pair();

        if fd == ChannelFd::Stdin {
            let closed = self.stdin_closed.clone();
            tokio::spawn(async move {
                if close_rx.await.is_ok() {
                    closed.store(true, Ordering::SeqCst);
                }
                drop(tx);
            });
            return Ok(channel);
        }

        let script = match fd {
            ChannelFd::Stdout => self.stdout.clone(),
            _ => self.stderr.clone(),
        };

        tokio::spawn(async move {
            for (delay, chunk) in script.chunks {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if tx.send(chunk.into_bytes()).is_err() {
                            return;
                        }
                    }
                    _ = &mut close_rx => return,
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(script.linger) => {}
                _ = &mut close_rx => {}
            }
            // Dropping the sender ends the stream, like a graceful close.
        });

        Ok(channel)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.fail_delete {
            return Err(DriverError::Api {
                code: 500,
                message: "delete refused".to_string(),
            });
        }
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn wait_operation(&self, _operation_id: &str) -> Result<i64> {
        Ok(self.exit_code)
    }
}

/// Cloner that succeeds without touching git.
pub struct NoopCloner;

#[async_trait]
impl Cloner for NoopCloner {
    async fn clone_into(
        &self,
        _repository: &Repository,
        _dest: &Path,
    ) -> std::result::Result<(), CloneError> {
        Ok(())
    }
}

/// Cloner that always fails.
pub struct FailingCloner;

#[async_trait]
impl Cloner for FailingCloner {
    async fn clone_into(
        &self,
        _repository: &Repository,
        _dest: &Path,
    ) -> std::result::Result<(), CloneError> {
        Err(CloneError::Command {
            stage: "clone",
            stderr: "fatal: repository not found".to_string(),
        })
    }
}

/// Minimal valid job for session-level tests.
pub fn job(secret: &str, commands: &[&str]) -> Job {
    Job {
        secret: secret.to_string(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        after_failure: Vec::new(),
        image: "alpine/3.20".to_string(),
        env: HashMap::new(),
        repository: Repository {
            origin: "https://example.com/repo.git".to_string(),
            branch: "main".to_string(),
            commit: "e7a4739755a81a06242bc3249e36b133b3783f9b".to_string(),
            private_keys: Vec::new(),
        },
    }
}

/// Wire-format job payload matching [`job`].
pub fn job_payload(secret: &str, commands: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "secret": secret,
        "commands": commands,
        "image": "alpine/3.20",
        "repository": {
            "origin": "https://example.com/repo.git",
            "branch": "main",
            "commit": "e7a4739755a81a06242bc3249e36b133b3783f9b",
        },
    })
}
