// ABOUTME: Container driver contract consumed by the execution session
// ABOUTME: Defines lifecycle operations, exec handles, and duplex output channels

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::job::ImageSource;

pub mod client;

pub use client::LxdClient;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("unexpected api response: {0}")]
    UnexpectedResponse(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("tls setup error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Everything needed to create a job's container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub source: ImageSource,
    pub profiles: Vec<String>,
    /// Bind-mount exposing the cloned repository inside the container.
    pub repository: RepositoryMount,
}

#[derive(Debug, Clone)]
pub struct RepositoryMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// One of the three duplex byte channels negotiated by an exec request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFd {
    Stdin,
    Stdout,
    Stderr,
}

impl ChannelFd {
    pub fn index(self) -> &'static str {
        match self {
            ChannelFd::Stdin => "0",
            ChannelFd::Stdout => "1",
            ChannelFd::Stderr => "2",
        }
    }
}

/// Handle to a remote exec operation: the operation id used to query the
/// final return code, plus the per-channel websocket secrets.
#[derive(Debug, Clone)]
pub struct ExecHandle {
    pub operation_id: String,
    pub fds: HashMap<String, String>,
}

impl ExecHandle {
    pub fn secret(&self, fd: ChannelFd) -> Result<&str> {
        self.fds
            .get(fd.index())
            .map(String::as_str)
            .ok_or_else(|| {
                DriverError::UnexpectedResponse(format!(
                    "exec operation is missing channel secret for fd {}",
                    fd.index()
                ))
            })
    }
}

/// Receiving side of one output channel.
///
/// The driver's reader task pushes raw frames into `receiver` and drops the
/// sender on graceful close (zero-length frame) or transport failure, which
/// ends the stream. `close` asks the reader to shut the channel down from
/// our side; the stdin channel is closed this way immediately after opening
/// since the script never reads input.
#[derive(Debug)]
pub struct ByteChannel {
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    closer: Option<oneshot::Sender<()>>,
}

impl ByteChannel {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
        closer: oneshot::Sender<()>,
    ) -> Self {
        Self {
            receiver,
            closer: Some(closer),
        }
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }

    /// Channel pair for drivers whose frames come from a local task: the
    /// producer half plus the close signal the consumer can raise.
    pub fn pair() -> (
        mpsc::UnboundedSender<Vec<u8>>,
        oneshot::Receiver<()>,
        ByteChannel,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        (tx, close_rx, ByteChannel::new(rx, close_tx))
    }
}

/// Contract over the remote container API.
///
/// All calls are synchronous from the session's perspective; channel reads
/// happen on background tasks owned by the driver.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container; it exists but is not running afterwards.
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Run `command` inside the container with three websocket-backed byte
    /// channels instead of inline capture.
    async fn exec(
        &self,
        name: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<ExecHandle>;

    /// Open one of an exec operation's negotiated channels.
    async fn open_channel(&self, exec: &ExecHandle, fd: ChannelFd) -> Result<ByteChannel>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Wait for an exec operation to finish and return its exit code.
    async fn wait_operation(&self, operation_id: &str) -> Result<i64>;
}
