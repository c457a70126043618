//! The CLI side of the IPC protocol. Every call opens its own connection;
//! the daemon handles one request per connection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixStream;

use crate::{codec::Connection, ConsoleLevel, Request, Response, ServiceStatus};

/// How long to wait for the daemon to accept a connection or answer a unary
/// call before declaring it unreachable.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    path: PathBuf,
}

impl Client {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Whether a daemon socket exists at all. A stale file still returns
    /// true; use [`Client::ping`] to check for a live daemon.
    pub fn socket_exists(&self) -> bool {
        self.path.exists()
    }

    async fn connect(&self) -> Result<Connection<UnixStream>> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(&self.path))
            .await
            .context("timed out connecting to the localizer daemon")?
            .context("failed to connect to the localizer daemon")?;
        Ok(Connection::new(stream))
    }

    async fn unary(&self, request: Request) -> Result<Response> {
        let mut conn = self.connect().await?;
        conn.send(&request).await?;
        let response = tokio::time::timeout(DIAL_TIMEOUT, conn.recv::<Response>())
            .await
            .context("timed out waiting for the daemon to respond")??;
        match response {
            None => bail!("daemon closed the connection without responding"),
            Some(Response::Error { message }) => bail!(message),
            Some(response) => Ok(response),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.unary(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => bail!("unexpected response to ping: {other:?}"),
        }
    }

    pub async fn list(&self) -> Result<Vec<ServiceStatus>> {
        match self.unary(Request::List).await? {
            Response::List { services } => Ok(services),
            other => bail!("unexpected response to list: {other:?}"),
        }
    }

    pub async fn stable(&self) -> Result<bool> {
        match self.unary(Request::Stable).await? {
            Response::Stable { stable } => Ok(stable),
            other => bail!("unexpected response to stable: {other:?}"),
        }
    }

    pub async fn kill(&self) -> Result<()> {
        match self.unary(Request::Kill).await? {
            Response::Ok => Ok(()),
            other => bail!("unexpected response to kill: {other:?}"),
        }
    }

    /// Issues a streaming request, invoking `on_line` for every console
    /// message until the daemon terminates the stream.
    pub async fn stream(
        &self,
        request: Request,
        mut on_line: impl FnMut(ConsoleLevel, &str),
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.send(&request).await?;

        loop {
            match conn.recv::<Response>().await? {
                None | Some(Response::Ok) => return Ok(()),
                Some(Response::Error { message }) => bail!(message),
                Some(Response::Console { level, message }) => on_line(level, &message),
                Some(other) => bail!("unexpected response in stream: {other:?}"),
            }
        }
    }
}
