//! Length-delimited JSON framing over a byte stream.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// One framed IPC connection. Generic over the transport so tests can run on
/// an in-memory duplex instead of a real socket.
pub struct Connection<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            framed: Framed::new(transport, LengthDelimitedCodec::new()),
        }
    }

    /// Sends one message as a single frame.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> std::io::Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.framed.send(Bytes::from(payload)).await
    }

    /// Receives the next message, or `None` when the peer closed the stream.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> std::io::Result<Option<M>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(frame) => {
                let frame = frame?;
                Ok(Some(serde_json::from_slice(&frame)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, Response, ServiceStatus};

    #[tokio::test]
    async fn round_trips_messages_over_a_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Connection::new(client);
        let mut server = Connection::new(server);

        client.send(&Request::Ping).await.unwrap();
        client.send(&Request::List).await.unwrap();
        drop(client);

        assert_eq!(server.recv::<Request>().await.unwrap(), Some(Request::Ping));
        assert_eq!(server.recv::<Request>().await.unwrap(), Some(Request::List));
        assert_eq!(server.recv::<Request>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn responses_survive_the_frame_boundary() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = Connection::new(a);
        let mut rx = Connection::new(b);

        let sent = Response::List {
            services: vec![ServiceStatus {
                namespace: "demo".to_string(),
                name: "api".to_string(),
                status: "running".to_string(),
                ports: vec!["80:8080".to_string()],
                ..ServiceStatus::default()
            }],
        };
        tx.send(&sent).await.unwrap();

        assert_eq!(rx.recv::<Response>().await.unwrap(), Some(sent));
    }
}
