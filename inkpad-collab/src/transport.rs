//! Duplex transport primitive between a session and a collaboration server.
//!
//! A [`DuplexChannel`] is a pair of byte pipes: `send` pushes an encoded
//! protocol frame toward the server, `recv` yields incoming frames, and a
//! closed channel is observed as `recv() -> None` (or a send error). The
//! [`Transport`] trait abstracts how such a channel is established so the
//! session engine runs identically over a real WebSocket, the in-process
//! server connector, or a test double.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport-level errors. All of these are transient from the session's
/// point of view: they feed the reconnect state machine and never escape it.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Establishing the connection failed
    Connect(String),
    /// The channel is closed
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connect error: {e}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A live duplex byte channel to a collaboration server.
pub struct DuplexChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl DuplexChannel {
    /// Create two connected ends. Frames sent on one end are received on
    /// the other.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }

    /// Send one frame. Fails once the peer end is gone.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Receive the next frame; `None` means the channel closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Clone of the outgoing sender, for send paths that outlive a borrow
    /// of the channel.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    /// Split into raw halves.
    pub fn into_parts(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.tx, self.rx)
    }
}

/// How a session establishes its duplex channel for a document.
pub trait Transport: Send + Sync + 'static {
    /// Initiate a connection attempt for `doc_id`.
    fn connect(&self, doc_id: Uuid) -> BoxFuture<'static, Result<DuplexChannel, TransportError>>;
}

/// Production transport: WebSocket client connection to a sync server.
///
/// Spawns reader/writer tasks that pump binary frames between the socket
/// and the duplex channel; either side closing tears both down.
pub struct WebSocketTransport {
    server_url: String,
    capacity: usize,
}

impl WebSocketTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            capacity: 256,
        }
    }

    pub fn with_capacity(server_url: impl Into<String>, capacity: usize) -> Self {
        Self {
            server_url: server_url.into(),
            capacity,
        }
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, doc_id: Uuid) -> BoxFuture<'static, Result<DuplexChannel, TransportError>> {
        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), doc_id);
        let capacity = self.capacity;

        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (bridge, endpoint) = DuplexChannel::pair(capacity);
            let (incoming_tx, mut outgoing_rx) = bridge.into_parts();

            // Writer task: forward session frames to the socket
            tokio::spawn(async move {
                while let Some(frame) = outgoing_rx.recv().await {
                    if ws_writer
                        .send(tokio_tungstenite::tungstenite::Message::Binary(frame.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                let _ = ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Close(None))
                    .await;
            });

            // Reader task: forward binary frames to the session
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            if incoming_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                            break;
                        }
                        _ => {}
                    }
                }
                // Dropping incoming_tx surfaces the close as recv() -> None
            });

            Ok(endpoint)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_directions() {
        let (a, mut b) = DuplexChannel::pair(8);

        a.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![1, 2, 3]));

        b.send(vec![4, 5]).await.unwrap();
        let mut a = a;
        assert_eq!(a.recv().await, Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (a, mut b) = DuplexChannel::pair(8);
        drop(a);
        assert_eq!(b.recv().await, None);
        assert!(b.send(vec![0]).await.is_err());
    }

    #[tokio::test]
    async fn test_sender_outlives_borrow() {
        let (a, mut b) = DuplexChannel::pair(8);
        let tx = a.sender();
        drop(a);
        // The cloned sender still feeds the other end
        tx.send(vec![9]).await.unwrap();
        assert_eq!(b.recv().await, Some(vec![9]));
    }

    #[tokio::test]
    async fn test_ws_connect_refused() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1");
        let result = transport.connect(Uuid::new_v4()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
