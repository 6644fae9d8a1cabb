use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;
use url::Url;

use crate::compression::{Compression, Decompressor};
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial the gateway and wrap the socket in a [`Connection`].
///
/// Dial failures and timeouts are recoverable; the reconnect loop retries.
pub(crate) async fn connect(
    url: &Url,
    connect_timeout: Duration,
    compression: Compression,
) -> Result<Connection, Error> {
    let (stream, response) = timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| Error::ConnectTimeout)??;
    trace!(status = %response.status(), "WebSocket handshake complete");
    Ok(Connection::new(stream, compression.decompressor()))
}

/// One live duplex socket.
///
/// Reads are exclusive to the read loop (the reader lock enforces this
/// rather than trusting callers). The writer lock doubles as the shard's
/// send mutex: every outbound frame, from any task, serializes through it.
/// The decompression context lives as long as the connection.
pub struct Connection {
    reader: Mutex<SplitStream<WsStream>>,
    writer: Mutex<SplitSink<WsStream, Message>>,
    codec: Mutex<Box<dyn Decompressor>>,
}

impl Connection {
    fn new(stream: WsStream, codec: Box<dyn Decompressor>) -> Self {
        let (writer, reader) = stream.split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            codec: Mutex::new(codec),
        }
    }

    /// Read one message payload, decompressing binary frames.
    ///
    /// Control frames are skipped (the transport answers pings itself). A
    /// close frame from the peer surfaces as [`Error::Close`] carrying the
    /// peer's code, which is what close classification inspects.
    pub async fn read(&self) -> Result<Vec<u8>, Error> {
        let mut reader = self.reader.lock().await;
        loop {
            let message = reader
                .next()
                .await
                .ok_or(Error::WebSocket(WsError::ConnectionClosed))??;
            match message {
                Message::Text(text) => return Ok(text.into_bytes()),
                Message::Binary(data) => return self.codec.lock().await.decompress(&data),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (1005, String::new()),
                    };
                    return Err(Error::Close { code, reason });
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    /// Write one text frame. Callers hold no other lock; ordering across
    /// tasks is exactly writer-lock acquisition order.
    pub async fn write(&self, body: String) -> Result<(), Error> {
        self.writer
            .lock()
            .await
            .send(Message::Text(body))
            .await
            .map_err(Error::from)
    }

    /// Initiate a protocol-level close with the given code. Idempotent:
    /// closing an already-closed socket is not an error.
    pub async fn close_with_code(&self, code: u16) -> Result<(), Error> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        match self.writer.lock().await.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
