//! Transport abstraction module
//!
//! Turns TCP and WebSocket connections into a stream of frames so the rest of
//! the server never sees raw socket bytes:
//! - TCP: each frame is a little-endian `u16` length followed by the payload
//! - WebSocket: each binary message is exactly one frame
//!
//! A connection is split into a [`FrameReader`] owned by the dispatch loop and
//! a [`FrameWriter`] owned by the writer task draining the session's queue.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::{NetworkError, RealmError, Result};

/// Size of the length prefix on TCP frames
pub const LENGTH_PREFIX: usize = 2;

/// Read chunk size for TCP
const READ_CHUNK: usize = 4096;

/// Prefix a payload with its length
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        RealmError::Network(NetworkError::FrameTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        })
    })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.put_u16_le(len);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split one complete frame off the front of `buffer`, if there is one
pub fn split_frame(
    buffer: &mut BytesMut,
    max_frame_size: usize,
) -> std::result::Result<Option<Bytes>, NetworkError> {
    if buffer.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u16::from_le_bytes([buffer[0], buffer[1]]) as usize;
    if len > max_frame_size {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    if buffer.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    buffer.advance(LENGTH_PREFIX);
    Ok(Some(buffer.split_to(len).freeze()))
}

/// Read half of a connection
pub enum FrameReader {
    Tcp {
        stream: OwnedReadHalf,
        buffer: BytesMut,
        max_frame_size: usize,
    },
    WebSocket {
        stream: SplitStream<WebSocketStream<TcpStream>>,
        max_frame_size: usize,
    },
}

impl FrameReader {
    /// Next frame, `None` once the peer has closed the connection
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        match self {
            Self::Tcp {
                stream,
                buffer,
                max_frame_size,
            } => loop {
                if let Some(frame) = split_frame(buffer, *max_frame_size)? {
                    trace!(len = frame.len(), "Received TCP frame");
                    return Ok(Some(frame));
                }
                buffer.reserve(READ_CHUNK);
                let read = stream
                    .read_buf(buffer)
                    .await
                    .map_err(|e| RealmError::Network(NetworkError::ReadError(e.to_string())))?;
                if read == 0 {
                    if !buffer.is_empty() {
                        debug!(pending = buffer.len(), "Connection closed mid-frame");
                    }
                    return Ok(None);
                }
            },
            Self::WebSocket {
                stream,
                max_frame_size,
            } => loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > *max_frame_size {
                            return Err(RealmError::Network(NetworkError::FrameTooLarge {
                                size: data.len(),
                                max: *max_frame_size,
                            }));
                        }
                        trace!(len = data.len(), "Received binary WebSocket message");
                        return Ok(Some(Bytes::from(data)));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket close message received");
                        return Ok(None);
                    }
                    // Pings are answered by tungstenite on the next write
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(_))) | Some(Ok(Message::Frame(_))) => {
                        warn!("Ignoring non-binary WebSocket message");
                    }
                    Some(Err(e)) => {
                        return Err(RealmError::Network(NetworkError::WebSocket(e.to_string())));
                    }
                }
            },
        }
    }
}

/// Write half of a connection
pub enum FrameWriter {
    Tcp(OwnedWriteHalf),
    WebSocket(SplitSink<WebSocketStream<TcpStream>, Message>),
}

impl FrameWriter {
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            Self::Tcp(stream) => {
                let framed = frame(payload)?;
                stream
                    .write_all(&framed)
                    .await
                    .map_err(|e| RealmError::Network(NetworkError::WriteError(e.to_string())))
            }
            Self::WebSocket(sink) => sink
                .send(Message::Binary(payload.to_vec()))
                .await
                .map_err(|e| RealmError::Network(NetworkError::WebSocket(e.to_string()))),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Tcp(stream) => stream
                .shutdown()
                .await
                .map_err(|e| RealmError::Network(NetworkError::WriteError(e.to_string()))),
            Self::WebSocket(sink) => sink
                .close()
                .await
                .map_err(|e| RealmError::Network(NetworkError::WebSocket(e.to_string()))),
        }
    }
}

/// A framed connection, before it is split
pub enum UnifiedTransport {
    Tcp(TcpStream),
    WebSocket(WebSocketStream<TcpStream>),
}

impl UnifiedTransport {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }

    /// Upgrade a TCP stream to a WebSocket connection
    pub async fn accept_websocket(stream: TcpStream) -> Result<Self> {
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| RealmError::Network(NetworkError::WebSocket(e.to_string())))?;
        Ok(Self::WebSocket(ws_stream))
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::WebSocket(_))
    }

    pub fn split(self, max_frame_size: usize) -> (FrameReader, FrameWriter) {
        match self {
            Self::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (
                    FrameReader::Tcp {
                        stream: read,
                        buffer: BytesMut::with_capacity(READ_CHUNK),
                        max_frame_size,
                    },
                    FrameWriter::Tcp(write),
                )
            }
            Self::WebSocket(stream) => {
                let (sink, stream) = stream.split();
                (
                    FrameReader::WebSocket {
                        stream,
                        max_frame_size,
                    },
                    FrameWriter::WebSocket(sink),
                )
            }
        }
    }
}

/// Drain a session's outbound queue onto the wire until the queue closes
pub async fn run_writer(mut writer: FrameWriter, mut outbound_rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            debug!(error = %e, "Writer stopped");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_prefixes_length() {
        let framed = frame(&[7, 8, 9]).unwrap();
        assert_eq!(framed, vec![3, 0, 7, 8, 9]);
    }

    #[test]
    fn test_split_frame_waits_for_full_frame() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[3, 0, 1]);
        assert_eq!(split_frame(&mut buffer, 64).unwrap(), None);

        buffer.extend_from_slice(&[2, 3, 1, 0, 9]);
        assert_eq!(
            split_frame(&mut buffer, 64).unwrap(),
            Some(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(
            split_frame(&mut buffer, 64).unwrap(),
            Some(Bytes::from_static(&[9]))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_split_frame_rejects_oversized() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[200, 0]);
        assert!(matches!(
            split_frame(&mut buffer, 100),
            Err(NetworkError::FrameTooLarge {
                size: 200,
                max: 100
            })
        ));
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_, mut writer) = UnifiedTransport::tcp(stream).split(64);
            writer.write_frame(&[1, 2]).await.unwrap();
            writer.write_frame(&[3]).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = UnifiedTransport::tcp(stream).split(64);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Bytes::from_static(&[1, 2]))
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Bytes::from_static(&[3]))
        );
        assert_eq!(reader.read_frame().await.unwrap(), None);
        client.await.unwrap();
    }
}
