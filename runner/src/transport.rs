//! Newline delimited JSON frames over TCP
//!
//! Each frame is one [`Envelope`] serialized on a single line of at most
//! [`MAX_FRAME_LENGTH`] bytes. Reading decodes lines with a [`LinesCodec`] out of a buffer
//! that survives cancellation, so a pending `receive` may sit inside a `select!` next to
//! timers and mailboxes without losing partial frames.

use crate::protocol::{Envelope, PROTOCOL_VERSION};
use bytes::BytesMut;
use serde::{de::DeserializeOwned, Serialize};
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::trace;

/// longest accepted frame, a status report of a few ten thousand tasks still fits
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame exceeds {0} bytes")]
    FrameTooLong(usize),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Errors that only concern a single frame; the connection itself is still usable
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_) | Self::FrameTooLong(_) | Self::VersionMismatch { .. }
        )
    }
}

/// Reading half of a framed connection
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
    buffer: BytesMut,
    codec: LinesCodec,
    max_length: usize,
    eof: bool,
}

impl FrameReader {
    fn new(inner: OwnedReadHalf, max_length: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            codec: LinesCodec::new_with_max_length(max_length),
            max_length,
            eof: false,
        }
    }

    /// Receive the next frame, `Ok(None)` once the peer closed the connection. An
    /// oversized frame is skipped up to its newline and reported as a protocol error.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let line = match self.next_line().await? {
            Some(line) => line,
            None => return Ok(None),
        };
        trace!(frame = %line, "Received frame");

        decode(&line).map(Some)
    }

    async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let decoded = if self.eof {
                self.codec.decode_eof(&mut self.buffer)
            } else {
                self.codec.decode(&mut self.buffer)
            };

            match decoded {
                Ok(Some(line)) => return Ok(Some(line)),
                Ok(None) if self.eof => return Ok(None),
                Ok(None) => {}
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Err(TransportError::FrameTooLong(self.max_length))
                }
                Err(LinesCodecError::Io(error)) => return Err(TransportError::Io(error)),
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                self.eof = true;
            }
        }
    }
}

/// Writing half of a framed connection
#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let mut frame = serde_json::to_vec(&Envelope::new(message))?;
        frame.push(b'\n');

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;

        Ok(())
    }
}

fn decode<T: DeserializeOwned>(line: &str) -> Result<T, TransportError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|error| TransportError::Malformed(error.to_string()))?;

    let actual = value
        .get("protocol_version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| TransportError::Malformed("missing protocol_version".to_string()))?;

    if actual != u64::from(PROTOCOL_VERSION) {
        return Err(TransportError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: u32::try_from(actual).unwrap_or(u32::MAX),
        });
    }

    serde_json::from_value::<Envelope<T>>(value)
        .map(|envelope| envelope.message)
        .map_err(|error| TransportError::Malformed(error.to_string()))
}

/// A framed TCP connection, used whole for request/response exchanges or split into
/// halves for sessions that read and write concurrently
#[derive(Debug)]
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    peer: SocketAddr,
}

impl Connection {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        Self::with_max_frame_length(stream, MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(
        stream: TcpStream,
        max_length: usize,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();

        Ok(Self {
            reader: FrameReader::new(read, max_length),
            writer: FrameWriter { inner: write },
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        self.writer.send(message).await
    }

    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        self.reader.receive().await
    }

    /// Receive the next frame within `timeout`, treating a closed connection as an error
    pub async fn expect<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(timeout, self.reader.receive()).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(TransportError::ConnectionClosed),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Send one request and await its response
    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &mut self,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, TransportError> {
        self.send(request).await?;
        self.expect(timeout).await
    }
}
