//! Message framing over byte streams and in-process pipes.
//!
//! A [`Codec`] moves whole [`Message`]s: `send` writes one frame, `recv`
//! blocks until the next message is available. A batch frame is yielded one
//! message per `recv` in send order. The clean end of a stream, and any use
//! after `close`, surface as [`WireError::ConnectionClosed`].

use crate::error::{WireError, WireResult};
use crate::message::{decode_frame, decode_length, encode_message, Frame, Message};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

/// Maximum frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A bidirectional message channel.
#[async_trait]
pub trait Codec: Send + Sync + 'static {
    /// Write one frame.
    async fn send(&self, frame: Frame) -> WireResult<()>;

    /// Wait for the next message.
    async fn recv(&self) -> WireResult<Message>;

    /// Close the channel. Pending and later `recv`s fail with `ConnectionClosed`.
    async fn close(&self) -> WireResult<()>;

    /// Remote socket address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// ---------------------------------------------------------------------------
// In-process pipe
// ---------------------------------------------------------------------------

/// One end of an in-process duplex pipe. Messages are passed without
/// serialization.
pub struct PipeCodec {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: Arc<watch::Sender<bool>>,
}

/// Create two connected pipe ends.
pub fn pipe() -> (PipeCodec, PipeCodec) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);
    let a = PipeCodec {
        tx: a_tx,
        rx: Mutex::new(b_rx),
        closed: closed.clone(),
    };
    let b = PipeCodec {
        tx: b_tx,
        rx: Mutex::new(a_rx),
        closed,
    };
    (a, b)
}

#[async_trait]
impl Codec for PipeCodec {
    async fn send(&self, frame: Frame) -> WireResult<()> {
        if *self.closed.borrow() {
            return Err(WireError::ConnectionClosed);
        }
        for message in frame.into_messages() {
            self.tx
                .send(message)
                .map_err(|_| WireError::ConnectionClosed)?;
        }
        Ok(())
    }

    async fn recv(&self) -> WireResult<Message> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(WireError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(WireError::ConnectionClosed),
            message = rx.recv() => message.ok_or(WireError::ConnectionClosed),
        }
    }

    async fn close(&self) -> WireResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Byte streams
// ---------------------------------------------------------------------------

/// How frames are delimited on a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 4-byte big-endian length header followed by the JSON body.
    LengthPrefixed,
    /// One JSON value per line, as spoken by Ethereum node IPC sockets.
    Lines,
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ReadState {
    inner: BufReader<BoxReader>,
    queue: VecDeque<Message>,
}

/// Codec over any split async byte stream.
pub struct IoCodec {
    framing: Framing,
    reader: Mutex<ReadState>,
    writer: Mutex<BoxWriter>,
    closed: watch::Sender<bool>,
    peer_addr: Option<SocketAddr>,
}

impl IoCodec {
    pub fn new<R, W>(reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            framing,
            reader: Mutex::new(ReadState {
                inner: BufReader::new(Box::new(reader)),
                queue: VecDeque::new(),
            }),
            writer: Mutex::new(Box::new(writer)),
            closed,
            peer_addr: None,
        }
    }

    /// Length-prefixed codec over a TCP connection, remembering the peer address.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let mut codec = Self::new(reader, writer, Framing::LengthPrefixed);
        codec.peer_addr = peer_addr;
        codec
    }

    /// Codec over a unix domain socket, e.g. a node's IPC endpoint.
    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream, framing: Framing) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, framing)
    }

    fn encode(&self, frame: &Frame) -> WireResult<Vec<u8>> {
        match self.framing {
            Framing::LengthPrefixed => {
                let bytes = encode_message(frame)?;
                let size = (bytes.len() - 4) as u32;
                if size > MAX_MESSAGE_SIZE {
                    return Err(WireError::MessageTooLarge {
                        size,
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                Ok(bytes)
            }
            Framing::Lines => {
                let mut bytes = serde_json::to_vec(frame)?;
                bytes.push(b'\n');
                Ok(bytes)
            }
        }
    }
}

async fn read_frame(reader: &mut BufReader<BoxReader>, framing: Framing) -> WireResult<Frame> {
    match framing {
        Framing::LengthPrefixed => {
            let mut header = [0u8; 4];
            reader.read_exact(&mut header).await.map_err(io_error)?;
            let len = decode_length(&header);
            if len > MAX_MESSAGE_SIZE {
                return Err(WireError::MessageTooLarge {
                    size: len,
                    max: MAX_MESSAGE_SIZE,
                });
            }
            let mut body = vec![0u8; len as usize];
            reader.read_exact(&mut body).await.map_err(io_error)?;
            Ok(decode_frame(&body)?)
        }
        Framing::Lines => {
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await.map_err(io_error)?;
                if n == 0 {
                    return Err(WireError::ConnectionClosed);
                }
                if line.len() as u64 > MAX_MESSAGE_SIZE as u64 {
                    return Err(WireError::MessageTooLarge {
                        size: line.len() as u32,
                        max: MAX_MESSAGE_SIZE,
                    });
                }
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return Ok(decode_frame(trimmed.as_bytes())?);
                }
            }
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

fn io_error(e: std::io::Error) -> WireError {
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => WireError::ConnectionClosed,
        _ => WireError::Io(e),
    }
}

#[async_trait]
impl Codec for IoCodec {
    async fn send(&self, frame: Frame) -> WireResult<()> {
        if *self.closed.borrow() {
            return Err(WireError::ConnectionClosed);
        }
        let bytes = self.encode(&frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)?;
        Ok(())
    }

    async fn recv(&self) -> WireResult<Message> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(WireError::ConnectionClosed);
        }
        let mut state = self.reader.lock().await;
        if let Some(message) = state.queue.pop_front() {
            return Ok(message);
        }
        let frame = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Err(WireError::ConnectionClosed),
            frame = read_frame(&mut state.inner, self.framing) => frame?,
        };
        let mut messages = frame.into_messages().into_iter();
        match messages.next() {
            Some(first) => {
                state.queue.extend(messages);
                Ok(first)
            }
            None => Err(WireError::InvalidResponse("empty batch".to_string())),
        }
    }

    async fn close(&self) -> WireResult<()> {
        self.closed.send_replace(true);
        // A writer blocked on a full socket keeps the lock; the flag above is
        // enough to stop it being used again.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Id, MessageKind};
    use serde_json::json;

    #[tokio::test]
    async fn test_pipe_preserves_order() {
        let (a, b) = pipe();
        for i in 0..5u64 {
            a.send(Message::request(Id::Num(i), "m", json!([])).into())
                .await
                .unwrap();
        }
        for i in 0..5u64 {
            assert_eq!(b.recv().await.unwrap().id, Some(Id::Num(i)));
        }
    }

    #[tokio::test]
    async fn test_pipe_close_fails_pending_read_on_other_end() {
        let (a, b) = pipe();
        let reader = tokio::spawn(async move { b.recv().await });
        tokio::task::yield_now().await;
        a.close().await.unwrap();
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
        assert!(matches!(
            a.send(Message::notification("m", json!([])).into()).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_pipe_batch_is_split() {
        let (a, b) = pipe();
        a.send(Frame::Batch(vec![
            Message::notification("first", json!([])),
            Message::notification("second", json!([])),
        ]))
        .await
        .unwrap();
        assert_eq!(b.recv().await.unwrap().method.as_deref(), Some("first"));
        assert_eq!(b.recv().await.unwrap().method.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_length_prefixed_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let a = IoCodec::new(lr, lw, Framing::LengthPrefixed);
        let b = IoCodec::new(rr, rw, Framing::LengthPrefixed);

        a.send(Frame::Batch(vec![
            Message::request(Id::Num(1), "vipnode_host", json!(["geth"])),
            Message::response(Id::Num(9), serde_json::Value::Null),
        ]))
        .await
        .unwrap();

        let first = b.recv().await.unwrap();
        assert_eq!(first.kind(), MessageKind::Request);
        let second = b.recv().await.unwrap();
        assert_eq!(second.result, Some(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn test_lines_framing_skips_blank_lines() {
        let input: &[u8] = b"\n{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":\"Geth/v1.9\"}\n";
        let codec = IoCodec::new(input, tokio::io::sink(), Framing::Lines);
        let message = codec.recv().await.unwrap();
        assert_eq!(message.id, Some(Id::Num(7)));
        assert!(matches!(codec.recv().await, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let mut input = Vec::new();
        input.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        let codec = IoCodec::new(std::io::Cursor::new(input), tokio::io::sink(), Framing::LengthPrefixed);
        match codec.recv().await {
            Err(WireError::MessageTooLarge { size, .. }) => assert_eq!(size, MAX_MESSAGE_SIZE + 1),
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }
}
