//! Control-channel plumbing shared by coordinator and agent.
//!
//! Each side owns the write half of a control socket through a dedicated
//! writer task fed by an mpsc channel, so any task holding a sender can
//! push messages without sharing the socket.  The read half is consumed by
//! a [`MessageReader`] that yields one [`Message`] per JSON line.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::Message;

/// Queue depth of a control channel's writer task.
const OUTBOX_CAPACITY: usize = 128;

/// Any bidirectional byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens outbound streams. Swapped for in-memory pipes in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Box<dyn Transport>>;
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Box<dyn Transport>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Sending side of a control channel.
pub type Outbox = mpsc::Sender<Message>;

/// Spawn the writer task owning `writer`.
///
/// The task ends when every [`Outbox`] is dropped or a write fails.
pub fn spawn_writer<W>(mut writer: W) -> (Outbox, JoinHandle<io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = match message.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to serialize {} message: {}", message.kind(), e);
                    continue;
                }
            };
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        let _ = writer.shutdown().await;
        Ok(())
    });
    (tx, handle)
}

/// Reads newline-delimited JSON messages.
pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next well-formed message; `Ok(None)` on a clean close.
    ///
    /// Blank and malformed lines are skipped.
    pub async fn next_message(&mut self) -> io::Result<Option<Message>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => debug!("Dropping malformed control line {:?}: {}", line, e),
            }
        }
        Ok(None)
    }
}
