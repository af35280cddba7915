//! Bundle-transfer sockets.
//!
//! The agent opens a fresh connection to the coordinator's transfer port
//! and restates a challenge as a single JSON line.  The coordinator answers
//! a valid header with the raw bundle bytes and closes the socket; anything
//! else gets the socket dropped without a single byte written.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::challenge::{ChallengeError, ChallengeTable};
use crate::channel::Connector;
use crate::runtime::{BundleSink, CodebaseProvider};
use crate::types::ChallengeHeader;

/// Upper bound on a challenge header line.
pub const MAX_HEADER_LEN: usize = 8 * 1024;

/// How long a transfer peer gets to deliver its header.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Header does not start with '{{'")]
    NotJson,

    #[error("Header longer than 8 KiB")]
    HeaderTooLong,

    #[error("Connection closed before a complete header")]
    Truncated,

    #[error("No complete header within {0:?}")]
    HeaderTimeout(Duration),

    #[error("Malformed header: {0}")]
    MalformedHeader(#[from] serde_json::Error),

    #[error(transparent)]
    Rejected(#[from] ChallengeError),

    #[error("Bundle source failed: {0}")]
    Source(anyhow::Error),

    #[error("Bundle sink failed: {0}")]
    Sink(anyhow::Error),

    #[error("Coordinator sent no bundle, challenge refused")]
    Refused,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read one `}\n`-terminated JSON header, tolerating partial reads.
///
/// Reads byte by byte so nothing past the header is consumed; give it a
/// buffered reader when that does not matter.
pub async fn read_header<R>(reader: &mut R) -> Result<ChallengeHeader, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransferError::Truncated)
            }
            Err(e) => return Err(e.into()),
        };
        if buf.is_empty() && byte != b'{' {
            return Err(TransferError::NotJson);
        }
        buf.push(byte);
        if buf.ends_with(b"}\n") {
            break;
        }
        if buf.len() > MAX_HEADER_LEN {
            return Err(TransferError::HeaderTooLong);
        }
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Coordinator side of one transfer socket.
///
/// Returns the number of bundle bytes written.  On any error the caller
/// drops `stream`, which is the whole rejection.  A [`TransferError::Source`]
/// may come after part of the bundle went out; the stream is left open so
/// the caller can abort it instead of closing it cleanly.
pub async fn serve_transfer<S>(
    mut stream: S,
    challenges: &Mutex<ChallengeTable>,
    codebase: &dyn CodebaseProvider,
) -> Result<u64, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Agents send nothing past the header.
    let mut reader = BufReader::new(&mut stream);
    let header = tokio::time::timeout(HEADER_TIMEOUT, read_header(&mut reader))
        .await
        .map_err(|_| TransferError::HeaderTimeout(HEADER_TIMEOUT))??;
    drop(reader);
    let challenge = challenges.lock().await.redeem(&header)?;
    debug!(
        "Challenge {} redeemed for {} {}",
        challenge.id, challenge.app, challenge.bundle
    );

    let mut bundle = codebase
        .create_bundle_stream(&challenge.app, &challenge.bundle)
        .await
        .map_err(TransferError::Source)?;
    let mut written = 0u64;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = bundle
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::Source(e.into()))?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    stream.shutdown().await?;
    info!(
        "Sent {} bytes of {} {} to {}",
        written, challenge.app, challenge.bundle, challenge.machine
    );
    Ok(written)
}

/// Agent side: restate `header` on a new socket and feed the reply to `sink`.
///
/// Returns the number of bundle bytes installed.
pub async fn fetch_bundle(
    connector: &dyn Connector,
    addr: SocketAddr,
    header: &ChallengeHeader,
    mut sink: Box<dyn BundleSink>,
) -> Result<u64, TransferError> {
    let mut stream = connector.connect(addr).await?;
    stream.write_all(header.to_line()?.as_bytes()).await?;
    stream.flush().await?;

    let mut received = 0u64;
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            // A destroyed socket may surface as a reset rather than EOF.
            Err(e) if received == 0 && e.kind() == io::ErrorKind::ConnectionReset => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            break;
        }
        sink.write_chunk(&buf[..n])
            .await
            .map_err(TransferError::Sink)?;
        received += n as u64;
    }

    if received == 0 {
        warn!("Transfer of {} {} refused", header.app, header.bundle);
        return Err(TransferError::Refused);
    }
    sink.finish().await.map_err(TransferError::Sink)?;
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::BundleStream;
    use crate::types::VersionPair;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::duplex;

    /// Serves a fixed byte stream, delivered in the given chunks.
    struct ChunkedCodebase {
        chunks: Vec<&'static [u8]>,
        fail_after_chunks: bool,
        requested: std::sync::Mutex<Vec<(String, VersionPair)>>,
    }

    /// Yields `chunks`, then fails.
    struct BrokenSource(Vec<&'static [u8]>);

    impl AsyncRead for BrokenSource {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.0.is_empty() {
                return std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "bundle writer died",
                )));
            }
            let chunk = self.0.remove(0);
            buf.put_slice(chunk);
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl CodebaseProvider for ChunkedCodebase {
        async fn get_current_version(&self, _app: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn create_bundle_stream(
            &self,
            app: &str,
            bundle: &VersionPair,
        ) -> anyhow::Result<BundleStream> {
            self.requested
                .lock()
                .unwrap()
                .push((app.to_string(), bundle.clone()));
            if self.fail_after_chunks {
                return Ok(Box::new(BrokenSource(self.chunks.clone())));
            }
            let (mut tx, rx) = duplex(64);
            let chunks = self.chunks.clone();
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.write_all(chunk).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Box::new(rx))
        }
    }

    fn codebase() -> ChunkedCodebase {
        ChunkedCodebase {
            chunks: vec![&b"PACK"[..], &b"-chunk-1"[..], &b"-chunk-2"[..]],
            fail_after_chunks: false,
            requested: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn machine() -> SocketAddr {
        "10.0.0.1:5003".parse().unwrap()
    }

    #[tokio::test]
    async fn header_survives_partial_reads() {
        let (mut agent, mut coordinator) = duplex(64);
        let line = ChallengeHeader {
            challenge: "c1".into(),
            app: "api".into(),
            bundle: VersionPair::full("aaaa"),
        }
        .to_line()
        .unwrap();
        let writer = tokio::spawn(async move {
            for piece in line.as_bytes().chunks(3) {
                agent.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
            agent
        });
        let header = read_header(&mut coordinator).await.unwrap();
        assert_eq!(header.challenge, "c1");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn non_json_header_is_rejected_immediately() {
        let (mut agent, mut coordinator) = duplex(64);
        agent.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        assert!(matches!(
            read_header(&mut coordinator).await,
            Err(TransferError::NotJson)
        ));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let (mut agent, mut coordinator) = duplex(MAX_HEADER_LEN * 2);
        let mut junk = vec![b'{'];
        junk.extend(std::iter::repeat(b'a').take(MAX_HEADER_LEN + 1));
        agent.write_all(&junk).await.unwrap();
        assert!(matches!(
            read_header(&mut coordinator).await,
            Err(TransferError::HeaderTooLong)
        ));
    }

    async fn serve_with(
        header_line: Vec<u8>,
        table: &Mutex<ChallengeTable>,
        codebase: &ChunkedCodebase,
    ) -> (Result<u64, TransferError>, Vec<u8>) {
        let (mut agent, coordinator) = duplex(1024);
        agent.write_all(&header_line).await.unwrap();
        let result = serve_transfer(coordinator, table, codebase).await;
        let mut received = Vec::new();
        agent.read_to_end(&mut received).await.unwrap();
        (result, received)
    }

    #[tokio::test]
    async fn matching_header_streams_every_chunk_then_closes() {
        let table = Mutex::new(ChallengeTable::new(Duration::from_secs(60)));
        let c = table
            .lock()
            .await
            .issue(machine(), "api", VersionPair::delta("aaaa", "bbbb"));
        let codebase = codebase();
        let line = ChallengeHeader {
            challenge: c.id.clone(),
            app: "api".into(),
            bundle: VersionPair::delta("aaaa", "bbbb"),
        }
        .to_line()
        .unwrap();

        let (result, received) = serve_with(line.into_bytes(), &table, &codebase).await;
        assert_eq!(result.unwrap(), 20);
        assert_eq!(received, b"PACK-chunk-1-chunk-2");
        assert_eq!(
            codebase.requested.lock().unwrap().as_slice(),
            &[("api".to_string(), VersionPair::delta("aaaa", "bbbb"))]
        );
        assert!(table.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failing_source_fails_the_transfer() {
        let table = Mutex::new(ChallengeTable::new(Duration::from_secs(60)));
        let c = table
            .lock()
            .await
            .issue(machine(), "api", VersionPair::full("aaaa"));
        let codebase = ChunkedCodebase {
            fail_after_chunks: true,
            ..codebase()
        };
        let line = ChallengeHeader {
            challenge: c.id.clone(),
            app: "api".into(),
            bundle: VersionPair::full("aaaa"),
        }
        .to_line()
        .unwrap();

        let (mut agent, coordinator) = duplex(1024);
        agent.write_all(line.as_bytes()).await.unwrap();
        let result = serve_transfer(coordinator, &table, &codebase).await;
        assert!(matches!(result, Err(TransferError::Source(_))), "{:?}", result);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let table = Mutex::new(ChallengeTable::new(Duration::from_secs(60)));
        let codebase = codebase();
        let (mut agent, coordinator) = duplex(1024);
        agent.write_all(b"{\"challenge\":").await.unwrap();

        let started = tokio::time::Instant::now();
        let result = serve_transfer(coordinator, &table, &codebase).await;
        assert!(matches!(result, Err(TransferError::HeaderTimeout(_))));
        assert!(started.elapsed() >= HEADER_TIMEOUT);
        assert!(codebase.requested.lock().unwrap().is_empty());
        drop(agent);
    }

    #[tokio::test]
    async fn mismatching_header_gets_no_bytes() {
        let table = Mutex::new(ChallengeTable::new(Duration::from_secs(60)));
        let c = table
            .lock()
            .await
            .issue(machine(), "api", VersionPair::full("aaaa"));
        let codebase = codebase();
        let line = ChallengeHeader {
            challenge: c.id.clone(),
            app: "web".into(),
            bundle: VersionPair::full("aaaa"),
        }
        .to_line()
        .unwrap();

        let (result, received) = serve_with(line.into_bytes(), &table, &codebase).await;
        assert!(matches!(
            result,
            Err(TransferError::Rejected(ChallengeError::AppMismatch { .. }))
        ));
        assert!(received.is_empty());
        assert!(codebase.requested.lock().unwrap().is_empty());
        assert!(table.lock().await.is_empty());
    }

    #[tokio::test]
    async fn garbage_header_gets_no_bytes() {
        let table = Mutex::new(ChallengeTable::new(Duration::from_secs(60)));
        let codebase = codebase();
        let (result, received) =
            serve_with(b"{\"challenge\": 42}\n".to_vec(), &table, &codebase).await;
        assert!(matches!(result, Err(TransferError::MalformedHeader(_))));
        assert!(received.is_empty());
    }

    struct RecordingSink {
        bytes: Arc<std::sync::Mutex<Vec<u8>>>,
        finished: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl BundleSink for RecordingSink {
        async fn write_chunk(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
            self.bytes.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> anyhow::Result<()> {
            self.finished
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct PipeConnector(std::sync::Mutex<Option<tokio::io::DuplexStream>>);

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(
            &self,
            _addr: SocketAddr,
        ) -> io::Result<Box<dyn crate::channel::Transport>> {
            self.0
                .lock()
                .unwrap()
                .take()
                .map(|s| Box::new(s) as Box<dyn crate::channel::Transport>)
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    #[tokio::test]
    async fn refused_transfer_never_finishes_the_sink() {
        let (agent, mut coordinator) = duplex(1024);
        let connector = PipeConnector(std::sync::Mutex::new(Some(agent)));
        let bytes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let sink = Box::new(RecordingSink {
            bytes: Arc::clone(&bytes),
            finished: Arc::clone(&finished),
        });
        let header = ChallengeHeader {
            challenge: "c1".into(),
            app: "api".into(),
            bundle: VersionPair::full("aaaa"),
        };

        let coordinator_side = tokio::spawn(async move {
            let _ = read_header(&mut coordinator).await;
            drop(coordinator);
        });
        let result = fetch_bundle(&connector, machine(), &header, sink).await;
        coordinator_side.await.unwrap();

        assert!(matches!(result, Err(TransferError::Refused)));
        assert!(bytes.lock().unwrap().is_empty());
        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
    }
}
