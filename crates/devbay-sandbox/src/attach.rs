//! Raw attach protocol client
//!
//! Attaching to a sandbox shell is an HTTP/1.1 connection upgrade over the
//! engine control socket: one request, one response header, then the socket
//! becomes a bidirectional byte pipe to the shell's combined stdio. Engine
//! client libraries hide the upgraded socket, so this module speaks the
//! protocol directly over a `UnixStream`.
//!
//! The subtle part is the boundary: the engine may send shell output in the
//! same segment as the upgrade header. Whatever arrives after the terminating
//! blank line belongs to the shell and must be replayed to the first reader,
//! which [`SandboxStream`] handles.

use crate::error::AttachError;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;

/// Engine API version baked into the attach request path
const API_VERSION: &str = "v1.41";

/// Upper bound on the upgrade response header, headers larger than this are
/// treated as malformed
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Bidirectional shell transport handed to the terminal layer
pub trait ShellIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ShellIo for T {}

/// Opens attached shell transports; implemented by [`AttachClient`] in
/// production and by in-memory connectors in tests
#[async_trait::async_trait]
pub trait AttachConnector: Send + Sync {
    /// Attach to the shell of the sandbox with the given engine id
    async fn attach_shell(&self, engine_id: &str) -> Result<Box<dyn ShellIo>, AttachError>;
}

/// Parsed upgrade response: the status code and any bytes that arrived after
/// the header terminator
#[derive(Debug)]
pub struct UpgradeResponse {
    /// HTTP status code from the response line
    pub status: u16,
    /// Shell output received in the same segments as the header
    pub leftover: Bytes,
}

impl UpgradeResponse {
    /// Whether the engine accepted the upgrade (informational 1xx status)
    #[must_use]
    pub fn upgraded(&self) -> bool {
        self.status / 100 == 1
    }
}

/// Incremental parser for the upgrade response header.
///
/// Accepts reads of any fragmentation, including one byte at a time and
/// segments that straddle the header terminator.
#[derive(Debug, Default)]
pub struct UpgradeParser {
    buf: BytesMut,
}

impl UpgradeParser {
    /// Create an empty parser
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes; returns the parsed response once the full header
    /// has arrived, `None` while it is still incomplete.
    ///
    /// # Errors
    ///
    /// Fails when the header exceeds [`MAX_HEADER_BYTES`] or the status line
    /// is not valid HTTP.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<UpgradeResponse>, AttachError> {
        self.buf.extend_from_slice(chunk);

        let Some(end) = find_header_end(&self.buf) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(malformed("upgrade header too large"));
            }
            return Ok(None);
        };

        let header = self.buf.split_to(end + 4);
        let status = parse_status_line(&header)?;
        let leftover = std::mem::take(&mut self.buf).freeze();

        Ok(Some(UpgradeResponse { status, leftover }))
    }
}

/// Position of the `\r\n\r\n` header terminator, if present
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Extract the status code from the first line of a response header
fn parse_status_line(header: &[u8]) -> Result<u16, AttachError> {
    let line_end = header
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| malformed("missing status line"))?;
    let line = std::str::from_utf8(&header[..line_end])
        .map_err(|_| malformed("status line is not utf-8"))?;

    let mut parts = line.split_whitespace();
    let version = parts.next().ok_or_else(|| malformed("empty status line"))?;
    if !version.starts_with("HTTP/") {
        return Err(malformed("status line missing HTTP version"));
    }

    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed("status line missing status code"))
}

fn malformed(detail: &str) -> AttachError {
    AttachError::Transport(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        detail.to_string(),
    ))
}

/// Attached shell transport that replays header-trailing bytes before reading
/// from the underlying socket
#[derive(Debug)]
pub struct SandboxStream<T> {
    inner: T,
    leftover: Bytes,
}

impl<T> SandboxStream<T> {
    /// Wrap a transport, replaying `leftover` to the first reads
    pub fn new(inner: T, leftover: Bytes) -> Self {
        Self { inner, leftover }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for SandboxStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            let chunk = self.leftover.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for SandboxStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Attach protocol client speaking to the engine control socket
#[derive(Debug, Clone)]
pub struct AttachClient {
    socket: PathBuf,
    timeout: Duration,
}

impl AttachClient {
    /// Create a client for the given control socket, bounding the wait for
    /// the upgrade header by `timeout`
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    /// Attach to a sandbox shell and return the upgraded transport.
    ///
    /// # Errors
    ///
    /// [`AttachError::Rejected`] when the engine answers with a non-1xx
    /// status, [`AttachError::UpgradeTimeout`] when the header does not
    /// complete in time, [`AttachError::PrematureClose`] when the socket
    /// closes mid-header.
    pub async fn attach(&self, engine_id: &str) -> Result<SandboxStream<UnixStream>, AttachError> {
        let mut stream = UnixStream::connect(&self.socket).await?;

        let request = format!(
            "POST /{API_VERSION}/containers/{engine_id}/attach\
             ?stream=1&stdin=1&stdout=1&stderr=1 HTTP/1.1\r\n\
             Host: engine\r\n\
             Connection: Upgrade\r\n\
             Upgrade: tcp\r\n\
             Content-Length: 0\r\n\
             \r\n"
        );
        stream.write_all(request.as_bytes()).await?;

        let response = tokio::time::timeout(self.timeout, read_upgrade(&mut stream))
            .await
            .map_err(|_| AttachError::UpgradeTimeout)??;

        if !response.upgraded() {
            tracing::warn!(engine_id = %engine_id, status = response.status, "attach rejected");
            return Err(AttachError::Rejected {
                status: response.status,
            });
        }

        tracing::debug!(
            engine_id = %engine_id,
            leftover = response.leftover.len(),
            "shell attached"
        );
        Ok(SandboxStream::new(stream, response.leftover))
    }
}

#[async_trait::async_trait]
impl AttachConnector for AttachClient {
    async fn attach_shell(&self, engine_id: &str) -> Result<Box<dyn ShellIo>, AttachError> {
        let stream = self.attach(engine_id).await?;
        Ok(Box::new(stream))
    }
}

/// Read from the transport until the upgrade header is complete
async fn read_upgrade<T: AsyncRead + Unpin>(
    stream: &mut T,
) -> Result<UpgradeResponse, AttachError> {
    let mut parser = UpgradeParser::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(AttachError::PrematureClose);
        }
        if let Some(response) = parser.feed(&chunk[..n])? {
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE_HEADER: &[u8] = b"HTTP/1.1 101 UPGRADED\r\n\
        Content-Type: application/vnd.docker.raw-stream\r\n\
        Connection: Upgrade\r\n\
        Upgrade: tcp\r\n\
        \r\n";

    #[test]
    fn test_parse_complete_header() {
        let mut parser = UpgradeParser::new();
        let response = parser.feed(UPGRADE_HEADER).unwrap().unwrap();
        assert_eq!(response.status, 101);
        assert!(response.upgraded());
        assert!(response.leftover.is_empty());
    }

    #[test]
    fn test_parse_header_with_trailing_shell_output() {
        let mut input = UPGRADE_HEADER.to_vec();
        input.extend_from_slice(b"$ ");

        let mut parser = UpgradeParser::new();
        let response = parser.feed(&input).unwrap().unwrap();
        assert!(response.upgraded());
        assert_eq!(&response.leftover[..], b"$ ");
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let mut input = UPGRADE_HEADER.to_vec();
        input.extend_from_slice(b"echo");

        let mut parser = UpgradeParser::new();
        let mut result = None;
        for (i, byte) in input.iter().enumerate() {
            if let Some(response) = parser.feed(std::slice::from_ref(byte)).unwrap() {
                // The terminator completes before the trailing bytes arrive
                assert_eq!(i, UPGRADE_HEADER.len() - 1);
                result = Some(response);
                break;
            }
        }
        let response = result.expect("header never completed");
        assert!(response.upgraded());
        assert!(response.leftover.is_empty());
    }

    #[test]
    fn test_parse_split_across_terminator() {
        // Split inside the \r\n\r\n terminator
        let split = UPGRADE_HEADER.len() - 2;
        let mut parser = UpgradeParser::new();
        assert!(parser.feed(&UPGRADE_HEADER[..split]).unwrap().is_none());
        let response = parser
            .feed(&UPGRADE_HEADER[split..])
            .unwrap()
            .expect("header complete");
        assert_eq!(response.status, 101);
    }

    #[test]
    fn test_parse_rejection_status() {
        let mut parser = UpgradeParser::new();
        let response = parser
            .feed(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.upgraded());
    }

    #[test]
    fn test_parse_rejects_garbage_status_line() {
        let mut parser = UpgradeParser::new();
        assert!(parser.feed(b"not http at all\r\n\r\n").is_err());
    }

    #[test]
    fn test_parse_oversized_header() {
        let mut parser = UpgradeParser::new();
        let filler = vec![b'x'; MAX_HEADER_BYTES + 1];
        assert!(parser.feed(&filler).is_err());
    }

    #[tokio::test]
    async fn test_sandbox_stream_replays_leftover_first() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = SandboxStream::new(client, Bytes::from_static(b"early "));

        server.write_all(b"late").await.unwrap();

        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early ");

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");
    }

    #[tokio::test]
    async fn test_sandbox_stream_partial_leftover_read() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = SandboxStream::new(client, Bytes::from_static(b"abcdef"));

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ef");
    }

    #[tokio::test]
    async fn test_sandbox_stream_writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = SandboxStream::new(client, Bytes::new());

        stream.write_all(b"ls\n").await.unwrap();

        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");
    }

    #[tokio::test]
    async fn test_attach_against_fake_engine() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            // Consume the request header
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                conn.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            let request = String::from_utf8(request).unwrap();
            assert!(request.starts_with("POST /v1.41/containers/abc123/attach"));
            assert!(request.contains("Upgrade: tcp"));

            // Header and first shell bytes in one segment
            let mut response = UPGRADE_HEADER.to_vec();
            response.extend_from_slice(b"$ ");
            conn.write_all(&response).await.unwrap();

            // Echo one command's worth of input back
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let client = AttachClient::new(&socket, Duration::from_secs(2));
        let mut stream = client.attach("abc123").await.unwrap();

        let mut prompt = [0u8; 2];
        stream.read_exact(&mut prompt).await.unwrap();
        assert_eq!(&prompt, b"$ ");

        stream.write_all(b"ls\n").await.unwrap();
        let mut echoed = [0u8; 3];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ls\n");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_rejected_by_engine() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 1024];
            let _ = conn.read(&mut sink).await.unwrap();
            conn.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let client = AttachClient::new(&socket, Duration::from_secs(2));
        let err = client.attach("missing").await.unwrap_err();
        assert!(matches!(err, AttachError::Rejected { status: 404 }));
    }

    #[tokio::test]
    async fn test_attach_premature_close() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut sink = [0u8; 1024];
            let _ = conn.read(&mut sink).await.unwrap();
            // Half a header, then drop the connection
            conn.write_all(b"HTTP/1.1 101 UPG").await.unwrap();
        });

        let client = AttachClient::new(&socket, Duration::from_secs(2));
        let err = client.attach("abc123").await.unwrap_err();
        assert!(matches!(err, AttachError::PrematureClose));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_upgrade_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            // Accept but never answer
            let (_conn, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let client = AttachClient::new(&socket, Duration::from_millis(200));
        let err = client.attach("abc123").await.unwrap_err();
        assert!(matches!(err, AttachError::UpgradeTimeout));
    }
}
