//! Connection hijacking and stream framing for exec and attach.
//!
//! Engine clients ask for `Connection: Upgrade` / `Upgrade: tcp` and then use
//! the raw connection in both directions. Without a TTY, output is
//! multiplexed: every chunk is preceded by an 8-byte header holding the
//! stream id and the big-endian payload length.

use std::io;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream},
    sync::Mutex,
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::engine::{MULTIPLEXED_STREAM_MEDIA_TYPE, RAW_STREAM_MEDIA_TYPE};

const COPY_BUFFER_BYTES: usize = 32 * 1024;
const BODY_PIPE_BYTES: usize = 64 * 1024;

pub type UpstreamReader = Box<dyn AsyncRead + Send + Unpin>;
pub type UpstreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[derive(Debug, thiserror::Error)]
pub enum StreamBridgeError {
    #[error("connection cannot be hijacked")]
    NotHijackable,
    #[error("connection upgrade failed: {0}")]
    Upgrade(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Multiplexed,
    Raw,
}

impl Framing {
    /// A TTY merges output into one raw stream.
    #[must_use]
    pub fn for_tty(tty: bool) -> Self {
        if tty { Self::Raw } else { Self::Multiplexed }
    }

    #[must_use]
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Multiplexed => MULTIPLEXED_STREAM_MEDIA_TYPE,
            Self::Raw => RAW_STREAM_MEDIA_TYPE,
        }
    }
}

#[must_use]
pub fn frame_header(kind: StreamKind, len: u32) -> [u8; 8] {
    let [b0, b1, b2, b3] = len.to_be_bytes();
    [kind as u8, 0, 0, 0, b0, b1, b2, b3]
}

pub async fn write_frame<W>(writer: &mut W, kind: StreamKind, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for chunk in payload.chunks(u32::MAX as usize) {
        writer
            .write_all(&frame_header(kind, chunk.len() as u32))
            .await?;
        writer.write_all(chunk).await?;
    }
    Ok(())
}

/// The client side of a hijacked request, not yet usable until the
/// handshake response has been sent.
pub enum PendingConnection {
    Upgrade(OnUpgrade),
    Body(DuplexStream),
}

impl PendingConnection {
    pub async fn connect(self) -> Result<Box<dyn Connection>, StreamBridgeError> {
        match self {
            Self::Upgrade(on_upgrade) => {
                let upgraded = on_upgrade
                    .await
                    .map_err(|error| StreamBridgeError::Upgrade(error.to_string()))?;
                Ok(Box::new(TokioIo::new(upgraded)))
            }
            Self::Body(pipe) => Ok(Box::new(pipe)),
        }
    }
}

/// Builds the handshake response and the connection it hands over.
///
/// Requests carrying an `Upgrade` header get `101` and the raw connection.
/// Others get `200` with the output streamed as the response body.
pub fn hijack(
    headers: &HeaderMap,
    on_upgrade: Option<OnUpgrade>,
    framing: Framing,
) -> Result<(Response, PendingConnection), StreamBridgeError> {
    if headers.contains_key(header::UPGRADE) {
        let on_upgrade = on_upgrade.ok_or(StreamBridgeError::NotHijackable)?;
        let response = (
            StatusCode::SWITCHING_PROTOCOLS,
            [
                (header::CONNECTION, "Upgrade"),
                (header::UPGRADE, "tcp"),
                (header::CONTENT_TYPE, framing.media_type()),
            ],
        )
            .into_response();
        return Ok((response, PendingConnection::Upgrade(on_upgrade)));
    }

    let (client, server) = tokio::io::duplex(BODY_PIPE_BYTES);
    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, framing.media_type())],
        Body::from_stream(ReaderStream::new(client)),
    )
        .into_response();
    Ok((response, PendingConnection::Body(server)))
}

/// Moves bytes between a hijacked connection and an upstream process until
/// the upstream output ends. Input is forwarded concurrently and abandoned
/// once output is done.
pub async fn pump(
    connection: Box<dyn Connection>,
    framing: Framing,
    stdin: Option<UpstreamWriter>,
    stdout: Option<UpstreamReader>,
    stderr: Option<UpstreamReader>,
) -> Result<(), StreamBridgeError> {
    let (mut client_reader, client_writer) = tokio::io::split(connection);

    let stdin_task = stdin.map(|mut upstream| {
        tokio::spawn(async move {
            let copied = tokio::io::copy(&mut client_reader, &mut upstream).await;
            let _ = upstream.shutdown().await;
            copied
        })
    });

    // The first output error ends both copies and drops the upstream readers.
    let sink = Mutex::new(client_writer);
    let copied = tokio::try_join!(
        copy_output(stdout, StreamKind::Stdout, framing, &sink),
        copy_output(stderr, StreamKind::Stderr, framing, &sink),
    );

    if let Some(task) = stdin_task {
        task.abort();
    }

    let (stdout_bytes, stderr_bytes) = match copied {
        Ok(bytes) => bytes,
        Err(error) => {
            debug!(error = %error, "stream bridge output ended early");
            return Err(error.into());
        }
    };

    let mut writer = sink.into_inner();
    let closed = async {
        writer.flush().await?;
        writer.shutdown().await
    }
    .await;
    debug!(stdout_bytes, stderr_bytes, "stream bridge finished");
    closed.or_else(ignore_disconnect)?;
    Ok(())
}

async fn copy_output<W>(
    source: Option<UpstreamReader>,
    kind: StreamKind,
    framing: Framing,
    sink: &Mutex<W>,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let Some(mut source) = source else {
        return Ok(0);
    };
    let mut buffer = vec![0_u8; COPY_BUFFER_BYTES];
    let mut total = 0_u64;
    loop {
        let read = source.read(&mut buffer).await?;
        if read == 0 {
            return Ok(total);
        }
        let chunk = &buffer[..read];
        let mut writer = sink.lock().await;
        match framing {
            Framing::Multiplexed => write_frame(&mut *writer, kind, chunk).await?,
            Framing::Raw => writer.write_all(chunk).await?,
        }
        writer.flush().await?;
        total += read as u64;
    }
}

/// A client that already hung up is not a bridge failure.
fn ignore_disconnect(error: io::Error) -> io::Result<()> {
    match error.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected => {
            Ok(())
        }
        _ => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, time::Duration};

    use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{
        Framing, PendingConnection, StreamBridgeError, StreamKind, frame_header, hijack, pump,
    };

    fn parse_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        while bytes.len() >= 8 {
            let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
            frames.push((bytes[0], bytes[8..8 + len].to_vec()));
            bytes = &bytes[8 + len..];
        }
        assert!(bytes.is_empty(), "trailing partial frame");
        frames
    }

    #[test]
    fn header_layout_matches_engine_framing() {
        assert_eq!(frame_header(StreamKind::Stdout, 5), [1, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(
            frame_header(StreamKind::Stderr, 0x0102_0304),
            [2, 0, 0, 0, 1, 2, 3, 4]
        );
        assert_eq!(frame_header(StreamKind::Stdin, 0)[0], 0);
    }

    #[test]
    fn framing_follows_tty() {
        assert_eq!(Framing::for_tty(true), Framing::Raw);
        assert_eq!(Framing::for_tty(false), Framing::Multiplexed);
        assert_eq!(
            Framing::Multiplexed.media_type(),
            "application/vnd.docker.multiplexed-stream"
        );
    }

    #[test]
    fn upgrade_without_hijackable_connection_fails() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("tcp"));
        assert!(matches!(
            hijack(&headers, None, Framing::Raw),
            Err(StreamBridgeError::NotHijackable)
        ));
    }

    #[tokio::test]
    async fn plain_request_streams_over_the_body() {
        let (response, pending) =
            hijack(&HeaderMap::new(), None, Framing::Multiplexed).expect("hijack");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static(
                "application/vnd.docker.multiplexed-stream"
            ))
        );
        assert!(matches!(pending, PendingConnection::Body(_)));
    }

    #[tokio::test]
    async fn multiplexed_output_is_framed_per_stream() {
        let (server, mut client) = tokio::io::duplex(4096);
        pump(
            Box::new(server),
            Framing::Multiplexed,
            None,
            Some(Box::new(Cursor::new(b"hello".to_vec()))),
            Some(Box::new(Cursor::new(b"oops".to_vec()))),
        )
        .await
        .expect("pump");

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.expect("read");
        let mut frames = parse_frames(&output);
        frames.sort();
        assert_eq!(
            frames,
            vec![(1, b"hello".to_vec()), (2, b"oops".to_vec())]
        );
    }

    #[tokio::test]
    async fn client_hangup_ends_the_bridge_while_stderr_is_silent() {
        let (server, client) = tokio::io::duplex(64);
        drop(client);
        let (stderr_upstream, _stderr_remote) = tokio::io::duplex(64);
        let (stdin_upstream, _stdin_remote) = tokio::io::duplex(64);

        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            pump(
                Box::new(server),
                Framing::Multiplexed,
                Some(Box::new(stdin_upstream)),
                Some(Box::new(Cursor::new(vec![b'x'; 1024]))),
                Some(Box::new(stderr_upstream)),
            ),
        )
        .await
        .expect("pump should return once the client is gone");
        assert!(matches!(finished, Err(StreamBridgeError::Io(_))));
    }

    #[tokio::test]
    async fn raw_output_and_stdin_are_forwarded() {
        let (server, client) = tokio::io::duplex(4096);
        let (stdin_upstream, mut stdin_remote) = tokio::io::duplex(4096);
        let (stdout_upstream, mut stdout_remote) = tokio::io::duplex(4096);
        let bridge = tokio::spawn(pump(
            Box::new(server),
            Framing::Raw,
            Some(Box::new(stdin_upstream)),
            Some(Box::new(stdout_upstream)),
            None,
        ));

        let (mut client_reader, mut client_writer) = tokio::io::split(client);
        client_writer.write_all(b"ping").await.expect("write stdin");
        let mut forwarded = [0_u8; 4];
        stdin_remote
            .read_exact(&mut forwarded)
            .await
            .expect("stdin forwarded");
        assert_eq!(&forwarded, b"ping");

        stdout_remote.write_all(b"pong").await.expect("write stdout");
        drop(stdout_remote);
        bridge.await.expect("join").expect("pump");

        let mut output = Vec::new();
        client_reader
            .read_to_end(&mut output)
            .await
            .expect("read output");
        assert_eq!(output, b"pong");
    }
}
