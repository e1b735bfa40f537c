//! Connections to backends.
//!
//! Every outbound connect is bounded by a short timeout so one unreachable
//! backend only delays its own collector. Whole exchanges get a larger read
//! budget on top of that.

pub mod fastcgi;
pub mod http;

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::uri::Endpoint;

/// Default connect timeout for backend calls.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Read budget for a full exchange, as a multiple of the connect timeout.
pub const EXCHANGE_TIMEOUT_FACTOR: u32 = 5;

/// Largest response read from a backend.
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// A bidirectional byte stream to a backend.
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

pub type BackendStream = Box<dyn BackendIo>;

/// Opens a stream to `endpoint`, failing after `timeout`.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<BackendStream> {
    let connecting = async {
        let stream: BackendStream = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            Endpoint::Unix(path) => Box::new(UnixStream::connect(path).await?),
        };
        Ok(stream)
    };

    tokio::time::timeout(timeout, connecting)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {} timed out after {:?}", endpoint, timeout),
            )
        })?
}

/// Sends `request` and reads until `is_complete` accepts the buffer or the
/// peer closes the connection.
pub async fn exchange<F>(
    endpoint: &Endpoint,
    request: &[u8],
    timeout: Duration,
    is_complete: F,
) -> io::Result<Vec<u8>>
where
    F: Fn(&[u8]) -> bool,
{
    let mut stream = connect(endpoint, timeout).await?;

    let io = async {
        stream.write_all(request).await?;
        stream.flush().await?;
        read_response(&mut stream, is_complete).await
    };

    tokio::time::timeout(timeout * EXCHANGE_TIMEOUT_FACTOR, io)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("reading from {} timed out", endpoint),
            )
        })?
}

async fn read_response<S, F>(stream: &mut S, is_complete: F) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
    F: Fn(&[u8]) -> bool,
{
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
        if is_complete(&buf) {
            return Ok(buf);
        }
        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "backend response too large",
            ));
        }
    }
}
