//! Backend connections and the byte relay.
//!
//! Both directions are pull-based: a chunk is read from one side, written
//! and flushed to the other, and only then is the next chunk requested. A
//! slow reader on either end therefore stalls the opposite end instead of
//! growing a buffer.
//!
//! When one side reaches end-of-stream (or fails), the opposite direction
//! stops at its next read point and closes its writer after flushing.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

/// Size of the per-direction relay buffer.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes of each chunk shown when wire logging is enabled.
const WIRE_PREVIEW_BYTES: usize = 64;

/// Result of connecting to a backend while the client side is live.
#[derive(Debug)]
pub enum BackendConnection {
    /// The backend is connected. `pending` holds client bytes that arrived
    /// while the connect was in flight; they must be forwarded first.
    Connected {
        stream: TcpStream,
        pending: Option<Vec<u8>>,
    },
    /// The client went away before the connect completed. Any backend
    /// connection that was established has already been closed.
    InboundClosed,
}

/// Opens connections to backend destinations.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    connect_timeout: Option<Duration>,
}

impl BackendConnector {
    /// Create a connector. `None` waits on the OS connect timeout.
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    /// Connect to `destination` (`host:port`) while watching `inbound`.
    ///
    /// At most one read is outstanding on `inbound` during the connect. If
    /// it reports end-of-stream (or an error) the new backend connection is
    /// closed without anything being forwarded.
    pub async fn connect<I>(
        &self,
        destination: &str,
        inbound: &mut I,
    ) -> io::Result<BackendConnection>
    where
        I: AsyncRead + Unpin,
    {
        let dial = self.dial(destination);
        tokio::pin!(dial);

        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut pending: Option<Vec<u8>> = None;
        let mut inbound_closed = false;

        loop {
            tokio::select! {
                biased;

                read = inbound.read(&mut buf), if pending.is_none() && !inbound_closed => {
                    match read {
                        Ok(0) => inbound_closed = true,
                        Ok(n) => pending = Some(buf[..n].to_vec()),
                        Err(e) => {
                            debug!(error = %e, "Client read failed during backend connect");
                            inbound_closed = true;
                        }
                    }
                }
                connected = &mut dial => {
                    let stream = connected?;
                    if inbound_closed {
                        debug!(destination, "Client closed before backend connect completed");
                        drop(stream);
                        return Ok(BackendConnection::InboundClosed);
                    }
                    return Ok(BackendConnection::Connected { stream, pending });
                }
            }
        }
    }

    async fn dial(&self, destination: &str) -> io::Result<TcpStream> {
        debug!(destination, "Connecting to backend");

        let stream = match self.connect_timeout {
            Some(limit) => match timeout(limit, TcpStream::connect(destination)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
                }
            },
            None => TcpStream::connect(destination).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Close the relay when neither direction has moved data for this long.
    pub idle_timeout: Option<Duration>,
    /// Trace every relayed chunk with a hex preview.
    pub wire_logging: bool,
    /// Per-direction buffer size.
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            wire_logging: false,
            buffer_size: RELAY_BUFFER_SIZE,
        }
    }
}

/// Byte counts for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToBackend,
    FromBackend,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ToBackend => "client->backend",
            Direction::FromBackend => "backend->client",
        }
    }
}

/// Relay bytes between the client and the backend until either side closes.
///
/// Both directions run on the calling task.
pub async fn relay<I, B>(inbound: I, backend: B, options: &RelayOptions) -> io::Result<RelayStats>
where
    I: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let (inbound_done_tx, inbound_done_rx) = watch::channel(false);
    let (backend_done_tx, backend_done_rx) = watch::channel(false);
    let activity = Activity::new();

    let (to_backend, from_backend) = tokio::join!(
        pump(
            inbound_read,
            backend_write,
            Direction::ToBackend,
            options,
            &activity,
            inbound_done_tx,
            backend_done_rx,
        ),
        pump(
            backend_read,
            inbound_write,
            Direction::FromBackend,
            options,
            &activity,
            backend_done_tx,
            inbound_done_rx,
        ),
    );

    Ok(RelayStats {
        bytes_to_backend: to_backend?,
        bytes_from_backend: from_backend?,
    })
}

/// Last time either direction moved data.
struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Move one direction, then signal the peer direction and close the writer.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    options: &RelayOptions,
    activity: &Activity,
    done: watch::Sender<bool>,
    mut peer_done: watch::Receiver<bool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let result = copy_chunks(
        &mut reader,
        &mut writer,
        direction,
        options,
        activity,
        &mut peer_done,
        &mut total,
    )
    .await;

    let _ = done.send(true);
    if let Err(e) = writer.shutdown().await {
        debug!(direction = direction.as_str(), error = %e, "Writer shutdown failed");
    }

    result.map(|()| total)
}

async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    options: &RelayOptions,
    activity: &Activity,
    peer_done: &mut watch::Receiver<bool>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            biased;

            _ = closed(peer_done) => return Ok(()),
            read = read_chunk(reader, &mut buf, options.idle_timeout, activity) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        if options.wire_logging {
            trace!(
                direction = direction.as_str(),
                bytes = n,
                preview = %hex::encode(&buf[..n.min(WIRE_PREVIEW_BYTES)]),
                "Relayed chunk"
            );
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        *total += n as u64;
    }
}

/// Read the next chunk. With an idle limit, a quiet direction keeps waiting
/// as long as the other direction is moving data.
async fn read_chunk<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
    activity: &Activity,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(limit) = idle else {
        return reader.read(buf).await;
    };
    loop {
        let deadline = activity.last() + limit;
        if let Ok(result) = timeout_at(deadline, reader.read(buf)).await {
            return result;
        }
        if activity.last() + limit <= Instant::now() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
        }
    }
}

/// Resolves once the peer direction has finished.
async fn closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
