//! Channel transport for coordinator/worker IPC.
//!
//! Platform-specific implementations:
//! - **NamedSocketListener**: Filesystem sockets (macOS, Linux, BSD)
//! - **AbstractSocketListener**: Linux abstract namespace (no filesystem, auto-cleanup)
//!
//! The coordinator binds a listener keyed by its [`ChannelId`] and accepts a
//! single peer; the worker connects with the same id.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{ChannelId, Frame};

pub type FrameReader = FramedRead<OwnedReadHalf, JsonCodec<Frame>>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, JsonCodec<Frame>>;

/// Socket path used for filesystem sockets: `{temp_dir}/{channel_id}.sock`
pub fn socket_path(channel_id: &ChannelId) -> PathBuf {
    std::env::temp_dir().join(format!("{}.sock", channel_id.as_str()))
}

/// Listener using a filesystem socket. Removes the socket file on drop.
pub struct NamedSocketListener {
    path: PathBuf,
    listener: tokio::net::UnixListener,
}

impl NamedSocketListener {
    pub fn bind(channel_id: &ChannelId) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = socket_path(channel_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;

        tracing::debug!(transport_type = "named", path = %path.display(), "Bound channel socket");
        Ok(Self { path, listener })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for NamedSocketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove channel socket");
        }
    }
}

/// Abstract namespace socket listener (Linux only).
///
/// No filesystem entries; the name is released when the listener closes.
#[cfg(target_os = "linux")]
pub struct AbstractSocketListener {
    listener: tokio::net::UnixListener,
}

#[cfg(target_os = "linux")]
impl AbstractSocketListener {
    pub fn bind(channel_id: &ChannelId) -> io::Result<Self> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

        let addr = SocketAddr::from_abstract_name(channel_id.as_str().as_bytes())?;
        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;

        tracing::debug!(transport_type = "abstract", name = %channel_id, "Bound channel socket");
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }
}

/// Server side of a channel.
pub enum ChannelListener {
    Named(NamedSocketListener),
    #[cfg(target_os = "linux")]
    Abstract(AbstractSocketListener),
}

impl ChannelListener {
    /// Bind using the platform default (abstract on Linux, named elsewhere).
    pub fn bind(channel_id: &ChannelId) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            AbstractSocketListener::bind(channel_id).map(Self::Abstract)
        }

        #[cfg(not(target_os = "linux"))]
        {
            NamedSocketListener::bind(channel_id).map(Self::Named)
        }
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        match self {
            Self::Named(l) => l.accept().await,
            #[cfg(target_os = "linux")]
            Self::Abstract(l) => l.accept().await,
        }
    }
}

/// Retry policy for the worker side of the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(150),
        }
    }
}

/// Connect to the channel a coordinator is serving, retrying per `policy`.
///
/// Returns the last connect error once the policy is exhausted.
pub async fn connect_channel(
    channel_id: &ChannelId,
    policy: ConnectPolicy,
) -> io::Result<UnixStream> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect_once(channel_id).await {
            Ok(stream) => {
                tracing::trace!(%channel_id, attempt, "Connected to channel");
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                tracing::trace!(%channel_id, attempt, error = %e, "Channel not ready, retrying");
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(target_os = "linux")]
async fn connect_once(channel_id: &ChannelId) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(channel_id.as_str().as_bytes())?;

    // tokio doesn't support abstract sockets directly
    let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    std_stream.set_nonblocking(true)?;
    UnixStream::from_std(std_stream)
}

#[cfg(not(target_os = "linux"))]
async fn connect_once(channel_id: &ChannelId) -> io::Result<UnixStream> {
    UnixStream::connect(socket_path(channel_id)).await
}

/// Split a connected stream into framed read/write halves.
pub fn framed(stream: UnixStream) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        FramedRead::new(read_half, JsonCodec::new()),
        FramedWrite::new(write_half, JsonCodec::new()),
    )
}

/// Shared handle for writing frames. Concurrent senders are serialized.
#[derive(Clone)]
pub struct FrameSender {
    writer: Arc<Mutex<FrameWriter>>,
}

impl FrameSender {
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, frame: Frame) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn listener_and_client_exchange_frames() {
        let id = ChannelId::generate();
        let listener = ChannelListener::bind(&id).unwrap();

        let client = tokio::spawn({
            let id = id.clone();
            async move {
                let stream = connect_channel(&id, ConnectPolicy::default()).await.unwrap();
                let (mut reader, writer) = framed(stream);
                FrameSender::new(writer).send(Frame::Initialize).await.unwrap();
                reader.next().await.unwrap().unwrap().unwrap()
            }
        });

        let (mut reader, writer) = framed(listener.accept().await.unwrap());
        assert_eq!(reader.next().await.unwrap().unwrap().unwrap(), Frame::Initialize);

        let reply = Frame::JsonRpc {
            data: "{}".to_string(),
        };
        FrameSender::new(writer).send(reply.clone()).await.unwrap();
        assert_eq!(client.await.unwrap(), reply);
    }

    #[tokio::test]
    async fn connect_without_listener_fails_after_retries() {
        let id = ChannelId::generate();
        let policy = ConnectPolicy {
            attempts: 3,
            interval: Duration::from_millis(5),
        };
        let started = std::time::Instant::now();
        assert!(connect_channel(&id, policy).await.is_err());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn connect_retries_until_listener_appears() {
        let id = ChannelId::generate();
        let policy = ConnectPolicy {
            attempts: 50,
            interval: Duration::from_millis(10),
        };
        let client = tokio::spawn({
            let id = id.clone();
            async move { connect_channel(&id, policy).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let listener = ChannelListener::bind(&id).unwrap();
        let _server = listener.accept().await.unwrap();
        assert!(client.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn named_socket_is_removed_on_drop() {
        let id = ChannelId::generate();
        let listener = NamedSocketListener::bind(&id).unwrap();
        let path = listener.path().clone();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropping_listener_releases_channel() {
        let id = ChannelId::generate();
        let first = ChannelListener::bind(&id).unwrap();
        drop(first);
        assert!(ChannelListener::bind(&id).is_ok());
    }

    #[tokio::test]
    async fn concurrent_senders_do_not_interleave() {
        let id = ChannelId::generate();
        let listener = ChannelListener::bind(&id).unwrap();
        let client = connect_channel(&id, ConnectPolicy::default()).await.unwrap();
        let (mut reader, _writer) = framed(listener.accept().await.unwrap());
        let (_client_reader, client_writer) = framed(client);
        let sender = FrameSender::new(client_writer);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                let data = format!("{{\"n\":{i},\"pad\":\"{}\"}}", "x".repeat(4096));
                sender.send(Frame::JsonRpc { data }).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..20 {
            let frame = reader.next().await.unwrap().unwrap().unwrap();
            let Frame::JsonRpc { data } = frame else {
                panic!("unexpected frame");
            };
            assert!(serde_json::from_str::<serde_json::Value>(&data).is_ok());
        }
    }
}
