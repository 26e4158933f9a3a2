//! Coordinator - owns one worker process and the channel to it.
//!
//! Flow:
//! 1. Bind the channel under a fresh [`ChannelId`]
//! 2. Spawn the worker with that id
//! 3. Wait for the worker's `initialize` frame (handshake barrier)
//! 4. Route responses to pending calls by request id
//! 5. On stop: close the channel, kill the worker's process tree, reap it

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::envelope::{Outcome, RemoteError, Response, decode_response, encode_request};
use crate::bridge::protocol::{ChannelId, Frame, RequestId};
use crate::bridge::transport::{ChannelListener, FrameReader, FrameSender, framed};
use crate::method::{RemoteMethod, encode_params};
use crate::process::{SpawnError, WorkerHandle, WorkerSpawner, terminate_tree};

type PendingCalls = Arc<DashMap<RequestId, oneshot::Sender<Outcome>>>;

#[derive(Clone)]
pub struct CoordinatorConfig {
    /// Starts the worker process for each coordinator.
    pub spawner: Arc<dyn WorkerSpawner>,
    /// Give up on a worker that hasn't sent `initialize` by then. Off by default.
    pub handshake_timeout: Option<Duration>,
    /// Fail calls that get no response by then. Off by default.
    pub call_timeout: Option<Duration>,
    /// How long `stop` waits for a killed worker to be reaped.
    pub reap_timeout: Duration,
}

impl CoordinatorConfig {
    /// No timeouts, 5s reap timeout.
    pub fn new(spawner: impl WorkerSpawner + 'static) -> Self {
        Self {
            spawner: Arc::new(spawner),
            handshake_timeout: None,
            call_timeout: None,
            reap_timeout: Duration::from_secs(5),
        }
    }

    /// Fail `start` if the worker hasn't sent `initialize` by then.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Fail calls that get no response by then.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// How long `stop` waits for the killed worker to exit.
    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to open channel {channel_id}: {source}")]
    Channel {
        channel_id: ChannelId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker exited before initialize")]
    WorkerExited,
    #[error("worker did not initialize within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("coordinator already started")]
    AlreadyStarted,
    #[error("coordinator stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("coordinator not started")]
    NotStarted,
    #[error("coordinator stopped")]
    Stopped,
    #[error("failed to encode request for {method}: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to send request: {0}")]
    Send(#[source] std::io::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("failed to decode result of {method}: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("channel closed before a response arrived")]
    Disconnected,
}

impl CallError {
    /// The worker's error, if the method itself failed.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

struct Session {
    sender: FrameSender,
    worker: WorkerHandle,
    dispatch: JoinHandle<()>,
}

impl Session {
    async fn shutdown(mut self, reap_timeout: Duration) {
        self.dispatch.abort();
        drop(self.sender);
        terminate_tree(&mut self.worker);
        self.worker.reap(reap_timeout).await;
    }
}

enum State {
    Created,
    Spawning,
    Alive(Session),
    Stopped,
}

/// Drives one worker process over one channel.
///
/// Calls may be issued concurrently from any number of tasks; responses are
/// matched to callers by request id in whatever order the worker sends them.
pub struct Coordinator {
    channel_id: ChannelId,
    config: CoordinatorConfig,
    state: Mutex<State>,
    pending: PendingCalls,
    cancel: CancellationToken,
    /// Cancelled once `start` has finished, however it finished.
    settled: CancellationToken,
}

/// Resolves a `start` that didn't reach `Alive`, including one whose future
/// was dropped mid-handshake. The worker itself is killed when its
/// [`WorkerHandle`] drops.
struct StartGuard<'a> {
    coordinator: &'a Coordinator,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.lock_state();
        if matches!(*state, State::Spawning) {
            *state = State::Stopped;
        }
        drop(state);
        self.coordinator.settled.cancel();
    }
}

/// Removes a call's pending entry on every exit path, including the caller
/// dropping the call future.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            channel_id: ChannelId::generate(),
            config,
            state: Mutex::new(State::Created),
            pending: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            settled: CancellationToken::new(),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn is_alive(&self) -> bool {
        matches!(*self.lock_state(), State::Alive(_))
    }

    /// OS pid of the worker while it is alive.
    pub fn pid(&self) -> Option<u32> {
        match *self.lock_state() {
            State::Alive(ref session) => session.worker.pid(),
            _ => None,
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker and wait for its handshake.
    ///
    /// On failure the partially started worker is torn down and the
    /// coordinator is left stopped. The same holds if this future is dropped
    /// before it completes.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = self.lock_state();
            match *state {
                State::Created => *state = State::Spawning,
                State::Stopped => return Err(CoordinatorError::Stopped),
                State::Spawning | State::Alive(_) => return Err(CoordinatorError::AlreadyStarted),
            }
        }
        let _guard = StartGuard { coordinator: self };

        let session = match self.launch().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(channel_id = %self.channel_id, error = %e, "Worker failed to start");
                return Err(e);
            }
        };

        let pid = session.worker.pid();
        let raced = {
            let mut state = self.lock_state();
            if matches!(*state, State::Spawning) {
                *state = State::Alive(session);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = raced {
            session.shutdown(self.config.reap_timeout).await;
            return Err(CoordinatorError::Stopped);
        }

        tracing::info!(channel_id = %self.channel_id, ?pid, "Worker ready");
        Ok(())
    }

    async fn launch(&self) -> Result<Session, CoordinatorError> {
        let listener =
            ChannelListener::bind(&self.channel_id).map_err(|source| CoordinatorError::Channel {
                channel_id: self.channel_id.clone(),
                source,
            })?;

        let mut worker = WorkerHandle::new(self.config.spawner.spawn(&self.channel_id)?);
        tracing::debug!(
            channel_id = %self.channel_id,
            pid = ?worker.pid(),
            "Waiting for worker to initialize"
        );

        let handshake_timeout = self.config.handshake_timeout;
        let handshake = tokio::select! {
            result = accept_handshake(&listener, &self.channel_id) => result,
            exited = worker.wait() => Err(match exited {
                Ok(()) => CoordinatorError::WorkerExited,
                Err(e) => CoordinatorError::Protocol(format!("failed to wait for worker: {e}")),
            }),
            _ = sleep_or_forever(handshake_timeout) => Err(CoordinatorError::HandshakeTimeout(
                handshake_timeout.unwrap_or_default(),
            )),
            _ = self.cancel.cancelled() => Err(CoordinatorError::Stopped),
        };

        match handshake {
            Ok((reader, sender)) => {
                let dispatch = tokio::spawn(dispatch_responses(
                    reader,
                    Arc::clone(&self.pending),
                    self.channel_id.clone(),
                ));
                Ok(Session {
                    sender,
                    worker,
                    dispatch,
                })
            }
            Err(e) => {
                terminate_tree(&mut worker);
                worker.reap(self.config.reap_timeout).await;
                Err(e)
            }
        }
    }

    fn sender(&self) -> Result<FrameSender, CallError> {
        match *self.lock_state() {
            State::Alive(ref session) => Ok(session.sender.clone()),
            State::Created | State::Spawning => Err(CallError::NotStarted),
            State::Stopped => Err(CallError::Stopped),
        }
    }

    /// Call a method by name with positional params.
    ///
    /// Without a configured call timeout this waits as long as it takes; a
    /// call whose worker dies without answering does not resolve.
    pub async fn call_raw(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let sender = self.sender()?;
        let (id, data) = encode_request(method, params).map_err(|source| CallError::Encode {
            method: method.to_string(),
            source,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        tracing::trace!(%id, method, "Sending request");
        sender
            .send(Frame::JsonRpc { data })
            .await
            .map_err(CallError::Send)?;
        drop(sender);

        let outcome = match self.config.call_timeout {
            None => rx.await,
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(%id, method, ?timeout, "Call timed out");
                    return Err(CallError::Timeout {
                        method: method.to_string(),
                        timeout,
                    });
                }
            },
        };

        match outcome {
            Ok(Outcome::Result(value)) => Ok(value),
            Ok(Outcome::Error(error)) => Err(CallError::Remote(error)),
            Err(_) => Err(CallError::Disconnected),
        }
    }

    /// Call a typed method.
    pub async fn call<M: RemoteMethod>(&self, params: M::Params) -> Result<M::Output, CallError> {
        let params = encode_params(&params).map_err(|source| CallError::Encode {
            method: M::NAME.to_string(),
            source,
        })?;
        let value = self.call_raw(M::NAME, params).await?;
        serde_json::from_value(value).map_err(|source| CallError::Decode {
            method: M::NAME,
            source,
        })
    }

    /// Close the channel and kill the worker's process tree. Idempotent.
    ///
    /// Calls still waiting for a response fail with [`CallError::Disconnected`].
    /// A `start` in progress is interrupted, and `stop` returns once its
    /// worker has been torn down.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), State::Stopped);
        self.cancel.cancel();

        match previous {
            State::Alive(session) => {
                tracing::debug!(
                    channel_id = %self.channel_id,
                    pid = ?session.worker.pid(),
                    pending = self.pending.len(),
                    "Stopping worker"
                );
                session.shutdown(self.config.reap_timeout).await;
                self.pending.clear();
                tracing::info!(channel_id = %self.channel_id, "Worker stopped");
            }
            State::Spawning => {
                tracing::debug!(channel_id = %self.channel_id, "Stop requested during start");
                self.settled.cancelled().await;
            }
            State::Created | State::Stopped => {}
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let State::Alive(session) = std::mem::replace(state, State::Stopped) {
            tracing::debug!(channel_id = %self.channel_id, "Coordinator dropped while alive");
            session.dispatch.abort();
            // Dropping the handle kills the worker's process tree.
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Accept the worker's connection and wait for `initialize`.
async fn accept_handshake(
    listener: &ChannelListener,
    channel_id: &ChannelId,
) -> Result<(FrameReader, FrameSender), CoordinatorError> {
    let stream = listener
        .accept()
        .await
        .map_err(|source| CoordinatorError::Channel {
            channel_id: channel_id.clone(),
            source,
        })?;
    let (mut reader, writer) = framed(stream);

    loop {
        match reader.next().await {
            Some(Ok(Ok(Frame::Initialize))) => {
                tracing::debug!(%channel_id, "Received initialize");
                return Ok((reader, FrameSender::new(writer)));
            }
            Some(Ok(Ok(Frame::JsonRpc { .. }))) => {
                tracing::warn!(%channel_id, "Dropping message received before initialize");
            }
            Some(Ok(Err(e))) => {
                tracing::warn!(%channel_id, error = %e, "Dropping malformed frame before initialize");
            }
            Some(Err(e)) => {
                return Err(CoordinatorError::Protocol(format!(
                    "channel error before initialize: {e}"
                )));
            }
            None => {
                return Err(CoordinatorError::Protocol(
                    "channel closed before initialize".to_string(),
                ));
            }
        }
    }
}

async fn dispatch_responses(mut reader: FrameReader, pending: PendingCalls, channel_id: ChannelId) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Ok(Frame::JsonRpc { data })) => match decode_response(&data) {
                Ok(response) => complete(&pending, response),
                Err(e) => {
                    tracing::warn!(%channel_id, error = %e, "Dropping undecodable response");
                }
            },
            Ok(Ok(Frame::Initialize)) => {
                tracing::warn!(%channel_id, "Unexpected initialize after handshake");
            }
            Ok(Err(e)) => {
                tracing::warn!(%channel_id, error = %e, "Dropping malformed frame");
            }
            Err(e) => {
                tracing::error!(%channel_id, error = %e, "Channel read error");
                break;
            }
        }
    }
    tracing::debug!(
        %channel_id,
        pending = pending.len(),
        "Channel closed by worker"
    );
}

/// Resolve the call waiting on `response.id`. Unknown ids are dropped.
fn complete(pending: &DashMap<RequestId, oneshot::Sender<Outcome>>, response: Response) {
    match pending.remove(&response.id) {
        Some((id, tx)) => {
            if tx.send(response.outcome).is_err() {
                tracing::debug!(%id, "Caller went away before response");
            }
        }
        None => {
            tracing::debug!(id = %response.id, "Dropping response with unknown id");
        }
    }
}
