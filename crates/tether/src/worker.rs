//! Worker side of the channel - runs inside the spawned worker process.
//!
//! The worker connects to the channel named by `TETHER_CHANNEL_ID`, announces
//! itself with an `initialize` frame, and then serves JSON-RPC requests from
//! its [`MethodTable`]. Requests run concurrently; each reply carries the id
//! of the request it answers.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};

use anyhow::Context;

use crate::bridge::envelope::{
    RemoteError, Request, decode_request, encode_error, encode_remote_error, encode_result,
};
use crate::bridge::protocol::{ChannelId, ConfigError, Frame};
use crate::bridge::transport::{ConnectPolicy, FrameReader, FrameSender, connect_channel, framed};
use crate::method::{RemoteMethod, decode_params};

/// Type-erased method handler: positional params in, JSON value out.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Methods a worker exposes, keyed by name. Immutable once built.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Arc<HashMap<String, Handler>>,
}

impl MethodTable {
    pub fn builder() -> MethodTableBuilder {
        MethodTableBuilder::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<Handler> {
        self.methods.get(name).cloned()
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

#[derive(Default)]
pub struct MethodTableBuilder {
    methods: HashMap<String, Handler>,
}

impl MethodTableBuilder {
    /// Register an untyped handler. A later registration under the same name wins.
    pub fn raw<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    /// Register a handler for a typed method.
    ///
    /// Params that don't decode into `M::Params` fail the call with a
    /// method error; the handler is not invoked.
    pub fn method<M, F, Fut>(self, handler: F) -> Self
    where
        M: RemoteMethod,
        F: Fn(M::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M::Output>> + Send + 'static,
    {
        self.raw(M::NAME, move |params| {
            let call = decode_params::<M::Params>(params).map(&handler);
            async move {
                let output = call
                    .with_context(|| format!("invalid params for {}", M::NAME))?
                    .await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(output)?)
            }
        })
    }

    pub fn build(self) -> MethodTable {
        MethodTable {
            methods: Arc::new(self.methods),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to channel {channel_id}: {source}")]
    Connect {
        channel_id: ChannelId,
        #[source]
        source: io::Error,
    },

    #[error("failed to send initialize: {0}")]
    Handshake(#[source] io::Error),

    #[error("connection is {0:?}, expected Disconnected")]
    InvalidState(ConnectionState),
}

/// A worker's connection to its coordinator.
pub struct WorkerConnection {
    channel_id: ChannelId,
    table: MethodTable,
    policy: ConnectPolicy,
    state: ConnectionState,
    dispatch: Option<JoinHandle<()>>,
}

impl WorkerConnection {
    pub fn new(channel_id: ChannelId, table: MethodTable) -> Self {
        Self {
            channel_id,
            table,
            policy: ConnectPolicy::default(),
            state: ConnectionState::Disconnected,
            dispatch: None,
        }
    }

    /// Build a connection for the channel id the coordinator put in the
    /// environment. Fails before any I/O if the id is missing or invalid.
    pub fn from_env(table: MethodTable) -> Result<Self, ConfigError> {
        Ok(Self::new(ChannelId::from_env()?, table))
    }

    pub fn with_connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connect, send `initialize`, and start serving requests.
    pub async fn connect(&mut self) -> Result<(), WorkerError> {
        if self.state != ConnectionState::Disconnected {
            return Err(WorkerError::InvalidState(self.state));
        }
        self.state = ConnectionState::Connecting;

        let stream = match connect_channel(&self.channel_id, self.policy).await {
            Ok(stream) => stream,
            Err(source) => {
                self.state = ConnectionState::Disconnected;
                return Err(WorkerError::Connect {
                    channel_id: self.channel_id.clone(),
                    source,
                });
            }
        };

        let (reader, writer) = framed(stream);
        let sender = FrameSender::new(writer);
        if let Err(e) = sender.send(Frame::Initialize).await {
            self.state = ConnectionState::Disconnected;
            return Err(WorkerError::Handshake(e));
        }
        tracing::debug!(channel_id = %self.channel_id, "Sent initialize");

        self.dispatch = Some(tokio::spawn(dispatch_loop(
            reader,
            sender,
            self.table.clone(),
        )));
        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// Wait until the coordinator closes the channel.
    pub async fn closed(&mut self) {
        if let Some(handle) = self.dispatch.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            tracing::error!(error = %e, "Dispatch loop failed");
        }
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Closed;
        }
    }

    /// Stop serving and drop the channel. Safe to call more than once.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.dispatch.take() {
            handle.abort();
            tracing::debug!(channel_id = %self.channel_id, "Disconnected");
        }
        self.state = ConnectionState::Closed;
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.take() {
            handle.abort();
        }
    }
}

/// Serve the coordinator named in the environment until it closes the channel.
pub async fn run_worker(table: MethodTable) -> Result<(), WorkerError> {
    let mut connection = WorkerConnection::from_env(table)?;
    connection.connect().await?;
    tracing::info!(
        channel_id = %connection.channel_id(),
        methods = connection.table.len(),
        "Worker connected"
    );
    connection.closed().await;
    tracing::info!("Channel closed, worker exiting");
    Ok(())
}

async fn dispatch_loop(mut reader: FrameReader, sender: FrameSender, table: MethodTable) {
    // Dropping the set aborts requests still running when the channel goes away.
    let mut requests = JoinSet::new();

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Ok(Frame::JsonRpc { data }))) => match decode_request(&data) {
                    Ok(request) => {
                        requests.spawn(handle_request(request, table.clone(), sender.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable request");
                    }
                },
                Some(Ok(Ok(Frame::Initialize))) => {
                    tracing::warn!("Unexpected initialize from coordinator");
                }
                Some(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "Dropping malformed frame");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Channel read error");
                    break;
                }
                None => {
                    tracing::debug!("Channel closed by coordinator");
                    break;
                }
            },

            Some(_) = requests.join_next() => {}
        }
    }
}

async fn handle_request(request: Request, table: MethodTable, sender: FrameSender) {
    let Request {
        method, params, id, ..
    } = request;

    let reply = match table.get(&method) {
        None => {
            tracing::debug!(%id, %method, "Method not found");
            encode_remote_error(&RemoteError::method_not_found(&method), &id)
        }
        Some(handler) => {
            tracing::trace!(%id, %method, "Running method");
            let outcome = AssertUnwindSafe(async move { handler(params).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(value)) => encode_result(value, &id),
                Ok(Err(error)) => {
                    tracing::debug!(%id, %method, error = %error, "Method failed");
                    encode_error(&error, &id)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!(%id, %method, %message, "Method panicked");
                    encode_remote_error(&RemoteError::method_failed(message, None), &id)
                }
            }
        }
    };

    let data = match reply {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(%id, error = %e, "Failed to encode response");
            return;
        }
    };
    if let Err(e) = sender.send(Frame::JsonRpc { data }).await {
        tracing::warn!(%id, error = %e, "Failed to send response");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("method panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("method panicked: {s}")
    } else {
        "method panicked".to_string()
    }
}
