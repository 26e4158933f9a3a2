//! tether: drive worker processes with JSON-RPC over a named local channel.
//!
//! A [`Coordinator`] spawns one worker, waits for its `initialize` handshake,
//! and then multiplexes concurrent calls over a Unix socket keyed by a
//! [`ChannelId`]. The worker side serves a [`MethodTable`] through
//! [`run_worker`]. A [`Scheduler`] sits on top and decides whether jobs share
//! a coordinator or each get their own, and how many run at once.

pub mod bridge;
pub mod coordinator;
pub mod logging;
pub mod method;
pub mod process;
pub mod scheduler;
pub mod worker;

pub use bridge::envelope::{ProtocolError, RemoteError, ThrownValue};
pub use bridge::protocol::{CHANNEL_ID_ENV, ChannelId, ConfigError, RequestId};
pub use bridge::transport::ConnectPolicy;
pub use coordinator::{CallError, Coordinator, CoordinatorConfig, CoordinatorError};
pub use method::RemoteMethod;
pub use process::{
    CommandSpawner, InProcessSpawner, SpawnError, WorkerHandle, WorkerProcess, WorkerSpawner,
    terminate_tree,
};
pub use scheduler::{
    ReusePolicy, ScheduleError, Scheduler, SchedulerConfig, available_parallelism,
    concurrency_limit,
};
pub use worker::{
    ConnectionState, MethodTable, MethodTableBuilder, WorkerConnection, WorkerError, run_worker,
};
