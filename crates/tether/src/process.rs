//! Worker processes: spawning, handles, and teardown.
//!
//! A [`WorkerSpawner`] turns a [`ChannelId`] into a running worker that will
//! connect back on that channel. [`CommandSpawner`] launches an executable;
//! [`InProcessSpawner`] runs a [`MethodTable`] on a tokio task, which is
//! handy for tests and for embedding.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{CHANNEL_ID_ENV, ChannelId};
use crate::bridge::transport::ConnectPolicy;
use crate::worker::{MethodTable, WorkerConnection};

/// A running worker as seen by its coordinator.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if the worker is an OS process.
    fn id(&self) -> Option<u32>;

    /// Ask the worker to die. Does not wait.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Wait for the worker to exit. Cancel safe; may be called again after exit.
    async fn wait(&mut self) -> io::Result<()>;
}

#[async_trait]
impl WorkerProcess for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }

    async fn wait(&mut self) -> io::Result<()> {
        let status = Child::wait(self).await?;
        tracing::debug!(%status, "Worker process exited");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned worker must connect to `channel_id`. Closures with the
/// matching signature are spawners too.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, channel_id: &ChannelId) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

impl<F> WorkerSpawner for F
where
    F: Fn(&ChannelId) -> Result<Box<dyn WorkerProcess>, SpawnError> + Send + Sync,
{
    fn spawn(&self, channel_id: &ChannelId) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        self(channel_id)
    }
}

/// A spawned worker plus the pid it had at spawn time.
///
/// The pid is captured up front: once a child has been reaped its id is gone,
/// but its process group may still hold descendants.
///
/// Dropping a handle that was never passed to [`terminate_tree`] terminates
/// the tree then.
pub struct WorkerHandle {
    process: Box<dyn WorkerProcess>,
    pid: Option<u32>,
    terminated: bool,
}

impl WorkerHandle {
    pub fn new(process: Box<dyn WorkerProcess>) -> Self {
        let pid = process.id();
        Self {
            process,
            pid,
            terminated: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn wait(&mut self) -> io::Result<()> {
        self.process.wait().await
    }

    /// Wait up to `timeout` for the worker to exit. Returns whether it did.
    pub async fn reap(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.process.wait()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(pid = ?self.pid, error = %e, "Failed to reap worker");
                false
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, ?timeout, "Worker did not exit in time");
                false
            }
        }
    }
}

/// Kill a worker and everything in its process group.
///
/// Signals the group first (descendants the worker started), then the worker
/// itself in case it isn't a group leader. Errors are logged and swallowed:
/// the targets may already be gone.
pub fn terminate_tree(worker: &mut WorkerHandle) {
    worker.terminated = true;

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = worker.pid.and_then(|pid| i32::try_from(pid).ok())
            && pid > 0
            && let Err(e) = signal::killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            tracing::debug!(pid, error = %e, "Process group kill failed");
        }
    }

    if let Err(e) = worker.process.start_kill() {
        tracing::debug!(pid = ?worker.pid, error = %e, "Process kill failed");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !self.terminated {
            tracing::debug!(pid = ?self.pid, "Worker handle dropped, terminating");
            terminate_tree(self);
        }
    }
}

/// Spawns an executable as the worker.
///
/// The child gets `TETHER_CHANNEL_ID`, runs in its own process group, and has
/// its stdout redirected to the coordinator's stderr so the coordinator's
/// stdout stays clean.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, channel_id: &ChannelId) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(CHANNEL_ID_ENV, channel_id.as_str())
            .stdin(Stdio::null())
            .stdout(io::stderr())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref dir) = self.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        tracing::debug!(
            pid = ?child.id(),
            program = ?self.program,
            %channel_id,
            "Spawned worker process"
        );
        Ok(Box::new(child))
    }
}

/// Runs a [`MethodTable`] as a worker on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct InProcessSpawner {
    table: MethodTable,
    policy: ConnectPolicy,
}

impl InProcessSpawner {
    pub fn new(table: MethodTable) -> Self {
        Self {
            table,
            policy: ConnectPolicy::default(),
        }
    }

    pub fn with_connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, channel_id: &ChannelId) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::Other(e.to_string()))?;
        let mut connection = WorkerConnection::new(channel_id.clone(), self.table.clone())
            .with_connect_policy(self.policy);
        let task = runtime.spawn(async move {
            match connection.connect().await {
                Ok(()) => connection.closed().await,
                Err(e) => tracing::warn!(error = %e, "In-process worker failed to connect"),
            }
        });
        Ok(Box::new(TaskProcess::new(task)))
    }
}

/// A worker running as a tokio task. Killing it aborts the task.
pub(crate) struct TaskProcess {
    task: Option<JoinHandle<()>>,
}

impl TaskProcess {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn start_kill(&mut self) -> io::Result<()> {
        if let Some(ref task) = self.task {
            task.abort();
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<()> {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
        Ok(())
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        if let Some(ref task) = self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn command_spawner_passes_channel_id() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("channel_id.txt");
        let spawner = CommandSpawner::new("sh")
            .arg("-c")
            .arg(r#"printf %s "$TETHER_CHANNEL_ID" > "$OUT""#)
            .env("OUT", &out);

        let id = ChannelId::generate();
        let mut worker = WorkerHandle::new(spawner.spawn(&id).unwrap());
        assert!(worker.pid().is_some());
        assert!(worker.reap(Duration::from_secs(10)).await);

        assert_eq!(std::fs::read_to_string(&out).unwrap(), id.as_str());
    }

    #[tokio::test]
    async fn command_spawner_runs_in_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = CommandSpawner::new("sh")
            .args(["-c", "touch marker"])
            .current_dir(dir.path());

        let mut worker = WorkerHandle::new(spawner.spawn(&ChannelId::generate()).unwrap());
        assert!(worker.reap(Duration::from_secs(10)).await);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/tether-worker");
        assert!(matches!(
            spawner.spawn(&ChannelId::generate()),
            Err(SpawnError::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn terminate_tree_kills_worker() {
        let spawner = CommandSpawner::new("sleep").arg("30");
        let mut worker = WorkerHandle::new(spawner.spawn(&ChannelId::generate()).unwrap());

        terminate_tree(&mut worker);
        assert!(worker.reap(Duration::from_secs(5)).await);

        // Already gone; a second teardown is harmless.
        terminate_tree(&mut worker);
    }

    #[tokio::test]
    async fn in_process_worker_stops_on_kill() {
        let spawner = InProcessSpawner::new(MethodTable::builder().build());
        // No coordinator is listening, so the worker keeps retrying until killed.
        let mut worker = WorkerHandle::new(spawner.spawn(&ChannelId::generate()).unwrap());
        assert_eq!(worker.pid(), None);

        terminate_tree(&mut worker);
        assert!(worker.reap(Duration::from_secs(5)).await);
        assert!(worker.reap(Duration::from_secs(1)).await);
    }

    struct RecordingProcess {
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerProcess for RecordingProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn start_kill(&mut self) -> io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn dropping_handle_kills_worker_once() {
        let kills = Arc::new(AtomicUsize::new(0));
        drop(WorkerHandle::new(Box::new(RecordingProcess {
            kills: Arc::clone(&kills),
        })));
        assert_eq!(kills.load(Ordering::SeqCst), 1);

        let kills = Arc::new(AtomicUsize::new(0));
        let mut handle = WorkerHandle::new(Box::new(RecordingProcess {
            kills: Arc::clone(&kills),
        }));
        terminate_tree(&mut handle);
        drop(handle);
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closures_are_spawners() {
        let spawner = |_: &ChannelId| -> Result<Box<dyn WorkerProcess>, SpawnError> {
            Err(SpawnError::Other("no workers today".to_string()))
        };
        let err = WorkerSpawner::spawn(&spawner, &ChannelId::generate()).err().expect("spawn should fail");
        assert_eq!(err.to_string(), "spawn failed: no workers today");
    }
}
