//! Dispatcher - owns the child's pipes and serializes every call onto them.
//!
//! Flow:
//! 1. Spawn the child process with piped stdin/stdout
//! 2. Start one worker task that owns both pipe ends
//! 3. Callers hand calls to the worker through a rendezvous queue
//! 4. Worker writes one request, reads one response, resolves the call, repeats
//! 5. On stop: drain, send `quit`, close both pipes, wait for the child
//!
//! A read or write failure on the pipe is fatal for the whole bridge.

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINE_LENGTH, LineCodec, Limits};
use crate::bridge::protocol::{ControlRequest, ProtocolError, validate_call};
use crate::call::PendingCall;
use crate::value::Record;

/// Program run when neither the config nor `BOOKR_BIN` names one.
pub const DEFAULT_PROGRAM: &str = "bookr";

/// Exit status used by the default fatal handler.
pub const FATAL_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Created,
    /// Pipes are open and the worker has been launched.
    Started,
    /// Worker is taking calls from the queue.
    Running,
    /// Queue closed; worker is draining and shutting the child down.
    Stopping,
    /// Child has exited.
    Stopped,
    /// A pipe failed; no further calls will be served.
    Defunct,
}

impl DispatcherState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Defunct)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Defunct => "defunct",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed opening {0}: not captured")]
    PipeNotCaptured(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed writing request {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading response to {id}: {source}")]
    Read {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child closed its output before responding to {id}")]
    UnexpectedEof { id: String },
    #[error("invalid request: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("bridge is closed")]
    Closed,
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("bridge worker terminated: {0}")]
    Worker(String),
}

/// Extension point for different ways of launching the child.
///
/// The returned child must have stdin and stdout piped.
pub trait ChildSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, StartupError>;
}

/// Runs a program with piped stdin/stdout and inherited stderr.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ChildSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, StartupError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }
}

/// Called with the failure when a pipe breaks. Must not return; if it does,
/// the worker panics with the same diagnostic.
pub type FatalHandler = Arc<dyn Fn(&BridgeError) + Send + Sync>;

fn exit_process(err: &BridgeError) {
    eprintln!("bookr-bridge: fatal: {err}");
    std::process::exit(FATAL_EXIT_CODE);
}

pub struct DispatcherConfig {
    pub spawner: Arc<dyn ChildSpawner>,
    pub max_line_length: usize,
    pub max_depth: usize,
    pub fatal_handler: FatalHandler,
}

impl DispatcherConfig {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            spawner: Arc::new(CommandSpawner::new(program)),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_depth: DEFAULT_MAX_DEPTH,
            fatal_handler: Arc::new(exit_process),
        }
    }

    /// Program from `BOOKR_BIN`, line limit from `BOOKR_MAX_LINE_LENGTH`.
    pub fn from_env() -> Self {
        let program = std::env::var_os("BOOKR_BIN").unwrap_or_else(|| DEFAULT_PROGRAM.into());
        let mut config = Self::new(program);

        if let Ok(raw) = std::env::var("BOOKR_MAX_LINE_LENGTH") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.max_line_length = n,
                _ => {
                    tracing::warn!(value = %raw, "Ignoring invalid BOOKR_MAX_LINE_LENGTH");
                }
            }
        }

        config
    }

    /// Run `program` with `args` instead of the configured program.
    pub fn with_command<I, S>(self, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.with_spawner(Arc::new(CommandSpawner::new(program).with_args(args)))
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ChildSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_max_line_length(mut self, n: usize) -> Self {
        self.max_line_length = n;
        self
    }

    pub fn with_max_depth(mut self, n: usize) -> Self {
        self.max_depth = n;
        self
    }

    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    fn limits(&self) -> Limits {
        Limits {
            max_line_length: self.max_line_length,
            max_depth: self.max_depth,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

/// A call handed to the worker, with the signal that it was accepted.
struct Submission {
    call: PendingCall,
    accepted: oneshot::Sender<()>,
}

type WorkerResult = Result<Option<ExitStatus>, BridgeError>;

/// Handle to the running bridge. Share it (e.g. in an `Arc`) between callers.
pub struct Dispatcher {
    queue: StdMutex<Option<mpsc::Sender<Submission>>>,
    state: watch::Receiver<DispatcherState>,
    worker: tokio::sync::Mutex<Option<JoinHandle<WorkerResult>>>,
}

impl Dispatcher {
    /// Spawn the child and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: DispatcherConfig) -> Result<Self, StartupError> {
        tracing::info!("Spawning child process");
        let mut child = config.spawner.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or(StartupError::PipeNotCaptured("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(StartupError::PipeNotCaptured("stdout"))?;

        tracing::debug!(pid = ?child.id(), "Child process started");
        Ok(Self::launch(stdout, stdin, Some(child), config))
    }

    /// Start the worker over pipes opened elsewhere. There is no child to
    /// wait for on stop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_io<R, W>(reader: R, writer: W, config: DispatcherConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::launch(reader, writer, None, config)
    }

    fn launch<R, W>(reader: R, writer: W, child: Option<Child>, config: DispatcherConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(DispatcherState::Created);
        let limits = config.limits();
        let reader = FramedRead::new(reader, LineCodec::<Record>::with_limits(limits));
        let writer = FramedWrite::new(writer, LineCodec::<ControlRequest>::with_limits(limits));

        // Capacity 1 plus the acceptance signal gives a rendezvous hand-off.
        let (queue_tx, queue_rx) = mpsc::channel(1);

        set_state(&state_tx, DispatcherState::Started);
        let worker = tokio::spawn(run_worker(
            reader,
            writer,
            queue_rx,
            child,
            state_tx,
            config.fatal_handler,
        ));

        Self {
            queue: StdMutex::new(Some(queue_tx)),
            state: state_rx,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Build a call and hand it to the worker. See [`Dispatcher::submit`].
    pub async fn send(
        &self,
        id: impl Into<String>,
        payload: Record,
    ) -> Result<PendingCall, BridgeError> {
        let call = PendingCall::new(id, payload);
        self.submit(call.clone()).await?;
        Ok(call)
    }

    /// Hand a call to the worker.
    ///
    /// Returns once the worker has taken the call off the queue, not when
    /// the response arrives. Calls are written in the order they are
    /// accepted. A payload the wire cannot represent is rejected here
    /// without touching the pipe.
    pub async fn submit(&self, call: PendingCall) -> Result<(), BridgeError> {
        validate_call(call.id(), call.payload())?;

        let queue = match self.queue.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let queue = queue.ok_or(BridgeError::Closed)?;

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let call_id = call.id().to_string();
        queue
            .send(Submission {
                call,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| BridgeError::Closed)?;
        accepted_rx.await.map_err(|_| BridgeError::Closed)?;

        tracing::trace!(%call_id, "Call accepted");
        Ok(())
    }

    /// Send a call and wait for its response.
    pub async fn call(
        &self,
        id: impl Into<String>,
        payload: Record,
    ) -> Result<Arc<Record>, BridgeError> {
        let call = self.send(id, payload).await?;
        Ok(call.wait().await)
    }

    /// Close the queue and wait for the worker to shut the child down.
    ///
    /// Calls already accepted are finished first. Returns the child's exit
    /// status (`None` when running over plain pipes or when already stopped).
    pub async fn stop(&self) -> Result<Option<ExitStatus>, BridgeError> {
        let queue = match self.queue.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(queue);

        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(None);
        };

        tracing::info!("Stopping bridge");
        match worker.await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::Worker(e.to_string())),
        }
    }
}

async fn run_worker<R, W>(
    mut reader: FramedRead<R, LineCodec<Record>>,
    mut writer: FramedWrite<W, LineCodec<ControlRequest>>,
    mut queue: mpsc::Receiver<Submission>,
    child: Option<Child>,
    state: watch::Sender<DispatcherState>,
    fatal_handler: FatalHandler,
) -> WorkerResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    set_state(&state, DispatcherState::Running);

    while let Some(Submission { call, accepted }) = queue.recv().await {
        if accepted.send(()).is_err() {
            tracing::debug!(call_id = %call.id(), "Submitter went away before acceptance");
        }

        match exchange(&mut reader, &mut writer, &call).await {
            Ok(response) => {
                tracing::debug!(
                    call_id = %call.id(),
                    elapsed_ms = call.elapsed().as_millis() as u64,
                    fields = response.len(),
                    "Call resolved"
                );
                call.resolve(response);
            }
            Err(e) => {
                set_state(&state, DispatcherState::Defunct);
                tracing::error!(error = %e, "Bridge pipe failed, terminating");
                fatal_handler(&e);
                panic!("bridge pipe failed: {e}");
            }
        }
    }

    set_state(&state, DispatcherState::Stopping);
    let result = shut_down(reader, writer, child).await;
    set_state(&state, shutdown_state(&result));
    result
}

/// Send `quit`, close both pipes and wait for the child to exit.
async fn shut_down<R, W>(
    reader: FramedRead<R, LineCodec<Record>>,
    mut writer: FramedWrite<W, LineCodec<ControlRequest>>,
    child: Option<Child>,
) -> WorkerResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::debug!("Queue closed, shutting down child");
    if let Err(e) = writer.send(ControlRequest::Quit).await {
        tracing::warn!(error = %e, "Failed to send quit");
    }
    if let Err(e) = writer.close().await {
        tracing::warn!(error = %e, "Failed to close child input");
    }
    drop(writer);
    drop(reader);

    let Some(mut child) = child else {
        return Ok(None);
    };
    match child.wait().await {
        Ok(status) => {
            tracing::info!(%status, "Child process exited");
            Ok(Some(status))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for child process");
            Err(BridgeError::Wait(e))
        }
    }
}

/// Where the worker settles once shutdown is over. An unreaped child is not a
/// clean stop.
fn shutdown_state(result: &WorkerResult) -> DispatcherState {
    match result {
        Ok(_) => DispatcherState::Stopped,
        Err(_) => DispatcherState::Defunct,
    }
}

fn set_state(state: &watch::Sender<DispatcherState>, next: DispatcherState) {
    let prev = state.send_replace(next);
    tracing::debug!(from = prev.as_str(), to = next.as_str(), "Dispatcher state changed");
}

/// Write one request and read exactly one response.
async fn exchange<R, W>(
    reader: &mut FramedRead<R, LineCodec<Record>>,
    writer: &mut FramedWrite<W, LineCodec<ControlRequest>>,
    call: &PendingCall,
) -> Result<Record, BridgeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::debug!(call_id = %call.id(), "Writing request");
    writer
        .send(call.request())
        .await
        .map_err(|source| BridgeError::Write {
            id: call.id().to_string(),
            source,
        })?;

    match reader.next().await {
        Some(Ok(response)) => Ok(response),
        Some(Err(source)) => Err(BridgeError::Read {
            id: call.id().to_string(),
            source,
        }),
        None => Err(BridgeError::UnexpectedEof {
            id: call.id().to_string(),
        }),
    }
}
