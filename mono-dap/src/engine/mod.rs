// Engine boundary
//
// The session drives a debugger engine only through these traits. Engines
// report asynchronous happenings (stops, thread changes, exit) over a bounded
// channel that the session drains; the session is the only mutator of its
// own state.

pub mod soft;

use crate::error::EngineResult;
use sdb_client::RetryPolicy;
use std::future::Future;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use soft::{SoftDebugger, SoftDebuggerConnector};

/// Capacity of the engine event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Step,
    Breakpoint,
    Exception { message: String },
    Pause,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Step => "step",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Exception { .. } => "exception",
            StopReason::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Ready,
    Stopped { thread: i64, reason: StopReason },
    ThreadStarted { id: i64, name: String },
    ThreadExited { id: i64 },
    Output { is_stderr: bool, text: String },
    Exited { exit_code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineThread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFrame {
    /// Position on the thread's stack, 0 = innermost
    pub index: usize,
    pub method: String,
    pub file: Option<String>,
    /// Engine line, 0 when unknown
    pub line: i64,
    pub column: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    pub frames: Vec<EngineFrame>,
    /// Depth of the whole stack, not just the frames returned
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct FrameScopes<V> {
    pub this: Option<V>,
    pub arguments: Vec<V>,
    pub locals: Vec<V>,
}

impl<V> Default for FrameScopes<V> {
    fn default() -> Self {
        Self {
            this: None,
            arguments: Vec::new(),
            locals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueFlags {
    pub error: bool,
    pub not_supported: bool,
    pub unknown: bool,
    pub object: bool,
    pub namespace: bool,
}

/// A value with its display text computed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedValue {
    pub name: String,
    pub display: Option<String>,
    pub type_name: Option<String>,
    pub flags: ValueFlags,
    pub has_children: bool,
}

#[derive(Debug, Clone)]
pub struct ExceptionInfo<V> {
    pub type_name: String,
    pub message: String,
    pub instance: V,
}

/// Where the runtime's debugger agent can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTarget {
    /// The agent listens and we connect to it
    Connect(SocketAddr),
    /// We listen and the agent connects back
    Listen(SocketAddr),
}

impl ConnectTarget {
    pub fn addr(&self) -> SocketAddr {
        match self {
            ConnectTarget::Connect(addr) | ConnectTarget::Listen(addr) => *addr,
        }
    }
}

pub trait Engine: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    // Execution control

    /// Let a freshly connected VM run once breakpoints are in place
    fn start(&self) -> impl Future<Output = EngineResult<()>> + Send;
    fn resume(&self) -> impl Future<Output = EngineResult<()>> + Send;
    fn step(&self, kind: StepKind) -> impl Future<Output = EngineResult<()>> + Send;
    /// Suspend a running VM; a `Stopped { reason: Pause }` follows
    fn interrupt(&self) -> impl Future<Output = EngineResult<()>> + Send;
    /// Leave the VM running without us
    fn detach(&self) -> impl Future<Output = EngineResult<()>> + Send;
    fn dispose(&self) -> impl Future<Output = ()> + Send;

    // Inspection

    fn threads(&self) -> impl Future<Output = EngineResult<Vec<EngineThread>>> + Send;
    fn active_thread(&self) -> Option<i64>;
    fn set_active_thread(&self, thread: i64) -> impl Future<Output = EngineResult<()>> + Send;
    /// Frames of the active thread
    fn backtrace(
        &self,
        start: usize,
        levels: Option<usize>,
    ) -> impl Future<Output = EngineResult<Backtrace>> + Send;
    fn frame_scopes(
        &self,
        thread: i64,
        frame: usize,
    ) -> impl Future<Output = EngineResult<FrameScopes<Self::Value>>> + Send;

    // Values

    fn resolve(&self, value: &Self::Value) -> impl Future<Output = ResolvedValue> + Send;
    fn children(
        &self,
        value: &Self::Value,
    ) -> impl Future<Output = EngineResult<Vec<Self::Value>>> + Send;

    // Expressions

    /// Syntax check before anything is sent to the VM
    fn validate_expression(&self, expression: &str) -> Result<(), String>;
    fn evaluate(
        &self,
        thread: i64,
        frame: usize,
        expression: &str,
    ) -> impl Future<Output = EngineResult<Self::Value>> + Send;
    fn active_exception(
        &self,
        thread: i64,
    ) -> impl Future<Output = Option<ExceptionInfo<Self::Value>>> + Send;

    // Breakpoints, keyed by the adapter's ids

    fn insert_breakpoint(
        &self,
        id: u32,
        path: &str,
        line: i64,
    ) -> impl Future<Output = EngineResult<()>> + Send;
    fn remove_breakpoint(&self, id: u32) -> impl Future<Output = EngineResult<()>> + Send;
    fn insert_catchpoint(
        &self,
        id: u32,
        exception: &str,
    ) -> impl Future<Output = EngineResult<()>> + Send;
    fn remove_catchpoint(&self, id: u32) -> impl Future<Output = EngineResult<()>> + Send;
}

pub trait EngineConnector: Send + Sync + 'static {
    type Engine: Engine;

    fn connect(
        &self,
        target: ConnectTarget,
        policy: RetryPolicy,
        cancel: CancellationToken,
        events: mpsc::Sender<EngineEvent>,
    ) -> impl Future<Output = EngineResult<Self::Engine>> + Send;
}
