// Debug session
//
// One session per client connection. It owns the debuggee's lifecycle,
// translates between client and engine conventions, and turns engine and
// process events into protocol events. Engine and debuggee events arrive
// over channels; the session is the only thing that touches its state.

use crate::args::{
    self, catchpoint_names, AttachArguments, DisconnectArguments, EvaluateArguments,
    ExceptionOptions, InitializeArguments, LaunchArguments, ScopesArguments,
    SetBreakpointsArguments, SetExceptionBreakpointsArguments, SetFunctionBreakpointsArguments,
    SourceArguments, StackTraceArguments, ThreadArguments, VariablesArguments,
};
use crate::breakpoints::{has_mono_extension, BreakpointTable};
use crate::config::AdapterConfig;
use crate::convert::Conventions;
use crate::dispatcher::{RequestHandler, Responder};
use crate::engine::{
    ConnectTarget, Engine, EngineConnector, EngineEvent, EngineFrame, ExceptionInfo, StepKind,
    StopReason, EVENT_CHANNEL_CAPACITY,
};
use crate::error::{HandlerError, RequestError};
use crate::handles::Handles;
use crate::protocol::{
    Breakpoint, Capabilities, EvaluateResponseBody, Event, ExitedEventBody, OutputEventBody,
    ProtocolMessage, Scope, ScopesResponseBody, SetBreakpointsResponseBody, Source, StackFrame,
    StackTraceResponseBody, StoppedEventBody, Thread, ThreadEventBody, ThreadsResponseBody,
    Variable, VariablesResponseBody,
};
use crate::transport::MessageSink;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type EngineValue<C> = <<C as EngineConnector>::Engine as Engine>::Value;

const NOT_AVAILABLE_IN_CONTEXT: &str =
    "reference not available in the current evaluation context";
// Extra time allowed on disconnect beyond the output drain
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Background happenings the session reacts to between requests
#[derive(Debug)]
pub enum SessionEvent {
    Engine(EngineEvent),
    Process(ProcessEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { category: &'static str, text: String },
    Exited { exit_code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Disconnected,
    Launched,
    Connected,
    Listening,
}

/// What a variables handle expands to
#[derive(Debug, Clone)]
enum Container<V> {
    Values(Vec<V>),
    Children(V),
}

/// A child process we started
struct Debuggee {
    kill: CancellationToken,
    exited: bool,
}

pub struct DebugSession<C: EngineConnector> {
    connector: C,
    config: AdapterConfig,
    sink: MessageSink,
    conventions: Conventions,

    engine: Option<Arc<C::Engine>>,
    engine_tx: mpsc::Sender<EngineEvent>,
    engine_rx: mpsc::Receiver<EngineEvent>,
    process_tx: mpsc::Sender<ProcessEvent>,
    process_rx: mpsc::Receiver<ProcessEvent>,

    breakpoints: BreakpointTable,
    frame_handles: Handles<(i64, EngineFrame)>,
    variable_handles: Handles<Container<EngineValue<C>>>,
    seen_threads: BTreeMap<i64, String>,
    exception: Option<ExceptionInfo<EngineValue<C>>>,

    connection: ConnectionKind,
    debuggee: Option<Debuggee>,
    /// Cancelled when the client goes away
    cancel: CancellationToken,
    exit_code: Option<i32>,
    executing: bool,
    terminated: bool,
    finished: bool,
}

impl<C: EngineConnector> DebugSession<C> {
    pub fn new(connector: C, config: AdapterConfig, sink: MessageSink) -> Self {
        let (engine_tx, engine_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (process_tx, process_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            connector,
            config,
            sink,
            conventions: Conventions::default(),
            engine: None,
            engine_tx,
            engine_rx,
            process_tx,
            process_rx,
            breakpoints: BreakpointTable::new(),
            frame_handles: Handles::new(),
            variable_handles: Handles::new(),
            seen_threads: BTreeMap::new(),
            exception: None,
            connection: ConnectionKind::Disconnected,
            debuggee: None,
            cancel: CancellationToken::new(),
            exit_code: None,
            executing: false,
            terminated: false,
            finished: false,
        }
    }

    fn engine(&self, command: &str) -> Result<Arc<C::Engine>, RequestError> {
        self.engine
            .clone()
            .ok_or_else(|| RequestError::no_debuggee(command))
    }

    async fn dispatch(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        match command {
            "initialize" => self.initialize(args::parse(command, arguments)?, responder),
            "launch" => self.launch(args::parse(command, arguments)?).await,
            "attach" => self.attach(args::parse(command, arguments)?).await,
            "disconnect" => self.disconnect(args::parse(command, arguments)?).await,
            "setBreakpoints" => {
                self.set_breakpoints(args::parse(command, arguments)?, responder)
                    .await
            }
            "setFunctionBreakpoints" => {
                self.set_function_breakpoints(args::parse(command, arguments)?, responder)
            }
            "setExceptionBreakpoints" => {
                self.set_exception_breakpoints(args::parse(command, arguments)?)
                    .await
            }
            "continue" => self.resume(command, args::parse(command, arguments)?).await,
            "next" => {
                self.step(command, StepKind::Over, args::parse(command, arguments)?)
                    .await
            }
            "stepIn" => {
                self.step(command, StepKind::Into, args::parse(command, arguments)?)
                    .await
            }
            "stepOut" => {
                self.step(command, StepKind::Out, args::parse(command, arguments)?)
                    .await
            }
            "pause" => self.pause(args::parse::<ThreadArguments>(command, arguments)?).await,
            "stackTrace" => {
                self.stack_trace(args::parse(command, arguments)?, responder)
                    .await
            }
            "scopes" => self.scopes(args::parse(command, arguments)?, responder).await,
            "variables" => {
                self.variables(args::parse(command, arguments)?, responder)
                    .await
            }
            "source" => self.source(args::parse(command, arguments)?),
            "threads" => self.threads(responder).await,
            "evaluate" => {
                self.evaluate(args::parse(command, arguments)?, responder)
                    .await
            }
            _ => Err(RequestError::unrecognized_request(command).into()),
        }
    }

    // Configuration

    fn initialize(
        &mut self,
        args: InitializeArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        let client_paths_are_uri = match args.path_format.as_deref() {
            None | Some("path") => false,
            Some("uri") => true,
            Some(other) => return Err(RequestError::bad_path_format(other).into()),
        };

        self.conventions = Conventions {
            client_lines_start_at1: args.lines_start_at1.unwrap_or(true),
            client_paths_are_uri,
            ..Conventions::default()
        };

        info!(
            "Client {} initialized",
            args.adapter_id.as_deref().unwrap_or("<unnamed>")
        );

        responder.set_body(Capabilities::default());
        responder.queue_event("initialized", None);
        Ok(())
    }

    async fn launch(&mut self, args: LaunchArguments) -> Result<(), HandlerError> {
        let program = match args.program.as_deref().map(str::trim) {
            Some(program) if !program.is_empty() => program.to_string(),
            _ => return Err(RequestError::program_missing().into()),
        };

        let (working_dir, program_arg) = match args.cwd.as_deref() {
            Some(cwd) if cwd.trim().is_empty() => return Err(RequestError::cwd_empty().into()),
            Some(cwd) => {
                let cwd = PathBuf::from(cwd);
                if !cwd.is_dir() {
                    return Err(RequestError::cwd_not_found(&cwd.to_string_lossy()).into());
                }
                let full = cwd.join(&program);
                if !full.exists() {
                    return Err(RequestError::program_not_found(&full.to_string_lossy()).into());
                }
                (cwd, program)
            }
            None => {
                let full = PathBuf::from(&program);
                if !full.exists() {
                    return Err(RequestError::program_not_found(&program).into());
                }
                let dir = full
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                let name = full
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or(program);
                (dir, name)
            }
        };

        let runtime = match args.runtime_executable.as_deref() {
            Some(runtime) if runtime.trim().is_empty() => {
                return Err(RequestError::runtime_empty().into())
            }
            Some(runtime) => {
                let path = PathBuf::from(runtime);
                if !path.exists() {
                    return Err(RequestError::runtime_not_found(runtime).into());
                }
                path
            }
            None => which::which(&self.config.runtime_executable).map_err(|_| {
                RequestError::runtime_not_on_path(&self.config.runtime_executable)
            })?,
        };

        self.apply_exception_options(args.exception_options.as_deref());

        let port = if args.no_debug {
            None
        } else {
            Some(self.free_port().await)
        };

        let mut runtime_args = Vec::new();
        if let Some(port) = port {
            runtime_args.push("--debug".to_string());
            runtime_args.push(format!(
                "--debugger-agent=transport=dt_socket,server=y,address=127.0.0.1:{}",
                port
            ));
        }
        runtime_args.extend(args.runtime_args.iter().cloned());
        runtime_args.push(program_arg);
        runtime_args.extend(args.args.iter().cloned());

        let console = args.console.as_deref().unwrap_or("internalConsole");
        if args.external_console || console != "internalConsole" {
            info!(
                "Console '{}' is not supported, using the internal console",
                console
            );
        }

        let mut command = Command::new(&runtime);
        command
            .args(&runtime_args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &args.env {
            match value {
                Some(value) => command.env(name, value),
                None => command.env_remove(name),
            };
        }

        let command_line = format!("{} {}\n", runtime.display(), runtime_args.join(" "));
        self.send_output("console", command_line).await;

        let child = command
            .spawn()
            .map_err(RequestError::launch_failed)?;
        info!("Launched {} (pid {:?})", runtime.display(), child.id());

        let exited = CancellationToken::new();
        let kill = CancellationToken::new();
        watch_debuggee(
            child,
            kill.clone(),
            exited.clone(),
            self.process_tx.clone(),
            self.config.output_drain_timeout(),
        );
        self.debuggee = Some(Debuggee {
            kill: kill.clone(),
            exited: false,
        });
        self.connection = ConnectionKind::Launched;

        let Some(port) = port else {
            return Ok(());
        };

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let engine = match self
            .connector
            .connect(
                ConnectTarget::Connect(addr),
                self.config.connect_retry,
                exited,
                self.engine_tx.clone(),
            )
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                warn!("Connecting to the debugger agent failed: {}", e);
                kill.cancel();
                return Err(RequestError::connect_failed(addr, e).into());
            }
        };

        self.start_engine(engine).await?;
        Ok(())
    }

    async fn attach(&mut self, args: AttachArguments) -> Result<(), HandlerError> {
        let address = match args.address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => address.to_string(),
            _ => return Err(RequestError::address_missing().into()),
        };
        let Some(port) = args.port else {
            return Err(RequestError::port_missing().into());
        };

        let addr = tokio::net::lookup_host((address.as_str(), port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| RequestError::invalid_address(&address))?;

        self.apply_exception_options(args.exception_options.as_deref());

        let (target, kind) = if args.listen {
            (ConnectTarget::Listen(addr), ConnectionKind::Listening)
        } else {
            (ConnectTarget::Connect(addr), ConnectionKind::Connected)
        };

        // Requests are handled one at a time, so a hang-up is only noticed
        // once the connect attempt has finished or run out of retries.
        let engine = self
            .connector
            .connect(
                target,
                self.config.connect_retry,
                self.cancel.child_token(),
                self.engine_tx.clone(),
            )
            .await
            .map_err(|e| RequestError::connect_failed(addr, e))?;

        self.connection = kind;
        self.start_engine(engine).await?;
        Ok(())
    }

    async fn start_engine(&mut self, engine: C::Engine) -> Result<(), HandlerError> {
        let engine = Arc::new(engine);
        self.engine = Some(engine.clone());

        for bp in self.breakpoints.breakpoints() {
            engine.insert_breakpoint(bp.id, &bp.path, bp.line).await?;
        }
        for cp in self.breakpoints.catchpoints() {
            engine.insert_catchpoint(cp.id, &cp.exception).await?;
        }

        engine.start().await?;
        self.executing = true;
        Ok(())
    }

    async fn disconnect(&mut self, args: DisconnectArguments) -> Result<(), HandlerError> {
        debug!(
            "Disconnect (terminateDebuggee {:?}, restart {:?})",
            args.terminate_debuggee, args.restart
        );

        match self.connection {
            ConnectionKind::Connected | ConnectionKind::Listening => {
                self.breakpoints.clear();
                if let Some(engine) = self.engine.take() {
                    if let Err(e) = engine.detach().await {
                        warn!("Detach failed: {}", e);
                    }
                }
                info!("Detached from debuggee");
            }
            ConnectionKind::Launched => self.kill_debuggee().await,
            ConnectionKind::Disconnected => {
                if let Some(engine) = self.engine.take() {
                    engine.dispose().await;
                }
            }
        }

        self.connection = ConnectionKind::Disconnected;
        self.finished = true;
        Ok(())
    }

    /// Kill the child we started and wait for it to be reported gone
    async fn kill_debuggee(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.dispose().await;
        }

        let Some(debuggee) = self.debuggee.as_ref() else {
            return;
        };
        if debuggee.exited {
            return;
        }

        info!("Killing debuggee");
        debuggee.kill.cancel();

        let deadline = self.config.output_drain_timeout() + KILL_GRACE;
        let waited = tokio::time::timeout(deadline, async {
            while !self.terminated {
                match self.next_session_event().await {
                    Some(event) => self.on_event(event).await,
                    None => break,
                }
            }
        })
        .await;
        if waited.is_err() {
            warn!("Debuggee did not report its exit within {:?}", deadline);
        }
    }

    // Breakpoints

    async fn set_breakpoints(
        &mut self,
        args: SetBreakpointsArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        let client_path = args
            .source
            .as_ref()
            .and_then(|source| source.path.as_deref())
            .filter(|path| !path.is_empty())
            .ok_or_else(RequestError::source_missing)?;
        let path = self
            .conventions
            .to_debugger_path(client_path)
            .ok_or_else(RequestError::source_missing)?;

        let client_lines = args.requested_lines();

        if !has_mono_extension(&path) {
            debug!("Not a Mono source file, no breakpoints: {}", path);
            responder.set_body(SetBreakpointsResponseBody {
                breakpoints: Vec::new(),
            });
            return Ok(());
        }

        let lines: Vec<i64> = client_lines
            .iter()
            .map(|line| self.conventions.to_debugger_line(*line))
            .collect();
        let update = self.breakpoints.apply(&path, &lines);

        if let Some(engine) = self.engine.clone() {
            for id in &update.removed {
                engine.remove_breakpoint(*id).await?;
            }
            for bp in &update.added {
                engine.insert_breakpoint(bp.id, &bp.path, bp.line).await?;
            }
        }

        let breakpoints = update
            .ids
            .iter()
            .zip(client_lines)
            .map(|(id, line)| Breakpoint {
                id: Some(*id),
                verified: true,
                line: Some(line),
            })
            .collect();

        responder.set_body(SetBreakpointsResponseBody { breakpoints });
        Ok(())
    }

    fn set_function_breakpoints(
        &mut self,
        args: SetFunctionBreakpointsArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        let breakpoints = args
            .breakpoints
            .iter()
            .map(|bp| {
                debug!("Function breakpoint '{}' not supported", bp.name);
                Breakpoint {
                    id: None,
                    verified: false,
                    line: None,
                }
            })
            .collect();

        responder.set_body(SetBreakpointsResponseBody { breakpoints });
        Ok(())
    }

    async fn set_exception_breakpoints(
        &mut self,
        args: SetExceptionBreakpointsArguments,
    ) -> Result<(), HandlerError> {
        if !args.filters.is_empty() {
            debug!("Ignoring exception filters {:?}", args.filters);
        }

        let names = catchpoint_names(args.exception_options.as_deref().unwrap_or_default());
        let (removed, current) = self.breakpoints.replace_catchpoints(&names);

        if let Some(engine) = self.engine.clone() {
            for id in removed {
                engine.remove_catchpoint(id).await?;
            }
            for cp in current {
                engine.insert_catchpoint(cp.id, &cp.exception).await?;
            }
        }
        Ok(())
    }

    /// `__exceptionOptions` on launch and attach, before any engine exists
    fn apply_exception_options(&mut self, options: Option<&[ExceptionOptions]>) {
        if let Some(options) = options {
            let names = catchpoint_names(options);
            self.breakpoints.replace_catchpoints(&names);
        }
    }

    // Execution control

    async fn resume(&mut self, command: &str, args: ThreadArguments) -> Result<(), HandlerError> {
        self.wait_for_suspend().await;
        if self.terminated {
            return Ok(());
        }

        let engine = self.engine(command)?;
        debug!("Continue (thread {:?})", args.thread_id);
        engine.resume().await?;
        self.executing = true;
        Ok(())
    }

    async fn step(
        &mut self,
        command: &str,
        kind: StepKind,
        args: ThreadArguments,
    ) -> Result<(), HandlerError> {
        self.wait_for_suspend().await;
        if self.terminated {
            return Ok(());
        }

        let engine = self.engine(command)?;
        if let Some(thread) = args.thread_id {
            if engine.active_thread() != Some(thread) {
                engine.set_active_thread(thread).await?;
            }
        }

        engine.step(kind).await?;
        self.executing = true;
        Ok(())
    }

    async fn pause(&mut self, args: ThreadArguments) -> Result<(), HandlerError> {
        let engine = self.engine("pause")?;
        if self.executing && !self.terminated {
            debug!("Pause (thread {:?})", args.thread_id);
            engine.interrupt().await?;
        }
        Ok(())
    }

    /// Block until the debuggee stops or goes away
    async fn wait_for_suspend(&mut self) {
        while self.executing && !self.terminated {
            match self.next_session_event().await {
                Some(event) => self.on_event(event).await,
                None => break,
            }
        }
    }

    // Inspection

    async fn stack_trace(
        &mut self,
        args: StackTraceArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        self.wait_for_suspend().await;
        let engine = self.engine("stackTrace")?;

        let thread = match args.thread_id.or_else(|| engine.active_thread()) {
            Some(thread) => thread,
            None => {
                responder.set_body(StackTraceResponseBody {
                    stack_frames: Vec::new(),
                    total_frames: 0,
                });
                return Ok(());
            }
        };

        // The engine only reports frames of its active thread
        if engine.active_thread() != Some(thread) {
            engine.set_active_thread(thread).await?;
        }

        let levels = match args.levels {
            None => Some(self.config.default_stack_levels),
            Some(levels) if levels <= 0 => None,
            Some(levels) => Some(levels as usize),
        };
        let start = args.start_frame.unwrap_or(0).max(0) as usize;

        let backtrace = engine.backtrace(start, levels).await?;
        let mut stack_frames = Vec::with_capacity(backtrace.frames.len());

        for frame in backtrace.frames {
            let (source, hint) = self.frame_source(&frame);
            let line = if frame.line > 0 {
                self.conventions.to_client_line(frame.line)
            } else {
                0
            };
            let id = self.frame_handles.create((thread, frame.clone()));

            stack_frames.push(StackFrame {
                id,
                name: frame.method,
                source,
                line,
                column: frame.column,
                presentation_hint: hint.to_string(),
            });
        }

        responder.set_body(StackTraceResponseBody {
            stack_frames,
            total_frames: backtrace.total,
        });
        Ok(())
    }

    fn frame_source(&self, frame: &EngineFrame) -> (Option<Source>, &'static str) {
        let Some(file) = frame.file.as_deref() else {
            return (None, "subtle");
        };

        let name = Path::new(file)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());

        if Path::new(file).exists() {
            let source = Source {
                name,
                path: self.conventions.to_client_path(file),
                source_reference: 0,
                presentation_hint: "normal".to_string(),
            };
            (Some(source), "normal")
        } else {
            let source = Source {
                name,
                path: None,
                source_reference: 1000,
                presentation_hint: "deemphasize".to_string(),
            };
            (Some(source), "subtle")
        }
    }

    async fn scopes(
        &mut self,
        args: ScopesArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        let frame_id = args.frame_id.unwrap_or(0);
        let (thread, frame) = self
            .frame_handles
            .try_get(frame_id)
            .cloned()
            .ok_or_else(|| RequestError::frame_unavailable("scopes", frame_id))?;
        let engine = self.engine("scopes")?;

        let mut scopes = Vec::new();

        if frame.index == 0 {
            if let Some(exception) = &self.exception {
                let reference = self
                    .variable_handles
                    .create(Container::Values(vec![exception.instance.clone()]));
                scopes.push(Scope {
                    name: "Exception".to_string(),
                    variables_reference: reference,
                    expensive: false,
                });
            }
        }

        let frame_scopes = engine.frame_scopes(thread, frame.index).await?;

        let mut arguments = Vec::new();
        arguments.extend(frame_scopes.this);
        arguments.extend(frame_scopes.arguments);
        if !arguments.is_empty() {
            scopes.push(Scope {
                name: "Argument".to_string(),
                variables_reference: self.variable_handles.create(Container::Values(arguments)),
                expensive: false,
            });
        }

        if !frame_scopes.locals.is_empty() {
            scopes.push(Scope {
                name: "Local".to_string(),
                variables_reference: self
                    .variable_handles
                    .create(Container::Values(frame_scopes.locals)),
                expensive: false,
            });
        }

        responder.set_body(ScopesResponseBody { scopes });
        Ok(())
    }

    async fn variables(
        &mut self,
        args: VariablesArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        let reference = args
            .variables_reference
            .ok_or_else(RequestError::variables_reference_missing)?;
        let engine = self.engine("variables")?;

        let empty = Container::Values(Vec::new());
        let container = self.variable_handles.get_or(reference, &empty).clone();
        let mut values = match container {
            Container::Values(values) => values,
            Container::Children(parent) => engine.children(&parent).await?,
        };

        let truncated = values.len() > self.config.max_children;
        values.truncate(self.config.max_children);

        // Few children resolve concurrently, many one at a time
        let resolved = if values.len() < self.config.concurrent_children_threshold {
            let mut pending = Vec::with_capacity(values.len());
            for value in &values {
                pending.push(engine.resolve(value));
            }
            join_all(pending).await
        } else {
            let mut resolved = Vec::with_capacity(values.len());
            for value in &values {
                resolved.push(engine.resolve(value).await);
            }
            resolved
        };

        let mut variables = Vec::with_capacity(values.len() + 1);
        for (value, resolved) in values.into_iter().zip(resolved) {
            let text = if resolved.flags.error {
                "<error getting value>".to_string()
            } else {
                strip_braces(resolved.display.as_deref().unwrap_or_default()).to_string()
            };
            let variables_reference = if resolved.has_children {
                self.variable_handles.create(Container::Children(value))
            } else {
                0
            };

            variables.push(Variable {
                name: resolved.name,
                value: text,
                type_name: resolved.type_name,
                variables_reference,
            });
        }

        if truncated {
            variables.push(Variable {
                name: "...".to_string(),
                value: "more".to_string(),
                type_name: None,
                variables_reference: 0,
            });
        }

        responder.set_body(VariablesResponseBody { variables });
        Ok(())
    }

    fn source(&mut self, args: SourceArguments) -> Result<(), HandlerError> {
        debug!("No source for reference {:?}", args.source_reference);
        Err(RequestError::no_source().into())
    }

    async fn threads(&mut self, responder: &mut Responder) -> Result<(), HandlerError> {
        let mut merged = self.seen_threads.clone();

        if let Some(engine) = self.engine.clone() {
            if !self.terminated {
                for thread in engine.threads().await? {
                    merged.insert(thread.id, thread.name);
                }
            }
        }

        let threads = merged
            .into_iter()
            .map(|(id, name)| Thread {
                id,
                name: if name.is_empty() {
                    format!("Thread #{}", id)
                } else {
                    name
                },
            })
            .collect();

        responder.set_body(ThreadsResponseBody { threads });
        Ok(())
    }

    async fn evaluate(
        &mut self,
        args: EvaluateArguments,
        responder: &mut Responder,
    ) -> Result<(), HandlerError> {
        let Some(expression) = args.expression.filter(|e| !e.trim().is_empty()) else {
            return Err(RequestError::evaluate_failed("expression missing").into());
        };
        let Some((thread, frame)) = args
            .frame_id
            .and_then(|id| self.frame_handles.try_get(id))
            .cloned()
        else {
            return Err(RequestError::evaluate_failed("no active stackframe").into());
        };
        let engine = self.engine("evaluate")?;

        if let Err(reason) = engine.validate_expression(&expression) {
            debug!("Rejected expression '{}': {}", expression, reason);
            return Err(RequestError::evaluate_failed("invalid expression").into());
        }

        let value = engine
            .evaluate(thread, frame.index, &expression)
            .await
            .map_err(RequestError::evaluate_failed)?;
        let resolved = engine.resolve(&value).await;
        let flags = resolved.flags;

        let failure = if flags.error || flags.not_supported {
            let text = resolved.display.clone().unwrap_or_default();
            Some(if text.contains(NOT_AVAILABLE_IN_CONTEXT) {
                "not available".to_string()
            } else {
                text
            })
        } else if flags.unknown {
            Some("invalid expression".to_string())
        } else if flags.object && flags.namespace {
            Some("not available".to_string())
        } else {
            None
        };

        if let Some(reason) = failure {
            return Err(RequestError::evaluate_failed(reason).into());
        }

        let variables_reference = if resolved.has_children {
            self.variable_handles.create(Container::Children(value))
        } else {
            0
        };

        responder.set_body(EvaluateResponseBody {
            result: strip_braces(resolved.display.as_deref().unwrap_or_default()).to_string(),
            variables_reference,
        });
        Ok(())
    }

    // Events

    async fn next_session_event(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            Some(event) = self.engine_rx.recv() => Some(SessionEvent::Engine(event)),
            Some(event) = self.process_rx.recv() => Some(SessionEvent::Process(event)),
            else => None,
        }
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Engine(event) => self.on_engine_event(event).await,
            SessionEvent::Process(event) => self.on_process_event(event).await,
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Ready => debug!("Engine ready"),
            EngineEvent::Stopped { thread, reason } => self.stopped(thread, reason).await,
            EngineEvent::ThreadStarted { id, name } => {
                self.seen_threads.insert(id, name);
                self.send_event(
                    "thread",
                    ThreadEventBody {
                        reason: "started".to_string(),
                        thread_id: id,
                    },
                )
                .await;
            }
            EngineEvent::ThreadExited { id } => {
                self.seen_threads.remove(&id);
                self.send_event(
                    "thread",
                    ThreadEventBody {
                        reason: "exited".to_string(),
                        thread_id: id,
                    },
                )
                .await;
            }
            EngineEvent::Output { is_stderr, text } => {
                let category = if is_stderr { "stderr" } else { "stdout" };
                self.send_output(category, text).await;
            }
            EngineEvent::Exited { exit_code } => {
                info!("Debuggee exited (engine)");
                if exit_code.is_some() {
                    self.exit_code = exit_code;
                }
                self.executing = false;

                // A launched child still has output to flush; its exit terminates us
                let child_running = self.debuggee.as_ref().is_some_and(|d| !d.exited);
                if !child_running {
                    self.terminate().await;
                }
            }
        }
    }

    async fn on_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Output { category, text } => self.send_output(category, text).await,
            ProcessEvent::Exited { exit_code } => {
                info!("Debuggee process exited with {:?}", exit_code);
                if let Some(debuggee) = self.debuggee.as_mut() {
                    debuggee.exited = true;
                }
                if exit_code.is_some() {
                    self.exit_code = exit_code;
                }
                self.terminate().await;
            }
        }
    }

    async fn stopped(&mut self, thread: i64, reason: StopReason) {
        self.executing = false;
        self.frame_handles.reset();
        self.variable_handles.reset();

        self.exception = match (&reason, self.engine.clone()) {
            (StopReason::Exception { .. }, Some(engine)) => engine.active_exception(thread).await,
            _ => None,
        };

        let text = match &reason {
            StopReason::Exception { message } => Some(message.clone()),
            _ => None,
        };

        self.send_event(
            "stopped",
            StoppedEventBody {
                reason: reason.as_str().to_string(),
                thread_id: thread,
                text,
                all_threads_stopped: true,
            },
        )
        .await;
    }

    /// Report the end of the debuggee exactly once
    async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.executing = false;

        if let Some(engine) = self.engine.take() {
            engine.dispose().await;
        }

        if let Some(exit_code) = self.exit_code {
            self.send_event("exited", ExitedEventBody { exit_code }).await;
        }
        self.sink
            .send(ProtocolMessage::Event(Event::new("terminated", None)))
            .await;
    }

    async fn send_event<B: serde::Serialize>(&self, event: &str, body: B) {
        self.sink.send_event(event, body).await;
    }

    async fn send_output(&self, category: &str, output: String) {
        self.send_event(
            "output",
            OutputEventBody {
                category: category.to_string(),
                output,
            },
        )
        .await;
    }

    async fn free_port(&self) -> u16 {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
            Ok(listener) => match listener.local_addr() {
                Ok(addr) => addr.port(),
                Err(_) => self.config.fallback_agent_port,
            },
            Err(e) => {
                warn!(
                    "No free port ({}), using {}",
                    e, self.config.fallback_agent_port
                );
                self.config.fallback_agent_port
            }
        }
    }
}

impl<C: EngineConnector> RequestHandler for DebugSession<C> {
    type Event = SessionEvent;

    async fn handle_request(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        responder: &mut Responder,
    ) {
        if let Err(e) = self.dispatch(command, arguments, responder).await {
            responder.set_error(e.into_request_error(command));
        }
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.next_session_event().await
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        self.on_event(event).await;
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if self.finished {
            return;
        }

        debug!("Client went away, releasing debuggee");
        match self.connection {
            ConnectionKind::Launched => {
                if let Some(engine) = self.engine.take() {
                    engine.dispose().await;
                }
                if let Some(debuggee) = &self.debuggee {
                    debuggee.kill.cancel();
                }
            }
            _ => {
                if let Some(engine) = self.engine.take() {
                    if let Err(e) = engine.detach().await {
                        debug!("Detach failed: {}", e);
                    }
                }
            }
        }
        self.finished = true;
    }
}

fn strip_braces(text: &str) -> &str {
    text.strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(text)
}

/// Forward the child's output and report its exit once output is drained
fn watch_debuggee(
    mut child: Child,
    kill: CancellationToken,
    exited: CancellationToken,
    events: mpsc::Sender<ProcessEvent>,
    drain: Duration,
) {
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_output(stdout, "stdout", events.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_output(stderr, "stderr", events.clone())));
    }

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Killing debuggee failed: {}", e);
                }
                child.wait().await
            }
        };
        exited.cancel();

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Waiting for debuggee failed: {}", e);
                None
            }
        };

        if tokio::time::timeout(drain, join_all(readers)).await.is_err() {
            debug!("Debuggee output not drained within {:?}", drain);
        }

        if events.send(ProcessEvent::Exited { exit_code }).await.is_err() {
            debug!("Session gone before debuggee exit was reported");
        }
    });
}

async fn forward_output<R>(stream: R, category: &'static str, events: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let mut text = String::from_utf8_lossy(&line).into_owned();
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                if events
                    .send(ProcessEvent::Output { category, text })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!("Reading debuggee {} failed: {}", category, e);
                break;
            }
        }
    }
}
