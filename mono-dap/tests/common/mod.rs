// Shared fixtures for adapter tests
//
// A scripted engine stands in for a live runtime, and the adapter is
// driven through the protocol client over an in-memory pipe.

#![allow(dead_code)]

use mono_dap::client::ProtocolClient;
use mono_dap::engine::{
    Backtrace, ConnectTarget, Engine, EngineConnector, EngineEvent, EngineFrame, EngineThread,
    ExceptionInfo, FrameScopes, ResolvedValue, StepKind, StopReason, ValueFlags,
};
use mono_dap::error::{EngineError, EngineResult};
use mono_dap::protocol::{Event, Response};
use mono_dap::{serve, AdapterConfig, DebugSession, MessageSink};
use sdb_client::RetryPolicy;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const EVENT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct FakeValue {
    pub name: String,
    pub display: String,
    pub type_name: Option<String>,
    pub flags: ValueFlags,
    pub children: Vec<FakeValue>,
}

impl FakeValue {
    pub fn new(name: &str, display: &str) -> Self {
        Self {
            name: name.to_string(),
            display: display.to_string(),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_children(mut self, children: Vec<FakeValue>) -> Self {
        self.children = children;
        self
    }
}

/// What the fake runtime looks like
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub threads: Vec<EngineThread>,
    /// Announced through thread-start events when the engine starts
    pub started_threads: Vec<EngineThread>,
    pub frames: Vec<EngineFrame>,
    pub scopes: FrameScopes<FakeValue>,
    pub evaluations: HashMap<String, FakeValue>,
    pub stop_on_start: Option<(i64, StopReason)>,
    pub exit_on_resume: Option<i32>,
    pub exception: Option<ExceptionInfo<FakeValue>>,
}

/// Everything the adapter asked the engine to do
#[derive(Debug, Default)]
pub struct Recorded {
    pub calls: Vec<String>,
    pub breakpoints: Vec<(u32, String, i64)>,
    pub removed_breakpoints: Vec<u32>,
    pub catchpoints: Vec<(u32, String)>,
    pub removed_catchpoints: Vec<u32>,
    pub targets: Vec<ConnectTarget>,
    /// Tokens handed to `connect`
    pub cancel_tokens: Vec<CancellationToken>,
}

pub type Log = Arc<Mutex<Recorded>>;

#[derive(Clone)]
pub struct ScriptedConnector {
    pub script: Arc<Script>,
    pub log: Log,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            log: Log::default(),
        }
    }
}

impl EngineConnector for ScriptedConnector {
    type Engine = ScriptedEngine;

    async fn connect(
        &self,
        target: ConnectTarget,
        _policy: RetryPolicy,
        cancel: CancellationToken,
        events: mpsc::Sender<EngineEvent>,
    ) -> EngineResult<ScriptedEngine> {
        let mut log = self.log.lock().unwrap();
        log.targets.push(target);
        log.cancel_tokens.push(cancel);
        drop(log);
        Ok(ScriptedEngine {
            script: self.script.clone(),
            log: self.log.clone(),
            events,
            active: Mutex::new(None),
        })
    }
}

pub struct ScriptedEngine {
    script: Arc<Script>,
    log: Log,
    events: mpsc::Sender<EngineEvent>,
    active: Mutex<Option<i64>>,
}

impl ScriptedEngine {
    fn call(&self, name: &str) {
        self.log.lock().unwrap().calls.push(name.to_string());
    }

    fn current(&self) -> i64 {
        self.active.lock().unwrap().unwrap_or(1)
    }
}

impl Engine for ScriptedEngine {
    type Value = FakeValue;

    async fn start(&self) -> EngineResult<()> {
        self.call("start");
        for thread in &self.script.started_threads {
            let event = EngineEvent::ThreadStarted {
                id: thread.id,
                name: thread.name.clone(),
            };
            self.events.send(event).await.unwrap();
        }
        if let Some((thread, reason)) = self.script.stop_on_start.clone() {
            *self.active.lock().unwrap() = Some(thread);
            self.events
                .send(EngineEvent::Stopped { thread, reason })
                .await
                .unwrap();
        }
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.call("resume");
        if let Some(code) = self.script.exit_on_resume {
            self.events
                .send(EngineEvent::Exited {
                    exit_code: Some(code),
                })
                .await
                .unwrap();
        }
        Ok(())
    }

    async fn step(&self, kind: StepKind) -> EngineResult<()> {
        self.call(&format!("step {:?}", kind));
        let thread = self.current();
        self.events
            .send(EngineEvent::Stopped {
                thread,
                reason: StopReason::Step,
            })
            .await
            .unwrap();
        Ok(())
    }

    async fn interrupt(&self) -> EngineResult<()> {
        self.call("interrupt");
        let thread = self.current();
        self.events
            .send(EngineEvent::Stopped {
                thread,
                reason: StopReason::Pause,
            })
            .await
            .unwrap();
        Ok(())
    }

    async fn detach(&self) -> EngineResult<()> {
        self.call("detach");
        Ok(())
    }

    async fn dispose(&self) {
        self.call("dispose");
    }

    async fn threads(&self) -> EngineResult<Vec<EngineThread>> {
        Ok(self.script.threads.clone())
    }

    fn active_thread(&self) -> Option<i64> {
        *self.active.lock().unwrap()
    }

    async fn set_active_thread(&self, thread: i64) -> EngineResult<()> {
        self.call(&format!("select thread {}", thread));
        *self.active.lock().unwrap() = Some(thread);
        Ok(())
    }

    async fn backtrace(&self, start: usize, levels: Option<usize>) -> EngineResult<Backtrace> {
        let total = self.script.frames.len();
        let frames = self
            .script
            .frames
            .iter()
            .skip(start)
            .take(levels.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(Backtrace { frames, total })
    }

    async fn frame_scopes(
        &self,
        _thread: i64,
        frame: usize,
    ) -> EngineResult<FrameScopes<FakeValue>> {
        if frame >= self.script.frames.len() {
            return Err(EngineError::Failed(format!("no frame {}", frame)));
        }
        Ok(self.script.scopes.clone())
    }

    async fn resolve(&self, value: &FakeValue) -> ResolvedValue {
        ResolvedValue {
            name: value.name.clone(),
            display: Some(value.display.clone()),
            type_name: value.type_name.clone(),
            flags: value.flags,
            has_children: !value.children.is_empty(),
        }
    }

    async fn children(&self, value: &FakeValue) -> EngineResult<Vec<FakeValue>> {
        Ok(value.children.clone())
    }

    fn validate_expression(&self, expression: &str) -> Result<(), String> {
        if expression.contains(|c: char| c.is_whitespace() || "+-*/".contains(c)) {
            Err(format!("unsupported expression '{}'", expression))
        } else {
            Ok(())
        }
    }

    async fn evaluate(
        &self,
        _thread: i64,
        _frame: usize,
        expression: &str,
    ) -> EngineResult<FakeValue> {
        Ok(self
            .script
            .evaluations
            .get(expression)
            .cloned()
            .unwrap_or_else(|| {
                FakeValue::new(expression, "").with_flags(ValueFlags {
                    unknown: true,
                    ..ValueFlags::default()
                })
            }))
    }

    async fn active_exception(&self, _thread: i64) -> Option<ExceptionInfo<FakeValue>> {
        self.script.exception.clone()
    }

    async fn insert_breakpoint(&self, id: u32, path: &str, line: i64) -> EngineResult<()> {
        self.log
            .lock()
            .unwrap()
            .breakpoints
            .push((id, path.to_string(), line));
        Ok(())
    }

    async fn remove_breakpoint(&self, id: u32) -> EngineResult<()> {
        self.log.lock().unwrap().removed_breakpoints.push(id);
        Ok(())
    }

    async fn insert_catchpoint(&self, id: u32, exception: &str) -> EngineResult<()> {
        self.log
            .lock()
            .unwrap()
            .catchpoints
            .push((id, exception.to_string()));
        Ok(())
    }

    async fn remove_catchpoint(&self, id: u32) -> EngineResult<()> {
        self.log.lock().unwrap().removed_catchpoints.push(id);
        Ok(())
    }
}

/// An adapter running on a background task, seen from the client side
pub struct Adapter {
    pub client: ProtocolClient,
    pub events: mpsc::Receiver<Event>,
    pub task: JoinHandle<()>,
}

pub fn start_adapter<C: EngineConnector>(connector: C, config: AdapterConfig) -> Adapter {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let trace = config.trace;

    let task = tokio::spawn(async move {
        let sink = MessageSink::new(server_write, trace);
        let mut session = DebugSession::new(connector, config, sink.clone());
        serve(server_read, sink, &mut session, trace).await;
    });

    let (client_read, client_write) = tokio::io::split(client_io);
    let (client, events) = ProtocolClient::new(client_read, client_write);

    Adapter {
        client,
        events,
        task,
    }
}

impl Adapter {
    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Response {
        self.client.request(command, arguments).await.unwrap()
    }

    /// Next event, whatever it is
    pub async fn any_event(&mut self) -> Event {
        tokio::time::timeout(EVENT_WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream closed")
    }

    /// Skip events until one named `name` shows up
    pub async fn event(&mut self, name: &str) -> Event {
        loop {
            let event = self.any_event().await;
            if event.event == name {
                return event;
            }
        }
    }
}

pub fn error_id(response: &Response) -> i64 {
    response.body.as_ref().unwrap()["error"]["id"]
        .as_i64()
        .unwrap()
}

pub fn frame(index: usize, method: &str, file: Option<&str>, line: i64) -> EngineFrame {
    EngineFrame {
        index,
        method: method.to_string(),
        file: file.map(str::to_string),
        line,
        column: 0,
    }
}

pub fn thread(id: i64, name: &str) -> EngineThread {
    EngineThread {
        id,
        name: name.to_string(),
    }
}
