// Soft debugger engine
//
// Drives a Mono runtime through its debugger agent. Source breakpoints and
// catchpoints that cannot be bound yet stay pending and are retried whenever
// the agent reports a newly loaded type.

use super::{
    Backtrace, ConnectTarget, Engine, EngineConnector, EngineEvent, EngineFrame, EngineThread,
    ExceptionInfo, FrameScopes, ResolvedValue, StepKind, StopReason,
};
use crate::error::{EngineError, EngineResult};
use sdb_client::commands::{event_kinds, field_attributes, value_tags};
use sdb_client::method::DebugInfo;
use sdb_client::stackframe::param_position;
use sdb_client::thread::Frame;
use sdb_client::typeinfo::{FieldInfo, TypeInfo};
use sdb_client::types::{MethodId, ObjectId, ThreadId, TypeId};
use sdb_client::{
    EventKind, EventSet, Location, RetryPolicy, SdbConnection, SdbError, SdbResult, StepDepth,
    SuspendPolicy, Value,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const VM_START_WAIT: Duration = Duration::from_secs(2);
const NOT_SUSPENDED: u16 = 101;
// Only the head of huge arrays is fetched
const MAX_ARRAY_FETCH: usize = 1000;
const MAX_TYPE_DEPTH: usize = 32;

/// A named value as seen by the agent
#[derive(Debug, Clone)]
pub struct SoftValue {
    pub name: String,
    pub value: Value,
    pub error: Option<String>,
}

impl SoftValue {
    fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            error: None,
        }
    }

    fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Void,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug)]
struct BoundBreakpoint {
    path: String,
    line: i64,
    requests: Vec<i32>,
}

#[derive(Debug)]
struct BoundCatchpoint {
    exception: String,
    requests: Vec<i32>,
}

#[derive(Debug, Default)]
struct State {
    started: bool,
    exited: bool,
    active_thread: Option<ThreadId>,
    step_request: Option<i32>,
    breakpoints: HashMap<u32, BoundBreakpoint>,
    catchpoints: HashMap<u32, BoundCatchpoint>,
    exceptions: HashMap<ThreadId, ObjectId>,
    debug_info: HashMap<MethodId, Arc<DebugInfo>>,
    type_info: HashMap<TypeId, Arc<TypeInfo>>,
}

struct Inner {
    conn: SdbConnection,
    events: mpsc::Sender<EngineEvent>,
    state: Mutex<State>,
    vm_started: Notify,
}

struct Description {
    display: String,
    type_name: Option<String>,
    has_children: bool,
    object: bool,
}

/// One step of a member access path such as `a.b[2].c`
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    Member(String),
    Index(i32),
}

fn parse_expression(expression: &str) -> Result<Vec<PathStep>, String> {
    let chars: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.is_empty() {
        return Err("empty expression".to_string());
    }

    let mut steps = Vec::new();
    let mut pos = 0;

    let read_ident = |pos: &mut usize| -> Option<String> {
        let start = *pos;
        while *pos < chars.len() && (chars[*pos].is_alphanumeric() || chars[*pos] == '_') {
            *pos += 1;
        }
        if start == *pos || chars[start].is_ascii_digit() {
            return None;
        }
        Some(chars[start..*pos].iter().collect())
    };

    match read_ident(&mut pos) {
        Some(ident) => steps.push(PathStep::Member(ident)),
        None => return Err(format!("unsupported expression '{}'", expression)),
    }

    while pos < chars.len() {
        match chars[pos] {
            '.' => {
                pos += 1;
                match read_ident(&mut pos) {
                    Some(ident) => steps.push(PathStep::Member(ident)),
                    None => return Err(format!("unsupported expression '{}'", expression)),
                }
            }
            '[' => {
                let start = pos + 1;
                let Some(len) = chars[start..].iter().position(|c| *c == ']') else {
                    return Err(format!("unsupported expression '{}'", expression));
                };
                let digits: String = chars[start..start + len].iter().collect();
                let index = digits
                    .parse::<i32>()
                    .map_err(|_| format!("unsupported index '{}'", digits))?;
                steps.push(PathStep::Index(index));
                pos = start + len + 1;
            }
            _ => return Err(format!("unsupported expression '{}'", expression)),
        }
    }

    Ok(steps)
}

fn same_file(a: &str, b: &str) -> bool {
    Path::new(a) == Path::new(b)
}

fn is_instance_field(field: &FieldInfo) -> bool {
    field.attributes & (field_attributes::STATIC | field_attributes::LITERAL) == 0
}

fn array_display(full_name: &str, length: usize) -> String {
    match full_name.strip_suffix("[]") {
        Some(element) => format!("{{{}[{}]}}", element, length),
        None => format!("{{{}}} [{}]", full_name, length),
    }
}

fn to_thread_id(thread: i64) -> EngineResult<ThreadId> {
    ThreadId::try_from(thread)
        .map_err(|_| EngineError::Failed(format!("invalid thread id {}", thread)))
}

/// Resume, tolerating a VM that is already running
async fn resume_vm(conn: &SdbConnection) -> SdbResult<()> {
    match conn.resume_all().await {
        Err(SdbError::ErrorCode(NOT_SUSPENDED, _)) => Ok(()),
        result => result,
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn emit(&self, event: EngineEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Engine event receiver is gone");
        }
    }

    async fn debug_info(&self, method: MethodId) -> SdbResult<Arc<DebugInfo>> {
        let cached = self.state().debug_info.get(&method).cloned();
        if let Some(info) = cached {
            return Ok(info);
        }

        let info = Arc::new(self.conn.get_debug_info(method).await?);
        self.state().debug_info.insert(method, info.clone());
        Ok(info)
    }

    async fn type_info(&self, type_id: TypeId) -> SdbResult<Arc<TypeInfo>> {
        let cached = self.state().type_info.get(&type_id).cloned();
        if let Some(info) = cached {
            return Ok(info);
        }

        let info = Arc::new(self.conn.get_type_info(type_id).await?);
        self.state().type_info.insert(type_id, info.clone());
        Ok(info)
    }

    async fn pump(self: Arc<Self>) {
        while let Some(set) = self.conn.recv_event().await {
            self.handle_event_set(set).await;
        }

        debug!("Agent connection closed");
        self.mark_exited().await;
    }

    async fn mark_exited(&self) {
        let already = std::mem::replace(&mut self.state().exited, true);
        if !already {
            self.emit(EngineEvent::Exited { exit_code: None }).await;
        }
    }

    async fn handle_event_set(&self, set: EventSet) {
        let mut resume = set.suspends();
        let mut stop: Option<(ThreadId, StopReason)> = None;

        for event in set.events {
            let thread = event.thread;
            match event.details {
                EventKind::VMStart { .. } => {
                    info!("VM started");
                    self.state().started = true;
                    self.vm_started.notify_one();
                    resume = false;
                }
                EventKind::VMDeath => {
                    info!("VM died");
                    resume = false;
                    self.mark_exited().await;
                }
                EventKind::ThreadStart => {
                    let name = self.conn.get_thread_name(thread).await.unwrap_or_default();
                    self.emit(EngineEvent::ThreadStarted {
                        id: i64::from(thread),
                        name,
                    })
                    .await;
                }
                EventKind::ThreadDeath => {
                    self.state().exceptions.remove(&thread);
                    self.emit(EngineEvent::ThreadExited {
                        id: i64::from(thread),
                    })
                    .await;
                }
                EventKind::TypeLoad { type_id } => {
                    if let Err(e) = self.bind_pending(type_id).await {
                        warn!("Binding pending breakpoints for type {} failed: {}", type_id, e);
                    }
                }
                EventKind::Breakpoint { .. } | EventKind::UserBreak => {
                    resume = false;
                    self.clear_step().await;
                    if stop.is_none() {
                        stop = Some((thread, StopReason::Breakpoint));
                    }
                }
                EventKind::Step { .. } => {
                    resume = false;
                    self.clear_step().await;
                    if stop.is_none() {
                        stop = Some((thread, StopReason::Step));
                    }
                }
                EventKind::Exception { exception } => {
                    resume = false;
                    self.state().exceptions.insert(thread, exception);
                    if stop.is_none() {
                        let message = self.exception_message(exception).await;
                        stop = Some((thread, StopReason::Exception { message }));
                    }
                }
                EventKind::UserLog { message, .. } => {
                    self.emit(EngineEvent::Output {
                        is_stderr: false,
                        text: message,
                    })
                    .await;
                }
                other => debug!("Ignoring agent event {:?}", other),
            }
        }

        if let Some((thread, reason)) = stop {
            self.state().active_thread = Some(thread);
            self.emit(EngineEvent::Stopped {
                thread: i64::from(thread),
                reason,
            })
            .await;
        } else if resume {
            if let Err(e) = resume_vm(&self.conn).await {
                warn!("Resume after event failed: {}", e);
            }
        }
    }

    async fn clear_step(&self) {
        let request = self.state().step_request.take();
        if let Some(request) = request {
            if let Err(e) = self.conn.clear_event_request(event_kinds::STEP, request).await {
                debug!("Clearing step request {} failed: {}", request, e);
            }
        }
    }

    async fn bind_pending(&self, type_id: TypeId) -> SdbResult<()> {
        let (breakpoints, catchpoints) = {
            let state = self.state();
            let breakpoints: Vec<(u32, String, i64)> = state
                .breakpoints
                .iter()
                .filter(|(_, bp)| bp.requests.is_empty())
                .map(|(id, bp)| (*id, bp.path.clone(), bp.line))
                .collect();
            let catchpoints: Vec<(u32, String)> = state
                .catchpoints
                .iter()
                .filter(|(_, cp)| cp.requests.is_empty())
                .map(|(id, cp)| (*id, cp.exception.clone()))
                .collect();
            (breakpoints, catchpoints)
        };

        if !catchpoints.is_empty() {
            let info = self.type_info(type_id).await?;
            for (id, _) in catchpoints.iter().filter(|(_, name)| *name == info.full_name) {
                self.bind_catchpoint_to(*id, type_id).await?;
            }
        }

        if !breakpoints.is_empty() {
            let files = self.conn.get_type_source_files(type_id).await?;
            for (id, path, line) in breakpoints {
                if files.iter().any(|file| same_file(file, &path)) {
                    self.bind_breakpoint(id, &path, line, Some(type_id)).await?;
                }
            }
        }

        Ok(())
    }

    async fn bind_breakpoint(
        &self,
        id: u32,
        path: &str,
        line: i64,
        only_type: Option<TypeId>,
    ) -> SdbResult<()> {
        let types = match only_type {
            Some(type_id) => vec![type_id],
            None => self.conn.get_types_for_source_file(path, false).await?,
        };

        let mut requests = Vec::new();
        for type_id in types {
            for method in self.conn.get_type_methods(type_id).await? {
                let info = match self.debug_info(method).await {
                    Ok(info) => info,
                    Err(e) if e.is_agent_error() => continue,
                    Err(e) => return Err(e),
                };
                if !same_file(&info.source_file, path) {
                    continue;
                }
                let Ok(line) = i32::try_from(line) else {
                    continue;
                };
                if let Some(il_offset) = info.offset_for_line(line) {
                    let location = Location {
                        method,
                        il_offset: i64::from(il_offset),
                    };
                    requests.push(self.conn.set_breakpoint(location, SuspendPolicy::All).await?);
                }
            }
        }

        if requests.is_empty() {
            debug!("Breakpoint {} at {}:{} is pending", id, path, line);
            return Ok(());
        }

        debug!("Breakpoint {} bound with requests {:?}", id, requests);
        let orphaned = {
            let mut state = self.state();
            match state.breakpoints.get_mut(&id) {
                Some(bp) => {
                    bp.requests.extend(requests);
                    None
                }
                None => Some(requests),
            }
        };

        // Removed while we were binding it
        if let Some(requests) = orphaned {
            for request in requests {
                self.conn
                    .clear_event_request(event_kinds::BREAKPOINT, request)
                    .await
                    .ok();
            }
        }

        Ok(())
    }

    async fn bind_catchpoint_to(&self, id: u32, type_id: TypeId) -> SdbResult<()> {
        let request = self
            .conn
            .set_exception_request(Some(type_id), true, true, SuspendPolicy::All)
            .await?;

        let orphaned = {
            let mut state = self.state();
            match state.catchpoints.get_mut(&id) {
                Some(cp) => {
                    cp.requests.push(request);
                    false
                }
                None => true,
            }
        };

        if orphaned {
            self.conn
                .clear_event_request(event_kinds::EXCEPTION, request)
                .await
                .ok();
        }
        Ok(())
    }

    async fn frames(&self, thread: ThreadId) -> SdbResult<Vec<Frame>> {
        self.conn.get_frames(thread, 0, -1).await
    }

    async fn frame_at(&self, thread: ThreadId, index: usize) -> EngineResult<Frame> {
        self.frames(thread)
            .await?
            .into_iter()
            .nth(index)
            .ok_or_else(|| EngineError::Failed(format!("frame {} is not available", index)))
    }

    async fn describe_frame(&self, index: usize, frame: &Frame) -> SdbResult<EngineFrame> {
        let name = self.conn.get_method_name(frame.method).await?;
        let type_id = self.conn.get_declaring_type(frame.method).await?;
        let type_name = match self.type_info(type_id).await {
            Ok(info) => info.name.clone(),
            Err(e) if e.is_agent_error() => String::new(),
            Err(e) => return Err(e),
        };
        let method = if type_name.is_empty() {
            name
        } else {
            format!("{}.{}", type_name, name)
        };

        let (file, line) = match self.debug_info(frame.method).await {
            Ok(info) => {
                let file = (!info.source_file.is_empty()).then(|| info.source_file.clone());
                let line = info
                    .line_for_offset(i64::from(frame.il_offset))
                    .map(i64::from)
                    .unwrap_or(0);
                (file, line)
            }
            Err(e) if e.is_agent_error() => (None, 0),
            Err(e) => return Err(e),
        };

        Ok(EngineFrame {
            index,
            method,
            file,
            line,
            column: 0,
        })
    }

    async fn instance_fields(&self, object: ObjectId) -> SdbResult<Vec<SoftValue>> {
        let mut type_id = self.conn.get_object_type(object).await?;
        let mut fields: Vec<FieldInfo> = Vec::new();

        for _ in 0..MAX_TYPE_DEPTH {
            if type_id == 0 {
                break;
            }
            let declared = self.conn.get_type_fields(type_id).await?;
            fields.extend(declared.into_iter().filter(is_instance_field));
            type_id = self.type_info(type_id).await?.base_type;
        }

        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<_> = fields.iter().map(|field| field.field_id).collect();
        let values = self.conn.get_object_values(object, &ids).await?;

        Ok(fields
            .into_iter()
            .zip(values)
            .map(|(field, value)| SoftValue::new(field.name, value))
            .collect())
    }

    async fn children(&self, value: &SoftValue) -> SdbResult<Vec<SoftValue>> {
        if value.error.is_some() {
            return Ok(Vec::new());
        }

        match &value.value {
            Value::Object { id, .. } if value.value.is_array() => {
                let length = self.conn.get_array_length(*id).await?.min(MAX_ARRAY_FETCH);
                if length == 0 {
                    return Ok(Vec::new());
                }
                let elements = self.conn.get_array_values(*id, 0, length as i32).await?;
                Ok(elements
                    .into_iter()
                    .enumerate()
                    .map(|(i, element)| SoftValue::new(format!("[{}]", i), element))
                    .collect())
            }
            Value::Object { id, .. } => self.instance_fields(*id).await,
            Value::ValueType {
                is_enum: false,
                klass,
                fields,
            } => {
                let declared = self.conn.get_type_fields(*klass).await?;
                Ok(declared
                    .into_iter()
                    .filter(is_instance_field)
                    .zip(fields.iter().cloned())
                    .map(|(field, value)| SoftValue::new(field.name, value))
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn describe(&self, value: &Value) -> SdbResult<Description> {
        if let Some(display) = value.format_primitive() {
            return Ok(Description {
                display,
                type_name: value.primitive_type_name().map(str::to_string),
                has_children: false,
                object: false,
            });
        }

        match value {
            Value::String(id) => {
                let text = self.conn.get_string_value(*id).await?;
                Ok(Description {
                    display: format!("\"{}\"", text),
                    type_name: Some("string".to_string()),
                    has_children: false,
                    object: false,
                })
            }
            Value::Object { id, .. } => {
                let type_id = self.conn.get_object_type(*id).await?;
                let info = self.type_info(type_id).await?;
                if value.is_array() {
                    let length = self.conn.get_array_length(*id).await?;
                    Ok(Description {
                        display: array_display(&info.full_name, length),
                        type_name: Some(info.full_name.clone()),
                        has_children: length > 0,
                        object: true,
                    })
                } else {
                    Ok(Description {
                        display: format!("{{{}}}", info.full_name),
                        type_name: Some(info.full_name.clone()),
                        has_children: true,
                        object: true,
                    })
                }
            }
            Value::ValueType {
                is_enum,
                klass,
                fields,
            } => {
                let info = self.type_info(*klass).await?;
                let display = match (*is_enum, fields.first()) {
                    (true, Some(underlying)) => underlying
                        .format_primitive()
                        .unwrap_or_else(|| info.name.clone()),
                    _ => format!("{{{}}}", info.full_name),
                };
                Ok(Description {
                    display,
                    type_name: Some(info.full_name.clone()),
                    has_children: !is_enum && !fields.is_empty(),
                    object: false,
                })
            }
            Value::Type(type_id) => {
                let info = self.type_info(*type_id).await?;
                Ok(Description {
                    display: format!("{{{}}}", info.full_name),
                    type_name: Some("System.Type".to_string()),
                    has_children: false,
                    object: false,
                })
            }
            other => Ok(Description {
                display: format!("{:?}", other),
                type_name: None,
                has_children: false,
                object: false,
            }),
        }
    }

    async fn exception_message(&self, exception: ObjectId) -> String {
        if let Ok(fields) = self.instance_fields(exception).await {
            let message = fields.into_iter().find(|field| field.name == "_message");
            if let Some(SoftValue {
                value: Value::String(id),
                ..
            }) = message
            {
                if let Ok(text) = self.conn.get_string_value(id).await {
                    return text;
                }
            }
        }

        match self.conn.get_object_type(exception).await {
            Ok(type_id) => match self.type_info(type_id).await {
                Ok(info) => info.full_name.clone(),
                Err(_) => "exception".to_string(),
            },
            Err(_) => "exception".to_string(),
        }
    }

    async fn lookup_root(
        &self,
        thread: ThreadId,
        frame: &Frame,
        name: &str,
    ) -> SdbResult<Option<SoftValue>> {
        if name == "this" {
            let this = self.conn.get_frame_this(thread, frame.frame_id).await?;
            return Ok(Some(SoftValue::new("this", this)));
        }

        let locals = self.conn.get_locals_info(frame.method).await?;
        if let Some(index) = locals.local_names.iter().position(|local| local == name) {
            let values = self
                .conn
                .get_frame_values(thread, frame.frame_id, &[index as i32])
                .await?;
            return Ok(values.into_iter().next().map(|v| SoftValue::new(name, v)));
        }

        let params = self.conn.get_param_info(frame.method).await?;
        if let Some(index) = params.param_names.iter().position(|param| param == name) {
            let values = self
                .conn
                .get_frame_values(thread, frame.frame_id, &[param_position(index)])
                .await?;
            return Ok(values.into_iter().next().map(|v| SoftValue::new(name, v)));
        }

        // Implicit this.field
        match self.conn.get_frame_this(thread, frame.frame_id).await {
            Ok(this @ Value::Object { .. }) => {
                let this = SoftValue::new("this", this);
                Ok(self
                    .children(&this)
                    .await?
                    .into_iter()
                    .find(|field| field.name == name))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_agent_error() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply_step(&self, current: SoftValue, step: &PathStep) -> SdbResult<SoftValue> {
        if matches!(current.value, Value::Null) {
            return Ok(SoftValue::error(
                current.name,
                "Object reference not set to an instance of an object.",
            ));
        }

        match step {
            PathStep::Member(name) => {
                let found = self
                    .children(&current)
                    .await?
                    .into_iter()
                    .find(|field| field.name == *name);
                Ok(found.unwrap_or_else(|| {
                    SoftValue::error(
                        name.clone(),
                        format!("Unknown member: {}", name),
                    )
                }))
            }
            PathStep::Index(index) => match &current.value {
                Value::Object { id, .. } if current.value.is_array() => {
                    let length = self.conn.get_array_length(*id).await?;
                    if *index < 0 || *index as usize >= length {
                        return Ok(SoftValue::error(
                            format!("[{}]", index),
                            "Index was outside the bounds of the array.",
                        ));
                    }
                    let values = self.conn.get_array_values(*id, *index, 1).await?;
                    Ok(values
                        .into_iter()
                        .next()
                        .map(|v| SoftValue::new(format!("[{}]", index), v))
                        .unwrap_or_else(|| SoftValue::error(format!("[{}]", index), "no value")))
                }
                _ => Ok(SoftValue::error(
                    format!("[{}]", index),
                    "Only arrays can be indexed.",
                )),
            },
        }
    }
}

/// Engine backed by a live agent connection
pub struct SoftDebugger {
    inner: Arc<Inner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SoftDebugger {
    /// Take over a negotiated connection and start listening for events
    pub async fn attach(
        conn: SdbConnection,
        events: mpsc::Sender<EngineEvent>,
    ) -> SdbResult<Self> {
        let inner = Arc::new(Inner {
            conn,
            events,
            state: Mutex::new(State::default()),
            vm_started: Notify::new(),
        });

        let requests = [
            (event_kinds::THREAD_START, SuspendPolicy::None),
            (event_kinds::THREAD_DEATH, SuspendPolicy::None),
            (event_kinds::TYPE_LOAD, SuspendPolicy::All),
            (event_kinds::USER_BREAK, SuspendPolicy::All),
            (event_kinds::USER_LOG, SuspendPolicy::None),
        ];
        for (kind, policy) in requests {
            inner.conn.enable_event(kind, policy).await?;
        }

        let pump = tokio::spawn(inner.clone().pump());

        Ok(Self {
            inner,
            pump: Mutex::new(Some(pump)),
        })
    }

    fn active(&self) -> EngineResult<ThreadId> {
        self.inner
            .state()
            .active_thread
            .ok_or_else(|| EngineError::Failed("no active thread".to_string()))
    }

    fn stop_pump(&self) {
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

impl Engine for SoftDebugger {
    type Value = SoftValue;

    async fn start(&self) -> EngineResult<()> {
        let started = self.inner.state().started;
        if !started {
            // Attaching to a running VM never sends VM_START
            if tokio::time::timeout(VM_START_WAIT, self.inner.vm_started.notified())
                .await
                .is_err()
            {
                debug!("No VM_START within {:?}", VM_START_WAIT);
            }
        }

        resume_vm(&self.inner.conn).await?;
        if self.inner.events.try_send(EngineEvent::Ready).is_err() {
            debug!("Could not report engine ready");
        }
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.inner.state().exceptions.clear();
        resume_vm(&self.inner.conn).await?;
        Ok(())
    }

    async fn step(&self, kind: StepKind) -> EngineResult<()> {
        let thread = self.active()?;
        let depth = match kind {
            StepKind::Over => StepDepth::Over,
            StepKind::Into => StepDepth::Into,
            StepKind::Out => StepDepth::Out,
        };

        self.inner.clear_step().await;
        let request = self
            .inner
            .conn
            .set_step(thread, depth, SuspendPolicy::All)
            .await?;
        {
            let mut state = self.inner.state();
            state.step_request = Some(request);
            state.exceptions.clear();
        }

        resume_vm(&self.inner.conn).await?;
        Ok(())
    }

    async fn interrupt(&self) -> EngineResult<()> {
        self.inner.conn.suspend_all().await?;

        let active = self.inner.state().active_thread;
        let thread = match active {
            Some(thread) => thread,
            None => {
                let threads = self.inner.conn.get_all_threads().await?;
                threads.first().copied().unwrap_or(0)
            }
        };
        self.inner.state().active_thread = Some(thread);

        // The session is the one draining this channel, so never wait on it
        let stopped = EngineEvent::Stopped {
            thread: i64::from(thread),
            reason: StopReason::Pause,
        };
        if self.inner.events.try_send(stopped).is_err() {
            warn!("Engine event channel full; pause stop dropped");
        }
        Ok(())
    }

    async fn detach(&self) -> EngineResult<()> {
        self.stop_pump();

        let (step, catchpoints) = {
            let mut state = self.inner.state();
            let catchpoints: Vec<i32> = state
                .catchpoints
                .drain()
                .flat_map(|(_, cp)| cp.requests)
                .collect();
            state.breakpoints.clear();
            (state.step_request.take(), catchpoints)
        };

        self.inner.conn.clear_all_breakpoints().await?;
        if let Some(step) = step {
            self.inner
                .conn
                .clear_event_request(event_kinds::STEP, step)
                .await
                .ok();
        }
        for request in catchpoints {
            self.inner
                .conn
                .clear_event_request(event_kinds::EXCEPTION, request)
                .await
                .ok();
        }

        resume_vm(&self.inner.conn).await?;
        self.dispose().await;
        Ok(())
    }

    async fn dispose(&self) {
        self.stop_pump();
        if let Err(e) = self.inner.conn.dispose().await {
            debug!("Dispose failed: {}", e);
        }
    }

    async fn threads(&self) -> EngineResult<Vec<EngineThread>> {
        let ids = self.inner.conn.get_all_threads().await?;
        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            let name = self.inner.conn.get_thread_name(id).await.unwrap_or_default();
            threads.push(EngineThread {
                id: i64::from(id),
                name,
            });
        }
        Ok(threads)
    }

    fn active_thread(&self) -> Option<i64> {
        self.inner.state().active_thread.map(i64::from)
    }

    async fn set_active_thread(&self, thread: i64) -> EngineResult<()> {
        let thread = to_thread_id(thread)?;
        self.inner.state().active_thread = Some(thread);
        Ok(())
    }

    async fn backtrace(&self, start: usize, levels: Option<usize>) -> EngineResult<Backtrace> {
        let thread = self.active()?;
        let frames = self.inner.frames(thread).await?;
        let total = frames.len();
        let end = match levels {
            Some(levels) => start.saturating_add(levels).min(total),
            None => total,
        };

        let mut result = Vec::new();
        for (index, frame) in frames.iter().enumerate().take(end).skip(start) {
            result.push(self.inner.describe_frame(index, frame).await?);
        }

        Ok(Backtrace {
            frames: result,
            total,
        })
    }

    async fn frame_scopes(
        &self,
        thread: i64,
        frame: usize,
    ) -> EngineResult<FrameScopes<SoftValue>> {
        let thread = to_thread_id(thread)?;
        let frame = self.inner.frame_at(thread, frame).await?;
        let conn = &self.inner.conn;

        let this = match conn.get_frame_this(thread, frame.frame_id).await {
            Ok(Value::Null) | Ok(Value::Void) => None,
            Ok(value) => Some(SoftValue::new("this", value)),
            Err(e) if e.is_agent_error() => None,
            Err(e) => return Err(e.into()),
        };

        let param_names = match conn.get_param_info(frame.method).await {
            Ok(info) => info.param_names,
            Err(e) if e.is_agent_error() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let positions: Vec<i32> = (0..param_names.len()).map(param_position).collect();
        let arguments = read_frame_values(conn, thread, &frame, param_names, &positions).await?;

        let local_names = match conn.get_locals_info(frame.method).await {
            Ok(info) => info.local_names,
            Err(e) if e.is_agent_error() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let positions: Vec<i32> = (0..local_names.len() as i32).collect();
        let locals = read_frame_values(conn, thread, &frame, local_names, &positions).await?;

        Ok(FrameScopes {
            this,
            arguments,
            locals,
        })
    }

    async fn resolve(&self, value: &SoftValue) -> ResolvedValue {
        let mut resolved = ResolvedValue {
            name: value.name.clone(),
            ..ResolvedValue::default()
        };

        if let Some(error) = &value.error {
            resolved.flags.error = true;
            resolved.display = Some(error.clone());
            return resolved;
        }

        match self.inner.describe(&value.value).await {
            Ok(description) => {
                resolved.display = Some(description.display);
                resolved.type_name = description.type_name;
                resolved.has_children = description.has_children;
                resolved.flags.object = description.object;
            }
            Err(e) => {
                resolved.flags.error = true;
                resolved.display = Some(e.to_string());
            }
        }
        resolved
    }

    async fn children(&self, value: &SoftValue) -> EngineResult<Vec<SoftValue>> {
        Ok(self.inner.children(value).await?)
    }

    fn validate_expression(&self, expression: &str) -> Result<(), String> {
        parse_expression(expression).map(|_| ())
    }

    async fn evaluate(
        &self,
        thread: i64,
        frame: usize,
        expression: &str,
    ) -> EngineResult<SoftValue> {
        let steps = parse_expression(expression).map_err(EngineError::Failed)?;
        let thread = to_thread_id(thread)?;
        let frame = self.inner.frame_at(thread, frame).await?;

        let mut steps = steps.iter();
        let Some(PathStep::Member(root)) = steps.next() else {
            return Err(EngineError::Failed(format!(
                "unsupported expression '{}'",
                expression
            )));
        };

        let Some(mut current) = self.inner.lookup_root(thread, &frame, root).await? else {
            return Ok(SoftValue::error(
                expression,
                format!("The name '{}' does not exist in the current context", root),
            ));
        };

        for step in steps {
            current = self.inner.apply_step(current, step).await?;
            if current.error.is_some() {
                break;
            }
        }

        current.name = expression.to_string();
        Ok(current)
    }

    async fn active_exception(&self, thread: i64) -> Option<ExceptionInfo<SoftValue>> {
        let thread = to_thread_id(thread).ok()?;
        let exception = self.inner.state().exceptions.get(&thread).copied()?;

        let type_id = self.inner.conn.get_object_type(exception).await.ok()?;
        let info = self.inner.type_info(type_id).await.ok()?;
        let message = self.inner.exception_message(exception).await;

        Some(ExceptionInfo {
            type_name: info.full_name.clone(),
            message,
            instance: SoftValue::new(
                "$exception",
                Value::Object {
                    tag: value_tags::CLASS,
                    id: exception,
                },
            ),
        })
    }

    async fn insert_breakpoint(&self, id: u32, path: &str, line: i64) -> EngineResult<()> {
        self.inner.state().breakpoints.insert(
            id,
            BoundBreakpoint {
                path: path.to_string(),
                line,
                requests: Vec::new(),
            },
        );

        match self.inner.bind_breakpoint(id, path, line, None).await {
            Err(e) if e.is_agent_error() => {
                debug!("Breakpoint {} stays pending: {}", id, e);
                Ok(())
            }
            result => Ok(result?),
        }
    }

    async fn remove_breakpoint(&self, id: u32) -> EngineResult<()> {
        let removed = self.inner.state().breakpoints.remove(&id);
        if let Some(bp) = removed {
            for request in bp.requests {
                match self
                    .inner
                    .conn
                    .clear_event_request(event_kinds::BREAKPOINT, request)
                    .await
                {
                    Err(e) if !e.is_agent_error() => return Err(e.into()),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn insert_catchpoint(&self, id: u32, exception: &str) -> EngineResult<()> {
        self.inner.state().catchpoints.insert(
            id,
            BoundCatchpoint {
                exception: exception.to_string(),
                requests: Vec::new(),
            },
        );

        let types = match self.inner.conn.get_types(exception, false).await {
            Ok(types) => types,
            Err(e) if e.is_agent_error() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for type_id in types {
            self.inner.bind_catchpoint_to(id, type_id).await?;
        }
        Ok(())
    }

    async fn remove_catchpoint(&self, id: u32) -> EngineResult<()> {
        let removed = self.inner.state().catchpoints.remove(&id);
        if let Some(cp) = removed {
            for request in cp.requests {
                match self
                    .inner
                    .conn
                    .clear_event_request(event_kinds::EXCEPTION, request)
                    .await
                {
                    Err(e) if !e.is_agent_error() => return Err(e.into()),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

impl Drop for SoftDebugger {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

async fn read_frame_values(
    conn: &SdbConnection,
    thread: ThreadId,
    frame: &Frame,
    names: Vec<String>,
    positions: &[i32],
) -> EngineResult<Vec<SoftValue>> {
    if positions.is_empty() {
        return Ok(Vec::new());
    }

    match conn.get_frame_values(thread, frame.frame_id, positions).await {
        Ok(values) => Ok(names
            .into_iter()
            .zip(values)
            .map(|(name, value)| SoftValue::new(name, value))
            .collect()),
        Err(e) if e.is_agent_error() => Ok(names
            .into_iter()
            .map(|name| SoftValue::error(name, e.to_string()))
            .collect()),
        Err(e) => Err(e.into()),
    }
}

/// Opens `SoftDebugger`s over TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftDebuggerConnector;

impl EngineConnector for SoftDebuggerConnector {
    type Engine = SoftDebugger;

    async fn connect(
        &self,
        target: ConnectTarget,
        policy: RetryPolicy,
        cancel: CancellationToken,
        events: mpsc::Sender<EngineEvent>,
    ) -> EngineResult<SoftDebugger> {
        let conn = match target {
            ConnectTarget::Connect(addr) => {
                SdbConnection::connect_with_retry(addr, policy, &cancel).await?
            }
            ConnectTarget::Listen(addr) => SdbConnection::listen(addr, &cancel).await?,
        };

        conn.negotiate_version().await?;
        info!("Connected to debugger agent at {}", target.addr());

        Ok(SoftDebugger::attach(conn, events).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_member_paths() {
        assert_eq!(
            parse_expression("this.items[2].Name").unwrap(),
            vec![
                PathStep::Member("this".to_string()),
                PathStep::Member("items".to_string()),
                PathStep::Index(2),
                PathStep::Member("Name".to_string()),
            ]
        );
        assert_eq!(
            parse_expression(" counter ").unwrap(),
            vec![PathStep::Member("counter".to_string())]
        );
    }

    #[test]
    fn test_rejects_operators() {
        assert!(parse_expression("a + b").is_err());
        assert!(parse_expression("1x").is_err());
        assert!(parse_expression("a.").is_err());
        assert!(parse_expression("a[x]").is_err());
        assert!(parse_expression("").is_err());
    }

    #[test]
    fn test_array_display() {
        assert_eq!(array_display("System.Int32[]", 3), "{System.Int32[3]}");
        assert_eq!(array_display("System.Int32[,]", 4), "{System.Int32[,]} [4]");
    }

    #[test]
    fn test_instance_fields_skip_statics_and_constants() {
        let field = |attributes| FieldInfo {
            field_id: 1,
            name: "f".to_string(),
            type_id: 2,
            attributes,
        };
        assert!(is_instance_field(&field(0x1)));
        assert!(!is_instance_field(&field(field_attributes::STATIC)));
        assert!(!is_instance_field(&field(field_attributes::LITERAL | field_attributes::STATIC)));
    }

    #[test]
    fn test_thread_id_conversion() {
        assert_eq!(to_thread_id(7).unwrap(), 7);
        assert!(to_thread_id(-1).is_err());
    }
}
