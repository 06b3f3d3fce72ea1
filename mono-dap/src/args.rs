// Typed request arguments
//
// Every command decodes its arguments once, at the dispatch boundary.
// Required properties are still optional here so a missing one can be
// answered with its own error id rather than a generic decode failure.

use crate::error::RequestError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Decode `arguments` for `command`; absent arguments decode as `{}`
pub fn parse<T: DeserializeOwned>(
    command: &str,
    arguments: Option<Value>,
) -> Result<T, RequestError> {
    let arguments = match arguments {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(value) => value,
    };
    serde_json::from_value(arguments).map_err(|e| RequestError::malformed_arguments(command, e))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    #[serde(rename = "adapterID")]
    pub adapter_id: Option<String>,
    pub lines_start_at1: Option<bool>,
    pub columns_start_at1: Option<bool>,
    pub path_format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionPathSegment {
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionOptions {
    pub path: Option<Vec<ExceptionPathSegment>>,
    #[serde(default)]
    pub break_mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    pub program: Option<String>,
    pub cwd: Option<String>,
    pub runtime_executable: Option<String>,
    #[serde(default)]
    pub runtime_args: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub no_debug: bool,
    pub console: Option<String>,
    #[serde(default)]
    pub external_console: bool,
    #[serde(rename = "__exceptionOptions")]
    pub exception_options: Option<Vec<ExceptionOptions>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    pub address: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub listen: bool,
    #[serde(rename = "__exceptionOptions")]
    pub exception_options: Option<Vec<ExceptionOptions>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceArgument {
    pub path: Option<String>,
    pub name: Option<String>,
    pub source_reference: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceBreakpointArgument {
    pub line: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetBreakpointsArguments {
    pub source: Option<SourceArgument>,
    pub lines: Option<Vec<i64>>,
    pub breakpoints: Option<Vec<SourceBreakpointArgument>>,
}

impl SetBreakpointsArguments {
    /// Requested client lines, preferring `lines` over `breakpoints`
    pub fn requested_lines(&self) -> Vec<i64> {
        match (&self.lines, &self.breakpoints) {
            (Some(lines), _) => lines.clone(),
            (None, Some(breakpoints)) => breakpoints.iter().map(|bp| bp.line).collect(),
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionBreakpointArgument {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetFunctionBreakpointsArguments {
    #[serde(default)]
    pub breakpoints: Vec<FunctionBreakpointArgument>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExceptionBreakpointsArguments {
    #[serde(default)]
    pub filters: Vec<String>,
    pub exception_options: Option<Vec<ExceptionOptions>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadArguments {
    pub thread_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: Option<i64>,
    pub start_frame: Option<i64>,
    pub levels: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: Option<String>,
    pub frame_id: Option<i64>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceArguments {
    pub source_reference: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectArguments {
    pub terminate_debuggee: Option<bool>,
    pub restart: Option<bool>,
}

/// Exception type names from options whose break mode is "always"
pub fn catchpoint_names(options: &[ExceptionOptions]) -> Vec<String> {
    options
        .iter()
        .filter(|option| option.break_mode == "always")
        .filter_map(|option| option.path.as_ref())
        .filter_map(|path| path.first())
        .flat_map(|segment| segment.names.iter().cloned())
        .collect()
}
