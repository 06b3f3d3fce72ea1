// Error types
//
// RequestError is the structured error carried in failed responses. Its
// `{name}` placeholders are only expanded when the response is built.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use sdb_client::SdbError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\{(\w+)\}").unwrap()
});

/// Substitute `{name}` placeholders from `variables`
pub fn expand_variables(format: &str, variables: &BTreeMap<String, String>) -> String {
    VARIABLE
        .replace_all(format, |caps: &Captures| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => value.clone(),
                None => format!("{{{}: not found}}", name),
            }
        })
        .into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestError {
    pub id: i64,
    pub format: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    pub show_user: bool,
    pub send_telemetry: bool,
}

impl RequestError {
    pub fn new(id: i64, format: impl Into<String>) -> Self {
        Self {
            id,
            format: format.into(),
            variables: BTreeMap::new(),
            show_user: true,
            send_telemetry: false,
        }
    }

    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    /// Human-readable text with every placeholder expanded
    pub fn message(&self) -> String {
        expand_variables(&self.format, &self.variables)
    }

    pub fn unrecognized_request(command: &str) -> Self {
        Self::new(1014, "unrecognized request: {_request}").with("_request", command)
    }

    pub fn bad_path_format(format: &str) -> Self {
        Self::new(1015, "initialize: bad value '{_format}' for pathFormat").with("_format", format)
    }

    pub fn malformed_arguments(command: &str, reason: impl ToString) -> Self {
        Self::new(1016, "{_request}: malformed arguments ({_reason})")
            .with("_request", command)
            .with("_reason", reason)
    }

    pub fn no_source() -> Self {
        Self::new(1020, "No source available")
    }

    pub fn engine_failure(command: &str, exception: impl ToString) -> Self {
        Self::new(
            1104,
            "error while processing request '{_request}' (exception: {_exception})",
        )
        .with("_request", command)
        .with("_exception", exception)
    }

    pub fn program_missing() -> Self {
        Self::new(3001, "Property 'program' is missing or empty.")
    }

    pub fn program_not_found(path: &str) -> Self {
        Self::new(3002, "Program '{path}' does not exist.").with("path", path)
    }

    pub fn cwd_empty() -> Self {
        Self::new(3003, "Property 'cwd' is empty.")
    }

    pub fn cwd_not_found(path: &str) -> Self {
        Self::new(3004, "Working directory '{path}' does not exist.").with("path", path)
    }

    pub fn runtime_empty() -> Self {
        Self::new(3005, "Property 'runtimeExecutable' is empty.")
    }

    pub fn runtime_not_found(path: &str) -> Self {
        Self::new(3006, "Runtime executable '{path}' does not exist.").with("path", path)
    }

    pub fn address_missing() -> Self {
        Self::new(3007, "Property 'address' is missing or empty.")
    }

    pub fn port_missing() -> Self {
        Self::new(3008, "Property 'port' is missing.")
    }

    pub fn variables_reference_missing() -> Self {
        Self::new(3009, "variables: property 'variablesReference' is missing")
    }

    pub fn source_missing() -> Self {
        Self::new(3010, "setBreakpoints: property 'source' is empty or misformed")
    }

    pub fn runtime_not_on_path(runtime: &str) -> Self {
        Self::new(3011, "Can't find runtime '{_runtime}' on PATH.").with("_runtime", runtime)
    }

    pub fn launch_failed(reason: impl ToString) -> Self {
        Self::new(3012, "Can't launch debug target ({_reason}).").with("_reason", reason)
    }

    pub fn invalid_address(address: &str) -> Self {
        Self::new(3013, "Invalid address '{address}'.").with("address", address)
    }

    pub fn evaluate_failed(reason: impl ToString) -> Self {
        Self::new(3014, "Evaluate request failed ({_reason}).").with("_reason", reason)
    }

    pub fn connect_failed(address: impl ToString, reason: impl ToString) -> Self {
        Self::new(
            3015,
            "Cannot connect to the debugger agent at {_address} ({_reason}).",
        )
        .with("_address", address)
        .with("_reason", reason)
    }

    pub fn no_debuggee(command: &str) -> Self {
        Self::new(3016, "{_request}: no debuggee is attached").with("_request", command)
    }

    pub fn frame_unavailable(command: &str, frame: i64) -> Self {
        Self::new(3017, "{_request}: stack frame {_frame} is not available")
            .with("_request", command)
            .with("_frame", frame)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (error {})", self.message(), self.id)
    }
}

impl std::error::Error for RequestError {}

/// Failures raised by an engine implementation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Sdb(#[from] SdbError),

    #[error("{0}")]
    Failed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl HandlerError {
    /// Structured error for the response to `command`
    pub fn into_request_error(self, command: &str) -> RequestError {
        match self {
            HandlerError::Request(error) => error,
            HandlerError::Engine(error) => RequestError::engine_failure(command, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_expand_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("path".to_string(), "/tmp/a.exe".to_string());

        assert_eq!(
            expand_variables("Program '{path}' does not exist.", &vars),
            "Program '/tmp/a.exe' does not exist."
        );
        assert_eq!(
            expand_variables("{missing} and {path}", &vars),
            "{missing: not found} and /tmp/a.exe"
        );
    }

    #[test]
    fn test_error_serializes_structure() {
        let error = RequestError::bad_path_format("url");

        assert_eq!(error.message(), "initialize: bad value 'url' for pathFormat");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({
                "id": 1015,
                "format": "initialize: bad value '{_format}' for pathFormat",
                "variables": {"_format": "url"},
                "showUser": true,
                "sendTelemetry": false
            })
        );
    }

    #[test]
    fn test_engine_errors_wrap_into_1104() {
        let error = HandlerError::from(EngineError::Failed("boom".to_string()));
        let error = error.into_request_error("next");

        assert_eq!(error.id, 1104);
        assert_eq!(
            error.message(),
            "error while processing request 'next' (exception: boom)"
        );
    }
}
