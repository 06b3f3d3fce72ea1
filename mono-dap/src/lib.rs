// Mono debug adapter
//
// Speaks the Debug Adapter Protocol to an editor and drives a Mono runtime
// through its soft debugger agent:
// - Content-Length framed transport and request dispatch
// - Debug session state machine (launch, attach, stepping, inspection)
// - Engine boundary with the soft debugger implementation
// - Client role for tests and tooling

pub mod args;
pub mod breakpoints;
pub mod client;
pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handles;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{AdapterConfig, TraceLevel};
pub use dispatcher::{serve, RequestHandler, Responder};
pub use session::DebugSession;
pub use transport::MessageSink;
