// Mono soft debugger (SDB) client library
//
// Implements the subset of the agent wire protocol a source-level debugger needs:
// - Connection management (connect, accept, handshake, version negotiation)
// - Breakpoint, step and exception requests
// - Thread, frame and value inspection
// - Execution control

pub mod array;
pub mod commands;
pub mod connection;
pub mod eventloop;
pub mod eventrequest;
pub mod events;
pub mod method;
pub mod object;
pub mod protocol;
pub mod reader;
pub mod stackframe;
pub mod string;
pub mod thread;
pub mod typeinfo;
pub mod types;
pub mod vm;

#[cfg(test)]
mod testing;

pub use connection::{RetryPolicy, SdbConnection};
pub use eventrequest::{StepDepth, SuspendPolicy};
pub use events::{Event, EventKind, EventSet};
pub use protocol::{SdbError, SdbResult};
pub use types::{Location, Value};
