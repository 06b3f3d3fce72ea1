// Adapter configuration
//
// Tunables shared by every session on this process. Launch and attach
// settings arrive per request and are not part of this.

use sdb_client::RetryPolicy;
use std::time::Duration;

/// Which protocol traffic is echoed to the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TraceLevel {
    #[default]
    Off,
    Requests,
    Responses,
}

impl TraceLevel {
    pub fn requests(self) -> bool {
        self != TraceLevel::Off
    }
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub connect_retry: RetryPolicy,
    pub runtime_executable: String,
    pub fallback_agent_port: u16,
    pub default_stack_levels: usize,
    pub max_children: usize,
    pub concurrent_children_threshold: usize,
    /// How long to wait for stdout/stderr to reach EOF after the debuggee exits
    pub output_drain_attempts: u32,
    pub output_drain_interval: Duration,
    pub trace: TraceLevel,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::default(),
            runtime_executable: "mono".to_string(),
            fallback_agent_port: 55555,
            default_stack_levels: 10,
            max_children: 100,
            concurrent_children_threshold: 20,
            output_drain_attempts: 100,
            output_drain_interval: Duration::from_millis(100),
            trace: TraceLevel::Off,
        }
    }
}

impl AdapterConfig {
    pub fn output_drain_timeout(&self) -> Duration {
        self.output_drain_interval * self.output_drain_attempts
    }
}
