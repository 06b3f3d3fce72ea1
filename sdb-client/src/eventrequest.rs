// EventRequest command implementations
//
// Set up event requests (breakpoints, steps, exceptions, type loads)

use crate::commands::{
    command_sets, event_kinds, event_request_commands, modifier_kinds, step_sizes,
};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_i32};
use crate::types::{Location, ThreadId, TypeId};
use bytes::BufMut;

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

/// Step granularity relative to the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StepDepth {
    Into = 0,
    Over = 1,
    Out = 2,
}

impl SdbConnection {
    async fn set_event_request(
        &self,
        kind: u8,
        suspend_policy: SuspendPolicy,
        modifiers: &[u8],
        modifier_count: u8,
    ) -> SdbResult<i32> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::EVENT_REQUEST, event_request_commands::SET);

        packet.data.put_u8(kind);
        packet.data.put_u8(suspend_policy as u8);
        packet.data.put_u8(modifier_count);
        packet.data.extend_from_slice(modifiers);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_i32(&mut data)
    }

    /// Set a breakpoint at an IL location (EventRequest.Set command)
    /// Returns the request ID for this breakpoint
    pub async fn set_breakpoint(
        &self,
        location: Location,
        suspend_policy: SuspendPolicy,
    ) -> SdbResult<i32> {
        let mut modifiers = Vec::new();
        modifiers.put_u8(modifier_kinds::LOCATION_ONLY);
        put_id(&mut modifiers, location.method);
        modifiers.put_i64(location.il_offset);

        self.set_event_request(event_kinds::BREAKPOINT, suspend_policy, &modifiers, 1)
            .await
    }

    /// Request a single line step on `thread`
    pub async fn set_step(
        &self,
        thread: ThreadId,
        depth: StepDepth,
        suspend_policy: SuspendPolicy,
    ) -> SdbResult<i32> {
        let mut modifiers = Vec::new();
        modifiers.put_u8(modifier_kinds::STEP);
        put_id(&mut modifiers, thread);
        modifiers.put_i32(step_sizes::LINE);
        modifiers.put_i32(depth as i32);

        self.set_event_request(event_kinds::STEP, suspend_policy, &modifiers, 1)
            .await
    }

    /// Stop on exceptions of `type_id`, or of any type when it is None
    pub async fn set_exception_request(
        &self,
        type_id: Option<TypeId>,
        caught: bool,
        uncaught: bool,
        suspend_policy: SuspendPolicy,
    ) -> SdbResult<i32> {
        let mut modifiers = Vec::new();
        modifiers.put_u8(modifier_kinds::EXCEPTION_ONLY);
        put_id(&mut modifiers, type_id.unwrap_or(0));
        modifiers.put_u8(caught as u8);
        modifiers.put_u8(uncaught as u8);

        self.set_event_request(event_kinds::EXCEPTION, suspend_policy, &modifiers, 1)
            .await
    }

    /// Enable notifications for kinds that carry no modifiers
    /// (type loads, thread start/death, user log)
    pub async fn enable_event(&self, kind: u8, suspend_policy: SuspendPolicy) -> SdbResult<i32> {
        self.set_event_request(kind, suspend_policy, &[], 0).await
    }

    /// Clear an event request by kind and ID (EventRequest.Clear command)
    pub async fn clear_event_request(&self, kind: u8, request_id: i32) -> SdbResult<()> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::EVENT_REQUEST, event_request_commands::CLEAR);

        packet.data.put_u8(kind);
        packet.data.put_i32(request_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// Clear every breakpoint request (EventRequest.ClearAllBreakpoints command)
    pub async fn clear_all_breakpoints(&self) -> SdbResult<()> {
        let id = self.next_id();
        let packet = CommandPacket::new(
            id,
            command_sets::EVENT_REQUEST,
            event_request_commands::CLEAR_ALL_BREAKPOINTS,
        );

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }
}
