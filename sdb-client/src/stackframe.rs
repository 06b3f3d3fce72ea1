// StackFrame command implementations
//
// Commands for inspecting stack frame variables

use crate::commands::{command_sets, stack_frame_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::put_id;
use crate::types::{read_value, FrameId, ThreadId, Value};
use bytes::BufMut;

/// Position of parameter `index` in StackFrame.GetValues
pub fn param_position(index: usize) -> i32 {
    -(index as i32) - 1
}

impl SdbConnection {
    /// Get local or parameter values in a frame (StackFrame.GetValues command)
    ///
    /// Locals are addressed by index, parameters by `param_position`.
    pub async fn get_frame_values(
        &self,
        thread_id: ThreadId,
        frame_id: FrameId,
        positions: &[i32],
    ) -> SdbResult<Vec<Value>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::STACK_FRAME, stack_frame_commands::GET_VALUES);

        put_id(&mut packet.data, thread_id);
        put_id(&mut packet.data, frame_id);
        packet.data.put_i32(positions.len() as i32);
        for position in positions {
            packet.data.put_i32(*position);
        }

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let mut values = Vec::with_capacity(positions.len());
        for _ in positions {
            values.push(read_value(&mut data)?);
        }

        Ok(values)
    }

    /// Get `this` for an instance frame (StackFrame.GetThis command)
    pub async fn get_frame_this(&self, thread_id: ThreadId, frame_id: FrameId) -> SdbResult<Value> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::STACK_FRAME, stack_frame_commands::GET_THIS);

        put_id(&mut packet.data, thread_id);
        put_id(&mut packet.data, frame_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_value(&mut data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_positions() {
        assert_eq!(param_position(0), -1);
        assert_eq!(param_position(2), -3);
    }
}
