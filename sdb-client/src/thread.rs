// Thread command implementations
//
// Commands for working with threads (frames, names)

use crate::commands::{command_sets, thread_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_count, read_i32, read_id, read_string, read_u8};
use crate::types::{FrameId, MethodId, ThreadId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Stack frame information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub method: MethodId,
    pub il_offset: i32,
    pub flags: u8,
}

impl SdbConnection {
    /// Get stack frames for a suspended thread (Thread.GetFrameInfo command)
    pub async fn get_frames(
        &self,
        thread_id: ThreadId,
        start_frame: i32,
        length: i32,
    ) -> SdbResult<Vec<Frame>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::THREAD, thread_commands::GET_FRAME_INFO);

        put_id(&mut packet.data, thread_id);
        // Start frame (0 = top frame)
        packet.data.put_i32(start_frame);
        // Length (-1 = all frames)
        packet.data.put_i32(length);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let frames_count = read_count(&mut data)?;
        let mut frames = Vec::with_capacity(frames_count);

        for _ in 0..frames_count {
            let frame_id = read_i32(&mut data)? as FrameId;
            let method = read_id(&mut data)?;
            let il_offset = read_i32(&mut data)?;
            let flags = read_u8(&mut data)?;

            frames.push(Frame {
                frame_id,
                method,
                il_offset,
                flags,
            });
        }

        Ok(frames)
    }

    /// Get the managed name of a thread (Thread.GetName command)
    pub async fn get_thread_name(&self, thread_id: ThreadId) -> SdbResult<String> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::THREAD, thread_commands::GET_NAME);

        put_id(&mut packet.data, thread_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_string(&mut data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAgent;

    #[tokio::test]
    async fn test_get_frames() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;
            let cmd = agent.read_command().await;
            assert_eq!(cmd.command_set, command_sets::THREAD);
            assert_eq!(cmd.data, vec![0, 0, 0, 3, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);

            let mut payload = Vec::new();
            payload.put_i32(2);
            for (frame, method, il) in [(1, 100, 4), (2, 101, 12)] {
                payload.put_i32(frame);
                payload.put_u32(method);
                payload.put_i32(il);
                payload.put_u8(0);
            }
            agent.reply(cmd.id, &payload).await;
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        let frames = connection.get_frames(3, 0, -1).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].frame_id, 2);
        assert_eq!(frames[1].method, 101);
        assert_eq!(frames[1].il_offset, 12);
        server.await.unwrap();
    }
}
