// VirtualMachine command implementations
//
// These are the fundamental commands for interacting with the runtime

use crate::commands::{command_sets, vm_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_string, read_count, read_i32, read_id, read_string};
use crate::types::{ThreadId, TypeId};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Agent version information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmVersion {
    pub vm_version: String,
    pub major: i32,
    pub minor: i32,
}

impl SdbConnection {
    /// Get agent version information (VirtualMachine.Version command)
    pub async fn get_version(&self) -> SdbResult<VmVersion> {
        let id = self.next_id();
        let packet = CommandPacket::new(id, command_sets::VIRTUAL_MACHINE, vm_commands::VERSION);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let vm_version = read_string(&mut data)?;
        let major = read_i32(&mut data)?;
        let minor = read_i32(&mut data)?;

        Ok(VmVersion {
            vm_version,
            major,
            minor,
        })
    }

    /// Get all managed threads (VirtualMachine.AllThreads)
    pub async fn get_all_threads(&self) -> SdbResult<Vec<ThreadId>> {
        let id = self.next_id();
        let packet =
            CommandPacket::new(id, command_sets::VIRTUAL_MACHINE, vm_commands::ALL_THREADS);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let threads_count = read_count(&mut data)?;
        let mut threads = Vec::with_capacity(threads_count);

        for _ in 0..threads_count {
            threads.push(read_id(&mut data)?);
        }

        Ok(threads)
    }

    /// Suspend all threads (VirtualMachine.Suspend)
    pub async fn suspend_all(&self) -> SdbResult<()> {
        let id = self.next_id();
        let packet = CommandPacket::new(id, command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// Resume all threads (VirtualMachine.Resume)
    pub async fn resume_all(&self) -> SdbResult<()> {
        let id = self.next_id();
        let packet = CommandPacket::new(id, command_sets::VIRTUAL_MACHINE, vm_commands::RESUME);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// Detach from the debuggee, which keeps running (VirtualMachine.Dispose)
    pub async fn dispose(&self) -> SdbResult<()> {
        let id = self.next_id();
        let packet = CommandPacket::new(id, command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        Ok(())
    }

    /// Find loaded types that have code in `source_file`
    /// (VirtualMachine.GetTypesForSourceFile command)
    pub async fn get_types_for_source_file(
        &self,
        source_file: &str,
        ignore_case: bool,
    ) -> SdbResult<Vec<TypeId>> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(
            id,
            command_sets::VIRTUAL_MACHINE,
            vm_commands::GET_TYPES_FOR_SOURCE_FILE,
        );

        put_string(&mut packet.data, source_file);
        packet.data.put_u8(ignore_case as u8);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let types_count = read_count(&mut data)?;
        let mut types = Vec::with_capacity(types_count);

        for _ in 0..types_count {
            types.push(read_id(&mut data)?);
        }

        Ok(types)
    }

    /// Find loaded types by full name (VirtualMachine.GetTypes command)
    pub async fn get_types(&self, name: &str, ignore_case: bool) -> SdbResult<Vec<TypeId>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::VIRTUAL_MACHINE, vm_commands::GET_TYPES);

        put_string(&mut packet.data, name);
        packet.data.put_u8(ignore_case as u8);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let types_count = read_count(&mut data)?;
        let mut types = Vec::with_capacity(types_count);

        for _ in 0..types_count {
            types.push(read_id(&mut data)?);
        }

        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SdbError;
    use crate::testing::FakeAgent;

    #[tokio::test]
    async fn test_types_for_source_file() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;
            let cmd = agent.read_command().await;
            assert_eq!(cmd.command, vm_commands::GET_TYPES_FOR_SOURCE_FILE);

            let mut args = cmd.data.as_slice();
            assert_eq!(read_string(&mut args).unwrap(), "/src/Program.cs");
            assert_eq!(args, &[1u8][..]);

            let mut payload = Vec::new();
            payload.put_i32(2);
            payload.put_u32(40);
            payload.put_u32(41);
            agent.reply(cmd.id, &payload).await;
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        let types = connection
            .get_types_for_source_file("/src/Program.cs", true)
            .await
            .unwrap();
        assert_eq!(types, vec![40, 41]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_error_is_reported() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;
            let cmd = agent.read_command().await;
            assert_eq!(cmd.command, vm_commands::RESUME);
            agent.reply_with_code(cmd.id, 101, &[]).await;
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        let err = connection.resume_all().await.unwrap_err();
        assert!(matches!(err, SdbError::ErrorCode(101, "NOT_SUSPENDED")));
        server.await.unwrap();
    }
}
