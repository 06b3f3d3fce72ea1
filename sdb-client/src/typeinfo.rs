// Type command implementations
//
// Commands for inspecting loaded types (names, methods, fields, sources)

use crate::commands::{command_sets, type_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_count, read_i32, read_id, read_string, read_u8};
use crate::types::{FieldId, MethodId, TypeId};
use serde::{Deserialize, Serialize};

/// Basic type description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeInfo {
    pub namespace: String,
    pub name: String,
    pub full_name: String,
    pub base_type: TypeId,
    pub element_type: TypeId,
    pub rank: u8,
    pub attributes: i32,
    pub flags: u8,
}

impl TypeInfo {
    pub fn is_valuetype(&self) -> bool {
        self.flags & 0x8 != 0
    }

    pub fn is_enum(&self) -> bool {
        self.flags & 0x10 != 0
    }
}

/// Field declared by a type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub type_id: TypeId,
    pub attributes: i32,
}

impl SdbConnection {
    /// Get names and shape of a type (Type.GetInfo command)
    pub async fn get_type_info(&self, type_id: TypeId) -> SdbResult<TypeInfo> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::TYPE, type_commands::GET_INFO);
        put_id(&mut packet.data, type_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let namespace = read_string(&mut data)?;
        let name = read_string(&mut data)?;
        let full_name = read_string(&mut data)?;
        let _assembly = read_id(&mut data)?;
        let _module = read_id(&mut data)?;
        let base_type = read_id(&mut data)?;
        let element_type = read_id(&mut data)?;
        let _token = read_i32(&mut data)?;
        let rank = read_u8(&mut data)?;
        let attributes = read_i32(&mut data)?;
        let flags = read_u8(&mut data)?;

        Ok(TypeInfo {
            namespace,
            name,
            full_name,
            base_type,
            element_type,
            rank,
            attributes,
            flags,
        })
    }

    /// Get the methods declared by a type (Type.GetMethods command)
    pub async fn get_type_methods(&self, type_id: TypeId) -> SdbResult<Vec<MethodId>> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::TYPE, type_commands::GET_METHODS);
        put_id(&mut packet.data, type_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let methods_count = read_count(&mut data)?;
        let mut methods = Vec::with_capacity(methods_count);

        for _ in 0..methods_count {
            methods.push(read_id(&mut data)?);
        }

        Ok(methods)
    }

    /// Get the fields declared by a type (Type.GetFields command)
    pub async fn get_type_fields(&self, type_id: TypeId) -> SdbResult<Vec<FieldInfo>> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::TYPE, type_commands::GET_FIELDS);
        put_id(&mut packet.data, type_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let fields_count = read_count(&mut data)?;
        let mut fields = Vec::with_capacity(fields_count);

        for _ in 0..fields_count {
            let field_id = read_id(&mut data)?;
            let name = read_string(&mut data)?;
            let type_id = read_id(&mut data)?;
            let attributes = read_i32(&mut data)?;

            fields.push(FieldInfo {
                field_id,
                name,
                type_id,
                attributes,
            });
        }

        Ok(fields)
    }

    /// Get the full paths of source files contributing to a type
    /// (Type.GetSourceFiles2 command)
    pub async fn get_type_source_files(&self, type_id: TypeId) -> SdbResult<Vec<String>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::TYPE, type_commands::GET_SOURCE_FILES_2);
        put_id(&mut packet.data, type_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let files_count = read_count(&mut data)?;
        let mut files = Vec::with_capacity(files_count);

        for _ in 0..files_count {
            files.push(read_string(&mut data)?);
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::put_string;
    use crate::testing::FakeAgent;
    use bytes::BufMut;

    #[tokio::test]
    async fn test_get_type_info() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;
            let cmd = agent.read_command().await;
            assert_eq!(cmd.command, type_commands::GET_INFO);

            let mut payload = Vec::new();
            put_string(&mut payload, "Demo");
            put_string(&mut payload, "Point");
            put_string(&mut payload, "Demo.Point");
            payload.put_u32(1); // assembly
            payload.put_u32(2); // module
            payload.put_u32(3); // base type
            payload.put_u32(0); // element type
            payload.put_i32(0x02000004);
            payload.put_u8(0);
            payload.put_i32(0x100000);
            payload.put_u8(0x8);
            payload.put_i32(0);
            agent.reply(cmd.id, &payload).await;
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        let info = connection.get_type_info(55).await.unwrap();
        assert_eq!(info.full_name, "Demo.Point");
        assert_eq!(info.base_type, 3);
        assert!(info.is_valuetype());
        assert!(!info.is_enum());
        server.await.unwrap();
    }
}
