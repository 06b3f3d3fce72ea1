// ObjectReference command implementations
//
// Commands for working with object instances

use crate::commands::{command_sets, object_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_id};
use crate::types::{read_value, FieldId, ObjectId, TypeId, Value};
use bytes::BufMut;

impl SdbConnection {
    /// Get the runtime type of an object (ObjectReference.GetType command)
    pub async fn get_object_type(&self, object_id: ObjectId) -> SdbResult<TypeId> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::OBJECT_REFERENCE, object_commands::GET_TYPE);

        put_id(&mut packet.data, object_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_id(&mut data)
    }

    /// Get instance field values of an object (ObjectReference.GetValues command)
    pub async fn get_object_values(
        &self,
        object_id: ObjectId,
        field_ids: &[FieldId],
    ) -> SdbResult<Vec<Value>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::OBJECT_REFERENCE, object_commands::GET_VALUES);

        put_id(&mut packet.data, object_id);
        packet.data.put_i32(field_ids.len() as i32);
        for field_id in field_ids {
            put_id(&mut packet.data, *field_id);
        }

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        // One value per requested field, no count prefix
        let mut values = Vec::with_capacity(field_ids.len());
        for _ in field_ids {
            values.push(read_value(&mut data)?);
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::value_tags;
    use crate::testing::FakeAgent;

    #[tokio::test]
    async fn test_get_object_values() {
        let (agent, addr) = FakeAgent::bind().await;

        let server = tokio::spawn(async move {
            let mut agent = agent.accept().await;
            let cmd = agent.read_command().await;
            assert_eq!(cmd.command, object_commands::GET_VALUES);
            assert_eq!(cmd.data, vec![0, 0, 0, 8, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2]);

            let mut payload = Vec::new();
            payload.put_u8(value_tags::I4);
            payload.put_i32(3);
            payload.put_u8(value_tags::STRING);
            payload.put_u32(19);
            agent.reply(cmd.id, &payload).await;
        });

        let connection = SdbConnection::connect(addr).await.unwrap();
        let values = connection.get_object_values(8, &[1, 2]).await.unwrap();
        assert_eq!(values, vec![Value::I4(3), Value::String(19)]);
        server.await.unwrap();
    }
}
