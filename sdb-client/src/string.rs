// StringReference command implementations

use crate::commands::{command_sets, string_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_string};
use crate::types::StringId;

impl SdbConnection {
    /// Get the contents of a string object (StringReference.GetValue command)
    pub async fn get_string_value(&self, string_id: StringId) -> SdbResult<String> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::STRING_REFERENCE, string_commands::GET_VALUE);

        put_id(&mut packet.data, string_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_string(&mut data)
    }
}
