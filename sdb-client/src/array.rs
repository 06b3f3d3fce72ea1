// ArrayReference command implementations

use crate::commands::{command_sets, array_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_count, read_i32};
use crate::types::{read_value, ArrayId, Value};
use bytes::BufMut;

/// Per-dimension length and lower bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayBound {
    pub length: i32,
    pub lower_bound: i32,
}

impl SdbConnection {
    /// Get the dimensions of an array (ArrayReference.GetLength command)
    pub async fn get_array_bounds(&self, array_id: ArrayId) -> SdbResult<Vec<ArrayBound>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::ARRAY_REFERENCE, array_commands::GET_LENGTH);

        put_id(&mut packet.data, array_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let rank = read_count(&mut data)?;
        let mut bounds = Vec::with_capacity(rank);
        for _ in 0..rank {
            let length = read_i32(&mut data)?;
            let lower_bound = read_i32(&mut data)?;
            bounds.push(ArrayBound {
                length,
                lower_bound,
            });
        }

        Ok(bounds)
    }

    /// Total number of elements across all dimensions
    pub async fn get_array_length(&self, array_id: ArrayId) -> SdbResult<usize> {
        let bounds = self.get_array_bounds(array_id).await?;
        Ok(bounds
            .iter()
            .map(|bound| bound.length.max(0) as usize)
            .product())
    }

    /// Get a slice of elements (ArrayReference.GetValues command)
    pub async fn get_array_values(
        &self,
        array_id: ArrayId,
        index: i32,
        length: i32,
    ) -> SdbResult<Vec<Value>> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::ARRAY_REFERENCE, array_commands::GET_VALUES);

        put_id(&mut packet.data, array_id);
        packet.data.put_i32(index);
        packet.data.put_i32(length);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let mut values = Vec::with_capacity(length.max(0) as usize);
        for _ in 0..length.max(0) {
            values.push(read_value(&mut data)?);
        }

        Ok(values)
    }
}
