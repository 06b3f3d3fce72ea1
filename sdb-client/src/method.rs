// Method command implementations
//
// Commands for working with methods (names, line tables, parameters, locals)

use crate::commands::{command_sets, method_commands};
use crate::connection::SdbConnection;
use crate::protocol::{CommandPacket, SdbResult};
use crate::reader::{put_id, read_count, read_i32, read_id, read_string};
use crate::types::{MethodId, TypeId};
use serde::{Deserialize, Serialize};

/// Line table entry - maps an IL offset to a source line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTableEntry {
    pub il_offset: i32,
    pub line: i32,
}

/// Debug info for a method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugInfo {
    pub code_size: i32,
    pub source_file: String,
    pub lines: Vec<LineTableEntry>,
}

impl DebugInfo {
    /// Line of the closest sequence point at or before `il_offset`
    pub fn line_for_offset(&self, il_offset: i64) -> Option<i32> {
        self.lines
            .iter()
            .filter(|entry| i64::from(entry.il_offset) <= il_offset)
            .max_by_key(|entry| entry.il_offset)
            .map(|entry| entry.line)
    }

    /// Lowest IL offset mapped to `line`
    pub fn offset_for_line(&self, line: i32) -> Option<i32> {
        self.lines
            .iter()
            .filter(|entry| entry.line == line)
            .map(|entry| entry.il_offset)
            .min()
    }
}

/// Parameter names and types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamInfo {
    pub return_type: TypeId,
    pub param_types: Vec<TypeId>,
    pub param_names: Vec<String>,
}

/// Local variable names and types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalsInfo {
    pub local_types: Vec<TypeId>,
    pub local_names: Vec<String>,
}

impl SdbConnection {
    /// Get the method name (Method.GetName command)
    pub async fn get_method_name(&self, method_id: MethodId) -> SdbResult<String> {
        let id = self.next_id();
        let mut packet = CommandPacket::new(id, command_sets::METHOD, method_commands::GET_NAME);
        put_id(&mut packet.data, method_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_string(&mut data)
    }

    /// Get the type that declares a method (Method.GetDeclaringType command)
    pub async fn get_declaring_type(&self, method_id: MethodId) -> SdbResult<TypeId> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::METHOD, method_commands::GET_DECLARING_TYPE);
        put_id(&mut packet.data, method_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();
        read_id(&mut data)
    }

    /// Get the line table for a method (Method.GetDebugInfo command)
    pub async fn get_debug_info(&self, method_id: MethodId) -> SdbResult<DebugInfo> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::METHOD, method_commands::GET_DEBUG_INFO);
        put_id(&mut packet.data, method_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let code_size = read_i32(&mut data)?;
        let source_file = read_string(&mut data)?;

        let lines_count = read_count(&mut data)?;
        let mut lines = Vec::with_capacity(lines_count);

        for _ in 0..lines_count {
            let il_offset = read_i32(&mut data)?;
            let line = read_i32(&mut data)?;
            lines.push(LineTableEntry { il_offset, line });
        }

        Ok(DebugInfo {
            code_size,
            source_file,
            lines,
        })
    }

    /// Get parameter names and types (Method.GetParamInfo command)
    pub async fn get_param_info(&self, method_id: MethodId) -> SdbResult<ParamInfo> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::METHOD, method_commands::GET_PARAM_INFO);
        put_id(&mut packet.data, method_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let _call_conv = read_i32(&mut data)?;
        let param_count = read_count(&mut data)?;
        let _generic_param_count = read_i32(&mut data)?;
        let return_type = read_id(&mut data)?;

        let mut param_types = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            param_types.push(read_id(&mut data)?);
        }

        let mut param_names = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            param_names.push(read_string(&mut data)?);
        }

        Ok(ParamInfo {
            return_type,
            param_types,
            param_names,
        })
    }

    /// Get local variable names and types (Method.GetLocalsInfo command)
    pub async fn get_locals_info(&self, method_id: MethodId) -> SdbResult<LocalsInfo> {
        let id = self.next_id();
        let mut packet =
            CommandPacket::new(id, command_sets::METHOD, method_commands::GET_LOCALS_INFO);
        put_id(&mut packet.data, method_id);

        let reply = self.send_command(packet).await?;
        reply.check_error()?;

        let mut data = reply.data();

        let locals_count = read_count(&mut data)?;

        let mut local_types = Vec::with_capacity(locals_count);
        for _ in 0..locals_count {
            local_types.push(read_id(&mut data)?);
        }

        let mut local_names = Vec::with_capacity(locals_count);
        for _ in 0..locals_count {
            local_names.push(read_string(&mut data)?);
        }

        // Live ranges follow; scoping by IL range is not used

        Ok(LocalsInfo {
            local_types,
            local_names,
        })
    }
}
