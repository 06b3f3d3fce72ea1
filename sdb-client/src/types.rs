// SDB type definitions
//
// Common types used across the SDB protocol

use crate::commands::value_tags;
use crate::protocol::{SdbError, SdbResult};
use crate::reader::{read_i32, read_i64, read_id, read_u8};
use serde::{Deserialize, Serialize};

// Every id is 4 bytes in SDB
pub type Id = u32;
pub type ObjectId = Id;
pub type ThreadId = ObjectId;
pub type StringId = ObjectId;
pub type ArrayId = ObjectId;
pub type TypeId = Id;
pub type MethodId = Id;
pub type FieldId = Id;
pub type FrameId = Id;
pub type AssemblyId = Id;
pub type DomainId = Id;

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub method: MethodId,
    pub il_offset: i64,
}

// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Void,
    Boolean(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    Ptr(i64),
    String(StringId),
    Object { tag: u8, id: ObjectId },
    ValueType {
        is_enum: bool,
        klass: TypeId,
        fields: Vec<Value>,
    },
    Type(TypeId),
    Null,
}

impl Value {
    /// Format primitive values for display; references need the agent
    pub fn format_primitive(&self) -> Option<String> {
        let text = match self {
            Value::Void => "void".to_string(),
            Value::Boolean(v) => if *v { "true" } else { "false" }.to_string(),
            Value::Char(v) => format!("'{}'", char::from_u32(*v as u32).unwrap_or('?')),
            Value::I1(v) => v.to_string(),
            Value::U1(v) => v.to_string(),
            Value::I2(v) => v.to_string(),
            Value::U2(v) => v.to_string(),
            Value::I4(v) => v.to_string(),
            Value::U4(v) => v.to_string(),
            Value::I8(v) => v.to_string(),
            Value::U8(v) => v.to_string(),
            Value::R4(v) => v.to_string(),
            Value::R8(v) => v.to_string(),
            Value::Ptr(v) => format!("0x{:x}", v),
            Value::Null => "null".to_string(),
            _ => return None,
        };
        Some(text)
    }

    /// Built-in type name for primitive tags
    pub fn primitive_type_name(&self) -> Option<&'static str> {
        match self {
            Value::Void => Some("void"),
            Value::Boolean(_) => Some("bool"),
            Value::Char(_) => Some("char"),
            Value::I1(_) => Some("sbyte"),
            Value::U1(_) => Some("byte"),
            Value::I2(_) => Some("short"),
            Value::U2(_) => Some("ushort"),
            Value::I4(_) => Some("int"),
            Value::U4(_) => Some("uint"),
            Value::I8(_) => Some("long"),
            Value::U8(_) => Some("ulong"),
            Value::R4(_) => Some("float"),
            Value::R8(_) => Some("double"),
            Value::Ptr(_) => Some("IntPtr"),
            Value::String(_) => Some("string"),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Value::Object { tag, .. } if *tag == value_tags::ARRAY || *tag == value_tags::SZARRAY
        )
    }
}

/// Read a tagged value
pub fn read_value(buf: &mut &[u8]) -> SdbResult<Value> {
    let tag = read_u8(buf)?;
    read_value_by_tag(tag, buf)
}

/// Read a value based on its type tag
pub fn read_value_by_tag(tag: u8, buf: &mut &[u8]) -> SdbResult<Value> {
    // Small integers travel as 4-byte ints
    let value = match tag {
        value_tags::VOID => Value::Void,
        value_tags::BOOLEAN => Value::Boolean(read_i32(buf)? != 0),
        value_tags::CHAR => Value::Char(read_i32(buf)? as u16),
        value_tags::I1 => Value::I1(read_i32(buf)? as i8),
        value_tags::U1 => Value::U1(read_i32(buf)? as u8),
        value_tags::I2 => Value::I2(read_i32(buf)? as i16),
        value_tags::U2 => Value::U2(read_i32(buf)? as u16),
        value_tags::I4 => Value::I4(read_i32(buf)?),
        value_tags::U4 => Value::U4(read_i32(buf)? as u32),
        value_tags::I8 => Value::I8(read_i64(buf)?),
        value_tags::U8 => Value::U8(read_i64(buf)? as u64),
        value_tags::R4 => Value::R4(f32::from_bits(read_i32(buf)? as u32)),
        value_tags::R8 => Value::R8(f64::from_bits(read_i64(buf)? as u64)),
        value_tags::PTR => Value::Ptr(read_i64(buf)?),
        value_tags::STRING => Value::String(read_id(buf)?),
        value_tags::CLASS | value_tags::ARRAY | value_tags::OBJECT | value_tags::SZARRAY => {
            Value::Object {
                tag,
                id: read_id(buf)?,
            }
        }
        value_tags::VALUETYPE => {
            let is_enum = read_u8(buf)? != 0;
            let klass = read_id(buf)?;
            let count = read_i32(buf)?.max(0) as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(read_value(buf)?);
            }
            Value::ValueType {
                is_enum,
                klass,
                fields,
            }
        }
        value_tags::NULL => Value::Null,
        value_tags::TYPE => Value::Type(read_id(buf)?),
        value_tags::PARENT_VTYPE => {
            let _index = read_i32(buf)?;
            Value::Void
        }
        _ => return Err(SdbError::Protocol(format!("Unknown value tag: {:#x}", tag))),
    };
    Ok(value)
}
