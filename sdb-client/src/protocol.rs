// SDB packet framing
//
// The Mono soft debugger agent speaks a JDWP-like protocol: an ASCII
// handshake followed by length-prefixed big-endian packets. Object, type,
// method and frame ids are all 4 bytes wide on the wire.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub type SdbResult<T> = Result<T, SdbError>;

#[derive(Debug, Error)]
pub enum SdbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("SDB error code {0}: {1}")]
    ErrorCode(u16, &'static str),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Gave up after {attempts} connect attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("Connection attempt cancelled")]
    Cancelled,
}

impl SdbError {
    /// True when the agent rejected the command, as opposed to a transport failure
    pub fn is_agent_error(&self) -> bool {
        matches!(self, SdbError::ErrorCode(..))
    }
}

// Sent by the agent first, echoed back by the debugger
pub const SDB_HANDSHAKE: &[u8] = b"DWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            command_set,
            command,
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data.len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(0x00);
        buf.put_u8(self.command_set);
        buf.put_u8(self.command);
        buf.put_slice(&self.data);

        buf.to_vec()
    }

    /// Decode a command packet sent by the agent (event composites)
    pub fn decode(mut buf: &[u8]) -> SdbResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SdbError::Protocol("Command packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags == REPLY_FLAG {
            return Err(SdbError::Protocol("Expected a command packet, got a reply".to_string()));
        }

        let command_set = buf.get_u8();
        let command = buf.get_u8();

        Ok(Self {
            id,
            command_set,
            command,
            data: buf.to_vec(),
        })
    }
}

impl ReplyPacket {
    pub fn decode(mut buf: &[u8]) -> SdbResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SdbError::Protocol("Reply packet too short".to_string()));
        }

        let _length = buf.get_u32();
        let id = buf.get_u32();
        let flags = buf.get_u8();

        if flags != REPLY_FLAG {
            return Err(SdbError::Protocol(format!("Invalid reply flag: {:#x}", flags)));
        }

        let error_code = buf.get_u16();
        let data = buf.to_vec();

        Ok(Self {
            id,
            error_code,
            data,
        })
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    pub fn check_error(&self) -> SdbResult<()> {
        if self.is_error() {
            Err(SdbError::ErrorCode(self.error_code, self.error_message()))
        } else {
            Ok(())
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn error_message(&self) -> &'static str {
        match self.error_code {
            0 => "NONE",
            20 => "INVALID_OBJECT",
            25 => "INVALID_FIELDID",
            30 => "INVALID_FRAMEID",
            100 => "NOT_IMPLEMENTED",
            101 => "NOT_SUSPENDED",
            102 => "INVALID_ARGUMENT",
            103 => "ERR_UNLOADED",
            104 => "ERR_NO_INVOCATION",
            105 => "ABSENT_INFORMATION",
            106 => "NO_SEQ_POINT_AT_IL_OFFSET",
            107 => "INVOKE_ABORTED",
            108 => "LOADER_ERROR",
            _ => "UNKNOWN_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_packet_encode() {
        let packet = CommandPacket::new(7, 1, 8);
        let encoded = packet.encode();

        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 11]);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 7]);
        assert_eq!(encoded[8], 0x00);
        assert_eq!(encoded[9], 1);
        assert_eq!(encoded[10], 8);
    }

    #[test]
    fn test_length_counts_payload() {
        let mut packet = CommandPacket::new(0x12345678, 15, 1);
        packet.data.extend_from_slice(&[1, 2, 3]);
        let encoded = packet.encode();

        assert_eq!(&encoded[0..4], &[0, 0, 0, 14]);
        assert_eq!(&encoded[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&encoded[11..], &[1, 2, 3]);
    }

    #[test]
    fn test_reply_packet_decode() {
        let reply_data = vec![
            0, 0, 0, 15, // length
            0, 0, 0, 3, // id
            0x80, // reply flag
            0, 0, // error code
            0, 0, 0, 42,
        ];

        let packet = ReplyPacket::decode(&reply_data).unwrap();
        assert_eq!(packet.id, 3);
        assert!(!packet.is_error());
        assert_eq!(packet.data(), &[0, 0, 0, 42]);
    }

    #[test]
    fn test_reply_error_code() {
        let reply_data = vec![0, 0, 0, 11, 0, 0, 0, 1, 0x80, 0, 101];
        let packet = ReplyPacket::decode(&reply_data).unwrap();

        let err = packet.check_error().unwrap_err();
        assert!(err.is_agent_error());
        assert_eq!(err.to_string(), "SDB error code 101: NOT_SUSPENDED");
    }

    #[test]
    fn test_reply_decode_rejects_command() {
        let data = vec![0, 0, 0, 11, 0, 0, 0, 1, 0x00, 64, 100];
        assert!(ReplyPacket::decode(&data).is_err());

        let command = CommandPacket::decode(&data).unwrap();
        assert_eq!(command.command_set, 64);
        assert_eq!(command.command, 100);
    }
}
