// Helpers for reading and writing SDB wire types

use crate::protocol::{SdbError, SdbResult};
use crate::types::Id;
use bytes::{Buf, BufMut};

/// Read an SDB string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> SdbResult<String> {
    if buf.remaining() < 4 {
        return Err(SdbError::Protocol("Not enough data for string length".to_string()));
    }

    let len = buf.get_u32() as usize;

    if buf.remaining() < len {
        return Err(SdbError::Protocol(format!(
            "Not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| SdbError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> SdbResult<u32> {
    if buf.remaining() < 4 {
        return Err(SdbError::Protocol("Not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> SdbResult<i32> {
    if buf.remaining() < 4 {
        return Err(SdbError::Protocol("Not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> SdbResult<u8> {
    if buf.remaining() < 1 {
        return Err(SdbError::Protocol("Not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

/// Read a i64
pub fn read_i64(buf: &mut &[u8]) -> SdbResult<i64> {
    if buf.remaining() < 8 {
        return Err(SdbError::Protocol("Not enough data for i64".to_string()));
    }
    Ok(buf.get_i64())
}

/// Read an object/type/method id
pub fn read_id(buf: &mut &[u8]) -> SdbResult<Id> {
    read_u32(buf)
}

/// Read a count prefix, rejecting negative values
pub fn read_count(buf: &mut &[u8]) -> SdbResult<usize> {
    let count = read_i32(buf)?;
    usize::try_from(count).map_err(|_| SdbError::Protocol(format!("Negative count: {}", count)))
}

pub fn put_string(data: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    data.put_u32(bytes.len() as u32);
    data.extend_from_slice(bytes);
}

pub fn put_id(data: &mut Vec<u8>, id: Id) {
    data.put_u32(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut data = Vec::new();
        put_string(&mut data, "Program.cs");
        put_id(&mut data, 9);

        let mut buf = data.as_slice();
        assert_eq!(read_string(&mut buf).unwrap(), "Program.cs");
        assert_eq!(read_id(&mut buf).unwrap(), 9);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_buffers_error() {
        let mut buf: &[u8] = &[0, 0, 0, 5, b'a'];
        assert!(read_string(&mut buf).is_err());

        let mut buf: &[u8] = &[0, 0];
        assert!(read_i32(&mut buf).is_err());
    }

    #[test]
    fn test_negative_count_rejected() {
        let mut buf: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        assert!(read_count(&mut buf).is_err());
    }
}
