//! Worker-protocol wire framing.
//!
//! The remote worker speaks a simple binary protocol: unsigned 64-bit
//! little-endian integers, strings framed as a length followed by the bytes
//! zero-padded to an 8-byte boundary, and length-prefixed string lists.
//! Command tags are integers.

use std::io::{Read, Write};

use buildhook_shared::errors::{HookError, HookResult};

/// Push a closure (export stream follows on the channel).
pub const CMD_IMPORT_PATHS: u64 = 4;
/// Ask the worker to export the listed paths back to us.
pub const CMD_EXPORT_PATHS: u64 = 5;
/// Build the listed derivations.
pub const CMD_BUILD_PATHS: u64 = 6;

fn read_error(err: std::io::Error) -> HookError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        HookError::Protocol("unexpected end of worker stream".to_string())
    } else {
        HookError::Protocol(format!("read from worker failed: {}", err))
    }
}

fn write_error(err: std::io::Error) -> HookError {
    HookError::Protocol(format!("write to worker failed: {}", err))
}

pub fn write_int<W: Write + ?Sized>(to: &mut W, value: u64) -> HookResult<()> {
    to.write_all(&value.to_le_bytes()).map_err(write_error)
}

pub fn read_int<R: Read + ?Sized>(from: &mut R) -> HookResult<u64> {
    let mut buf = [0u8; 8];
    from.read_exact(&mut buf).map_err(read_error)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_string<W: Write + ?Sized>(to: &mut W, value: &str) -> HookResult<()> {
    let bytes = value.as_bytes();
    write_int(to, bytes.len() as u64)?;
    to.write_all(bytes).map_err(write_error)?;
    let padding = bytes.len().next_multiple_of(8) - bytes.len();
    to.write_all(&[0u8; 8][..padding]).map_err(write_error)
}

pub fn read_string<R: Read + ?Sized>(from: &mut R) -> HookResult<String> {
    let len = read_int(from)? as usize;
    let mut bytes = vec![0u8; len];
    from.read_exact(&mut bytes).map_err(read_error)?;
    let padding = len.next_multiple_of(8) - len;
    let mut pad = [0u8; 8];
    from.read_exact(&mut pad[..padding]).map_err(read_error)?;
    String::from_utf8(bytes)
        .map_err(|_| HookError::Protocol("non-UTF-8 string from worker".to_string()))
}

pub fn write_string_list<W: Write + ?Sized>(to: &mut W, values: &[String]) -> HookResult<()> {
    write_int(to, values.len() as u64)?;
    for value in values {
        write_string(to, value)?;
    }
    Ok(())
}

pub fn read_string_list<R: Read + ?Sized>(from: &mut R) -> HookResult<Vec<String>> {
    let count = read_int(from)? as usize;
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        values.push(read_string(from)?);
    }
    Ok(values)
}
