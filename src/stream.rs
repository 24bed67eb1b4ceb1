//! Framed stream primitives
//!
//! Exact-length transfers and u16 length-prefixed strings over any blocking
//! byte channel. All multi-byte integers on the wire are big-endian.

use byteorder::{BigEndian, ByteOrder};
use std::io::{self, Read, Write};

/// Longest string a u16 length prefix can describe
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Fill `buf` completely from `reader`.
///
/// Short reads are retried until the buffer is full. A peer that closes
/// before that is reported as `UnexpectedEof`; any other error is returned
/// as soon as it is seen.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `buf` to `writer`, retrying short writes.
pub fn write_full<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match writer.write(&buf[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("peer stopped accepting after {} of {} bytes", sent, buf.len()),
                ))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Move exactly `len` bytes from `reader` to `writer` through `buf`.
///
/// Returns the number of bytes moved, which is always `len` on success.
pub fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64, buf: &mut [u8]) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    if buf.is_empty() && len > 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty copy buffer"));
    }

    let mut moved = 0u64;
    while moved < len {
        let chunk = (len - moved).min(buf.len() as u64) as usize;
        read_full(reader, &mut buf[..chunk])?;
        write_full(writer, &buf[..chunk])?;
        moved += chunk as u64;
    }
    Ok(moved)
}

/// Read a u16 length-prefixed UTF-8 string.
///
/// Strings longer than `buf` are read in `buf`-sized chunks into a single
/// allocation of the announced length.
pub fn read_string<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<String> {
    let mut prefix = [0u8; 2];
    read_full(reader, &mut prefix)?;
    let len = BigEndian::read_u16(&prefix) as usize;

    let bytes = if len <= buf.len() {
        read_full(reader, &mut buf[..len])?;
        buf[..len].to_vec()
    } else {
        if buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty string buffer"));
        }
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = (len - out.len()).min(buf.len());
            read_full(reader, &mut buf[..chunk])?;
            out.extend_from_slice(&buf[..chunk]);
        }
        out
    };

    String::from_utf8(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("string is not UTF-8: {}", e)))
}

/// Write a u16 length-prefixed string.
///
/// Short strings go out in a single write together with their prefix.
pub fn write_string<W: Write + ?Sized>(writer: &mut W, buf: &mut [u8], value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes exceeds {} byte limit", bytes.len(), MAX_STRING_LEN),
        ));
    }

    let framed = bytes.len() + 2;
    if framed <= buf.len() {
        BigEndian::write_u16(&mut buf[..2], bytes.len() as u16);
        buf[2..framed].copy_from_slice(bytes);
        return write_full(writer, &buf[..framed]);
    }

    let mut prefix = [0u8; 2];
    BigEndian::write_u16(&mut prefix, bytes.len() as u16);
    write_full(writer, &prefix)?;
    for chunk in bytes.chunks(buf.len().max(1)) {
        write_full(writer, chunk)?;
    }
    Ok(())
}
