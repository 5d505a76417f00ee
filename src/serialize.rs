//! Self-delimiting binary record primitives.
//!
//! Scratch files and the finished `book.bin` share one encoding: strings are
//! length-prefixed (u32 little-endian + UTF-8 bytes), numeric fields are
//! fixed-width little-endian. Records built from these primitives can be
//! re-read sequentially without a separate length table, which is what lets
//! the builder replay scratch files with nothing but a cursor.

use std::io::{self, Read, Write};

/// Upper bound on a single serialized string.
///
/// Hrefs and TOC titles are short in practice; anything past this limit is
/// a corrupt or hostile file, not a real book.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Write a single byte.
pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

/// Write a u32 as little-endian.
pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write a u64 as little-endian.
pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write an i32 as little-endian.
pub fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write a length-prefixed UTF-8 string.
pub fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

/// Read a single byte.
pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Read a little-endian u32.
pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64.
pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a little-endian i32.
pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read a length-prefixed UTF-8 string.
///
/// Fails with `InvalidData` if the length prefix exceeds [`MAX_STRING_LEN`]
/// or the bytes are not valid UTF-8.
pub fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    let len = read_u32(r)? as usize;
    if len > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string length {} exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid UTF-8"))
}

/// Serialized size of a length-prefixed string, without writing it.
pub fn str_len(s: &str) -> u64 {
    4 + s.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_numeric_round_trip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 0xAB).unwrap();
        write_u32(&mut buf, 0xDEAD_BEEF).unwrap();
        write_u64(&mut buf, u64::MAX - 1).unwrap();
        write_i32(&mut buf, -1).unwrap();

        let mut cur = Cursor::new(buf);
        assert_eq!(read_u8(&mut cur).unwrap(), 0xAB);
        assert_eq!(read_u32(&mut cur).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(&mut cur).unwrap(), u64::MAX - 1);
        assert_eq!(read_i32(&mut cur).unwrap(), -1);
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = Vec::new();
        write_str(&mut buf, "OEBPS/chapter1.xhtml").unwrap();
        write_str(&mut buf, "").unwrap();
        write_str(&mut buf, "Ü§ non-ascii ✓").unwrap();

        let mut cur = Cursor::new(buf);
        assert_eq!(read_str(&mut cur).unwrap(), "OEBPS/chapter1.xhtml");
        assert_eq!(read_str(&mut cur).unwrap(), "");
        assert_eq!(read_str(&mut cur).unwrap(), "Ü§ non-ascii ✓");
    }

    #[test]
    fn test_string_length_guard() {
        let mut buf = Vec::new();
        write_u32(&mut buf, (MAX_STRING_LEN + 1) as u32).unwrap();
        buf.extend_from_slice(&[0u8; 16]);

        let err = read_str(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_past_end_is_unexpected_eof() {
        let mut cur = Cursor::new(vec![1u8, 2]);
        let err = read_u32(&mut cur).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_str_len_matches_encoding() {
        let s = "spine/ch1.xhtml";
        let mut buf = Vec::new();
        write_str(&mut buf, s).unwrap();
        assert_eq!(buf.len() as u64, str_len(s));
    }
}
