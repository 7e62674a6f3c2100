use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::path::Path;

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn uvarint_encode(mut n: u64, out: &mut Vec<u8>) {
    while n >= 0x80 {
        out.push((n as u8) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}

/// Returns `None` on truncated input.
pub fn uvarint_decode(mut data: &[u8]) -> Option<(u64, &[u8])> {
    let mut x = 0u64;
    let mut s = 0u32;
    loop {
        let (&b, rest) = data.split_first()?;
        data = rest;
        if b < 0x80 {
            return Some((x | ((b as u64) << s), data));
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
        if s > 63 {
            return None;
        }
    }
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<LE>(v)
}
pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<LE>(v)
}
pub fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_i64::<LE>(v)
}
pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<LE>()
}
pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<LE>()
}
pub fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    r.read_i64::<LE>()
}

/// Little-endian i64 at `off`; `None` when out of bounds.
#[inline]
pub fn i64_at(buf: &[u8], off: usize) -> Option<i64> {
    let b = buf.get(off..off + 8)?;
    Some(i64::from_le_bytes(b.try_into().ok()?))
}

#[inline]
pub fn u64_at(buf: &[u8], off: usize) -> Option<u64> {
    let b = buf.get(off..off + 8)?;
    Some(u64::from_le_bytes(b.try_into().ok()?))
}

#[inline]
pub fn u32_at(buf: &[u8], off: usize) -> Option<u32> {
    let b = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes(b.try_into().ok()?))
}

#[cfg(unix)]
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let dir = path.parent().unwrap_or(Path::new("."));
    let f = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(dir)?;
    f.sync_all()
}
#[cfg(not(unix))]
pub fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
