//! Segment file format & IO (hash index + order table + Bloom filter)
//!
//! Header (LE, 48 bytes):
//!   magic[4]   = "QDRS"
//!   version[2] = 1
//!   kind[2]    = SegmentKind (1=dict,2=quads,3=sorted)
//!   rsv[4]     = 0
//!   idx_off[8] = hash index block offset
//!   flt_off[8] = filter block offset
//!   ord_off[8] = order table offset
//!   foot_off[8]= end of the last block
//!
//! Hash index:
//!   u64 cap (power-of-two)
//!   repeat cap * { u64 h, u64 fp, u64 off, u32 size, u32 pad }
//!
//! Filter block (Bloom):
//!   [u32 k][u32 blen][bytes]
//!
//! Order table (records in caller order, with an inline key head):
//!   u64 count
//!   repeat count * { u64 off, u32 size, u32 key_len, head[24] }
//!
//! Record: [value bytes][crc32(value)]
//!
//! Writers go through a `NamedTempFile` in the target directory. `seal` makes
//! the file durable without publishing it; `publish` renames it into place.

use crate::consts::{SegmentKind, HDR_SIZE, IDX_ENTRY_SIZE, MAGIC_SEG, ORDER_ENTRY_SIZE, ORDER_HEAD, VERSION};
use crate::errors::{QuadError, Result};
use crate::filter::Bloom;
use crate::utils::{crc32, fsync_dir, u32_at, u64_at, write_u32, write_u64};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[inline]
fn h64(key: &[u8]) -> u64 {
    // 0 marks an empty slot
    xxhash_rust::xxh3::xxh3_64(key).max(1)
}

#[inline]
fn fp64(key: &[u8]) -> u64 {
    let b = blake3::hash(key);
    let mut out = [0u8; 8];
    out.copy_from_slice(&b.as_bytes()[0..8]);
    u64::from_le_bytes(out)
}

/// Location of a record written by a [`SegmentWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    off: u64,
    size: u32,
}

/// Writer: append-only; writes index, filter and order blocks, then publishes atomically.
pub struct SegmentWriter {
    path_final: PathBuf,
    tmp: NamedTempFile,
    kind: SegmentKind,
    // (hash, fp, off, size)
    items: Vec<(u64, u64, u64, u32)>,
    order: Vec<(RecordRef, [u8; ORDER_HEAD], u32)>,
    bloom: Bloom,
}

impl SegmentWriter {
    /// New segment (not yet published).
    pub fn create(path: impl AsRef<Path>, kind: SegmentKind, bloom: Bloom) -> Result<Self> {
        let path_final = path.as_ref().to_path_buf();
        let dir = path_final.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::Builder::new().prefix("qdr_seg_").tempfile_in(dir)?;
        tmp.as_file_mut().write_all(&[0u8; HDR_SIZE])?;
        Ok(Self { path_final, tmp, kind, items: Vec::new(), order: Vec::new(), bloom })
    }

    /// Writes `[value][crc]` without indexing it.
    pub fn append(&mut self, value: &[u8]) -> Result<RecordRef> {
        let f = self.tmp.as_file_mut();
        let off = f.seek(SeekFrom::End(0))?;
        f.write_all(value)?;
        write_u32(f, crc32(value))?;
        let size = (f.seek(SeekFrom::End(0))? - off) as u32;
        Ok(RecordRef { off, size })
    }

    /// Makes `rec` reachable through `key`.
    pub fn index(&mut self, key: &[u8], rec: RecordRef) {
        self.items.push((h64(key), fp64(key), rec.off, rec.size));
        self.bloom.add(key);
    }

    /// Appends `rec` to the order table. Only the first bytes of `key` are
    /// kept inline; its full length is recorded.
    pub fn order(&mut self, rec: RecordRef, key: &[u8]) {
        let n = key.len().min(ORDER_HEAD);
        let mut buf = [0u8; ORDER_HEAD];
        buf[..n].copy_from_slice(&key[..n]);
        self.order.push((rec, buf, key.len() as u32));
    }

    /// Adds `key` to the filter without indexing anything under it.
    pub fn filter(&mut self, key: &[u8]) {
        self.bloom.add(key);
    }

    /// (key,value) record, reachable by key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<RecordRef> {
        let rec = self.append(value)?;
        self.index(key, rec);
        Ok(rec)
    }

    fn build_hashtable(&self) -> Vec<u8> {
        let n = self.items.len() as u64;
        let mut cap = 1u64;
        while cap < (n * 5) / 4 + 1 {
            cap <<= 1
        } // ~0.8 LF
        let mut table: Vec<(u64, u64, u64, u32)> = vec![(0, 0, 0, 0); cap as usize];
        for (h, fp, off, size) in &self.items {
            let mut idx = h & (cap - 1);
            loop {
                if table[idx as usize].0 == 0 {
                    table[idx as usize] = (*h, *fp, *off, *size);
                    break;
                }
                idx = (idx + 1) & (cap - 1);
            }
        }
        let mut buf = Vec::with_capacity(8 + (cap as usize) * IDX_ENTRY_SIZE);
        buf.extend_from_slice(&cap.to_le_bytes());
        for (h, fp, off, size) in table {
            buf.extend_from_slice(&h.to_le_bytes());
            buf.extend_from_slice(&fp.to_le_bytes());
            buf.extend_from_slice(&off.to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes());
        }
        buf
    }

    /// Writes index, filter, order table and header. The file stays unpublished.
    pub fn seal(mut self, sync: bool) -> Result<SealedSegment> {
        let idx_bytes = self.build_hashtable();
        let f = self.tmp.as_file_mut();

        let index_off = f.seek(SeekFrom::End(0))?;
        f.write_all(&idx_bytes)?;

        let filter_off = f.seek(SeekFrom::End(0))?;
        write_u32(f, self.bloom.k)?;
        write_u32(f, self.bloom.bits.len() as u32)?;
        f.write_all(&self.bloom.bits)?;

        let order_off = f.seek(SeekFrom::End(0))?;
        write_u64(f, self.order.len() as u64)?;
        for (rec, head, key_len) in &self.order {
            write_u64(f, rec.off)?;
            write_u32(f, rec.size)?;
            write_u32(f, *key_len)?;
            f.write_all(head)?;
        }

        let footer_off = f.seek(SeekFrom::End(0))?;

        f.seek(SeekFrom::Start(0))?;
        let mut hdr = Vec::with_capacity(HDR_SIZE);
        hdr.extend_from_slice(MAGIC_SEG);
        hdr.extend_from_slice(&VERSION.to_le_bytes());
        hdr.extend_from_slice(&(self.kind as u16).to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes());
        hdr.extend_from_slice(&index_off.to_le_bytes());
        hdr.extend_from_slice(&filter_off.to_le_bytes());
        hdr.extend_from_slice(&order_off.to_le_bytes());
        hdr.extend_from_slice(&footer_off.to_le_bytes());
        hdr.resize(HDR_SIZE, 0);
        f.write_all(&hdr)?;
        if sync {
            f.sync_all()?;
        }
        Ok(SealedSegment { path_final: self.path_final, tmp: self.tmp })
    }

    /// seal + publish
    pub fn finalize(self, sync: bool) -> Result<PathBuf> {
        self.seal(sync)?.publish(sync)
    }
}

/// A fully written segment that has not been renamed into place yet.
/// Dropping it removes the temporary file.
pub struct SealedSegment {
    path_final: PathBuf,
    tmp: NamedTempFile,
}

impl SealedSegment {
    pub fn target(&self) -> &Path {
        &self.path_final
    }

    pub fn publish(self, sync: bool) -> Result<PathBuf> {
        self.tmp.persist(&self.path_final)?;
        if sync {
            if let Err(e) = fsync_dir(&self.path_final) {
                tracing::warn!(path = %self.path_final.display(), error = %e, "directory fsync failed");
            }
        }
        Ok(self.path_final)
    }
}

/// Reader: memory-maps a published segment.
pub struct SegmentReader {
    _f: File,
    mmap: Mmap,
    pub kind: SegmentKind,
    index_off: u64,
    order_off: u64,
    filter: Bloom,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::open(path)?;
        // SAFETY: segments are immutable once published
        let mmap = unsafe { Mmap::map(&f)? };
        if mmap.len() < HDR_SIZE || &mmap[0..4] != MAGIC_SEG {
            return Err(QuadError::BadHeader);
        }
        let ver = u16::from_le_bytes([mmap[4], mmap[5]]);
        if ver != VERSION {
            return Err(QuadError::BadHeader);
        }
        let kind = SegmentKind::from_u16(u16::from_le_bytes([mmap[6], mmap[7]])).ok_or(QuadError::Unsupported)?;
        let index_off = u64_at(&mmap, 12).ok_or(QuadError::BadHeader)?;
        let filter_off = u64_at(&mmap, 20).ok_or(QuadError::BadHeader)?;
        let order_off = u64_at(&mmap, 28).ok_or(QuadError::BadHeader)?;

        let fo = filter_off as usize;
        let k = u32_at(&mmap, fo).ok_or(QuadError::Corrupt)?;
        let blen = u32_at(&mmap, fo + 4).ok_or(QuadError::Corrupt)? as usize;
        let bits = mmap.get(fo + 8..fo + 8 + blen).ok_or(QuadError::Corrupt)?.to_vec();
        let filter = Bloom::from_bytes(k, bits);

        Ok(Self { _f: f, mmap, kind, index_off, order_off, filter })
    }

    /// Open and check the kind.
    pub fn open_kind(path: impl AsRef<Path>, kind: SegmentKind) -> Result<Self> {
        let r = Self::open(path)?;
        if r.kind != kind {
            return Err(QuadError::Unsupported);
        }
        Ok(r)
    }

    fn record(&self, off: usize, size: usize) -> Result<&[u8]> {
        let end = off.checked_add(size).ok_or(QuadError::Corrupt)?;
        if size < 4 || end > self.index_off as usize {
            return Err(QuadError::Corrupt);
        }
        let val = &self.mmap[off..end - 4];
        let want = u32_at(&self.mmap, end - 4).ok_or(QuadError::Corrupt)?;
        if crc32(val) != want {
            return Err(QuadError::Corrupt);
        }
        Ok(val)
    }

    /// Record for `key`, CRC checked.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        if !self.filter.contains(key) {
            return Ok(None);
        }
        let base = self.index_off as usize;
        let cap = u64_at(&self.mmap, base).ok_or(QuadError::Corrupt)?;
        if cap == 0 {
            return Ok(None);
        }
        let (h, fp) = (h64(key), fp64(key));
        let mut idx = (h & (cap - 1)) as usize;
        for _ in 0..cap {
            let epos = base + 8 + idx * IDX_ENTRY_SIZE;
            let eh = u64_at(&self.mmap, epos).ok_or(QuadError::Corrupt)?;
            if eh == 0 {
                return Ok(None);
            }
            let efp = u64_at(&self.mmap, epos + 8).ok_or(QuadError::Corrupt)?;
            if eh == h && efp == fp {
                let off = u64_at(&self.mmap, epos + 16).ok_or(QuadError::Corrupt)? as usize;
                let size = u32_at(&self.mmap, epos + 24).ok_or(QuadError::Corrupt)? as usize;
                return self.record(off, size).map(Some);
            }
            idx = (idx + 1) & ((cap as usize) - 1);
        }
        Ok(None)
    }

    /// Number of hash index slots.
    pub fn index_capacity(&self) -> u64 {
        u64_at(&self.mmap, self.index_off as usize).unwrap_or(0)
    }

    pub fn order_len(&self) -> usize {
        u64_at(&self.mmap, self.order_off as usize).unwrap_or(0) as usize
    }

    fn order_entry(&self, i: usize) -> Result<usize> {
        if i >= self.order_len() {
            return Err(QuadError::Corrupt);
        }
        Ok(self.order_off as usize + 8 + i * ORDER_ENTRY_SIZE)
    }

    /// Inline key head of the i-th ordered record and the full key length.
    pub fn order_head(&self, i: usize) -> Result<(&[u8], usize)> {
        let e = self.order_entry(i)?;
        let n = u32_at(&self.mmap, e + 12).ok_or(QuadError::Corrupt)? as usize;
        let head = self.mmap.get(e + 16..e + 16 + n.min(ORDER_HEAD)).ok_or(QuadError::Corrupt)?;
        Ok((head, n))
    }

    /// Filter check only; `false` means the key was never added.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.contains(key)
    }

    /// i-th ordered record, CRC checked.
    pub fn order_record(&self, i: usize) -> Result<&[u8]> {
        let e = self.order_entry(i)?;
        let off = u64_at(&self.mmap, e).ok_or(QuadError::Corrupt)? as usize;
        let size = u32_at(&self.mmap, e + 8).ok_or(QuadError::Corrupt)? as usize;
        self.record(off, size)
    }
}
