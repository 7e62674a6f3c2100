//! Sorted tuple materializer.
//!
//! Rows from any [`Tuples`] source are sorted with a registered
//! [`RowComparator`] (external merge sort through run files once the buffer
//! fills) and written to a `Sorted` segment, one record per row in order.
//! The segment records the comparator by id so a relation can be reopened
//! cold against a [`ComparatorRegistry`].
//!
//! Variables repeated in the source are stored once. The backing segment is
//! shared by clones of a relation and released when the last one closes.

use crate::config::StoreConfig;
use crate::consts::{NodeId, SegmentKind};
use crate::errors::{QuadError, Result};
use crate::filter::Bloom;
use crate::segment::{SegmentReader, SegmentWriter};
use crate::tuples::{Cardinality, Tuples, Variable};
use crate::utils::{i64_at, read_i64, write_i64};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

const META_KEY: &[u8] = b"meta";

/// Raw id order.
pub const ID_ORDER: u32 = 0;
/// Node value order, registered by the store.
pub const VALUE_ORDER: u32 = 1;

/// Column-wise order over rows of equal length (full rows or prefixes).
pub trait RowComparator: Send + Sync {
    fn compare(&self, a: &[NodeId], b: &[NodeId]) -> Ordering;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdOrder;

impl RowComparator for IdOrder {
    fn compare(&self, a: &[NodeId], b: &[NodeId]) -> Ordering {
        a.cmp(b)
    }
}

/// Stable ids -> comparators, filled at start-up.
pub struct ComparatorRegistry {
    inner: RwLock<HashMap<u32, Arc<dyn RowComparator>>>,
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComparatorRegistry {
    pub fn new() -> Self {
        let mut m: HashMap<u32, Arc<dyn RowComparator>> = HashMap::new();
        m.insert(ID_ORDER, Arc::new(IdOrder));
        Self { inner: RwLock::new(m) }
    }

    /// Returns the comparator previously registered under `id`, if any.
    pub fn register(&self, id: u32, cmp: Arc<dyn RowComparator>) -> Option<Arc<dyn RowComparator>> {
        self.inner.write().insert(id, cmp)
    }

    pub fn get(&self, id: u32) -> Result<Arc<dyn RowComparator>> {
        self.inner.read().get(&id).cloned().ok_or(QuadError::UnknownComparator(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.read().contains_key(&id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SortedMeta {
    comparator: u32,
    duplicates: bool,
    width: usize,
    columns: Vec<String>,
    lookup: Vec<usize>,
}

fn decode_row(bytes: &[u8], width: usize, out: &mut Vec<NodeId>) -> Result<()> {
    if bytes.len() != width * 8 {
        return Err(QuadError::Corrupt);
    }
    out.clear();
    for k in 0..width {
        out.push(i64_at(bytes, k * 8).ok_or(QuadError::Corrupt)?);
    }
    Ok(())
}

/// The shared segment behind a relation and its clones.
struct Backing {
    path: PathBuf,
    reader: SegmentReader,
    width: usize,
    rows: usize,
    comparator_id: u32,
    comparator: Arc<dyn RowComparator>,
    open: AtomicUsize,
    temporary: AtomicBool,
}

impl Backing {
    fn open(path: &Path, registry: &ComparatorRegistry, temporary: bool) -> Result<(Self, SortedMeta)> {
        let reader = SegmentReader::open_kind(path, SegmentKind::Sorted)?;
        let meta: SortedMeta = serde_json::from_slice(reader.get(META_KEY)?.ok_or(QuadError::Corrupt)?)?;
        if meta.lookup.len() != meta.columns.len() || meta.lookup.iter().any(|&u| u >= meta.width) {
            return Err(QuadError::Corrupt);
        }
        let comparator = registry.get(meta.comparator)?;
        let backing = Backing {
            path: path.to_path_buf(),
            rows: reader.order_len(),
            reader,
            width: meta.width,
            comparator_id: meta.comparator,
            comparator,
            open: AtomicUsize::new(1),
            temporary: AtomicBool::new(temporary),
        };
        Ok((backing, meta))
    }

    fn row(&self, i: usize, out: &mut Vec<NodeId>) -> Result<()> {
        decode_row(self.reader.order_record(i)?, self.width, out)
    }

    fn acquire(&self) {
        self.open.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn release(&self) -> Result<()> {
        let prev = self.open.fetch_sub(1, AtomicOrdering::SeqCst);
        if prev == 0 {
            self.open.store(0, AtomicOrdering::SeqCst);
            return Err(QuadError::consistency(format!("{} released more often than acquired", self.path.display())));
        }
        if prev == 1 && self.temporary.load(AtomicOrdering::SeqCst) {
            debug!(path = %self.path.display(), "removing sorted relation");
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// A materialized, ordered relation.
pub struct SortedRelation {
    backing: Option<Arc<Backing>>,
    variables: Vec<Variable>,
    lookup: Vec<usize>,
    prefix: Vec<NodeId>,
    row: Vec<NodeId>,
    on_row: bool,
    next_pos: usize,
    exhausted: bool,
}

impl SortedRelation {
    fn from_backing(backing: Backing, meta: SortedMeta) -> Self {
        Self {
            backing: Some(Arc::new(backing)),
            variables: meta.columns.into_iter().map(Variable::new).collect(),
            lookup: meta.lookup,
            prefix: Vec::new(),
            row: Vec::new(),
            on_row: false,
            next_pos: 0,
            exhausted: true,
        }
    }

    /// Reopens a kept relation, attaching its comparator from `registry`.
    pub fn open(path: impl AsRef<Path>, registry: &ComparatorRegistry) -> Result<Self> {
        let (backing, meta) = Backing::open(path.as_ref(), registry, false)?;
        Ok(Self::from_backing(backing, meta))
    }

    fn backing(&self) -> Result<&Arc<Backing>> {
        self.backing.as_ref().ok_or(QuadError::AlreadyClosed)
    }

    pub fn path(&self) -> Result<&Path> {
        Ok(&self.backing()?.path)
    }

    pub fn comparator_id(&self) -> Result<u32> {
        Ok(self.backing()?.comparator_id)
    }

    /// Physical columns after removing repeated variables.
    pub fn unique_width(&self) -> Result<usize> {
        Ok(self.backing()?.width)
    }

    /// Open handles on the backing segment.
    pub fn open_handles(&self) -> usize {
        self.backing.as_ref().map_or(0, |b| b.open.load(AtomicOrdering::SeqCst))
    }

    /// Keeps the segment on disk after the last handle closes.
    pub fn keep(&self) -> Result<PathBuf> {
        let b = self.backing()?;
        b.temporary.store(false, AtomicOrdering::SeqCst);
        Ok(b.path.clone())
    }
}

impl Clone for SortedRelation {
    fn clone(&self) -> Self {
        if let Some(b) = &self.backing {
            b.acquire();
        }
        Self {
            backing: self.backing.clone(),
            variables: self.variables.clone(),
            lookup: self.lookup.clone(),
            prefix: self.prefix.clone(),
            row: self.row.clone(),
            on_row: self.on_row,
            next_pos: self.next_pos,
            exhausted: self.exhausted,
        }
    }
}

impl Drop for SortedRelation {
    fn drop(&mut self) {
        if let Some(b) = self.backing.take() {
            if let Err(e) = b.release() {
                warn!(error = %e, "releasing sorted relation on drop");
            }
        }
    }
}

impl Tuples for SortedRelation {
    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// `prefix` binds the leading unique columns.
    fn before_first_prefix(&mut self, prefix: &[NodeId], suffix_truncation: usize) -> Result<()> {
        let b = Arc::clone(self.backing()?);
        if suffix_truncation != 0 {
            error!(suffix_truncation, "suffix truncation requested on a sorted relation");
            return Err(QuadError::SuffixTruncation);
        }
        if prefix.len() > b.width {
            return Err(QuadError::Prefix(format!("{} prefix values for {} columns", prefix.len(), b.width)));
        }
        let n = prefix.len();
        let (mut lo, mut hi) = (0usize, b.rows);
        let mut row = Vec::with_capacity(b.width);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            b.row(mid, &mut row)?;
            if b.comparator.compare(&row[..n], prefix) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.prefix = prefix.to_vec();
        self.next_pos = lo;
        self.on_row = false;
        self.exhausted = false;
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        let b = Arc::clone(self.backing()?);
        if self.exhausted || self.next_pos >= b.rows {
            self.exhausted = true;
            self.on_row = false;
            return Ok(false);
        }
        b.row(self.next_pos, &mut self.row)?;
        if self.row[..self.prefix.len()] != self.prefix[..] {
            self.exhausted = true;
            self.on_row = false;
            return Ok(false);
        }
        self.next_pos += 1;
        self.on_row = true;
        Ok(true)
    }

    fn column_value(&self, column: usize) -> Result<NodeId> {
        if !self.on_row {
            return Err(QuadError::Prefix("cursor is not on a row".into()));
        }
        let u = *self.lookup.get(column).ok_or_else(|| QuadError::Prefix(format!("no column {column}")))?;
        Ok(self.row[u])
    }

    fn row_count(&mut self) -> Result<u64> {
        Ok(self.backing()?.rows as u64)
    }

    fn cardinality(&mut self) -> Result<Cardinality> {
        Ok(Cardinality::from_count(self.backing()?.rows as u64))
    }

    fn close(&mut self) -> Result<()> {
        match self.backing.take() {
            Some(b) => b.release(),
            None => {
                error!("sorted relation closed twice");
                Err(QuadError::AlreadyClosed)
            }
        }
    }
}

/// One spilled run: packed rows in sorted order.
struct Run {
    reader: BufReader<File>,
    remaining: u64,
    head: Option<Vec<NodeId>>,
    _file: NamedTempFile,
}

impl Run {
    fn advance(&mut self, width: usize) -> Result<()> {
        if self.remaining == 0 {
            self.head = None;
            return Ok(());
        }
        let mut row = Vec::with_capacity(width);
        for _ in 0..width {
            row.push(read_i64(&mut self.reader)?);
        }
        self.remaining -= 1;
        self.head = Some(row);
        Ok(())
    }
}

/// Builds sorted relations in a scratch directory.
pub struct Materializer {
    dir: PathBuf,
    buffer_rows: usize,
    sync: bool,
    registry: Arc<ComparatorRegistry>,
    seq: AtomicU64,
}

impl Materializer {
    pub fn new(dir: impl AsRef<Path>, cfg: &StoreConfig, registry: Arc<ComparatorRegistry>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, buffer_rows: cfg.sort_buffer_rows.max(1), sync: cfg.sync_writes, registry, seq: AtomicU64::new(0) })
    }

    pub fn registry(&self) -> &Arc<ComparatorRegistry> {
        &self.registry
    }

    /// Sorts every row of `source` (from `before_first`) under `comparator`.
    /// Equal rows collapse unless `duplicates` is set.
    pub fn materialize(&self, source: &mut dyn Tuples, comparator: u32, duplicates: bool) -> Result<SortedRelation> {
        let cmp = self.registry.get(comparator)?;
        let columns: Vec<Variable> = source.variables().to_vec();
        let mut unique: Vec<usize> = Vec::new();
        let mut lookup = Vec::with_capacity(columns.len());
        for (i, v) in columns.iter().enumerate() {
            match unique.iter().position(|&u| columns[u] == *v) {
                Some(k) => lookup.push(k),
                None => {
                    lookup.push(unique.len());
                    unique.push(i);
                }
            }
        }
        let width = unique.len();

        let mut buffer: Vec<Vec<NodeId>> = Vec::new();
        let mut runs: Vec<Run> = Vec::new();
        source.before_first()?;
        while source.next()? {
            let row = unique.iter().map(|&c| source.column_value(c)).collect::<Result<Vec<_>>>()?;
            buffer.push(row);
            if buffer.len() >= self.buffer_rows {
                runs.push(self.spill(&mut buffer, cmp.as_ref(), width)?);
            }
        }

        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let path = self.dir.join(format!("sorted-{}-{seq:06}.qsrt", std::process::id()));
        let mut w = SegmentWriter::create(&path, SegmentKind::Sorted, Bloom::new(64, 1))?;
        let mut last: Option<Vec<NodeId>> = None;
        let mut written = 0u64;
        let mut emit = |row: Vec<NodeId>, w: &mut SegmentWriter| -> Result<()> {
            if !duplicates {
                if let Some(prev) = &last {
                    if cmp.compare(prev, &row) == Ordering::Equal {
                        return Ok(());
                    }
                }
            }
            let mut bytes = Vec::with_capacity(width * 8);
            for n in &row {
                bytes.extend_from_slice(&n.to_le_bytes());
            }
            let rec = w.append(&bytes)?;
            w.order(rec, &[]);
            written += 1;
            last = Some(row);
            Ok(())
        };

        if runs.is_empty() {
            buffer.sort_by(|a, b| cmp.compare(a, b));
            for row in buffer.drain(..) {
                emit(row, &mut w)?;
            }
        } else {
            if !buffer.is_empty() {
                runs.push(self.spill(&mut buffer, cmp.as_ref(), width)?);
            }
            debug!(runs = runs.len(), "merging sorted runs");
            for run in runs.iter_mut() {
                run.advance(width)?;
            }
            loop {
                let mut best: Option<usize> = None;
                for (i, run) in runs.iter().enumerate() {
                    let Some(head) = &run.head else { continue };
                    best = match best {
                        Some(b) => match &runs[b].head {
                            Some(bh) if cmp.compare(head, bh) == Ordering::Less => Some(i),
                            _ => Some(b),
                        },
                        None => Some(i),
                    };
                }
                let Some(i) = best else { break };
                let row = runs[i].head.take().ok_or_else(|| QuadError::consistency("empty run head"))?;
                runs[i].advance(width)?;
                emit(row, &mut w)?;
            }
        }

        let meta = SortedMeta {
            comparator,
            duplicates,
            width,
            columns: columns.iter().map(|v| v.name().to_string()).collect(),
            lookup,
        };
        w.add(META_KEY, &serde_json::to_vec(&meta)?)?;
        let path = w.finalize(self.sync)?;
        debug!(path = %path.display(), rows = written, width, comparator, "relation materialized");

        let (backing, meta) = Backing::open(&path, &self.registry, true)?;
        Ok(SortedRelation::from_backing(backing, meta))
    }

    fn spill(&self, buffer: &mut Vec<Vec<NodeId>>, cmp: &dyn RowComparator, width: usize) -> Result<Run> {
        buffer.sort_by(|a, b| cmp.compare(a, b));
        let mut file = tempfile::Builder::new().prefix("qdr_run_").tempfile_in(&self.dir)?;
        {
            let mut out = BufWriter::new(file.as_file_mut());
            for row in buffer.iter() {
                for &n in row {
                    write_i64(&mut out, n)?;
                }
            }
            out.flush()?;
        }
        let remaining = buffer.len() as u64;
        buffer.clear();
        debug!(rows = remaining, width, "spilled sort run");
        Ok(Run { reader: BufReader::new(file.reopen()?), remaining, head: None, _file: file })
    }
}
