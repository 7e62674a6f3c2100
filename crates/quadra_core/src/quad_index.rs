//! Quad index: (subject, predicate, object, graph) rows under six physical
//! column orders, so every set of bound positions is a prefix of one order.
//!
//! Readers hold an `Arc<Phase>` snapshot. The write phase is copied on first
//! modification (`Arc::make_mut`) and published on commit. That first copy
//! clones all six ordered sets while a reader still holds the old phase.

use crate::config::StoreConfig;
use crate::consts::{NodeId, SegmentKind, NONE};
use crate::errors::{QuadError, Result};
use crate::filter::Bloom;
use crate::manifest::{PhaseLog, PhaseRec};
use crate::segment::{SealedSegment, SegmentReader, SegmentWriter};
use crate::txn::{Participant, Vote};
use crate::utils::i64_at;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const INDEX_MANIFEST: &str = "index.manifest.json";
const QUADS_KEY: &[u8] = b"quads";
const ROW_BYTES: usize = 32;

/// Logical positions.
pub const SUBJECT: usize = 0;
pub const PREDICATE: usize = 1;
pub const OBJECT: usize = 2;
pub const GRAPH: usize = 3;

pub type Quad = [NodeId; 4];

const ORDERS: [[usize; 4]; 6] = [
    [0, 1, 2, 3], // SPOG
    [1, 2, 0, 3], // POSG
    [2, 0, 1, 3], // OSPG
    [3, 0, 1, 2], // GSPO
    [3, 1, 2, 0], // GPOS
    [3, 2, 0, 1], // GOSP
];
const ORDER_NAMES: [&str; 6] = ["SPOG", "POSG", "OSPG", "GSPO", "GPOS", "GOSP"];

/// A physical column order: column `k` stores logical position `columns()[k]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnOrder(u8);

impl ColumnOrder {
    pub const SPOG: ColumnOrder = ColumnOrder(0);

    pub fn all() -> impl Iterator<Item = ColumnOrder> {
        (0..ORDERS.len() as u8).map(ColumnOrder)
    }

    pub fn columns(self) -> [usize; 4] {
        ORDERS[self.0 as usize]
    }

    pub fn name(self) -> &'static str {
        ORDER_NAMES[self.0 as usize]
    }

    /// The order whose leading columns are exactly the bound positions.
    pub fn for_bound(bound: [bool; 4]) -> ColumnOrder {
        let n = bound.iter().filter(|b| **b).count();
        Self::all()
            .find(|o| o.columns()[..n].iter().all(|&pos| bound[pos]))
            .unwrap_or(ColumnOrder::SPOG)
    }

    /// Logical position -> physical column.
    pub fn column_of(self, position: usize) -> usize {
        self.columns().iter().position(|&p| p == position).unwrap_or(position)
    }

    /// Logical quad -> physical row.
    pub fn to_row(self, q: &Quad) -> Quad {
        let c = self.columns();
        [q[c[0]], q[c[1]], q[c[2]], q[c[3]]]
    }

    /// Physical row -> logical quad.
    pub fn to_quad(self, row: &Quad) -> Quad {
        let mut q = [NONE; 4];
        for (k, &pos) in self.columns().iter().enumerate() {
            q[pos] = row[k];
        }
        q
    }
}

impl fmt::Display for ColumnOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One immutable-once-shared version of the index.
#[derive(Debug, Clone, Default)]
pub struct Phase {
    orders: [BTreeSet<Quad>; 6],
}

impl Phase {
    fn set(&self, order: ColumnOrder) -> &BTreeSet<Quad> {
        &self.orders[order.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.orders[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders[0].is_empty()
    }

    pub fn contains(&self, q: &Quad) -> bool {
        self.orders[0].contains(q)
    }

    fn insert(&mut self, q: &Quad) -> bool {
        if !self.orders[0].insert(*q) {
            return false;
        }
        for o in ColumnOrder::all().skip(1) {
            self.orders[o.0 as usize].insert(o.to_row(q));
        }
        true
    }

    fn remove(&mut self, q: &Quad) -> bool {
        if !self.orders[0].remove(q) {
            return false;
        }
        for o in ColumnOrder::all().skip(1) {
            self.orders[o.0 as usize].remove(&o.to_row(q));
        }
        true
    }

    /// First physical row `> after` (or `>= from`) in `order`.
    fn next_row(&self, order: ColumnOrder, from: &Quad, after: bool) -> Option<&Quad> {
        let lower = if after { Bound::Excluded(*from) } else { Bound::Included(*from) };
        self.set(order).range((lower, Bound::Unbounded)).next()
    }
}

/// Positioned scan over one physical order of a phase snapshot. Cloning
/// copies the position and shares the snapshot.
#[derive(Debug, Clone)]
pub struct IndexCursor {
    phase: Arc<Phase>,
    order: ColumnOrder,
    prefix: Vec<NodeId>,
    current: Option<Quad>,
    started: bool,
    exhausted: bool,
}

impl IndexCursor {
    pub fn new(phase: Arc<Phase>, order: ColumnOrder) -> Self {
        Self { phase, order, prefix: Vec::new(), current: None, started: false, exhausted: false }
    }

    pub fn order(&self) -> ColumnOrder {
        self.order
    }

    /// Positions before the first row starting with `prefix` (physical columns).
    pub fn seek(&mut self, prefix: &[NodeId]) {
        self.prefix = prefix.iter().copied().take(4).collect();
        self.current = None;
        self.started = false;
        self.exhausted = false;
    }

    /// Positions on an empty range.
    pub fn seek_empty(&mut self) {
        self.seek(&[]);
        self.exhausted = true;
    }

    pub fn next(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        let found = match (&self.current, self.started) {
            (Some(cur), _) => self.phase.next_row(self.order, cur, true).copied(),
            (None, false) => {
                let mut from = [NodeId::MIN; 4];
                from[..self.prefix.len()].copy_from_slice(&self.prefix);
                self.phase.next_row(self.order, &from, false).copied()
            }
            (None, true) => None,
        };
        self.started = true;
        match found {
            Some(row) if row[..self.prefix.len()] == self.prefix[..] => {
                self.current = Some(row);
                true
            }
            _ => {
                self.current = None;
                self.exhausted = true;
                false
            }
        }
    }

    /// Current physical row.
    pub fn row(&self) -> Option<&Quad> {
        self.current.as_ref()
    }

    pub fn phase(&self) -> &Arc<Phase> {
        &self.phase
    }
}

/// Iterator over the logical quads matching a pattern.
pub struct QuadMatches {
    cursor: IndexCursor,
}

impl Iterator for QuadMatches {
    type Item = Quad;

    fn next(&mut self) -> Option<Quad> {
        if self.cursor.next() {
            self.cursor.row().map(|r| self.cursor.order.to_quad(r))
        } else {
            None
        }
    }
}

/// Matches for `pattern` (`NONE` = wildcard) in a snapshot.
pub fn find_in(phase: Arc<Phase>, pattern: &Quad) -> QuadMatches {
    let bound = pattern.map(|n| n != NONE);
    let order = ColumnOrder::for_bound(bound);
    let prefix: Vec<NodeId> = order.columns().iter().map(|&p| pattern[p]).take_while(|&n| n != NONE).collect();
    let mut cursor = IndexCursor::new(phase, order);
    cursor.seek(&prefix);
    QuadMatches { cursor }
}

struct PreparedQuads {
    sealed: SealedSegment,
    rec: PhaseRec,
}

pub struct QuadIndex {
    dir: PathBuf,
    cfg: StoreConfig,
    log: PhaseLog,
    phase: u64,
    committed: Arc<Phase>,
    working: Arc<Phase>,
    dirty: bool,
    prepared: Option<PreparedQuads>,
}

impl QuadIndex {
    pub fn open(dir: impl AsRef<Path>, cfg: &StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let log = PhaseLog::open(&dir, INDEX_MANIFEST, cfg.retained_phases)?;
        let latest = log.manifest().latest().map(|p| p.phase).unwrap_or(0);
        let mut index = Self {
            dir,
            cfg: cfg.clone(),
            log,
            phase: 0,
            committed: Arc::new(Phase::default()),
            working: Arc::new(Phase::default()),
            dirty: false,
            prepared: None,
        };
        index.load_phase(latest)?;
        Ok(index)
    }

    fn load_phase(&mut self, phase: u64) -> Result<()> {
        let mut snapshot = Phase::default();
        match self.log.manifest().get(phase) {
            Some(rec) => {
                let reader = SegmentReader::open_kind(self.log.segment_path(rec), SegmentKind::Quads)?;
                let packed = reader.get(QUADS_KEY)?.ok_or(QuadError::Corrupt)?;
                if packed.len() % ROW_BYTES != 0 {
                    return Err(QuadError::Corrupt);
                }
                for row in packed.chunks_exact(ROW_BYTES) {
                    let mut q = [NONE; 4];
                    for (k, slot) in q.iter_mut().enumerate() {
                        *slot = i64_at(row, k * 8).ok_or(QuadError::Corrupt)?;
                    }
                    snapshot.insert(&q);
                }
            }
            None if phase == 0 => {}
            None => return Err(QuadError::txn(format!("quad index does not retain phase {phase}"))),
        }
        debug!(phase, quads = snapshot.len(), "quad index loaded");
        self.committed = Arc::new(snapshot);
        self.working = Arc::clone(&self.committed);
        self.dirty = false;
        self.prepared = None;
        self.phase = phase;
        Ok(())
    }

    /// Last committed snapshot.
    pub fn committed(&self) -> Arc<Phase> {
        Arc::clone(&self.committed)
    }

    /// Snapshot including the open write phase's changes.
    pub fn working(&self) -> Arc<Phase> {
        Arc::clone(&self.working)
    }

    pub fn len(&self) -> usize {
        self.working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }

    pub fn contains(&self, q: &Quad) -> bool {
        self.working.contains(q)
    }

    pub fn add(&mut self, q: Quad) -> Result<bool> {
        if let Some(bad) = q.iter().find(|&&n| n <= NONE) {
            return Err(QuadError::InvalidConstraint(format!("cannot store node id {bad}")));
        }
        if self.working.contains(&q) {
            return Ok(false);
        }
        Arc::make_mut(&mut self.working).insert(&q);
        self.dirty = true;
        Ok(true)
    }

    /// Removes every quad matching `pattern` (`NONE` = wildcard).
    pub fn remove(&mut self, pattern: &Quad) -> usize {
        let hits: Vec<Quad> = find_in(self.working(), pattern).collect();
        if hits.is_empty() {
            return 0;
        }
        let w = Arc::make_mut(&mut self.working);
        for q in &hits {
            w.remove(q);
        }
        self.dirty = true;
        hits.len()
    }

    pub fn find(&self, pattern: &Quad) -> QuadMatches {
        find_in(self.working(), pattern)
    }

    /// Writes the whole working set; commit cost is linear in the store size.
    fn write_segment(&self, phase: u64) -> Result<PreparedQuads> {
        let name = format!("quads-{phase:08}.qseg");
        let mut packed = Vec::with_capacity(self.working.len() * ROW_BYTES);
        for q in self.working.set(ColumnOrder::SPOG) {
            for n in q {
                packed.extend_from_slice(&n.to_le_bytes());
            }
        }
        let mut w = SegmentWriter::create(self.dir.join(&name), SegmentKind::Quads, Bloom::new(64, 1))?;
        w.add(QUADS_KEY, &packed)?;
        let sealed = w.seal(self.cfg.sync_writes)?;
        let rec = PhaseRec {
            phase,
            kind: SegmentKind::Quads,
            path: PathBuf::from(name),
            count: self.working.len() as u64,
            next_node: None,
        };
        Ok(PreparedQuads { sealed, rec })
    }
}

impl Participant for QuadIndex {
    fn name(&self) -> &'static str {
        "quad-index"
    }

    fn refresh(&mut self) -> Result<()> {
        if self.dirty {
            debug!("quad index discarding stale write phase");
        }
        self.working = Arc::clone(&self.committed);
        self.dirty = false;
        self.prepared = None;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn current_phase(&self) -> u64 {
        self.phase
    }

    fn last_phase(&self) -> u64 {
        self.log.manifest().high_water()
    }

    fn prepare(&mut self, phase: u64) -> Result<Vote> {
        if !self.dirty && self.log.manifest().latest().is_some() {
            return Ok(Vote::ReadOnly);
        }
        let prepared = self.write_segment(phase)?;
        debug!(phase, quads = prepared.rec.count, "quad index prepared");
        self.prepared = Some(prepared);
        Ok(Vote::Ok)
    }

    fn commit(&mut self, phase: u64) -> Result<()> {
        match self.prepared.take() {
            Some(p) => {
                if p.rec.phase != phase {
                    return Err(QuadError::consistency(format!(
                        "quad index prepared phase {} but was asked to commit {phase}",
                        p.rec.phase
                    )));
                }
                p.sealed.publish(self.cfg.sync_writes)?;
                self.log.record(p.rec)?;
            }
            None if self.dirty => {
                return Err(QuadError::consistency("quad index committing unprepared changes"));
            }
            None => {
                self.log.alias_latest(phase)?;
            }
        }
        self.committed = Arc::clone(&self.working);
        self.dirty = false;
        self.phase = phase;
        info!(phase, quads = self.committed.len(), "quad index committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.prepared = None;
        self.working = Arc::clone(&self.committed);
        self.dirty = false;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.prepared = None;
        Ok(())
    }

    fn recover(&self) -> Vec<u64> {
        self.log.manifest().phase_numbers()
    }

    fn select_phase(&mut self, phase: u64) -> Result<()> {
        self.log.truncate_after(phase)?;
        self.load_phase(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg() -> StoreConfig {
        StoreConfig { sync_writes: false, ..StoreConfig::default() }
    }

    #[test]
    fn every_bound_set_has_a_prefix_order() {
        for mask in 0u8..16 {
            let bound = [mask & 1 != 0, mask & 2 != 0, mask & 4 != 0, mask & 8 != 0];
            let n = bound.iter().filter(|b| **b).count();
            let order = ColumnOrder::for_bound(bound);
            let lead: Vec<usize> = order.columns()[..n].to_vec();
            assert!(lead.iter().all(|&p| bound[p]), "{mask:04b} -> {order}");
        }
        assert_eq!(ColumnOrder::for_bound([false, true, true, false]).name(), "POSG");
        assert_eq!(ColumnOrder::for_bound([false, true, false, true]).name(), "GPOS");
    }

    #[test]
    fn row_permutation_round_trips() {
        let q = [1, 2, 3, 4];
        for o in ColumnOrder::all() {
            assert_eq!(o.to_quad(&o.to_row(&q)), q);
            for pos in 0..4 {
                assert_eq!(o.to_row(&q)[o.column_of(pos)], q[pos]);
            }
        }
    }

    #[test]
    fn pattern_matching() {
        let tmp = tempdir().unwrap();
        let mut idx = QuadIndex::open(tmp.path(), &cfg()).unwrap();
        for q in [[1, 2, 3, 9], [1, 2, 4, 9], [5, 2, 3, 9], [5, 6, 3, 8]] {
            assert!(idx.add(q).unwrap());
        }
        assert!(!idx.add([1, 2, 3, 9]).unwrap());
        assert!(idx.add([0, 2, 3, 9]).is_err());

        let objs: Vec<NodeId> = idx.find(&[1, 2, NONE, 9]).map(|q| q[OBJECT]).collect();
        assert_eq!(objs, vec![3, 4]);
        let subs: Vec<NodeId> = idx.find(&[NONE, NONE, 3, NONE]).map(|q| q[SUBJECT]).collect();
        assert_eq!(subs, vec![1, 5, 5]);
        assert_eq!(idx.find(&[NONE; 4]).count(), 4);
        assert_eq!(idx.find(&[7, NONE, NONE, NONE]).count(), 0);

        assert_eq!(idx.remove(&[5, NONE, NONE, NONE]), 2);
        assert_eq!(idx.len(), 2);
        assert!(!idx.contains(&[5, 2, 3, 9]));
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let tmp = tempdir().unwrap();
        let mut idx = QuadIndex::open(tmp.path(), &cfg()).unwrap();
        idx.add([1, 1, 1, 1]).unwrap();
        let before = idx.working();
        let mut cursor = IndexCursor::new(before, ColumnOrder::SPOG);
        idx.add([2, 2, 2, 2]).unwrap();
        cursor.seek(&[]);
        let mut n = 0;
        while cursor.next() {
            n += 1;
        }
        assert_eq!(n, 1);
        assert!(!cursor.next());
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn commit_persists_and_rollback_discards() {
        let tmp = tempdir().unwrap();
        {
            let mut idx = QuadIndex::open(tmp.path(), &cfg()).unwrap();
            idx.add([1, 2, 3, 4]).unwrap();
            assert_eq!(idx.prepare(1).unwrap(), Vote::Ok);
            idx.commit(1).unwrap();
            idx.add([5, 6, 7, 8]).unwrap();
            idx.rollback().unwrap();
            assert_eq!(idx.len(), 1);
            assert_eq!(idx.prepare(2).unwrap(), Vote::ReadOnly);
        }
        let idx = QuadIndex::open(tmp.path(), &cfg()).unwrap();
        assert_eq!(idx.current_phase(), 1);
        assert!(idx.contains(&[1, 2, 3, 4]));
        assert_eq!(idx.len(), 1);
    }
}
