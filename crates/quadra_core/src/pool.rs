//! Value pool: bijection between node ids and node values.
//!
//! The committed dictionary is a memory-mapped `Dict` segment whose order
//! table lists records in value order. Changes made by the open write phase
//! live in `added` (authoritative, id -> value) with `by_value` derived from it.
//! Allocations made through [`ValuePool::localize_persistent`] are journaled
//! before they are handed out and survive rollback.

use crate::config::StoreConfig;
use crate::consts::{NodeId, SegmentKind, MIN_NODE, NONE, POOL_JOURNAL};
use crate::errors::{QuadError, Result};
use crate::filter::Bloom;
use crate::manifest::{PhaseLog, PhaseRec};
use crate::node::{Limit, NodeValue, RangeValue, TypeCategory};
use crate::ordering::{compare_range, compare_values, order_key, NodeOrdering, ValueComparator};
use crate::segment::{SealedSegment, SegmentReader, SegmentWriter};
use crate::txn::{Participant, Vote};
use crate::utils::{crc32, i64_at, u32_at, write_u32};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const POOL_MANIFEST: &str = "pool.manifest.json";

fn id_key(id: NodeId) -> [u8; 9] {
    let mut k = [0u8; 9];
    k[0] = b'i';
    k[1..].copy_from_slice(&id.to_le_bytes());
    k
}

fn value_key(encoded: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(encoded.len() + 1);
    k.push(b'v');
    k.extend_from_slice(encoded);
    k
}

fn split_record(rec: &[u8]) -> Result<(NodeId, NodeValue)> {
    let id = i64_at(rec, 0).ok_or(QuadError::Corrupt)?;
    Ok((id, NodeValue::decode(&rec[8..])?))
}

/// Pool ordering as a `BTreeMap` key. Stored keys are always nodes; limits
/// only appear as range bounds.
#[derive(Debug, Clone)]
struct OrderedKey(RangeValue);

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_range(&self.0, &other.0)
    }
}

/// One end of a value range.
#[derive(Debug, Clone)]
pub struct RangeBound {
    pub value: RangeValue,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(value: impl Into<RangeValue>) -> Self {
        RangeBound { value: value.into(), inclusive: true }
    }

    pub fn exclusive(value: impl Into<RangeValue>) -> Self {
        RangeBound { value: value.into(), inclusive: false }
    }

    fn to_bound(&self) -> Bound<OrderedKey> {
        let k = OrderedKey(self.value.clone());
        if self.inclusive {
            Bound::Included(k)
        } else {
            Bound::Excluded(k)
        }
    }
}

/// Append-only log of durable allocations: `[u32 len][u32 crc][i64 id][value]`.
struct Journal {
    path: PathBuf,
    sync: bool,
}

impl Journal {
    fn read(&self) -> Result<Vec<(NodeId, NodeValue)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let buf = fs::read(&self.path)?;
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            let (Some(len), Some(crc)) = (u32_at(&buf, pos), u32_at(&buf, pos + 4)) else {
                warn!(path = %self.path.display(), pos, "torn journal header ignored");
                break;
            };
            let start = pos + 8;
            let Some(payload) = buf.get(start..start + len as usize) else {
                warn!(path = %self.path.display(), pos, "torn journal record ignored");
                break;
            };
            if crc32(payload) != crc || payload.len() < 8 {
                warn!(path = %self.path.display(), pos, "journal record failed CRC; replay stops");
                break;
            }
            out.push(split_record(payload)?);
            pos = start + len as usize;
        }
        Ok(out)
    }

    fn encode(id: NodeId, value: &NodeValue, out: &mut Vec<u8>) -> Result<()> {
        let mut payload = id.to_le_bytes().to_vec();
        payload.extend_from_slice(&value.encode());
        write_u32(out, payload.len() as u32)?;
        write_u32(out, crc32(&payload))?;
        out.extend_from_slice(&payload);
        Ok(())
    }

    fn append(&self, id: NodeId, value: &NodeValue) -> Result<()> {
        let mut rec = Vec::new();
        Self::encode(id, value, &mut rec)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(&rec)?;
        if self.sync {
            f.sync_data()?;
        }
        Ok(())
    }

    fn rewrite(&self, entries: &[(NodeId, NodeValue)]) -> Result<()> {
        if entries.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let mut buf = Vec::new();
        for (id, v) in entries {
            Self::encode(*id, v, &mut buf)?;
        }
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::Builder::new().prefix("qdr_jnl_").tempfile_in(dir)?;
        tmp.as_file_mut().write_all(&buf)?;
        if self.sync {
            tmp.as_file_mut().sync_all()?;
        }
        tmp.persist(&self.path)?;
        Ok(())
    }
}

struct PreparedDict {
    sealed: SealedSegment,
    rec: PhaseRec,
}

pub struct ValuePool {
    dir: PathBuf,
    cfg: StoreConfig,
    ordering: NodeOrdering,
    log: PhaseLog,
    phase: u64,
    dict: Option<Arc<SegmentReader>>,
    next_id: NodeId,
    added: HashMap<NodeId, NodeValue>,
    by_value: BTreeMap<OrderedKey, NodeId>,
    removed: HashSet<NodeId>,
    durable: HashSet<NodeId>,
    journal: Journal,
    prepared: Option<PreparedDict>,
}

impl ValuePool {
    /// Opens the pool at its latest committed phase and replays the journal.
    pub fn open(dir: impl AsRef<Path>, cfg: &StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = PhaseLog::open(&dir, POOL_MANIFEST, cfg.retained_phases)?;
        let latest = log.manifest().latest().map(|p| p.phase).unwrap_or(0);
        let journal = Journal { path: dir.join(POOL_JOURNAL), sync: cfg.sync_writes };
        let mut pool = Self {
            dir,
            cfg: cfg.clone(),
            ordering: NodeOrdering,
            log,
            phase: 0,
            dict: None,
            next_id: MIN_NODE,
            added: HashMap::new(),
            by_value: BTreeMap::new(),
            removed: HashSet::new(),
            durable: HashSet::new(),
            journal,
            prepared: None,
        };
        pool.load_phase(latest)?;
        Ok(pool)
    }

    fn load_phase(&mut self, phase: u64) -> Result<()> {
        self.added.clear();
        self.by_value.clear();
        self.removed.clear();
        self.durable.clear();
        self.prepared = None;
        match self.log.manifest().get(phase) {
            Some(rec) => {
                let reader = SegmentReader::open_kind(self.log.segment_path(rec), SegmentKind::Dict)?;
                self.dict = Some(Arc::new(reader));
                self.next_id = rec.next_node.unwrap_or(MIN_NODE).max(MIN_NODE);
            }
            None if phase == 0 => {
                self.dict = None;
                self.next_id = MIN_NODE;
            }
            None => return Err(QuadError::txn(format!("value pool does not retain phase {phase}"))),
        }
        self.phase = phase;

        let mut replayed = 0usize;
        for (id, value) in self.journal.read()? {
            self.next_id = self.next_id.max(id + 1);
            if self.find_value(id)?.is_some() || self.find_id(&value)? != NONE {
                continue;
            }
            self.insert_pending(id, value);
            self.durable.insert(id);
            replayed += 1;
        }
        debug!(phase, replayed, next_id = self.next_id, "value pool loaded");
        Ok(())
    }

    fn insert_pending(&mut self, id: NodeId, value: NodeValue) {
        self.by_value.insert(OrderedKey(RangeValue::Node(value.clone())), id);
        self.added.insert(id, value);
    }

    fn drop_pending(&mut self, id: NodeId) -> bool {
        match self.added.remove(&id) {
            Some(value) => {
                self.by_value.remove(&OrderedKey(RangeValue::Node(value)));
                self.durable.remove(&id);
                true
            }
            None => false,
        }
    }

    fn allocate(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---- committed dictionary ----

    fn dict_value(&self, id: NodeId) -> Result<Option<NodeValue>> {
        let Some(dict) = &self.dict else { return Ok(None) };
        if self.removed.contains(&id) {
            return Ok(None);
        }
        match dict.get(&id_key(id))? {
            Some(rec) => Ok(Some(split_record(rec)?.1)),
            None => Ok(None),
        }
    }

    /// Record `i` of the order table compared against `target`.
    fn probe(&self, dict: &SegmentReader, i: usize, target: &RangeValue, target_key: Option<&[u8]>) -> Result<Ordering> {
        let (head, full_len) = dict.order_head(i)?;
        let fast = match target {
            RangeValue::Limit(l) => head.first().map(|&c| {
                let cat = l.category as u8;
                if c != cat {
                    c.cmp(&cat)
                } else if l.smallest {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }),
            RangeValue::Node(_) => target_key
                .and_then(|k| self.ordering.compare_prefix(k, head, full_len))
                .map(Ordering::reverse),
        };
        if let Some(o) = fast {
            return Ok(o);
        }
        let (_, v) = split_record(dict.order_record(i)?)?;
        Ok(self.ordering.compare(&RangeValue::Node(v), target))
    }

    /// First order-table index whose value is `>= target` (or `> target`).
    fn lower_bound(&self, dict: &SegmentReader, target: &RangeValue, inclusive: bool) -> Result<usize> {
        let key = match target {
            RangeValue::Node(v) => Some(order_key(v)),
            RangeValue::Limit(_) => None,
        };
        let (mut lo, mut hi) = (0usize, dict.order_len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let o = self.probe(dict, mid, target, key.as_deref())?;
            let before = match o {
                Ordering::Less => true,
                Ordering::Equal => !inclusive,
                Ordering::Greater => false,
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn dict_find(&self, value: &NodeValue) -> Result<Option<NodeId>> {
        let Some(dict) = &self.dict else { return Ok(None) };
        if !dict.may_contain(&value_key(&value.encode())) {
            return Ok(None);
        }
        let i = self.lower_bound(dict, &RangeValue::Node(value.clone()), true)?;
        if i >= dict.order_len() {
            return Ok(None);
        }
        let (id, found) = split_record(dict.order_record(i)?)?;
        if &found == value && !self.removed.contains(&id) {
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    fn dict_range(&self, low: Option<&RangeBound>, high: Option<&RangeBound>, out: &mut Vec<(NodeValue, NodeId)>) -> Result<()> {
        let Some(dict) = &self.dict else { return Ok(()) };
        let start = match low {
            Some(b) => self.lower_bound(dict, &b.value, b.inclusive)?,
            None => 0,
        };
        for i in start..dict.order_len() {
            let (id, v) = split_record(dict.order_record(i)?)?;
            if let Some(h) = high {
                match compare_range(&RangeValue::Node(v.clone()), &h.value) {
                    Ordering::Greater => break,
                    Ordering::Equal if !h.inclusive => break,
                    _ => {}
                }
            }
            if !self.removed.contains(&id) {
                out.push((v, id));
            }
        }
        Ok(())
    }

    // ---- public surface ----

    /// Inserts a fresh mapping.
    pub fn put(&mut self, id: NodeId, value: NodeValue) -> Result<()> {
        if id < MIN_NODE {
            return Err(QuadError::InvalidValue(format!("node id {id} is reserved")));
        }
        if self.find_value(id)?.is_some() {
            return Err(QuadError::DuplicateNode(format!("id #{id}")));
        }
        if self.find_id(&value)? != NONE {
            return Err(QuadError::DuplicateNode(value.to_string()));
        }
        self.next_id = self.next_id.max(id + 1);
        self.insert_pending(id, value);
        Ok(())
    }

    /// Id for `value`, or [`NONE`].
    pub fn find_id(&self, value: &NodeValue) -> Result<NodeId> {
        if let Some(id) = self.by_value.get(&OrderedKey(RangeValue::Node(value.clone()))) {
            return Ok(*id);
        }
        Ok(self.dict_find(value)?.unwrap_or(NONE))
    }

    pub fn find_value(&self, id: NodeId) -> Result<Option<NodeValue>> {
        if let Some(v) = self.added.get(&id) {
            return Ok(Some(v.clone()));
        }
        self.dict_value(id)
    }

    pub fn compare(&self, a: &RangeValue, b: &RangeValue) -> Ordering {
        self.ordering.compare(a, b)
    }

    /// Drops a mapping in the current write phase.
    pub fn remove(&mut self, id: NodeId) -> Result<bool> {
        if self.drop_pending(id) {
            return Ok(true);
        }
        if self.dict_value(id)?.is_some() {
            self.removed.insert(id);
            return Ok(true);
        }
        Ok(false)
    }

    /// Ids and values inside the range, in value order.
    pub fn find_range_values(&self, low: Option<&RangeBound>, high: Option<&RangeBound>) -> Result<Vec<(NodeId, NodeValue)>> {
        if let (Some(l), Some(h)) = (low, high) {
            match compare_range(&l.value, &h.value) {
                Ordering::Greater => return Ok(Vec::new()),
                Ordering::Equal if !(l.inclusive && h.inclusive) => return Ok(Vec::new()),
                _ => {}
            }
        }
        let mut hits = Vec::new();
        self.dict_range(low, high, &mut hits)?;
        let lo = low.map(RangeBound::to_bound).unwrap_or(Bound::Unbounded);
        let hi = high.map(RangeBound::to_bound).unwrap_or(Bound::Unbounded);
        for (k, id) in self.by_value.range((lo, hi)) {
            if let RangeValue::Node(v) = &k.0 {
                hits.push((v.clone(), *id));
            }
        }
        hits.sort_by(|a, b| compare_values(&a.0, &b.0));
        Ok(hits.into_iter().map(|(v, id)| (id, v)).collect())
    }

    pub fn find_range(&self, low: Option<&RangeBound>, high: Option<&RangeBound>) -> Result<Vec<NodeId>> {
        Ok(self.find_range_values(low, high)?.into_iter().map(|(id, _)| id).collect())
    }

    /// Every node of a category, optionally restricted to one datatype.
    pub fn find_type(&self, category: TypeCategory, datatype: Option<&str>) -> Result<Vec<NodeId>> {
        let lo = RangeBound::inclusive(Limit::smallest(category));
        let hi = RangeBound::inclusive(Limit::largest(category));
        Ok(self
            .find_range_values(Some(&lo), Some(&hi))?
            .into_iter()
            .filter(|(_, v)| match (datatype, v) {
                (None, _) => true,
                (Some(want), NodeValue::Typed { datatype, .. }) => datatype == want,
                (Some(_), _) => false,
            })
            .map(|(id, _)| id)
            .collect())
    }

    /// Id for `value`, allocating one in the current phase if needed.
    pub fn localize(&mut self, value: &NodeValue) -> Result<NodeId> {
        let id = self.find_id(value)?;
        if id != NONE {
            return Ok(id);
        }
        let id = self.allocate();
        self.insert_pending(id, value.clone());
        Ok(id)
    }

    /// Like [`localize`](Self::localize), but the allocation is journaled and
    /// survives rollback.
    pub fn localize_persistent(&mut self, value: &NodeValue) -> Result<NodeId> {
        let id = self.find_id(value)?;
        if id != NONE {
            if self.added.contains_key(&id) && self.durable.insert(id) {
                self.journal.append(id, value)?;
            }
            return Ok(id);
        }
        let id = self.allocate();
        self.journal.append(id, value)?;
        self.insert_pending(id, value.clone());
        self.durable.insert(id);
        Ok(id)
    }

    pub fn new_blank_node(&mut self) -> Result<NodeId> {
        let id = self.allocate();
        let mut label = format!("b{id}");
        let mut n = 0;
        while self.find_id(&NodeValue::Blank(label.clone()))? != NONE {
            n += 1;
            label = format!("b{id}_{n}");
        }
        self.insert_pending(id, NodeValue::Blank(label));
        Ok(id)
    }

    /// All live mappings in value order.
    pub fn entries(&self) -> Result<Vec<(NodeId, NodeValue)>> {
        self.find_range_values(None, None)
    }

    pub fn len(&self) -> Result<usize> {
        let committed = self.dict.as_ref().map(|d| d.order_len()).unwrap_or(0);
        Ok(committed + self.added.len() - self.removed.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn next_id(&self) -> NodeId {
        self.next_id
    }

    /// Every phase carries a complete dictionary segment, not a delta.
    fn write_dict(&self, phase: u64) -> Result<PreparedDict> {
        let entries = self.entries()?;
        let name = format!("dict-{phase:08}.qseg");
        let bloom = Bloom::for_keys(entries.len(), 10, self.cfg.bloom_bits, self.cfg.bloom_k);
        let mut w = SegmentWriter::create(self.dir.join(&name), SegmentKind::Dict, bloom)?;
        for (id, v) in &entries {
            let enc = v.encode();
            let mut rec = id.to_le_bytes().to_vec();
            rec.extend_from_slice(&enc);
            let r = w.append(&rec)?;
            w.index(&id_key(*id), r);
            w.filter(&value_key(&enc));
            w.order(r, &order_key(v));
        }
        let sealed = w.seal(self.cfg.sync_writes)?;
        let rec = PhaseRec {
            phase,
            kind: SegmentKind::Dict,
            path: PathBuf::from(name),
            count: entries.len() as u64,
            next_node: Some(self.next_id),
        };
        Ok(PreparedDict { sealed, rec })
    }

    fn compact_journal(&self) -> Result<()> {
        let floor = self.log.manifest().phases.first().and_then(|p| p.next_node).unwrap_or(MIN_NODE);
        let keep: Vec<_> = self.journal.read()?.into_iter().filter(|(id, _)| *id >= floor).collect();
        self.journal.rewrite(&keep)
    }
}

impl Participant for ValuePool {
    fn name(&self) -> &'static str {
        "value-pool"
    }

    fn refresh(&mut self) -> Result<()> {
        if self.prepared.take().is_some() {
            warn!("value pool dropped a stale prepared dictionary");
        }
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    fn current_phase(&self) -> u64 {
        self.phase
    }

    fn last_phase(&self) -> u64 {
        self.log.manifest().high_water()
    }

    fn prepare(&mut self, phase: u64) -> Result<Vote> {
        if !self.is_dirty() && self.log.manifest().latest().is_some() {
            return Ok(Vote::ReadOnly);
        }
        let prepared = self.write_dict(phase)?;
        debug!(phase, nodes = prepared.rec.count, "value pool prepared");
        self.prepared = Some(prepared);
        Ok(Vote::Ok)
    }

    fn commit(&mut self, phase: u64) -> Result<()> {
        let rec = match self.prepared.take() {
            Some(p) => {
                if p.rec.phase != phase {
                    return Err(QuadError::consistency(format!(
                        "value pool prepared phase {} but was asked to commit {phase}",
                        p.rec.phase
                    )));
                }
                p.sealed.publish(self.cfg.sync_writes)?;
                self.log.record(p.rec.clone())?;
                p.rec
            }
            None if self.is_dirty() => {
                return Err(QuadError::consistency("value pool committing unprepared changes"));
            }
            None => self.log.alias_latest(phase)?,
        };
        let path = self.log.segment_path(&rec);
        self.dict = Some(Arc::new(SegmentReader::open_kind(path, SegmentKind::Dict)?));
        self.added.clear();
        self.by_value.clear();
        self.removed.clear();
        self.durable.clear();
        self.phase = phase;
        self.compact_journal()?;
        info!(phase, next_id = self.next_id, "value pool committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.prepared = None;
        self.removed.clear();
        let keep: Vec<(NodeId, NodeValue)> = self
            .added
            .drain()
            .filter(|(id, _)| self.durable.contains(id))
            .collect();
        self.by_value.clear();
        for (id, v) in keep {
            self.insert_pending(id, v);
        }
        debug!(kept = self.added.len(), "value pool rolled back");
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
    use crate::node::{XSD_DECIMAL, XSD_INT};
    use tempfile::tempdir;

    fn cfg() -> StoreConfig {
        StoreConfig { sync_writes: false, ..StoreConfig::default() }
    }

    fn commit(pool: &mut ValuePool, phase: u64) {
        pool.prepare(phase).unwrap();
        pool.commit(phase).unwrap();
    }

    #[test]
    fn put_rejects_duplicates() {
        let tmp = tempdir().unwrap();
        let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
        pool.put(5, NodeValue::uri("http://a")).unwrap();
        assert!(matches!(pool.put(5, NodeValue::uri("http://b")), Err(QuadError::DuplicateNode(_))));
        assert!(matches!(pool.put(6, NodeValue::uri("http://a")), Err(QuadError::DuplicateNode(_))));
        commit(&mut pool, 1);
        assert!(matches!(pool.put(5, NodeValue::uri("http://c")), Err(QuadError::DuplicateNode(_))));
        assert!(matches!(pool.put(7, NodeValue::uri("http://a")), Err(QuadError::DuplicateNode(_))));
        assert_eq!(pool.localize(&NodeValue::plain("x")).unwrap(), 6);
    }

    #[test]
    fn lookups_span_committed_and_pending() {
        let tmp = tempdir().unwrap();
        let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
        let a = pool.localize(&NodeValue::uri("http://a")).unwrap();
        let lit = pool.localize(&NodeValue::lang("bonjour", "fr")).unwrap();
        commit(&mut pool, 1);
        let b = pool.localize(&NodeValue::uri("http://b")).unwrap();

        assert_eq!(pool.find_id(&NodeValue::uri("http://a")).unwrap(), a);
        assert_eq!(pool.find_id(&NodeValue::uri("http://b")).unwrap(), b);
        assert_eq!(pool.find_id(&NodeValue::uri("http://zzz")).unwrap(), NONE);
        assert_eq!(pool.find_value(lit).unwrap(), Some(NodeValue::lang("bonjour", "fr")));
        assert_eq!(pool.len().unwrap(), 3);

        assert!(pool.remove(a).unwrap());
        assert_eq!(pool.find_id(&NodeValue::uri("http://a")).unwrap(), NONE);
        assert_eq!(pool.find_value(a).unwrap(), None);
        assert!(!pool.remove(999).unwrap());
    }

    #[test]
    fn committed_dictionary_finds_every_value() {
        for n in [10usize, 13, 21] {
            let tmp = tempdir().unwrap();
            let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
            let ids: Vec<_> = (0..n).map(|i| pool.localize(&NodeValue::uri(format!("http://n{i}"))).unwrap()).collect();
            commit(&mut pool, 1);
            let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
            for (i, id) in ids.iter().enumerate() {
                let v = NodeValue::uri(format!("http://n{i}"));
                assert_eq!(pool.find_value(*id).unwrap(), Some(v.clone()), "{n} nodes, id {id}");
                assert_eq!(pool.find_id(&v).unwrap(), *id);
            }
            assert_eq!(pool.localize(&NodeValue::uri("http://n0")).unwrap(), ids[0]);
            assert_eq!(pool.len().unwrap(), n);
        }
    }

    #[test]
    fn ranges_follow_value_order() {
        let tmp = tempdir().unwrap();
        let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
        let ten = pool.localize(&NodeValue::typed("10", XSD_INT)).unwrap();
        let two = pool.localize(&NodeValue::typed("2", XSD_INT)).unwrap();
        let half = pool.localize(&NodeValue::typed("0.5", XSD_DECIMAL)).unwrap();
        let uri = pool.localize(&NodeValue::uri("http://x")).unwrap();
        let plain = pool.localize(&NodeValue::plain("p")).unwrap();
        commit(&mut pool, 1);
        let seven = pool.localize(&NodeValue::typed("7", XSD_INT)).unwrap();

        assert_eq!(pool.find_type(TypeCategory::Typed, None).unwrap(), vec![half, two, seven, ten]);
        assert_eq!(pool.find_type(TypeCategory::Typed, Some(XSD_DECIMAL)).unwrap(), vec![half]);
        assert_eq!(pool.find_type(TypeCategory::Uri, None).unwrap(), vec![uri]);
        assert_eq!(pool.find_range(None, None).unwrap(), vec![uri, plain, half, two, seven, ten]);

        let lo = RangeBound::exclusive(NodeValue::typed("2", XSD_INT));
        let hi = RangeBound::inclusive(NodeValue::typed("10", XSD_INT));
        assert_eq!(pool.find_range(Some(&lo), Some(&hi)).unwrap(), vec![seven, ten]);
        let empty = RangeBound::exclusive(NodeValue::typed("10", XSD_INT));
        assert!(pool.find_range(Some(&empty), Some(&hi)).unwrap().is_empty());
    }

    #[test]
    fn persistent_allocations_survive_rollback_and_reopen() {
        let tmp = tempdir().unwrap();
        let (keep, gone);
        {
            let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
            keep = pool.localize_persistent(&NodeValue::uri("http://schema")).unwrap();
            gone = pool.localize(&NodeValue::uri("http://temp")).unwrap();
            pool.rollback().unwrap();
            assert_eq!(pool.find_value(gone).unwrap(), None);
            assert_eq!(pool.find_id(&NodeValue::uri("http://schema")).unwrap(), keep);
            // ids are not reused
            assert!(pool.new_blank_node().unwrap() > gone);
        }
        let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
        assert_eq!(pool.find_id(&NodeValue::uri("http://schema")).unwrap(), keep);
        commit(&mut pool, 1);
        assert!(!tmp.path().join(POOL_JOURNAL).exists());
        let pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
        assert_eq!(pool.find_id(&NodeValue::uri("http://schema")).unwrap(), keep);
    }

    #[test]
    fn phases_are_retained_and_selectable() {
        let tmp = tempdir().unwrap();
        let mut pool = ValuePool::open(tmp.path(), &cfg()).unwrap();
        let a = pool.localize(&NodeValue::uri("http://a")).unwrap();
        commit(&mut pool, 1);
        pool.localize(&NodeValue::uri("http://b")).unwrap();
        commit(&mut pool, 2);
        assert_eq!(pool.recover(), vec![1, 2]);
        // clean participants alias the previous segment
        assert_eq!(pool.prepare(3).unwrap(), Vote::ReadOnly);
        pool.commit(3).unwrap();
        assert_eq!(pool.recover(), vec![2, 3]);

        pool.select_phase(2).unwrap();
        assert_eq!(pool.current_phase(), 2);
        assert_eq!(pool.recover(), vec![2]);
        assert_eq!(pool.find_id(&NodeValue::uri("http://a")).unwrap(), a);
        assert!(tmp.path().join("dict-00000002.qseg").exists());
    }
}
