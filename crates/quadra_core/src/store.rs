//! Store facade: value pool, quad index, commit coordinator and sorter behind
//! one handle.

use crate::backup::{compress, read_backup, write_backup, BackupStats};
use crate::config::StoreConfig;
use crate::consts::{NodeId, NONE};
use crate::errors::{QuadError, Result};
use crate::node::NodeValue;
use crate::ordering::compare_values;
use crate::pool::ValuePool;
use crate::quad_index::{Phase, QuadIndex};
use crate::resolution::{Constraint, Resolution};
use crate::sorted::{ComparatorRegistry, Materializer, RowComparator, SortedRelation, VALUE_ORDER};
use crate::tuples::{Tuples, Variable};
use crate::txn::{Coordinator, EndFlag, Participant, SharedParticipant, StartFlag, XaResource, Xid};
use crate::utils::fsync_dir;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Scratch directory for materialized relations.
pub const SORTED_DIR: &str = "sorted";
/// Format id of transactions the store starts for itself.
pub const LOCAL_FORMAT: i32 = 0x5144;

/// Orders rows column by column on the pool's node values.
struct ValueRowOrder {
    pool: Arc<RwLock<ValuePool>>,
}

impl RowComparator for ValueRowOrder {
    fn compare(&self, a: &[NodeId], b: &[NodeId]) -> Ordering {
        let pool = self.pool.read();
        for (x, y) in a.iter().zip(b) {
            if x == y {
                continue;
            }
            let ord = match (pool.find_value(*x), pool.find_value(*y)) {
                (Ok(Some(vx)), Ok(Some(vy))) => compare_values(&vx, &vy),
                _ => x.cmp(y),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.len().cmp(&b.len())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub dir: PathBuf,
    pub phase: u64,
    pub statements: usize,
    pub nodes: usize,
    pub next_node: NodeId,
    pub index_phases: Vec<u64>,
    pub pool_phases: Vec<u64>,
    pub config: StoreConfig,
}

pub struct QuadStore {
    dir: PathBuf,
    cfg: StoreConfig,
    pool: Arc<RwLock<ValuePool>>,
    index: Arc<RwLock<QuadIndex>>,
    coordinator: Coordinator,
    registry: Arc<ComparatorRegistry>,
    materializer: Materializer,
    local_txns: AtomicU64,
}

impl QuadStore {
    /// Opens with the directory's `quadra.json`, or defaults.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let cfg = StoreConfig::load(&dir)?;
        Self::open_with(dir, cfg)
    }

    /// Writes `cfg` into a (new) store directory and opens it.
    pub fn init(dir: impl AsRef<Path>, cfg: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        cfg.save(&dir)?;
        Self::open_with(dir, cfg)
    }

    pub fn open_with(dir: impl AsRef<Path>, cfg: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let pool = Arc::new(RwLock::new(ValuePool::open(&dir, &cfg)?));
        let index = Arc::new(RwLock::new(QuadIndex::open(&dir, &cfg)?));
        let participants = vec![index.clone() as SharedParticipant, pool.clone() as SharedParticipant];
        let coordinator = Coordinator::new(participants);
        let phase = coordinator.recover_participants()?;

        let registry = Arc::new(ComparatorRegistry::new());
        registry.register(VALUE_ORDER, Arc::new(ValueRowOrder { pool: Arc::clone(&pool) }));
        let materializer = Materializer::new(dir.join(SORTED_DIR), &cfg, Arc::clone(&registry))?;

        info!(dir = %dir.display(), phase, "store opened");
        Ok(Self { dir, cfg, pool, index, coordinator, registry, materializer, local_txns: AtomicU64::new(0) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<ComparatorRegistry> {
        &self.registry
    }

    /// Read access to the pool for range and type queries.
    pub fn pool(&self) -> RwLockReadGuard<'_, ValuePool> {
        self.pool.read()
    }

    pub fn index(&self) -> RwLockReadGuard<'_, QuadIndex> {
        self.index.read()
    }

    /// Transaction branch interface for an external transaction manager.
    pub fn xa_resource(&self) -> &Coordinator {
        &self.coordinator
    }

    // ---- reads ----

    /// Working phase for the thread running the write transaction, the last
    /// committed phase for everyone else.
    fn read_phase(&self) -> Arc<Phase> {
        let index = self.index.read();
        if self.coordinator.associated() {
            index.working()
        } else {
            index.committed()
        }
    }

    pub fn resolve(&self, constraint: Constraint) -> Result<Resolution> {
        Resolution::new(self.read_phase(), constraint)
    }

    /// Resolves with `pending` variables to be bound later through a prefix.
    pub fn resolve_pending(&self, constraint: Constraint, pending: &[Variable]) -> Result<Resolution> {
        Resolution::with_pending(self.read_phase(), constraint, pending)
    }

    pub fn globalize(&self, id: NodeId) -> Result<NodeValue> {
        self.pool.read().find_value(id)?.ok_or(QuadError::UnknownNode(id))
    }

    /// Id for `value`, or `NONE`. Never allocates.
    pub fn lookup(&self, value: &NodeValue) -> Result<NodeId> {
        self.pool.read().find_id(value)
    }

    pub fn statement_count(&self) -> usize {
        self.read_phase().len()
    }

    /// Materializes `tuples` under the registered comparator.
    pub fn sort(&self, tuples: &mut dyn Tuples, comparator: u32, duplicates: bool) -> Result<SortedRelation> {
        self.materializer.materialize(tuples, comparator, duplicates)
    }

    // ---- writes ----

    /// Runs `f` inside a store-local transaction: start, end, one-phase
    /// commit; rolled back when `f` or the commit fails.
    pub fn with_write<T>(&self, f: impl FnOnce(&QuadStore) -> Result<T>) -> Result<T> {
        let n = self.local_txns.fetch_add(1, AtomicOrdering::SeqCst);
        let xid = Xid::new(LOCAL_FORMAT, format!("local-{}-{n}", std::process::id()), "0");
        self.coordinator.start(&xid, StartFlag::NoFlags)?;
        let outcome = f(self).and_then(|v| {
            self.coordinator.end(&xid, EndFlag::Success)?;
            self.coordinator.commit(&xid, true)?;
            Ok(v)
        });
        if outcome.is_err() && self.coordinator.state(&xid).is_some() {
            if let Err(e) = self.coordinator.rollback(&xid) {
                warn!(%xid, error = %e, "rollback after failed write");
            }
        }
        outcome
    }

    /// Joins the transaction this thread is working in, or runs `f` in its own.
    fn in_write<T>(&self, f: impl FnOnce(&QuadStore) -> Result<T>) -> Result<T> {
        if self.coordinator.associated() {
            f(self)
        } else {
            self.with_write(f)
        }
    }

    /// Inserts or deletes `(s, p, o)` statements in `graph`. Returns how many
    /// statements changed. A `NONE` position in a delete matches anything.
    pub fn modify_statements<I>(&self, graph: NodeId, statements: I, insert: bool) -> Result<usize>
    where
        I: IntoIterator<Item = (NodeId, NodeId, NodeId)>,
    {
        self.in_write(|s| {
            let mut index = s.index.write();
            let mut changed = 0;
            for (subject, predicate, object) in statements {
                let q = [subject, predicate, object, graph];
                if insert {
                    changed += usize::from(index.add(q)?);
                } else {
                    changed += index.remove(&q);
                }
            }
            debug!(graph, changed, insert, "statements modified");
            Ok(changed)
        })
    }

    /// Id for `value`, allocating one if needed.
    pub fn localize(&self, value: &NodeValue) -> Result<NodeId> {
        self.in_write(|s| s.pool.write().localize(value))
    }

    /// Allocation that survives an aborted transaction.
    pub fn localize_persistent(&self, value: &NodeValue) -> Result<NodeId> {
        self.pool.write().localize_persistent(value)
    }

    pub fn new_blank_node(&self) -> Result<NodeId> {
        self.in_write(|s| s.pool.write().new_blank_node())
    }

    /// Emergency teardown outside the commit protocol.
    pub fn abort(&self) -> Result<()> {
        self.coordinator.abort()
    }

    // ---- backup ----

    pub fn backup_to<W: Write>(&self, out: &mut W) -> Result<BackupStats> {
        let nodes = self.pool.read().entries()?;
        let mut all = self.resolve(Constraint::all_statements())?;
        let stats = write_backup(out, OffsetDateTime::now_utc(), &nodes, &mut all)?;
        all.close()?;
        Ok(stats)
    }

    /// Writes a backup file atomically, zstd compressed when configured.
    pub fn backup(&self, path: impl AsRef<Path>) -> Result<BackupStats> {
        let path = path.as_ref();
        let mut text = Vec::new();
        let stats = self.backup_to(&mut text)?;
        let bytes = if self.cfg.compress_backups { compress(&text)? } else { text };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        if self.cfg.sync_writes {
            if let Err(e) = fsync_dir(path) {
                warn!(path = %path.display(), error = %e, "directory fsync failed");
            }
        }
        info!(path = %path.display(), nodes = stats.nodes, statements = stats.statements, "backup written");
        Ok(stats)
    }

    pub fn restore(&self, path: impl AsRef<Path>) -> Result<BackupStats> {
        let bytes = fs::read(path.as_ref())?;
        self.restore_bytes(&bytes)
    }

    /// Loads a backup into this store in one transaction. Node ids are
    /// remapped through the target pool; blank nodes always get fresh ids.
    /// Ids without a node entry are kept unless they name a node here.
    pub fn restore_bytes(&self, bytes: &[u8]) -> Result<BackupStats> {
        let backup = read_backup(bytes)?;
        let stats = self.with_write(|s| {
            let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(backup.nodes.len());
            let mut pool = s.pool.write();
            for (old, value) in &backup.nodes {
                let id = if value.is_blank() { pool.new_blank_node()? } else { pool.localize(value)? };
                remap.insert(*old, id);
            }
            let mut index = s.index.write();
            let mut statements = 0u64;
            for q in &backup.statements {
                let mut mapped = [NONE; 4];
                for (slot, n) in mapped.iter_mut().zip(q) {
                    *slot = match remap.get(n) {
                        Some(id) => *id,
                        None if pool.find_value(*n)?.is_some() => return Err(QuadError::UnknownNode(*n)),
                        None => *n,
                    };
                }
                statements += u64::from(index.add(mapped)?);
            }
            Ok(BackupStats { nodes: remap.len() as u64, statements })
        })?;
        info!(created = %backup.created, nodes = stats.nodes, statements = stats.statements, "backup restored");
        Ok(stats)
    }

    pub fn info(&self) -> Result<StoreInfo> {
        let statements = self.statement_count();
        let pool = self.pool.read();
        let index = self.index.read();
        Ok(StoreInfo {
            dir: self.dir.clone(),
            phase: index.current_phase(),
            statements,
            nodes: pool.len()?,
            next_node: pool.next_id(),
            index_phases: index.recover(),
            pool_phases: pool.recover(),
            config: self.cfg.clone(),
        })
    }
}
