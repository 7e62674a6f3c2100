//! Two-phase commit across participant resources.
//!
//! A session is created on the first `start` of a global transaction id and
//! shared by all of its branches. The coordinator owns the registry of
//! sessions currently preparing, so a second `prepare` of the same session
//! returns the first one's outcome instead of preparing again. A branch is
//! associated with the thread that started it until `end`.

use crate::errors::{QuadError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Ok,
    ReadOnly,
}

/// A resource taking part in two-phase commit.
pub trait Participant: Send + Sync {
    fn name(&self) -> &'static str;
    /// First start of a session: drop anything left from an earlier one.
    fn refresh(&mut self) -> Result<()>;
    fn is_dirty(&self) -> bool;
    /// Phase the participant is reading from.
    fn current_phase(&self) -> u64;
    /// Highest phase number the participant ever committed.
    fn last_phase(&self) -> u64;
    /// Makes `phase` durable but unpublished.
    fn prepare(&mut self, phase: u64) -> Result<Vote>;
    /// Publishes `phase`. Clean participants record it against their current data.
    fn commit(&mut self, phase: u64) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
    /// Retained committed phases.
    fn recover(&self) -> Vec<u64>;
    fn select_phase(&mut self, phase: u64) -> Result<()>;
}

pub type SharedParticipant = Arc<RwLock<dyn Participant>>;

/// Transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    pub format_id: i32,
    pub gtrid: Vec<u8>,
    pub bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Self {
        Xid { format_id, gtrid: gtrid.into(), bqual: bqual.into() }
    }

    /// Another branch of the same global transaction.
    pub fn branch(&self, bqual: impl Into<Vec<u8>>) -> Self {
        Xid { format_id: self.format_id, gtrid: self.gtrid.clone(), bqual: bqual.into() }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.gtrid {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.bqual {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    NoFlags,
    Join,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Success,
    Suspend,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Ended,
    Preparing,
    Prepared,
    /// Voted read-only; kept until every branch has been answered.
    ReadOnly,
    Committed,
    RolledBack,
}

pub type SessionId = u64;

/// Format id plus global transaction id.
type GlobalKey = (i32, Vec<u8>);

fn global(xid: &Xid) -> GlobalKey {
    (xid.format_id, xid.gtrid.clone())
}

#[derive(Debug, Default)]
struct Branch {
    suspended: bool,
    ended: bool,
    done: bool,
    thread: Option<ThreadId>,
}

impl Branch {
    fn on_current_thread() -> Self {
        Branch { thread: Some(thread::current().id()), ..Branch::default() }
    }
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    state: TxState,
    branches: HashMap<Vec<u8>, Branch>,
    phase: Option<u64>,
    rollback_only: bool,
    prepare_failed: bool,
    releases: u32,
}

impl Session {
    fn complete(&self) -> bool {
        matches!(self.state, TxState::ReadOnly | TxState::Committed | TxState::RolledBack)
    }
}

/// Outcome of claiming a session for preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    New,
    /// Already prepared by another branch, with its vote.
    Existing(Vote),
    /// The prepare this claim waited on failed.
    Failed,
}

/// Sessions between prepare and completion.
#[derive(Debug, Default)]
pub struct PreparingRegistry {
    inner: Mutex<HashMap<SessionId, Option<Vote>>>,
    settled: Condvar,
}

impl PreparingRegistry {
    /// Claims `id` for preparation. A claim on a session whose prepare is
    /// still in flight blocks until that prepare settles or fails.
    pub fn claim(&self, id: SessionId) -> Claim {
        let mut m = self.inner.lock();
        let mut waited = false;
        loop {
            match m.get(&id) {
                Some(Some(vote)) => return Claim::Existing(*vote),
                Some(None) => {
                    waited = true;
                    self.settled.wait(&mut m);
                }
                None if waited => return Claim::Failed,
                None => {
                    m.insert(id, None);
                    return Claim::New;
                }
            }
        }
    }

    pub fn settle(&self, id: SessionId, vote: Vote) {
        self.inner.lock().insert(id, Some(vote));
        self.settled.notify_all();
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self.inner.lock().remove(&id).is_some();
        self.settled.notify_all();
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.inner.lock().clear();
        self.settled.notify_all();
    }
}

/// The XA verbs a transaction manager drives.
pub trait XaResource {
    fn start(&self, xid: &Xid, flag: StartFlag) -> Result<()>;
    fn end(&self, xid: &Xid, flag: EndFlag) -> Result<()>;
    fn prepare(&self, xid: &Xid) -> Result<Vote>;
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;
    fn rollback(&self, xid: &Xid) -> Result<()>;
    fn forget(&self, xid: &Xid) -> Result<()>;
    /// Branches that are prepared but not yet completed.
    fn recover(&self) -> Vec<Xid>;
}

fn unknown(xid: &Xid) -> QuadError {
    QuadError::txn(format!("unknown xid {xid}"))
}

/// Drives prepare/commit/rollback over a fixed set of participants.
pub struct Coordinator {
    participants: Vec<SharedParticipant>,
    sessions: Mutex<HashMap<GlobalKey, Session>>,
    preparing: PreparingRegistry,
    next_session: AtomicU64,
    next_phase: Mutex<u64>,
    releases: AtomicU64,
}

impl Coordinator {
    pub fn new(participants: Vec<SharedParticipant>) -> Self {
        let next_phase = Self::high_water(&participants) + 1;
        Self {
            participants,
            sessions: Mutex::new(HashMap::new()),
            preparing: PreparingRegistry::default(),
            next_session: AtomicU64::new(1),
            next_phase: Mutex::new(next_phase),
            releases: AtomicU64::new(0),
        }
    }

    fn high_water(participants: &[SharedParticipant]) -> u64 {
        participants.iter().map(|p| p.read().last_phase()).max().unwrap_or(0)
    }

    /// Moves every participant to the newest phase all of them retain.
    pub fn recover_participants(&self) -> Result<u64> {
        let mut common: Option<Vec<u64>> = None;
        for p in &self.participants {
            let phases = p.read().recover();
            common = Some(match common {
                None => phases,
                Some(c) => c.into_iter().filter(|n| phases.contains(n)).collect(),
            });
        }
        let chosen = common.unwrap_or_default().into_iter().max().unwrap_or(0);
        for p in &self.participants {
            let mut g = p.write();
            if g.current_phase() != chosen || g.recover().iter().any(|&n| n > chosen) {
                warn!(participant = g.name(), from = g.current_phase(), to = chosen, "selecting recovery phase");
                g.select_phase(chosen)?;
            }
        }
        *self.next_phase.lock() = Self::high_water(&self.participants) + 1;
        Ok(chosen)
    }

    pub fn participants(&self) -> &[SharedParticipant] {
        &self.participants
    }

    /// Total session releases performed.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn preparing(&self) -> &PreparingRegistry {
        &self.preparing
    }

    pub fn state(&self, xid: &Xid) -> Option<TxState> {
        self.sessions.lock().get(&global(xid)).map(|s| s.state)
    }

    /// Whether a write session is open.
    pub fn in_transaction(&self) -> bool {
        self.sessions.lock().values().any(|s| !s.complete())
    }

    /// Whether the calling thread is associated with an open branch.
    pub fn associated(&self) -> bool {
        let me = thread::current().id();
        self.sessions
            .lock()
            .values()
            .any(|s| !s.complete() && s.branches.values().any(|b| b.thread == Some(me)))
    }

    fn release_session(&self, s: &mut Session) -> Result<()> {
        assert!(s.releases == 0, "session {} released twice", s.id);
        s.releases += 1;
        self.releases.fetch_add(1, Ordering::SeqCst);
        let mut first = None;
        for p in &self.participants {
            let mut g = p.write();
            if let Err(e) = g.release() {
                warn!(participant = g.name(), error = %e, "release failed");
                first.get_or_insert(e);
            }
        }
        debug!(session = s.id, "session released");
        first.map_or(Ok(()), Err)
    }

    /// Marks the branch finished; drops the session once every branch is.
    fn finish_branch(&self, xid: &Xid) {
        let mut sessions = self.sessions.lock();
        let Some(s) = sessions.get_mut(&global(xid)) else { return };
        if let Some(b) = s.branches.get_mut(&xid.bqual) {
            b.done = true;
        }
        if s.complete() && s.branches.values().all(|b| b.done) {
            let id = s.id;
            sessions.remove(&global(xid));
            self.preparing.remove(id);
        }
    }

    fn prepare_participants(&self) -> Result<(Vote, Option<u64>)> {
        if !self.participants.iter().any(|p| p.read().is_dirty()) {
            return Ok((Vote::ReadOnly, None));
        }
        let phase = {
            let mut n = self.next_phase.lock();
            let p = *n;
            *n += 1;
            p
        };
        for p in &self.participants {
            let mut g = p.write();
            let vote = g.prepare(phase)?;
            debug!(participant = g.name(), phase, ?vote, "participant prepared");
        }
        Ok((Vote::Ok, Some(phase)))
    }

    fn commit_participants(&self, phase: u64) -> Result<()> {
        let mut first = None;
        for p in &self.participants {
            let mut g = p.write();
            if let Err(e) = g.commit(phase) {
                error!(participant = g.name(), phase, error = %e, "commit failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn rollback_participants(&self) -> Result<()> {
        let mut first = None;
        for p in &self.participants {
            let mut g = p.write();
            if let Err(e) = g.rollback() {
                warn!(participant = g.name(), error = %e, "rollback failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Completes a session: sets its final state and releases it exactly once.
    fn complete(&self, xid: &Xid, state: TxState) -> Result<()> {
        let released = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&global(xid)) {
                Some(s) => {
                    s.state = state;
                    self.preparing.remove(s.id);
                    if s.releases == 0 {
                        self.release_session(s)
                    } else {
                        Ok(())
                    }
                }
                None => Ok(()),
            }
        };
        self.finish_branch(xid);
        released
    }

    /// Unilateral teardown outside the protocol: roll everything back and
    /// release every open session.
    pub fn abort(&self) -> Result<()> {
        let outcome = self.rollback_participants();
        let mut sessions = self.sessions.lock();
        let mut first = outcome.err();
        for s in sessions.values_mut() {
            if s.releases == 0 {
                if let Err(e) = self.release_session(s) {
                    first.get_or_insert(e);
                }
            }
        }
        let n = sessions.len();
        sessions.clear();
        self.preparing.clear();
        warn!(sessions = n, "transactions aborted");
        first.map_or(Ok(()), Err)
    }
}

impl XaResource for Coordinator {
    fn start(&self, xid: &Xid, flag: StartFlag) -> Result<()> {
        let mut sessions = self.sessions.lock();
        match flag {
            StartFlag::NoFlags => {
                if let Some(s) = sessions.get_mut(&global(xid)) {
                    if s.branches.contains_key(&xid.bqual) {
                        return Err(QuadError::txn(format!("duplicate xid {xid}")));
                    }
                    if !matches!(s.state, TxState::Active | TxState::Ended) {
                        return Err(QuadError::txn(format!("{xid} cannot start in state {:?}", s.state)));
                    }
                    s.branches.insert(xid.bqual.clone(), Branch::on_current_thread());
                    s.state = TxState::Active;
                    return Ok(());
                }
                if sessions.values().any(|s| !s.complete()) {
                    return Err(QuadError::WriterBusy);
                }
                for p in &self.participants {
                    p.write().refresh()?;
                }
                let id = self.next_session.fetch_add(1, Ordering::SeqCst);
                let mut branches = HashMap::new();
                branches.insert(xid.bqual.clone(), Branch::on_current_thread());
                sessions.insert(
                    global(xid),
                    Session {
                        id,
                        state: TxState::Active,
                        branches,
                        phase: None,
                        rollback_only: false,
                        prepare_failed: false,
                        releases: 0,
                    },
                );
                debug!(%xid, session = id, "transaction started");
                Ok(())
            }
            StartFlag::Join => {
                let s = sessions.get_mut(&global(xid)).ok_or_else(|| unknown(xid))?;
                if !matches!(s.state, TxState::Active | TxState::Ended) {
                    return Err(QuadError::txn(format!("{xid} cannot join in state {:?}", s.state)));
                }
                let b = s.branches.entry(xid.bqual.clone()).or_default();
                b.ended = false;
                b.thread = Some(thread::current().id());
                s.state = TxState::Active;
                Ok(())
            }
            StartFlag::Resume => {
                let s = sessions.get_mut(&global(xid)).ok_or_else(|| unknown(xid))?;
                let b = s.branches.get_mut(&xid.bqual).ok_or_else(|| unknown(xid))?;
                if !b.suspended {
                    return Err(QuadError::txn(format!("{xid} is not suspended")));
                }
                b.suspended = false;
                b.thread = Some(thread::current().id());
                Ok(())
            }
        }
    }

    fn end(&self, xid: &Xid, flag: EndFlag) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let s = sessions.get_mut(&global(xid)).ok_or_else(|| unknown(xid))?;
        let b = s.branches.get_mut(&xid.bqual).ok_or_else(|| unknown(xid))?;
        b.thread = None;
        match flag {
            EndFlag::Success => b.ended = true,
            EndFlag::Suspend => b.suspended = true,
            EndFlag::Fail => {
                b.ended = true;
                s.rollback_only = true;
            }
        }
        if s.state == TxState::Active && s.branches.values().all(|b| b.ended || b.done) {
            s.state = TxState::Ended;
        }
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote> {
        let (id, state) = {
            let sessions = self.sessions.lock();
            let s = sessions.get(&global(xid)).ok_or_else(|| unknown(xid))?;
            if !s.branches.contains_key(&xid.bqual) {
                return Err(unknown(xid));
            }
            match s.state {
                TxState::Committed => return Err(QuadError::txn(format!("{xid} already completed"))),
                TxState::RolledBack => return Err(QuadError::txn(format!("{xid} was rolled back"))),
                _ => {}
            }
            if s.prepare_failed {
                return Err(QuadError::txn(format!("{xid} failed to prepare earlier")));
            }
            if s.rollback_only {
                return Err(QuadError::txn(format!("{xid} is marked rollback-only")));
            }
            (s.id, s.state)
        };
        if state == TxState::ReadOnly {
            self.finish_branch(xid);
            return Ok(Vote::ReadOnly);
        }

        match self.preparing.claim(id) {
            Claim::New => {}
            Claim::Existing(vote) => {
                debug!(%xid, ?vote, "session already prepared");
                if vote == Vote::ReadOnly {
                    self.finish_branch(xid);
                }
                return Ok(vote);
            }
            Claim::Failed => return Err(QuadError::txn(format!("{xid} failed to prepare in another branch"))),
        }

        if let Some(s) = self.sessions.lock().get_mut(&global(xid)) {
            s.state = TxState::Preparing;
        }
        match self.prepare_participants() {
            Err(e) => {
                self.preparing.remove(id);
                if let Some(s) = self.sessions.lock().get_mut(&global(xid)) {
                    s.prepare_failed = true;
                    s.state = TxState::Ended;
                }
                warn!(%xid, error = %e, "prepare failed");
                Err(e)
            }
            Ok((Vote::ReadOnly, _)) => {
                // siblings keep getting the vote until each branch is answered
                let released = match self.sessions.lock().get_mut(&global(xid)) {
                    Some(s) => {
                        s.state = TxState::ReadOnly;
                        self.release_session(s)
                    }
                    None => Ok(()),
                };
                self.preparing.settle(id, Vote::ReadOnly);
                self.finish_branch(xid);
                debug!(%xid, "read-only transaction completed at prepare");
                released?;
                Ok(Vote::ReadOnly)
            }
            Ok((Vote::Ok, phase)) => {
                self.preparing.settle(id, Vote::Ok);
                if let Some(s) = self.sessions.lock().get_mut(&global(xid)) {
                    s.state = TxState::Prepared;
                    s.phase = phase;
                }
                Ok(Vote::Ok)
            }
        }
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let state = {
            let sessions = self.sessions.lock();
            let s = sessions.get(&global(xid)).ok_or_else(|| unknown(xid))?;
            if !s.branches.contains_key(&xid.bqual) {
                return Err(unknown(xid));
            }
            s.state
        };
        match state {
            TxState::Committed => {
                self.finish_branch(xid);
                return Ok(());
            }
            TxState::ReadOnly => {
                self.finish_branch(xid);
                return Err(QuadError::txn(format!("{xid} is read-only; nothing to commit")));
            }
            TxState::RolledBack => return Err(QuadError::txn(format!("{xid} was rolled back"))),
            TxState::Prepared => {}
            _ if one_phase => match self.prepare(xid) {
                Ok(Vote::ReadOnly) => return Ok(()),
                Ok(Vote::Ok) => {}
                Err(e) => {
                    warn!(%xid, error = %e, "one-phase commit failed to prepare; rolling back");
                    if let Err(re) = self.rollback(xid) {
                        warn!(%xid, error = %re, "rollback after failed prepare");
                    }
                    return Err(QuadError::RolledBack(e.to_string()));
                }
            },
            _ => return Err(QuadError::txn(format!("{xid} is not prepared"))),
        }

        let phase = self
            .sessions
            .lock()
            .get(&global(xid))
            .and_then(|s| s.phase)
            .ok_or_else(|| QuadError::consistency(format!("{xid} prepared without a phase")))?;
        let outcome = self.commit_participants(phase);
        let released = self.complete(xid, TxState::Committed);
        outcome?;
        released?;
        info!(%xid, phase, "transaction committed");
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<()> {
        let state = {
            let sessions = self.sessions.lock();
            let s = sessions.get(&global(xid)).ok_or_else(|| unknown(xid))?;
            s.state
        };
        match state {
            TxState::RolledBack | TxState::ReadOnly => {
                self.finish_branch(xid);
                return Ok(());
            }
            TxState::Committed => return Err(QuadError::txn(format!("{xid} already completed"))),
            _ => {}
        }
        let outcome = self.rollback_participants();
        let released = self.complete(xid, TxState::RolledBack);
        outcome?;
        released?;
        info!(%xid, "transaction rolled back");
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<()> {
        let (id, state) = {
            let sessions = self.sessions.lock();
            let s = sessions.get(&global(xid)).ok_or_else(|| unknown(xid))?;
            (s.id, s.state)
        };
        let mut first = None;
        if self.preparing.contains(id) && !matches!(state, TxState::ReadOnly | TxState::Committed | TxState::RolledBack) {
            warn!(%xid, "forgetting a preparing transaction; rolling back");
            if let Err(e) = self.rollback(xid) {
                first.get_or_insert(e);
            }
        }
        let mut sessions = self.sessions.lock();
        if let Some(mut s) = sessions.remove(&global(xid)) {
            if s.releases == 0 {
                if let Err(e) = self.release_session(&mut s) {
                    first.get_or_insert(e);
                }
            }
        }
        self.preparing.remove(id);
        first.map_or(Ok(()), Err)
    }

    fn recover(&self) -> Vec<Xid> {
        let sessions = self.sessions.lock();
        let mut out = Vec::new();
        for ((format_id, gtrid), s) in sessions.iter() {
            if s.state != TxState::Prepared {
                continue;
            }
            for (bqual, b) in &s.branches {
                if !b.done {
                    out.push(Xid { format_id: *format_id, gtrid: gtrid.clone(), bqual: bqual.clone() });
                }
            }
        }
        out
    }
}
