//! Constraint resolution: a quad pattern of fixed ids and variables becomes a
//! cursor over one physical order of the quad index whose leading columns are
//! the fixed positions.

use crate::consts::{NodeId, NONE};
use crate::errors::{QuadError, Result};
use crate::quad_index::{ColumnOrder, IndexCursor, Phase};
use crate::tuples::{Cardinality, Tuples, Variable};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Prefix marker for a column the caller will bind through `before_first_prefix`.
pub const PENDING: NodeId = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Fixed(NodeId),
    Var(Variable),
}

impl NodeRef {
    pub fn var(name: &str) -> Self {
        NodeRef::Var(Variable::from(name))
    }

    pub fn as_fixed(&self) -> Option<NodeId> {
        match self {
            NodeRef::Fixed(n) => Some(*n),
            NodeRef::Var(_) => None,
        }
    }

    pub fn as_var(&self) -> Option<&Variable> {
        match self {
            NodeRef::Var(v) => Some(v),
            NodeRef::Fixed(_) => None,
        }
    }
}

impl From<NodeId> for NodeRef {
    fn from(n: NodeId) -> Self {
        NodeRef::Fixed(n)
    }
}

impl From<Variable> for NodeRef {
    fn from(v: Variable) -> Self {
        NodeRef::Var(v)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Fixed(n) => write!(f, "#{n}"),
            NodeRef::Var(v) => write!(f, "{v}"),
        }
    }
}

/// (subject, predicate, object, graph) pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint([NodeRef; 4]);

impl Constraint {
    pub fn new(s: impl Into<NodeRef>, p: impl Into<NodeRef>, o: impl Into<NodeRef>, g: impl Into<NodeRef>) -> Self {
        Constraint([s.into(), p.into(), o.into(), g.into()])
    }

    /// Every statement in the store, in SPOG order.
    pub fn all_statements() -> Self {
        Constraint::new(
            NodeRef::var("subject"),
            NodeRef::var("predicate"),
            NodeRef::var("object"),
            NodeRef::var("graph"),
        )
    }

    pub fn element(&self, pos: usize) -> &NodeRef {
        &self.0[pos]
    }

    pub fn elements(&self) -> &[NodeRef; 4] {
        &self.0
    }

    pub fn bound_vector(&self) -> [bool; 4] {
        [0, 1, 2, 3].map(|i| self.0[i].as_fixed().is_some())
    }

    fn repeated_variable(&self) -> Option<&Variable> {
        let vars: Vec<&Variable> = self.0.iter().filter_map(NodeRef::as_var).collect();
        for (i, v) in vars.iter().enumerate() {
            if vars[i + 1..].contains(v) {
                return Some(*v);
            }
        }
        None
    }

    /// Replaces bound variables; `None` when no element changed.
    pub fn substitute(&self, bindings: &HashMap<Variable, NodeId>) -> Option<Constraint> {
        let mut changed = false;
        let next = self.0.clone().map(|e| match e {
            NodeRef::Var(v) => match bindings.get(&v) {
                Some(&n) => {
                    changed = true;
                    NodeRef::Fixed(n)
                }
                None => NodeRef::Var(v),
            },
            fixed => fixed,
        });
        changed.then_some(Constraint(next))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {} {})", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Order with the bound positions leading, followed by the longest run of
/// pending positions, and the length of that run.
fn choose_order(bound: [bool; 4], pending: [bool; 4]) -> (ColumnOrder, usize) {
    let nb = bound.iter().filter(|b| **b).count();
    ColumnOrder::all()
        .filter(|o| o.columns()[..nb].iter().all(|&p| bound[p]))
        .map(|o| (o, o.columns()[nb..].iter().take_while(|&&p| pending[p]).count()))
        .fold(None, |best: Option<(ColumnOrder, usize)>, cand| match best {
            Some(b) if b.1 >= cand.1 => Some(b),
            _ => Some(cand),
        })
        .unwrap_or_else(|| (ColumnOrder::for_bound(bound), 0))
}

/// Cursor over the bindings of a [`Constraint`]. Clones share the index
/// snapshot and keep their own position.
#[derive(Debug, Clone)]
pub struct Resolution {
    constraint: Constraint,
    pending: Vec<Variable>,
    order: ColumnOrder,
    /// Physical column order: fixed id, [`PENDING`] or `NONE`.
    prefix: [NodeId; 4],
    fixed_len: usize,
    variables: Vec<Variable>,
    var_columns: Vec<usize>,
    cursor: IndexCursor,
    placeholder: bool,
    row_count: Option<u64>,
    cardinality: Option<Cardinality>,
    scanned: u64,
    closed: bool,
}

impl Resolution {
    pub fn new(phase: Arc<Phase>, constraint: Constraint) -> Result<Self> {
        Self::with_pending(phase, constraint, &[])
    }

    /// Resolves with `pending` variables placed directly after the fixed
    /// columns when some order allows it, so callers can bind them later
    /// through `before_first_prefix`.
    pub fn with_pending(phase: Arc<Phase>, constraint: Constraint, pending: &[Variable]) -> Result<Self> {
        if constraint.0.iter().any(|e| e.as_fixed() == Some(NONE)) {
            return Err(QuadError::InvalidConstraint(format!("{constraint} contains the empty node")));
        }
        let placeholder = constraint.0.iter().any(|e| matches!(e.as_fixed(), Some(n) if n < NONE));
        if !placeholder {
            if let Some(v) = constraint.repeated_variable() {
                return Err(QuadError::RepeatingConstraint(v.to_string()));
            }
        }

        let bound = constraint.bound_vector();
        let pending_pos = [0, 1, 2, 3].map(|i| matches!(constraint.0[i].as_var(), Some(v) if pending.contains(v)));
        let (order, pending_len) = choose_order(bound, pending_pos);
        let cols = order.columns();

        let mut prefix = [NONE; 4];
        for (k, &pos) in cols.iter().enumerate() {
            prefix[k] = match &constraint.0[pos] {
                NodeRef::Fixed(n) => *n,
                NodeRef::Var(_) => NONE,
            };
        }
        let fixed_len = prefix.iter().take_while(|&&n| n != NONE).count();
        // Only pending columns adjacent to the fixed ones can be bound later.
        for slot in prefix.iter_mut().skip(fixed_len).take(pending_len) {
            *slot = PENDING;
        }
        if !placeholder && prefix[fixed_len..].iter().any(|&n| n > NONE) {
            return Err(QuadError::consistency(format!(
                "prefix {prefix:?} for {constraint} under {order} has a hole"
            )));
        }

        let mut variables = Vec::new();
        let mut var_columns = Vec::new();
        for (k, &pos) in cols.iter().enumerate().skip(fixed_len) {
            if let NodeRef::Var(v) = &constraint.0[pos] {
                if !v.is_internal() {
                    variables.push(v.clone());
                    var_columns.push(k);
                }
            }
        }

        let mut cursor = IndexCursor::new(phase, order);
        if placeholder {
            debug!(%constraint, "unresolved placeholder node; empty resolution");
            cursor.seek_empty();
        } else {
            debug!(%constraint, %order, ?prefix, "constraint resolved");
            cursor.seek(&prefix[..fixed_len]);
        }

        Ok(Self {
            constraint,
            pending: pending.to_vec(),
            order,
            prefix,
            fixed_len,
            variables,
            var_columns,
            cursor,
            placeholder,
            row_count: None,
            cardinality: None,
            scanned: 0,
            closed: false,
        })
    }

    pub fn constraint(&self) -> &Constraint {
        &self.constraint
    }

    pub fn order(&self) -> ColumnOrder {
        self.order
    }

    pub fn prefix(&self) -> &[NodeId; 4] {
        &self.prefix
    }

    /// Physical column of each exposed variable.
    pub fn variable_columns(&self) -> &[usize] {
        &self.var_columns
    }

    /// Rows pulled by counting and cardinality checks so far.
    pub fn rows_scanned(&self) -> u64 {
        self.scanned
    }

    /// Fresh resolution with `bindings` substituted, or `None` when none of
    /// them applies and this cursor is still valid.
    pub fn reresolve(&self, bindings: &HashMap<Variable, NodeId>) -> Result<Option<Resolution>> {
        let Some(next) = self.constraint.substitute(bindings) else {
            return Ok(None);
        };
        let pending: Vec<Variable> = self.pending.iter().filter(|v| !bindings.contains_key(*v)).cloned().collect();
        Resolution::with_pending(Arc::clone(self.cursor.phase()), next, &pending).map(Some)
    }

    fn fresh_scan(&self) -> IndexCursor {
        let mut c = IndexCursor::new(Arc::clone(self.cursor.phase()), self.order);
        if self.placeholder {
            c.seek_empty();
        } else {
            c.seek(&self.prefix[..self.fixed_len]);
        }
        c
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(QuadError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl Tuples for Resolution {
    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn before_first_prefix(&mut self, extra: &[NodeId], suffix_truncation: usize) -> Result<()> {
        self.check_open()?;
        if suffix_truncation != 0 {
            return Err(QuadError::SuffixTruncation);
        }
        if self.placeholder {
            self.cursor.seek_empty();
            return Ok(());
        }
        if self.fixed_len + extra.len() > 4 {
            return Err(QuadError::Prefix(format!(
                "{} prefix values after {} fixed columns",
                extra.len(),
                self.fixed_len
            )));
        }
        if extra.contains(&NONE) {
            return Err(QuadError::Prefix("empty node in prefix".into()));
        }
        if extra.iter().any(|&n| n < NONE) {
            debug!(constraint = %self.constraint, ?extra, "unbound join value; empty scan");
            self.cursor.seek_empty();
            return Ok(());
        }
        let mut full = self.prefix[..self.fixed_len].to_vec();
        full.extend_from_slice(extra);
        self.cursor.seek(&full);
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        self.check_open()?;
        Ok(self.cursor.next())
    }

    fn column_value(&self, column: usize) -> Result<NodeId> {
        let k = *self
            .var_columns
            .get(column)
            .ok_or_else(|| QuadError::Prefix(format!("no column {column}")))?;
        let row = self.cursor.row().ok_or_else(|| QuadError::Prefix("cursor is not on a row".into()))?;
        Ok(row[k])
    }

    fn row_count(&mut self) -> Result<u64> {
        self.check_open()?;
        if let Some(n) = self.row_count {
            return Ok(n);
        }
        let mut scan = self.fresh_scan();
        let mut n = 0u64;
        while scan.next() {
            n += 1;
        }
        self.scanned += n;
        self.row_count = Some(n);
        self.cardinality = Some(Cardinality::from_count(n));
        Ok(n)
    }

    fn cardinality(&mut self) -> Result<Cardinality> {
        self.check_open()?;
        if let Some(c) = self.cardinality {
            return Ok(c);
        }
        let mut scan = self.fresh_scan();
        let mut n = 0u64;
        while n < 2 && scan.next() {
            n += 1;
        }
        self.scanned += n;
        let c = Cardinality::from_count(n);
        self.cardinality = Some(c);
        Ok(c)
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        self.cursor.seek_empty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::quad_index::QuadIndex;
    use tempfile::tempdir;

    fn phase(quads: &[[NodeId; 4]]) -> Arc<Phase> {
        let tmp = tempdir().unwrap();
        let mut idx = QuadIndex::open(tmp.path(), &StoreConfig::default()).unwrap();
        for q in quads {
            idx.add(*q).unwrap();
        }
        idx.working()
    }

    fn rows(r: &mut Resolution) -> Vec<Vec<NodeId>> {
        r.before_first().unwrap();
        let mut out = Vec::new();
        while r.next().unwrap() {
            out.push(r.row().unwrap());
        }
        out
    }

    fn sample() -> Arc<Phase> {
        phase(&[[1, 2, 3, 9], [1, 2, 4, 9], [5, 2, 3, 9]])
    }

    #[test]
    fn bound_positions_lead_the_order() {
        let p = sample();
        let mut r = Resolution::new(p.clone(), Constraint::new(1, 2, NodeRef::var("o"), 9)).unwrap();
        assert_eq!(r.variables(), &[Variable::new("o")]);
        assert_eq!(rows(&mut r), vec![vec![3], vec![4]]);

        let mut r = Resolution::new(p, Constraint::new(NodeRef::var("s"), 2, 3, NodeRef::var("g"))).unwrap();
        assert_eq!(r.order().name(), "POSG");
        assert_eq!(r.variables(), &[Variable::new("s"), Variable::new("g")]);
        assert_eq!(rows(&mut r), vec![vec![1, 9], vec![5, 9]]);
    }

    #[test]
    fn repeating_variable_is_rejected() {
        let c = Constraint::new(NodeRef::var("x"), 2, NodeRef::var("x"), 9);
        assert!(matches!(Resolution::new(sample(), c), Err(QuadError::RepeatingConstraint(_))));
        let c = Constraint::new(NONE, 2, NodeRef::var("x"), 9);
        assert!(matches!(Resolution::new(sample(), c), Err(QuadError::InvalidConstraint(_))));
    }

    #[test]
    fn placeholder_ids_resolve_empty() {
        let mut r = Resolution::new(sample(), Constraint::new(-7, 2, NodeRef::var("o"), 9)).unwrap();
        assert!(rows(&mut r).is_empty());
        assert_eq!(r.cardinality().unwrap(), Cardinality::Zero);
        assert_eq!(r.rows_scanned(), 0);
    }

    #[test]
    fn extra_prefix_binds_leading_free_columns() {
        let mut r = Resolution::new(sample(), Constraint::new(NodeRef::var("s"), 2, NodeRef::var("o"), 9)).unwrap();
        assert_eq!(r.order().name(), "GPOS");
        assert_eq!(r.variables(), &[Variable::new("o"), Variable::new("s")]);
        r.before_first_prefix(&[3], 0).unwrap();
        let mut subjects = Vec::new();
        while r.next().unwrap() {
            subjects.push(r.column_value(1).unwrap());
        }
        assert_eq!(subjects, vec![1, 5]);

        r.before_first_prefix(&[PENDING], 0).unwrap();
        assert!(!r.next().unwrap());
        assert!(r.before_first_prefix(&[3, 1, 1], 0).is_err());
        assert!(matches!(r.before_first_prefix(&[], 2), Err(QuadError::SuffixTruncation)));
    }

    #[test]
    fn pending_variables_follow_fixed_columns() {
        let c = Constraint::new(NodeRef::var("s"), 2, NodeRef::var("o"), 9);
        let r = Resolution::with_pending(sample(), c, &[Variable::new("o")]).unwrap();
        assert_eq!(r.order().name(), "GPOS");
        assert_eq!(r.prefix(), &[9, 2, PENDING, NONE]);
        assert_eq!(r.variable_columns(), &[2, 3]);
    }

    #[test]
    fn pending_columns_never_skip_a_free_column() {
        let c = Constraint::new(NodeRef::var("s"), NodeRef::var("p"), 3, NodeRef::var("g"));
        let r = Resolution::with_pending(sample(), c, &[Variable::new("s"), Variable::new("g")]).unwrap();
        assert_eq!(r.order().name(), "OSPG");
        assert_eq!(r.prefix(), &[3, PENDING, NONE, NONE]);

        let c = Constraint::new(NodeRef::var("s"), 2, NodeRef::var("o"), NodeRef::var("g"));
        let mut r = Resolution::with_pending(sample(), c, &[Variable::new("s")]).unwrap();
        assert_eq!(r.order().name(), "POSG");
        assert_eq!(r.prefix(), &[2, NONE, NONE, NONE]);
        assert_eq!(r.variables()[0], Variable::new("o"));
        r.before_first_prefix(&[3], 0).unwrap();
        let mut subjects = Vec::new();
        while r.next().unwrap() {
            subjects.push(r.column_value(1).unwrap());
        }
        assert_eq!(subjects, vec![1, 5]);
    }

    #[test]
    fn rebinding_matches_a_fresh_resolution() {
        let p = sample();
        let r = Resolution::new(p.clone(), Constraint::new(NodeRef::var("x"), 2, NodeRef::var("y"), NodeRef::var("g")))
            .unwrap();
        let mut bindings = HashMap::new();
        bindings.insert(Variable::new("x"), 1);
        let mut rebound = r.reresolve(&bindings).unwrap().unwrap();
        let mut fresh = Resolution::new(p, Constraint::new(1, 2, NodeRef::var("y"), NodeRef::var("g"))).unwrap();
        assert_eq!(rebound.variables(), fresh.variables());
        assert_eq!(rows(&mut rebound), rows(&mut fresh));
        assert_eq!(rows(&mut rebound), vec![vec![3, 9], vec![4, 9]]);

        let mut unrelated = HashMap::new();
        unrelated.insert(Variable::new("z"), 5);
        assert!(r.reresolve(&unrelated).unwrap().is_none());
    }

    #[test]
    fn cardinality_reads_at_most_two_rows() {
        let quads: Vec<[NodeId; 4]> = (1..=50).map(|o| [1, 2, o, 9]).collect();
        let p = phase(&quads);
        let mut one = Resolution::new(p.clone(), Constraint::new(1, 2, 7, NodeRef::var("g"))).unwrap();
        assert_eq!(one.cardinality().unwrap(), Cardinality::One);
        assert!(one.rows_scanned() <= 2);

        let mut many = Resolution::new(p, Constraint::new(1, 2, NodeRef::var("o"), 9)).unwrap();
        assert_eq!(many.cardinality().unwrap(), Cardinality::Many);
        assert_eq!(many.rows_scanned(), 2);
        assert_eq!(many.row_count().unwrap(), 50);
        assert_eq!(many.row_count().unwrap(), 50);
        assert_eq!(many.rows_scanned(), 52);
    }

    #[test]
    fn clones_scan_independently() {
        let mut a = Resolution::new(sample(), Constraint::all_statements()).unwrap();
        a.before_first().unwrap();
        assert!(a.next().unwrap());
        let mut b = a.clone();
        assert!(b.next().unwrap());
        assert_eq!(a.row().unwrap(), vec![1, 2, 3, 9]);
        assert_eq!(b.row().unwrap(), vec![1, 2, 4, 9]);
        a.close().unwrap();
        assert!(matches!(a.close(), Err(QuadError::AlreadyClosed)));
        assert!(b.next().unwrap());
    }
}
