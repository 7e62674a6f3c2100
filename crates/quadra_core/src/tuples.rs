//! Cursor contract shared by constraint resolutions and sorted relations.

use crate::consts::NodeId;
use crate::errors::{QuadError, Result};
use std::fmt;

/// A named query variable. Names starting with `*` are internal bookkeeping
/// and never exposed as result columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(String);

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Variable(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_internal(&self) -> bool {
        self.0.starts_with('*')
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl From<&str> for Variable {
    fn from(s: &str) -> Self {
        Variable::new(s.trim_start_matches('?'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cardinality {
    Zero,
    One,
    Many,
}

impl Cardinality {
    pub fn from_count(n: u64) -> Self {
        match n {
            0 => Cardinality::Zero,
            1 => Cardinality::One,
            _ => Cardinality::Many,
        }
    }
}

/// A positioned cursor over fixed-width rows of node ids.
///
/// `before_first_prefix` binds the leading columns; `next` then walks rows
/// with that prefix in the cursor's physical order.
pub trait Tuples {
    /// Result columns in physical order.
    fn variables(&self) -> &[Variable];

    fn width(&self) -> usize {
        self.variables().len()
    }

    fn column_index(&self, v: &Variable) -> Option<usize> {
        self.variables().iter().position(|x| x == v)
    }

    fn before_first(&mut self) -> Result<()> {
        self.before_first_prefix(&[], 0)
    }

    fn before_first_prefix(&mut self, prefix: &[NodeId], suffix_truncation: usize) -> Result<()>;

    fn next(&mut self) -> Result<bool>;

    fn column_value(&self, column: usize) -> Result<NodeId>;

    /// Total rows, independent of positioning. Computed once.
    fn row_count(&mut self) -> Result<u64>;

    fn cardinality(&mut self) -> Result<Cardinality>;

    fn close(&mut self) -> Result<()>;

    /// Current row as a vector.
    fn row(&self) -> Result<Vec<NodeId>> {
        (0..self.width()).map(|i| self.column_value(i)).collect()
    }
}

/// Rows held in memory, in the order given. Used to feed the materializer
/// from outside the index.
#[derive(Debug, Clone)]
pub struct RowTuples {
    variables: Vec<Variable>,
    rows: Vec<Vec<NodeId>>,
    prefix: Vec<NodeId>,
    pos: Option<usize>,
    next_pos: usize,
    closed: bool,
}

impl RowTuples {
    pub fn new(variables: Vec<Variable>, rows: Vec<Vec<NodeId>>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|r| r.len() != variables.len()) {
            return Err(QuadError::InvalidConstraint(format!(
                "row of width {} for {} columns",
                bad.len(),
                variables.len()
            )));
        }
        Ok(Self { variables, rows, prefix: Vec::new(), pos: None, next_pos: 0, closed: false })
    }
}

impl Tuples for RowTuples {
    fn variables(&self) -> &[Variable] {
        &self.variables
    }

    fn before_first_prefix(&mut self, prefix: &[NodeId], suffix_truncation: usize) -> Result<()> {
        if self.closed {
            return Err(QuadError::AlreadyClosed);
        }
        if suffix_truncation != 0 {
            return Err(QuadError::SuffixTruncation);
        }
        if prefix.len() > self.variables.len() {
            return Err(QuadError::Prefix(format!("{} values for {} columns", prefix.len(), self.variables.len())));
        }
        self.prefix = prefix.to_vec();
        self.pos = None;
        self.next_pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(QuadError::AlreadyClosed);
        }
        let n = self.prefix.len();
        while self.next_pos < self.rows.len() {
            let i = self.next_pos;
            self.next_pos += 1;
            if self.rows[i][..n] == self.prefix[..] {
                self.pos = Some(i);
                return Ok(true);
            }
        }
        self.pos = None;
        Ok(false)
    }

    fn column_value(&self, column: usize) -> Result<NodeId> {
        let i = self.pos.ok_or_else(|| QuadError::Prefix("cursor is not on a row".into()))?;
        self.rows[i]
            .get(column)
            .copied()
            .ok_or_else(|| QuadError::Prefix(format!("no column {column}")))
    }

    fn row_count(&mut self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    fn cardinality(&mut self) -> Result<Cardinality> {
        Ok(Cardinality::from_count(self.rows.len() as u64))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(QuadError::AlreadyClosed);
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_filters_rows() {
        let vars = vec![Variable::new("a"), Variable::new("b")];
        let mut t = RowTuples::new(vars, vec![vec![1, 2], vec![3, 4], vec![1, 5]]).unwrap();
        t.before_first_prefix(&[1], 0).unwrap();
        let mut seen = Vec::new();
        while t.next().unwrap() {
            seen.push(t.column_value(1).unwrap());
        }
        assert_eq!(seen, vec![2, 5]);
        assert!(matches!(t.before_first_prefix(&[], 1), Err(QuadError::SuffixTruncation)));
        t.close().unwrap();
        assert!(matches!(t.close(), Err(QuadError::AlreadyClosed)));
    }

    #[test]
    fn variable_names() {
        assert_eq!(Variable::from("?x"), Variable::new("x"));
        assert_eq!(Variable::new("x").to_string(), "?x");
        assert!(Variable::new("*g").is_internal());
        assert!(RowTuples::new(vec![Variable::new("a")], vec![vec![1, 2]]).is_err());
    }
}
