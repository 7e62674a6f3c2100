//! Backup file: a header, the pool's nodes and every statement as four ids.
//!
//! ```text
//! QUADRA BACKUP v1
//! 2026-01-01T00:00:00Z
//! RDFNODES
//! 1 <http://example.org/a>
//! TRIPLES
//! 1 2 3 4
//! END
//! ```
//!
//! The `s p o g` lines are also usable on their own (`dump_statements`,
//! `load_statements`). Files may be zstd compressed; `read_backup` detects the
//! frame magic.

use crate::consts::{NodeId, NONE};
use crate::errors::{QuadError, Result};
use crate::node::NodeValue;
use crate::quad_index::Quad;
use crate::tuples::Tuples;
use serde::Serialize;
use std::io::{BufRead, Write};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const BACKUP_HEADER: &str = "QUADRA BACKUP v1";
const NODES_SECTION: &str = "RDFNODES";
const STATEMENTS_SECTION: &str = "TRIPLES";
const END: &str = "END";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    pub nodes: u64,
    pub statements: u64,
}

/// Parsed backup contents.
#[derive(Debug, Clone, Default)]
pub struct Backup {
    pub created: String,
    pub nodes: Vec<(NodeId, NodeValue)>,
    pub statements: Vec<Quad>,
}

fn bad(line: usize, msg: impl Into<String>) -> QuadError {
    QuadError::Backup { line, msg: msg.into() }
}

/// Writes every row of a four-column statement cursor as `s p o g`.
pub fn dump_statements<W: Write>(statements: &mut dyn Tuples, out: &mut W) -> Result<u64> {
    if statements.width() != 4 {
        return Err(QuadError::InvalidConstraint(format!(
            "statement dump needs 4 columns, got {}",
            statements.width()
        )));
    }
    statements.before_first()?;
    let mut n = 0u64;
    while statements.next()? {
        writeln!(
            out,
            "{} {} {} {}",
            statements.column_value(0)?,
            statements.column_value(1)?,
            statements.column_value(2)?,
            statements.column_value(3)?
        )?;
        n += 1;
    }
    Ok(n)
}

fn parse_statement(line: &str, lineno: usize) -> Result<Quad> {
    let mut q = [NONE; 4];
    let mut parts = line.split_whitespace();
    for slot in q.iter_mut() {
        let p = parts.next().ok_or_else(|| bad(lineno, "expected four node ids"))?;
        *slot = p.parse().map_err(|_| bad(lineno, format!("bad node id {p:?}")))?;
        if *slot <= NONE {
            return Err(bad(lineno, format!("node id {slot} out of range")));
        }
    }
    if parts.next().is_some() {
        return Err(bad(lineno, "trailing data after statement"));
    }
    Ok(q)
}

/// Reads `s p o g` lines; blank lines are skipped.
pub fn load_statements<R: BufRead>(input: R) -> Result<Vec<Quad>> {
    let mut out = Vec::new();
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(parse_statement(&line, i + 1)?);
    }
    Ok(out)
}

/// Writes a full backup; `nodes` should be in value order.
pub fn write_backup<W: Write>(
    out: &mut W,
    created: OffsetDateTime,
    nodes: &[(NodeId, NodeValue)],
    statements: &mut dyn Tuples,
) -> Result<BackupStats> {
    let stamp = created.format(&Rfc3339).map_err(|e| bad(2, e.to_string()))?;
    writeln!(out, "{BACKUP_HEADER}")?;
    writeln!(out, "{stamp}")?;
    writeln!(out, "{NODES_SECTION}")?;
    for (id, value) in nodes {
        writeln!(out, "{id} {value}")?;
    }
    writeln!(out, "{STATEMENTS_SECTION}")?;
    let statements = dump_statements(statements, out)?;
    writeln!(out, "{END}")?;
    Ok(BackupStats { nodes: nodes.len() as u64, statements })
}

pub fn compress(text: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(text, ZSTD_LEVEL)?)
}

pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&ZSTD_MAGIC)
}

pub fn read_backup(bytes: &[u8]) -> Result<Backup> {
    let plain;
    let bytes = if is_compressed(bytes) {
        plain = zstd::decode_all(bytes)?;
        &plain[..]
    } else {
        bytes
    };
    let text = std::str::from_utf8(bytes).map_err(|e| bad(0, e.to_string()))?;

    enum Section {
        Header,
        Stamp,
        Marker,
        Nodes,
        Statements,
        Done,
    }
    let mut section = Section::Header;
    let mut backup = Backup::default();
    for (i, line) in text.lines().enumerate() {
        let lineno = i + 1;
        match section {
            Section::Header if line == BACKUP_HEADER => section = Section::Stamp,
            Section::Header => return Err(bad(lineno, format!("expected {BACKUP_HEADER:?}"))),
            Section::Stamp => {
                backup.created = line.to_string();
                section = Section::Marker;
            }
            Section::Marker if line == NODES_SECTION => section = Section::Nodes,
            Section::Marker => return Err(bad(lineno, format!("expected {NODES_SECTION}"))),
            Section::Nodes if line == STATEMENTS_SECTION => section = Section::Statements,
            Section::Nodes => {
                let (id, term) = line.split_once(' ').ok_or_else(|| bad(lineno, "expected `id term`"))?;
                let id: NodeId = id.parse().map_err(|_| bad(lineno, format!("bad node id {id:?}")))?;
                let value: NodeValue = term.parse().map_err(|e: QuadError| bad(lineno, e.to_string()))?;
                backup.nodes.push((id, value));
            }
            Section::Statements if line == END => section = Section::Done,
            Section::Statements if line.trim().is_empty() => {}
            Section::Statements => backup.statements.push(parse_statement(line, lineno)?),
            Section::Done if line.trim().is_empty() => {}
            Section::Done => return Err(bad(lineno, "data after END")),
        }
    }
    match section {
        Section::Done => Ok(backup),
        _ => Err(bad(text.lines().count(), "truncated backup")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuples::{RowTuples, Variable};
    use time::macros::datetime;

    fn statements(rows: Vec<Vec<NodeId>>) -> RowTuples {
        let vars = ["subject", "predicate", "object", "graph"].map(Variable::new).to_vec();
        RowTuples::new(vars, rows).unwrap()
    }

    #[test]
    fn statement_lines() {
        let mut buf = Vec::new();
        let n = dump_statements(&mut statements(vec![vec![1, 2, 3, 9], vec![5, 2, 3, 9]]), &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), "1 2 3 9\n5 2 3 9\n");
        assert_eq!(load_statements(&buf[..]).unwrap(), vec![[1, 2, 3, 9], [5, 2, 3, 9]]);

        match load_statements(&b"1 2 3 9\n\n1 2 x 9\n"[..]) {
            Err(QuadError::Backup { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert!(load_statements(&b"1 2 3\n"[..]).is_err());
        assert!(load_statements(&b"1 2 3 0\n"[..]).is_err());
    }

    #[test]
    fn full_backup_layout() {
        let nodes = vec![(1, NodeValue::uri("http://ex/a")), (2, NodeValue::lang("chat", "fr"))];
        let mut buf = Vec::new();
        let stats =
            write_backup(&mut buf, datetime!(2026-03-01 12:00 UTC), &nodes, &mut statements(vec![vec![1, 1, 2, 1]]))
                .unwrap();
        assert_eq!(stats, BackupStats { nodes: 2, statements: 1 });
        let text = String::from_utf8(buf.clone()).unwrap();
        assert_eq!(
            text,
            "QUADRA BACKUP v1\n2026-03-01T12:00:00Z\nRDFNODES\n1 <http://ex/a>\n2 \"chat\"@fr\nTRIPLES\n1 1 2 1\nEND\n"
        );

        let back = read_backup(&buf).unwrap();
        assert_eq!(back.created, "2026-03-01T12:00:00Z");
        assert_eq!(back.nodes, nodes);
        assert_eq!(back.statements, vec![[1, 1, 2, 1]]);

        let packed = compress(&buf).unwrap();
        assert!(is_compressed(&packed));
        assert_eq!(read_backup(&packed).unwrap().statements, back.statements);
    }

    #[test]
    fn malformed_backups() {
        assert!(read_backup(b"NOT A BACKUP\n").is_err());
        assert!(read_backup(b"QUADRA BACKUP v1\nnow\nRDFNODES\n1 <a>\nTRIPLES\n1 1 1 1\n").is_err());
        match read_backup(b"QUADRA BACKUP v1\nnow\nRDFNODES\n1 nonsense\nTRIPLES\nEND\n") {
            Err(QuadError::Backup { line, .. }) => assert_eq!(line, 4),
            other => panic!("unexpected {other:?}"),
        }
    }
}
