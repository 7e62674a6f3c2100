use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;

use quadra_core::{
    Constraint, NodeId, NodeRef, NodeValue, QuadStore, StoreConfig, Tuples, NONE,
};

#[derive(Parser)]
#[command(name = "quadra", about = "Quadra quad store CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a store directory with a default config.
    Init {
        #[arg(long)]
        dir: PathBuf,
        /// Skip fsync on publish.
        #[arg(long, default_value_t = false)]
        no_sync: bool,
        /// zstd-compress backups.
        #[arg(long, default_value_t = false)]
        compress_backups: bool,
    },

    /// Insert one statement; positions are N-Triples terms.
    Insert {
        #[command(flatten)]
        stmt: StatementArgs,
    },

    /// Delete one statement.
    Delete {
        #[command(flatten)]
        stmt: StatementArgs,
    },

    /// Resolve a pattern. Each position is a term, `#id` or `?var`.
    Query {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = "?s")]
        subject: String,
        #[arg(long, default_value = "?p")]
        predicate: String,
        #[arg(long, default_value = "?o")]
        object: String,
        #[arg(long, default_value = "?g")]
        graph: String,
        /// Print node values instead of ids.
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },

    /// Show the value of `--id`, or the id of `--term`.
    Node {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, value_name = "ID", conflicts_with = "term")]
        id: Option<NodeId>,
        #[arg(long, value_name = "TERM")]
        term: Option<String>,
    },

    Backup {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    Restore {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        input: PathBuf,
    },

    Info {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[derive(clap::Args)]
struct StatementArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long)]
    graph: String,
    #[arg(long)]
    subject: String,
    #[arg(long)]
    predicate: String,
    #[arg(long)]
    object: String,
}

impl StatementArgs {
    fn terms(&self) -> Result<[NodeValue; 4]> {
        Ok([
            parse_term(&self.subject)?,
            parse_term(&self.predicate)?,
            parse_term(&self.object)?,
            parse_term(&self.graph)?,
        ])
    }
}

fn parse_term(s: &str) -> Result<NodeValue> {
    s.parse().map_err(|e| anyhow!("bad term {s:?}: {e}"))
}

fn open_store(dir: &Path) -> Result<QuadStore> {
    if !dir.exists() {
        bail!("no store at {} (run `quadra init` first)", dir.display());
    }
    Ok(QuadStore::open(dir)?)
}

/// `None` when the term is not in the pool, so nothing can match.
fn parse_ref(store: &QuadStore, s: &str) -> Result<Option<NodeRef>> {
    if let Some(name) = s.strip_prefix('?') {
        if name.is_empty() {
            bail!("empty variable name");
        }
        return Ok(Some(NodeRef::var(name)));
    }
    if let Some(id) = s.strip_prefix('#') {
        let id: NodeId = id.parse().map_err(|_| anyhow!("bad node id {s:?}"))?;
        return Ok(Some(NodeRef::Fixed(id)));
    }
    let id = store.lookup(&parse_term(s)?)?;
    Ok((id != NONE).then_some(NodeRef::Fixed(id)))
}

fn render(store: &QuadStore, id: NodeId, pretty: bool) -> String {
    if !pretty {
        return id.to_string();
    }
    match store.globalize(id) {
        Ok(v) => v.to_string(),
        Err(_) => format!("#{id}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init { dir, no_sync, compress_backups } => {
            let cfg = StoreConfig { sync_writes: !no_sync, compress_backups, ..StoreConfig::default() };
            QuadStore::init(&dir, cfg)?;
            println!("init: {}", dir.display());
        }
        Cmd::Insert { stmt } => {
            let store = open_store(&stmt.dir)?;
            let terms = stmt.terms()?;
            let n = store.with_write(|s| {
                let mut ids = [NONE; 4];
                for (slot, term) in ids.iter_mut().zip(&terms) {
                    *slot = s.localize(term)?;
                }
                s.modify_statements(ids[3], [(ids[0], ids[1], ids[2])], true)
            })?;
            println!("inserted: {n}");
        }
        Cmd::Delete { stmt } => {
            let store = open_store(&stmt.dir)?;
            let mut ids = [NONE; 4];
            for (slot, term) in ids.iter_mut().zip(stmt.terms()?) {
                *slot = store.lookup(&term)?;
            }
            let n = if ids.contains(&NONE) {
                debug!("statement uses unknown terms");
                0
            } else {
                store.modify_statements(ids[3], [(ids[0], ids[1], ids[2])], false)?
            };
            println!("deleted: {n}");
        }
        Cmd::Query { dir, subject, predicate, object, graph, pretty } => {
            let store = open_store(&dir)?;
            let mut refs = Vec::with_capacity(4);
            for s in [&subject, &predicate, &object, &graph] {
                refs.push(parse_ref(&store, s)?);
            }
            let Some(refs) = refs.into_iter().collect::<Option<Vec<_>>>() else {
                println!("rows: 0");
                return Ok(());
            };
            let [s, p, o, g]: [NodeRef; 4] = refs.try_into().map_err(|_| anyhow!("expected four positions"))?;
            let mut res = store.resolve(Constraint::new(s, p, o, g))?;
            let header: Vec<String> = res.variables().iter().map(|v| v.to_string()).collect();
            println!("{}", header.join("\t"));
            res.before_first()?;
            let mut rows = 0u64;
            while res.next()? {
                let cells: Vec<String> = (0..res.width())
                    .map(|i| res.column_value(i).map(|id| render(&store, id, pretty)))
                    .collect::<Result<_, _>>()?;
                println!("{}", cells.join("\t"));
                rows += 1;
            }
            res.close()?;
            println!("rows: {rows}");
        }
        Cmd::Node { dir, id, term } => {
            let store = open_store(&dir)?;
            match (id, term) {
                (Some(id), _) => println!("{}", store.globalize(id)?),
                (None, Some(term)) => {
                    let id = store.lookup(&parse_term(&term)?)?;
                    if id == NONE {
                        bail!("unknown term {term}");
                    }
                    println!("#{id}");
                }
                (None, None) => bail!("pass --id or --term"),
            }
        }
        Cmd::Backup { dir, out } => {
            let store = open_store(&dir)?;
            let stats = store.backup(&out)?;
            println!("backup: {} nodes={} statements={}", out.display(), stats.nodes, stats.statements);
        }
        Cmd::Restore { dir, input } => {
            let store = open_store(&dir)?;
            let stats = store.restore(&input)?;
            println!("restore: nodes={} statements={}", stats.nodes, stats.statements);
        }
        Cmd::Info { dir } => {
            let store = open_store(&dir)?;
            let info = store.info()?;
            println!("dir       : {}", info.dir.display());
            println!("phase     : {}", info.phase);
            println!("statements: {}", info.statements);
            println!("nodes     : {}", info.nodes);
            println!("next node : {}", info.next_node);
            println!("phases    : index={:?} pool={:?}", info.index_phases, info.pool_phases);
            println!("sync      : {}", info.config.sync_writes);
        }
    }
    Ok(())
}
