use quadra_core::{
    Cardinality, Constraint, NodeRef, NodeValue, QuadError, QuadStore, StoreConfig, Tuples, Variable, ID_ORDER,
    NONE, VALUE_ORDER,
};
use std::collections::{HashMap, HashSet};
use tempfile::tempdir;

fn cfg() -> StoreConfig {
    StoreConfig { sync_writes: false, ..StoreConfig::default() }
}

fn rows(t: &mut dyn Tuples) -> Vec<Vec<i64>> {
    t.before_first().unwrap();
    let mut out = Vec::new();
    while t.next().unwrap() {
        out.push(t.row().unwrap());
    }
    out
}

fn statements(store: &QuadStore) -> HashSet<[NodeValue; 4]> {
    let mut all = store.resolve(Constraint::all_statements()).unwrap();
    rows(&mut all)
        .into_iter()
        .map(|r| [0, 1, 2, 3].map(|i| store.globalize(r[i]).unwrap()))
        .collect()
}

#[test]
fn insert_and_resolve_patterns() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    let n = store.modify_statements(9, [(1, 2, 3), (1, 2, 4), (5, 2, 3)], true).unwrap();
    assert_eq!(n, 3);

    let mut r = store.resolve(Constraint::new(1, 2, NodeRef::var("o"), 9)).unwrap();
    assert_eq!(rows(&mut r), vec![vec![3], vec![4]]);

    let mut r = store.resolve(Constraint::new(NodeRef::var("s"), 2, 3, NodeRef::var("g"))).unwrap();
    assert_eq!(r.variables(), &[Variable::new("s"), Variable::new("g")]);
    assert_eq!(rows(&mut r), vec![vec![1, 9], vec![5, 9]]);

    assert_eq!(store.modify_statements(9, [(1, 2, NONE)], false).unwrap(), 2);
    let mut r = store.resolve(Constraint::all_statements()).unwrap();
    assert_eq!(rows(&mut r), vec![vec![5, 2, 3, 9]]);
    assert_eq!(r.cardinality().unwrap(), Cardinality::One);
}

#[test]
fn committed_statements_survive_reopen() {
    let tmp = tempdir().unwrap();
    let (knows, alice, bob) = {
        let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
        let ids = store
            .with_write(|s| {
                let alice = s.localize(&NodeValue::uri("http://ex/alice"))?;
                let knows = s.localize(&NodeValue::uri("http://ex/knows"))?;
                let bob = s.localize(&NodeValue::uri("http://ex/bob"))?;
                let g = s.localize(&NodeValue::uri("http://ex/g"))?;
                s.modify_statements(g, [(alice, knows, bob)], true)?;
                Ok((knows, alice, bob))
            })
            .unwrap();
        ids
    };

    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    assert_eq!(store.lookup(&NodeValue::uri("http://ex/knows")).unwrap(), knows);
    let mut r = store.resolve(Constraint::new(NodeRef::var("x"), knows, NodeRef::var("y"), NodeRef::var("g"))).unwrap();
    let found = rows(&mut r);
    assert_eq!(found.len(), 1);
    assert_eq!(r.variables()[0], Variable::new("y"));
    assert_eq!(found[0][..2], [bob, alice]);
    assert_eq!(store.info().unwrap().statements, 1);
}

#[test]
fn failed_write_rolls_back() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    store.modify_statements(4, [(1, 2, 3)], true).unwrap();
    let err = store
        .with_write(|s| {
            s.modify_statements(4, [(7, 8, 9)], true)?;
            s.modify_statements(4, [(7, 8, -1)], true)
        })
        .unwrap_err();
    assert!(matches!(err, QuadError::InvalidConstraint(_)));
    assert_eq!(store.statement_count(), 1);
    assert_eq!(store.xa_resource().releases(), 2);

    store.modify_statements(4, [(7, 8, 9)], true).unwrap();
    assert_eq!(store.statement_count(), 2);
}

#[test]
fn persistent_allocation_survives_abort() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    let schema = NodeValue::uri("http://ex/schema");
    let temp = NodeValue::uri("http://ex/temp");
    let _ = store.with_write(|s| {
        s.localize_persistent(&schema)?;
        s.localize(&temp)?;
        Err::<(), _>(QuadError::Transaction("abandoned".into()))
    });
    assert_ne!(store.lookup(&schema).unwrap(), NONE);
    assert_eq!(store.lookup(&temp).unwrap(), NONE);
    drop(store);

    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    assert_ne!(store.lookup(&schema).unwrap(), NONE);
}

#[test]
fn rebinding_through_the_store() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    store.modify_statements(7, [(42, 3, 10), (42, 3, 11), (43, 3, 10), (42, 4, 12)], true).unwrap();

    let open = store.resolve(Constraint::new(NodeRef::var("x"), 3, NodeRef::var("y"), 7)).unwrap();
    let mut bindings = HashMap::new();
    bindings.insert(Variable::new("x"), 42);
    let mut rebound = open.reresolve(&bindings).unwrap().unwrap();
    let mut fresh = store.resolve(Constraint::new(42, 3, NodeRef::var("y"), 7)).unwrap();
    assert_eq!(rows(&mut rebound), rows(&mut fresh));
    assert_eq!(rows(&mut fresh), vec![vec![10], vec![11]]);
}

#[test]
fn backup_round_trip_into_a_fresh_store() {
    let tmp = tempdir().unwrap();
    let source = QuadStore::open_with(tmp.path().join("a"), cfg()).unwrap();
    source
        .with_write(|s| {
            let g = s.localize(&NodeValue::uri("http://ex/g"))?;
            let p = s.localize(&NodeValue::uri("http://ex/age"))?;
            for (who, age) in [("a", "7"), ("b", "10"), ("c", "2")] {
                let subj = s.localize(&NodeValue::uri(format!("http://ex/{who}")))?;
                let lit = s.localize(&NodeValue::typed(age, quadra_core::node::XSD_INT))?;
                s.modify_statements(g, [(subj, p, lit)], true)?;
            }
            let b = s.new_blank_node()?;
            let note = s.localize(&NodeValue::lang("salut\n\"toi\"", "fr"))?;
            s.modify_statements(g, [(b, p, note)], true)?;
            Ok(())
        })
        .unwrap();

    let file = tmp.path().join("store.bak");
    let stats = source.backup(&file).unwrap();
    assert_eq!(stats.statements, 4);
    let text = std::fs::read_to_string(&file).unwrap();
    assert!(text.starts_with("QUADRA BACKUP v1\n"));
    assert!(text.ends_with("END\n"));

    let target = QuadStore::open_with(tmp.path().join("b"), cfg()).unwrap();
    target.localize(&NodeValue::uri("http://ex/unrelated")).unwrap();
    let restored = target.restore(&file).unwrap();
    assert_eq!(restored.statements, 4);
    assert_eq!(statements(&source), statements(&target));
}

#[test]
fn restored_blank_nodes_stay_distinct() {
    let tmp = tempdir().unwrap();
    let setup = |dir: &str, object: NodeValue| {
        let store = QuadStore::open_with(tmp.path().join(dir), cfg()).unwrap();
        store
            .with_write(|s| {
                let b = s.new_blank_node()?;
                let p = s.localize(&NodeValue::uri("http://ex/p"))?;
                let g = s.localize(&NodeValue::uri("http://ex/g"))?;
                let o = s.localize(&object)?;
                s.modify_statements(g, [(b, p, o)], true)
            })
            .unwrap();
        store
    };
    let source = setup("a", NodeValue::plain("theirs"));
    let target = setup("b", NodeValue::plain("mine"));
    // both stores hold a blank node labelled the same way
    assert_eq!(source.globalize(1).unwrap(), target.globalize(1).unwrap());

    let file = tmp.path().join("blank.bak");
    source.backup(&file).unwrap();
    target.restore(&file).unwrap();

    let p = target.lookup(&NodeValue::uri("http://ex/p")).unwrap();
    let mut r = target.resolve(Constraint::new(NodeRef::var("s"), p, NodeRef::var("o"), NodeRef::var("g"))).unwrap();
    let col = r.column_index(&Variable::new("s")).unwrap();
    let subjects: HashSet<i64> = rows(&mut r).into_iter().map(|row| row[col]).collect();
    assert_eq!(subjects.len(), 2);
    for s in subjects {
        assert!(target.globalize(s).unwrap().is_blank());
    }
}

#[test]
fn restore_rejects_bare_ids_that_name_local_nodes() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    store.localize(&NodeValue::uri("http://ex/local")).unwrap();
    let text = "QUADRA BACKUP v1\n2026-03-01T12:00:00Z\nRDFNODES\nTRIPLES\n1 20 30 40\nEND\n";
    assert!(matches!(store.restore_bytes(text.as_bytes()), Err(QuadError::UnknownNode(1))));
    assert_eq!(store.statement_count(), 0);

    let text = "QUADRA BACKUP v1\n2026-03-01T12:00:00Z\nRDFNODES\nTRIPLES\n10 20 30 40\nEND\n";
    assert_eq!(store.restore_bytes(text.as_bytes()).unwrap().statements, 1);
}

#[test]
fn readers_only_see_committed_statements() {
    use quadra_core::{EndFlag, StartFlag, XaResource, Xid};

    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    store.modify_statements(9, [(1, 2, 3)], true).unwrap();

    let xa = store.xa_resource();
    let x = Xid::new(1, "open", "1");
    xa.start(&x, StartFlag::NoFlags).unwrap();
    store.modify_statements(9, [(4, 5, 6)], true).unwrap();
    assert_eq!(store.statement_count(), 2);

    std::thread::scope(|sc| {
        let seen = sc
            .spawn(|| {
                let mut all = store.resolve(Constraint::all_statements()).unwrap();
                rows(&mut all)
            })
            .join()
            .unwrap();
        assert_eq!(seen, vec![vec![1, 2, 3, 9]]);
        let other = sc.spawn(|| store.modify_statements(9, [(7, 8, 9)], true)).join().unwrap();
        assert!(matches!(other, Err(QuadError::WriterBusy)));
    });

    xa.end(&x, EndFlag::Success).unwrap();
    // ended branches read like everyone else
    assert_eq!(store.statement_count(), 1);
    xa.rollback(&x).unwrap();
    let mut all = store.resolve(Constraint::all_statements()).unwrap();
    assert_eq!(rows(&mut all), vec![vec![1, 2, 3, 9]]);
}

#[test]
fn compressed_backup() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path().join("a"), StoreConfig { compress_backups: true, ..cfg() }).unwrap();
    store.modify_statements(1, [(2, 3, 4)], true).unwrap();
    let file = tmp.path().join("z.bak");
    store.backup(&file).unwrap();
    let bytes = std::fs::read(&file).unwrap();
    assert!(quadra_core::backup::is_compressed(&bytes));

    let other = QuadStore::open_with(tmp.path().join("b"), cfg()).unwrap();
    other.restore(&file).unwrap();
    let mut all = other.resolve(Constraint::all_statements()).unwrap();
    assert_eq!(rows(&mut all), vec![vec![2, 3, 4, 1]]);
}

#[test]
fn sort_by_node_value() {
    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    let ids = store
        .with_write(|s| {
            let mut ids = Vec::new();
            for n in ["10", "2", "33", "4"] {
                ids.push(s.localize(&NodeValue::typed(n, quadra_core::node::XSD_INTEGER))?);
            }
            let p = s.localize(&NodeValue::uri("http://ex/n"))?;
            let g = s.localize(&NodeValue::uri("http://ex/g"))?;
            for &id in &ids {
                s.modify_statements(g, [(p, p, id)], true)?;
            }
            Ok(ids)
        })
        .unwrap();

    let pattern = Constraint::new(NodeRef::var("p"), NodeRef::var("q"), NodeRef::var("o"), NodeRef::var("g"));
    let mut objects = store.resolve(pattern).unwrap();
    let mut by_value = store.sort(&mut objects, VALUE_ORDER, false).unwrap();
    let col = by_value.column_index(&Variable::new("o")).unwrap();
    let sorted: Vec<i64> = rows(&mut by_value).into_iter().map(|r| r[col]).collect();
    assert_eq!(sorted, vec![ids[1], ids[3], ids[0], ids[2]]);
    by_value.close().unwrap();

    let mut by_id = store.sort(&mut objects, ID_ORDER, false).unwrap();
    assert_eq!(by_id.row_count().unwrap(), 4);
}

#[test]
fn two_phase_through_the_resource_interface() {
    use quadra_core::{EndFlag, StartFlag, Vote, XaResource, Xid};

    let tmp = tempdir().unwrap();
    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    let xa = store.xa_resource();
    let a = Xid::new(1, "global", "a");
    let b = a.branch("b");
    xa.start(&a, StartFlag::NoFlags).unwrap();
    xa.start(&b, StartFlag::NoFlags).unwrap();
    store.modify_statements(9, [(1, 2, 3)], true).unwrap();
    xa.end(&a, EndFlag::Success).unwrap();
    xa.end(&b, EndFlag::Success).unwrap();
    assert_eq!(xa.prepare(&a).unwrap(), Vote::Ok);
    assert_eq!(xa.prepare(&b).unwrap(), Vote::Ok);
    assert_eq!(xa.recover().len(), 2);
    xa.commit(&a, false).unwrap();
    xa.commit(&b, false).unwrap();
    assert_eq!(xa.releases(), 1);
    assert!(xa.recover().is_empty());
    drop(store);

    let store = QuadStore::open_with(tmp.path(), cfg()).unwrap();
    assert_eq!(store.statement_count(), 1);
    assert_eq!(store.info().unwrap().phase, 1);
}
