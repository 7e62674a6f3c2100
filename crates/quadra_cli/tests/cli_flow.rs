use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn cli_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("quadra"))
}

fn insert(dir: &str, s: &str, p: &str, o: &str) {
    cli_cmd()
        .args(["insert", "--dir", dir, "--graph", "<http://ex/g>", "--subject", s, "--predicate", p, "--object", o])
        .assert()
        .success()
        .stdout(predicate::str::contains("inserted: 1"));
}

#[test]
fn insert_query_and_delete() {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path().join("store");
    let dir = dir.to_str().unwrap();

    cli_cmd().args(["init", "--dir", dir, "--no-sync"]).assert().success();

    insert(dir, "<http://ex/earth>", "<http://ex/orbits>", "<http://ex/sun>");
    insert(dir, "<http://ex/moon>", "<http://ex/orbits>", "<http://ex/earth>");
    insert(dir, "<http://ex/earth>", "<http://ex/name>", "\"Earth\"@en");

    cli_cmd()
        .args(["query", "--dir", dir, "--predicate", "<http://ex/orbits>", "--pretty"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<http://ex/earth>\t<http://ex/moon>"))
        .stdout(predicate::str::contains("rows: 2"));

    cli_cmd()
        .args(["query", "--dir", dir, "--subject", "<http://ex/earth>", "--predicate", "<http://ex/name>", "--pretty"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"Earth\"@en"));

    cli_cmd()
        .args(["query", "--dir", dir, "--subject", "<http://ex/pluto>"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rows: 0"));

    cli_cmd()
        .args([
            "delete",
            "--dir",
            dir,
            "--graph",
            "<http://ex/g>",
            "--subject",
            "<http://ex/moon>",
            "--predicate",
            "<http://ex/orbits>",
            "--object",
            "<http://ex/earth>",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted: 1"));

    cli_cmd()
        .args(["info", "--dir", dir])
        .assert()
        .success()
        .stdout(predicate::str::contains("statements: 2"));
}

#[test]
fn backup_and_restore_between_stores() {
    let tmp = tempdir().expect("tempdir");
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    let file = tmp.path().join("a.bak");
    let (a, b, file) = (a.to_str().unwrap(), b.to_str().unwrap(), file.to_str().unwrap());

    cli_cmd().args(["init", "--dir", a, "--no-sync"]).assert().success();
    cli_cmd().args(["init", "--dir", b, "--no-sync"]).assert().success();
    insert(a, "_:x", "<http://ex/age>", "\"42\"^^<http://www.w3.org/2001/XMLSchema#int>");

    cli_cmd()
        .args(["backup", "--dir", a, "--out", file])
        .assert()
        .success()
        .stdout(predicate::str::contains("statements=1"));

    cli_cmd()
        .args(["restore", "--dir", b, "--input", file])
        .assert()
        .success()
        .stdout(predicate::str::contains("statements=1"));

    cli_cmd()
        .args(["node", "--dir", b, "--term", "<http://ex/age>"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("#"));
}

#[test]
fn missing_store_is_an_error() {
    let tmp = tempdir().expect("tempdir");
    let dir = tmp.path().join("nope");
    cli_cmd()
        .args(["info", "--dir", dir.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("quadra init"));
}
