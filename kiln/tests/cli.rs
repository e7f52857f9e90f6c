//! End-to-end runs of the `kiln` binary against a scratch prefix.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn kiln(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(args)
        .env("KILN_PREFIX", root)
        .env("KILN_FORMULA_PATH", root.join("formulas"))
        .env("KILN_JOBS", "2")
        .env_remove("KILN_LOG")
        .env("NO_COLOR", "1")
        .output()
        .expect("failed to run kiln")
}

fn write_recipe(root: &Path, name: &str, body: &str) {
    let dir = root.join("formulas");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{name}.json")), body).unwrap();
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn setup() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_recipe(
        dir.path(),
        "lib-a",
        r#"{"name": "lib-a", "version": "1.0",
            "install": [{"type": "write_file", "path": "{prefix}/lib/a.txt", "content": "a"}]}"#,
    );
    write_recipe(
        dir.path(),
        "lib-b",
        r#"{"name": "lib-b", "version": "2.0", "dependencies": ["lib-a"],
            "options": [{"name": "with-extra", "description": "Install extra data"}],
            "install": [
              {"type": "write_file", "path": "{prefix}/lib/b.txt", "content": "{opt:lib-a}"},
              {"type": "write_file", "path": "{prefix}/extra.txt", "content": "x",
               "when": {"flag": "with-extra"}}
            ]}"#,
    );
    dir
}

#[test]
fn install_list_and_uninstall() {
    let dir = setup();
    let root = dir.path();

    let output = kiln(root, &["install", "lib-b"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let b_keg = root.join("Cellar/lib-b/2.0");
    assert_eq!(
        fs::read_to_string(b_keg.join("lib/b.txt")).unwrap(),
        root.join("Cellar/lib-a/1.0").display().to_string()
    );
    assert!(!b_keg.join("extra.txt").exists());

    let listed = stdout(&kiln(root, &["list"]));
    assert!(listed.contains("lib-a"));
    assert!(listed.contains("lib-b"));

    let refused = kiln(root, &["uninstall", "lib-a"]);
    assert!(!refused.status.success());
    assert!(root.join("Cellar/lib-a/1.0").exists());

    let removed = kiln(root, &["uninstall", "lib-b", "lib-a"]);
    assert!(removed.status.success());
    assert!(!root.join("Cellar/lib-b").exists());
    assert!(!root.join("opt/lib-b").exists());
}

#[test]
fn options_select_a_separate_keg() {
    let dir = setup();
    let root = dir.path();

    let output = kiln(root, &["install", "lib-b", "--with-extra", "--with-unknown"]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("with-unknown"), "{stderr}");

    let kegs: Vec<_> = fs::read_dir(root.join("Cellar/lib-b"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(kegs.len(), 1);
    assert!(kegs[0].join("extra.txt").is_file());
    assert!(kegs[0].file_name().unwrap().to_string_lossy().starts_with("2.0-"));
}

#[test]
fn failed_dependency_fails_the_run() {
    let dir = setup();
    let root = dir.path();
    write_recipe(
        root,
        "lib-a",
        r#"{"name": "lib-a", "version": "1.0",
            "install": [{"type": "run", "program": "/nonexistent/tool"}]}"#,
    );

    let output = kiln(root, &["install", "lib-b"]);
    assert!(!output.status.success());
    assert!(!root.join("Cellar/lib-b").exists());
    assert!(stdout(&output).contains("failed (dependency)"));
}

#[test]
fn unknown_formula_and_cycles_abort_before_installing() {
    let dir = setup();
    let root = dir.path();
    write_recipe(root, "x", r#"{"name": "x", "version": "1", "dependencies": ["y"]}"#);
    write_recipe(root, "y", r#"{"name": "y", "version": "1", "dependencies": ["x"]}"#);

    assert!(!kiln(root, &["install", "ghost"]).status.success());
    let cyclic = kiln(root, &["install", "x"]);
    assert!(!cyclic.status.success());
    assert!(String::from_utf8_lossy(&cyclic.stderr).to_lowercase().contains("cycl"));
    assert!(!root.join("Cellar").exists());
}

#[test]
fn deps_prints_dependencies_first() {
    let dir = setup();
    let out = stdout(&kiln(dir.path(), &["deps", "lib-b"]));
    let a = out.find("lib-a").expect("lib-a listed");
    let b = out.find("lib-b").expect("lib-b listed");
    assert!(a < b, "{out}");
}

#[test]
fn install_flags_may_follow_the_names() {
    let dir = setup();
    let root = dir.path();
    let output = kiln(root, &["install", "lib-b", "--jobs", "1", "--build-from-source"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(root.join("Cellar/lib-b/2.0/lib/b.txt").is_file());
}
