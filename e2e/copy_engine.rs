// e2e/copy_engine.rs — copy semantics through the binary.
//
// Block-size coupling, partial tails, the secondary output mirror, and the
// nowrite dry-run, each verified by inspecting the files afterwards.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn ptdd_bin() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_ptdd") {
        return PathBuf::from(p);
    }
    let mut p = std::env::current_exe().unwrap();
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("ptdd");
    p
}

fn run(args: &[String]) -> std::process::Output {
    Command::new(ptdd_bin())
        .args(args)
        .output()
        .expect("failed to spawn ptdd")
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ── Mismatched block sizes ────────────────────────────────────────────────────

#[test]
fn ibs_obs_coupling_counts_both_sides() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..8 * 512).map(|i| (i % 253) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "ibs=512",
        "obs=1024",
        "bpt=4",
        "count=8",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("8+0 records in"));
    assert!(report.contains("4+0 records out"));
}

#[test]
fn obs_smaller_than_ibs() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data = vec![0xA5u8; 4 * 4096];
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "ibs=4096",
        "obs=512",
        "bpt=2",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("4+0 records in"));
    assert!(report.contains("32+0 records out"));
}

// ── Partial tail ──────────────────────────────────────────────────────────────

#[test]
fn trailing_partial_block_is_copied_and_counted() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data = vec![9u8; 3 * 512 + 200];
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("3+1 records in"));
    assert!(report.contains("3+1 records out"));
}

// ── Secondary output ──────────────────────────────────────────────────────────

#[test]
fn of2_mirrors_the_input_stream() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let mirror = dir.path().join("mirror");
    let data: Vec<u8> = (0..6 * 512).map(|i| (i % 101) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        &format!("of2={}", mirror.display()),
        "bs=512",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    assert_eq!(std::fs::read(&mirror).unwrap(), data);
}

// ── nowrite ───────────────────────────────────────────────────────────────────

#[test]
fn nowrite_leaves_the_destination_untouched() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, vec![1u8; 4 * 512]).unwrap();
    std::fs::write(&dst, vec![2u8; 512]).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "oflag=nowrite",
    ]));
    assert_eq!(out.status.code(), Some(0));
    // Existing contents survive; counters still report the dry run.
    assert_eq!(std::fs::read(&dst).unwrap(), vec![2u8; 512]);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("4+0 records out"));
}

// ── bpt chunking across many iterations ───────────────────────────────────────

#[test]
fn small_bpt_still_copies_exactly() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..64 * 512).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=3",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("64+0 records in"));
}
