// e2e/sparse_resume.rs — sparse output modes and resumed copies.

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

/// Zeros, a run of 'A', zeros again: the classic sparse shape.
fn sparse_payload() -> Vec<u8> {
    let mut v = vec![0u8; 4096];
    v.extend_from_slice(&[b'A'; 512]);
    v.extend_from_slice(&vec![0u8; 4096]);
    v
}

// ── Sparse ────────────────────────────────────────────────────────────────────

#[test]
fn sparse_copy_keeps_data_and_reports_bypassed_blocks() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data = sparse_payload();
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=sparse",
    ]));
    assert_eq!(out.status.code(), Some(0));
    let written = std::fs::read(&dst).unwrap();
    assert_eq!(written.len(), data.len());
    assert_eq!(written, data);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("bypassed records out"));
}

#[test]
fn sparse_copy_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data = sparse_payload();
    std::fs::write(&src, &data).unwrap();

    let cli = args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=sparse",
    ]);
    assert_eq!(run(&cli).status.code(), Some(0));
    let first = std::fs::read(&dst).unwrap();
    assert_eq!(run(&cli).status.code(), Some(0));
    let second = std::fs::read(&dst).unwrap();
    assert_eq!(first, second);
}

#[test]
fn strunc_settles_the_length_by_truncation() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    // Data then a zero tail that sparse would otherwise leave unwritten.
    let mut data = vec![3u8; 1024];
    data.extend_from_slice(&vec![0u8; 4096]);
    std::fs::write(&src, &data).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "oflag=sparse,strunc",
    ]));
    assert_eq!(out.status.code(), Some(0));
    let written = std::fs::read(&dst).unwrap();
    assert_eq!(written.len(), data.len());
    assert_eq!(written, data);
}

// ── Resume ────────────────────────────────────────────────────────────────────

#[test]
fn resume_picks_up_after_existing_output() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..100 * 512).map(|i| (i % 47) as u8).collect();
    std::fs::write(&src, &data).unwrap();
    // First 40 blocks already in place.
    std::fs::write(&dst, &data[..40 * 512]).unwrap();

    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "count=100",
        "bpt=8",
        "oflag=resume",
        "verbose=2",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    let report = String::from_utf8_lossy(&out.stderr);
    // 40 done blocks are skipped on a whole-transfer boundary (bpt=8).
    assert!(report.contains("60+0 records in"));
}

#[test]
fn resume_after_a_complete_copy_writes_nothing_new() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..64 * 512).map(|i| (i % 31) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let plain = args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8",
    ]);
    assert_eq!(run(&plain).status.code(), Some(0));

    let resumed = args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8",
        "oflag=resume",
    ]);
    let out = run(&resumed);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("0+0 records in"));
    assert!(report.contains("0+0 records out"));
}

#[test]
fn resume_respects_explicit_trunc_being_ignored() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..16 * 512).map(|i| (i % 13) as u8).collect();
    std::fs::write(&src, &data).unwrap();
    std::fs::write(&dst, &data[..8 * 512]).unwrap();

    // trunc would defeat resume; it is ignored in this combination.
    let out = run(&args(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "bpt=8",
        "oflag=resume,trunc",
    ]));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}
