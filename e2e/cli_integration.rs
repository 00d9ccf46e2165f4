// e2e/cli_integration.rs — black-box CLI tests.
//
// Drives the `ptdd` binary with std::process::Command: operand validation,
// exit codes, the basic copy path, and the stderr report.

use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Locates the `ptdd` binary produced by Cargo.
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

fn run(args: &[&str]) -> std::process::Output {
    Command::new(ptdd_bin())
        .args(args)
        .output()
        .expect("failed to spawn ptdd")
}

// ── Help and version ──────────────────────────────────────────────────────────

#[test]
fn help_mentions_operands_and_exits_zero() {
    let out = run(&["--help"]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("if=IFILE"));
    assert!(text.contains("oflag="));
    assert!(text.contains("cdbsz="));
}

#[test]
fn version_prints_the_crate_version() {
    let out = run(&["--version"]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("ptdd"));
}

// ── Operand validation (exit code 1) ──────────────────────────────────────────

#[test]
fn missing_if_is_a_syntax_error() {
    let out = run(&["of=whatever"]);
    assert_eq!(out.status.code(), Some(1));
    let text = String::from_utf8_lossy(&out.stderr);
    assert!(text.contains("if="));
}

#[test]
fn unknown_operand_is_a_syntax_error() {
    let out = run(&["if=x", "frobnicate=1"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn misaligned_block_sizes_are_rejected_before_io() {
    // The input file does not even exist; the alignment check fires first.
    let out = run(&["if=/nonexistent", "ibs=512", "obs=1024", "bpt=5"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn trunc_with_sparing_is_fatal() {
    let out = run(&["if=x", "oflag=trunc,sparing"]);
    assert_eq!(out.status.code(), Some(1));
}

// ── Open failures (exit code 15) ──────────────────────────────────────────────

#[test]
fn missing_input_file_is_a_file_error() {
    let out = run(&["if=/nonexistent/__ptdd_e2e__", "of=."]);
    assert_eq!(out.status.code(), Some(15));
}

// ── Basic copies ──────────────────────────────────────────────────────────────

#[test]
fn ten_zero_blocks_copy_with_final_report() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, vec![0u8; 10 * 512]).unwrap();

    let out = run(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "count=10",
    ]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(std::fs::metadata(&dst).unwrap().len(), 5120);
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("10+0 records in"));
    assert!(report.contains("10+0 records out"));
}

#[test]
fn discard_output_still_reads_everything() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::write(&src, vec![7u8; 4 * 512]).unwrap();

    let out = run(&[&format!("if={}", src.display()), "of=."]);
    assert_eq!(out.status.code(), Some(0));
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("4+0 records in"));
}

#[test]
fn skip_and_seek_place_the_copy_window() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data: Vec<u8> = (0..4 * 512).map(|i| (i % 250) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let out = run(&[
        &format!("if={}", src.display()),
        &format!("of={}", dst.display()),
        "bs=512",
        "skip=1",
        "seek=2",
    ]);
    assert_eq!(out.status.code(), Some(0));
    let written = std::fs::read(&dst).unwrap();
    assert_eq!(written.len(), (2 + 3) * 512);
    assert_eq!(&written[2 * 512..], &data[512..]);
}

#[test]
fn stdout_output_carries_the_data() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let data = vec![0x42u8; 3 * 512];
    std::fs::write(&src, &data).unwrap();

    let out = run(&[&format!("if={}", src.display()), "of=-"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(out.stdout, data);
}

// ── status=noxfer ─────────────────────────────────────────────────────────────

#[test]
fn noxfer_suppresses_the_throughput_line() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    std::fs::write(&src, vec![0u8; 512]).unwrap();

    let out = run(&[&format!("if={}", src.display()), "of=.", "status=noxfer"]);
    assert_eq!(out.status.code(), Some(0));
    let report = String::from_utf8_lossy(&out.stderr);
    assert!(report.contains("records in"));
    assert!(!report.contains("bytes ("));
}
