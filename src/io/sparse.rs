//! Sparse-output support: zero-run detection and the end-of-copy pass that
//! settles the output length.
//!
//! During the copy, all-zero stretches of the write buffer are skipped (or
//! handed to WRITE SAME with the UNMAP bit on pass-through outputs) instead
//! of written.  Skipping the tail leaves a regular output file short, so a
//! final pass either truncates to the target length (`strunc`), writes one
//! terminal zero block to materialise the tail (sparse level 1), or leaves
//! the length to the filesystem (level above 1).

use std::io::{Seek, SeekFrom, Write};
use std::mem;

use crate::error::{Error, Result};
use crate::io::file_type::FileTypes;
use crate::opts::Opts;

const WORD: usize = mem::size_of::<usize>();

/// True when `buf` is entirely zero bytes.  Scans native words first and
/// mops up the unaligned tail byte-wise.
pub fn all_zeros(buf: &[u8]) -> bool {
    let words = buf.len() / WORD;
    for i in 0..words {
        let w = usize::from_ne_bytes(buf[i * WORD..(i + 1) * WORD].try_into().unwrap());
        if w != 0 {
            return false;
        }
    }
    buf[words * WORD..].iter().all(|&b| b == 0)
}

/// Settles the length of a regular sparse output at copy exit so it covers
/// `want_len` bytes (the seek cursor's final position plus any zero-skipped
/// partial tail).
pub fn sparse_post_pass(opts: &mut Opts, want_len: u64) -> Result<()> {
    if opts.oflag.sparse == 0 || !opts.out_type.contains(FileTypes::REG) {
        return Ok(());
    }
    let Some(file) = opts.out_file.as_mut() else {
        return Ok(());
    };
    let len = file
        .metadata()
        .map_err(|e| Error::file(format!("{}: {e}", opts.outf)))?
        .len();
    if len >= want_len {
        return Ok(());
    }
    if opts.oflag.strunc {
        file.set_len(want_len)
            .map_err(|e| Error::file(format!("{}: {e}", opts.outf)))?;
    } else if opts.oflag.sparse == 1 {
        // One terminal zero block; anything between the current end and it
        // stays a hole.
        let tail = (opts.obs as u64).min(want_len);
        file.seek(SeekFrom::Start(want_len - tail))
            .map_err(|e| Error::file(format!("{}: {e}", opts.outf)))?;
        file.write_all(&vec![0u8; tail as usize])
            .map_err(|e| Error::file(format!("{}: {e}", opts.outf)))?;
    }
    // Level above 1: the filesystem keeps whatever length the last real
    // write produced.
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    #[test]
    fn all_zeros_accepts_empty_and_zero_buffers() {
        assert!(all_zeros(&[]));
        assert!(all_zeros(&[0u8; 7]));
        assert!(all_zeros(&[0u8; 64]));
        assert!(all_zeros(&[0u8; 65]));
    }

    #[test]
    fn all_zeros_spots_a_single_nonzero_byte() {
        let mut buf = vec![0u8; 4096];
        assert!(all_zeros(&buf));
        buf[4095] = 1;
        assert!(!all_zeros(&buf));
        buf[4095] = 0;
        buf[0] = 1;
        assert!(!all_zeros(&buf));
        buf[0] = 0;
        buf[2049] = 1; // unaligned middle position
        assert!(!all_zeros(&buf));
    }

    fn sparse_opts(dir: &TempDir, level: u32, strunc: bool) -> Opts {
        let mut o = Opts::default();
        o.outf = dir.path().join("dst").to_str().unwrap().to_owned();
        o.out_file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&o.outf)
                .unwrap(),
        );
        o.out_type = FileTypes::REG;
        o.oflag.sparse = level;
        o.oflag.strunc = strunc;
        o
    }

    #[test]
    fn strunc_truncates_to_target_length() {
        let dir = TempDir::new().unwrap();
        let mut o = sparse_opts(&dir, 1, true);
        sparse_post_pass(&mut o, 9216).unwrap();
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 9216);
    }

    #[test]
    fn level_one_materialises_exactly_one_tail_block() {
        let dir = TempDir::new().unwrap();
        let mut o = sparse_opts(&dir, 1, false);
        sparse_post_pass(&mut o, 4096).unwrap();
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 4096);
        // Final obs bytes are explicit zeros.
        let data = std::fs::read(&o.outf).unwrap();
        assert!(data[4096 - 512..].iter().all(|&b| b == 0));
    }

    #[test]
    fn level_two_leaves_the_short_length() {
        let dir = TempDir::new().unwrap();
        let mut o = sparse_opts(&dir, 2, false);
        std::fs::write(&o.outf, vec![1u8; 1000]).unwrap();
        sparse_post_pass(&mut o, 4096).unwrap();
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 1000);
    }

    #[test]
    fn already_long_enough_is_untouched() {
        let dir = TempDir::new().unwrap();
        let mut o = sparse_opts(&dir, 1, false);
        std::fs::write(&o.outf, vec![5u8; 8192]).unwrap();
        sparse_post_pass(&mut o, 4096).unwrap();
        let data = std::fs::read(&o.outf).unwrap();
        assert_eq!(data.len(), 8192);
        assert!(data.iter().all(|&b| b == 5));
    }

    #[test]
    fn non_sparse_output_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut o = sparse_opts(&dir, 0, false);
        sparse_post_pass(&mut o, 4096).unwrap();
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 0);
    }
}
