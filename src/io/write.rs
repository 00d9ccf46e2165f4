//! Write dispatch, sparing and sparse filtering.
//!
//! The write stage consumes the iteration's output blocks in chunks of
//! `obpc` blocks (or the whole transfer when `obpc` is 0).  Each chunk can
//! be skipped by sparing (destination already holds these bytes), skipped
//! by sparse (all zeros, optionally de-allocated with WRITE SAME/UNMAP on
//! pass-through outputs), or written through the per-type path: positioned
//! file writes with seek elision, fifo loop-writes, tape writes with the
//! early-warning retry, or pass-through WRITE.
//!
//! `oflag=nowrite` short-circuits every path: blocks are accounted as
//! consumed and the descriptor is never touched.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Category, Error, Result};
use crate::io::copy::{CopyState, LeaveReason};
use crate::io::file_type::FileTypes;
use crate::io::sparse::all_zeros;
use crate::opts::Opts;
use crate::pt::PtStatus;
use crate::vprint;

/// Early-warning note is printed at most once per run.
static EW_REPORTED: AtomicBool = AtomicBool::new(false);

/// Writes all of `buf`, retrying EINTR; a zero-length write ends the loop.
fn write_all_retry(mut f: &std::fs::File, buf: &[u8], eintr: &mut u32) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match f.write(&buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                *eintr += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

// ── Secondary output mirror ───────────────────────────────────────────────────

/// Mirrors the bytes just read to OFILE2 (regular file or fifo, sequential).
pub fn write_of2(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    if opts.out2_file.is_none() || st.bytes_read == 0 {
        return Ok(());
    }
    let mut eintr = 0u32;
    let done = {
        let f = opts.out2_file.as_ref().unwrap();
        write_all_retry(f, &st.buf.as_slice()[..st.bytes_read], &mut eintr)
    };
    opts.interrupted_retries += eintr;
    let done = done.map_err(|e| Error::other(format!("{}: write: {e}", opts.out2f)))?;
    if done < st.bytes_read {
        return Err(Error::other(format!(
            "{}: secondary output consumed only {done} of {} bytes",
            opts.out2f, st.bytes_read
        )));
    }
    st.bytes_of2 = done;
    Ok(())
}

// ── Primary output ────────────────────────────────────────────────────────────

/// Consumes the planned output blocks plus any partial tail.
pub fn write_transfer(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    if st.ocbpt == 0 && st.partial_write_bytes == 0 {
        return Ok(());
    }
    if opts.out_type.contains(FileTypes::NULL) || opts.oflag.nowrite {
        opts.out_full += st.ocbpt as i64;
        if st.partial_write_bytes > 0 {
            opts.out_partial += 1;
        }
        return Ok(());
    }
    if opts.out_type.contains(FileTypes::PT) {
        return pt_write(opts, st);
    }
    if opts.out_type.contains(FileTypes::TAPE) {
        return tape_write(opts, st);
    }
    if opts.out_type.contains(FileTypes::FIFO) {
        return fifo_write(opts, st);
    }
    file_write(opts, st)
}

/// Reads the destination span for sparing; returns how many bytes of the
/// read-back buffer are valid (a shorter destination mismatches past that).
fn sparing_readback(opts: &mut Opts, st: &mut CopyState, total: usize) -> Result<usize> {
    let offset = opts.seek * opts.obs_pi as i64;
    let mut eintr = 0u32;
    let got = {
        let f = opts.out_file.as_ref().expect("output not open");
        match (&*f).seek(SeekFrom::Start(offset as u64)) {
            Ok(_) => {
                let sbuf = st.sparing_buf.as_mut().expect("sparing buffer missing");
                let mut got = 0usize;
                let mut r: &std::fs::File = f;
                while got < total {
                    match r.read(&mut sbuf[got..total]) {
                        Ok(0) => break,
                        Ok(n) => got += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => eintr += 1,
                        Err(_) => break,
                    }
                }
                got
            }
            Err(e) => {
                return Err(Error::file(format!("{}: seek for sparing: {e}", opts.outf)));
            }
        }
    };
    opts.interrupted_retries += eintr;
    // The read-back moved the descriptor; the tracked position no longer
    // matches until the next explicit seek.
    st.of_filepos = -1;
    Ok(got)
}

fn file_write(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let obs = opts.obs as usize;
    let obs_pi = opts.obs_pi as i64;
    let total = st.ocbpt as usize * obs;
    let sparing_valid = if opts.oflag.sparing {
        sparing_readback(opts, st, total + st.partial_write_bytes as usize)?
    } else {
        0
    };

    let chunk_blocks = if opts.obpc > 0 { opts.obpc } else { st.ocbpt.max(1) };
    let mut blk: u32 = 0;
    while blk < st.ocbpt {
        let nblk = chunk_blocks.min(st.ocbpt - blk);
        let lo = blk as usize * obs;
        let hi = (blk + nblk) as usize * obs;
        let skip_write = if opts.oflag.sparing
            && hi <= sparing_valid
            && st.buf.as_slice()[lo..hi] == st.sparing_buf.as_ref().unwrap()[lo..hi]
        {
            vprint!(3, "{}: sparing bypassed {} blocks", opts.outf, nblk);
            true
        } else if opts.oflag.sparse > 0 && all_zeros(&st.buf.as_slice()[lo..hi]) {
            opts.out_sparse += nblk as i64;
            true
        } else {
            false
        };
        if !skip_write {
            write_file_chunk(opts, st, (opts.seek + blk as i64) * obs_pi, lo..hi)?;
        }
        opts.out_full += nblk as i64;
        blk += nblk;
    }

    if st.partial_write_bytes > 0 {
        let lo = total;
        let hi = total + st.partial_write_bytes as usize;
        if opts.oflag.sparse > 0 && all_zeros(&st.buf.as_slice()[lo..hi]) {
            opts.out_sparse_partial += 1;
        } else {
            write_file_chunk(opts, st, (opts.seek + st.ocbpt as i64) * obs_pi, lo..hi)?;
            opts.out_partial += 1;
        }
    }
    Ok(())
}

fn write_file_chunk(
    opts: &mut Opts,
    st: &mut CopyState,
    offset: i64,
    range: std::ops::Range<usize>,
) -> Result<()> {
    let len = range.len();
    let mut eintr = 0u32;
    let done = {
        let f = opts.out_file.as_ref().expect("output not open");
        // A tape short read leaves the stream mid-record; re-seeking the
        // output would tear the pairing, so keep the current position.
        if st.of_filepos != offset && st.leave_reason != LeaveReason::TapeShortRead {
            (&*f)
                .seek(SeekFrom::Start(offset as u64))
                .map_err(|e| Error::file(format!("{}: seek: {e}", opts.outf)))?;
        } else if st.of_filepos == offset {
            vprint!(4, "{}: output already positioned at {}", opts.outf, offset);
        }
        write_all_retry(f, &st.buf.as_slice()[range], &mut eintr)
    };
    opts.interrupted_retries += eintr;
    let done = done.map_err(|e| {
        opts.wr_unrecovered_errs += 1;
        Error::other(format!("{}: write: {e}", opts.outf))
    })?;
    if done < len {
        opts.wr_unrecovered_errs += 1;
        return Err(Error::other(format!(
            "{}: short write ({done} of {len} bytes)",
            opts.outf
        )));
    }
    st.of_filepos = offset + done as i64;
    st.bytes_of += done;
    Ok(())
}

fn fifo_write(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let total = st.ocbpt as usize * opts.obs as usize + st.partial_write_bytes as usize;
    let mut eintr = 0u32;
    let done = {
        let f = opts.out_file.as_ref().expect("output not open");
        write_all_retry(f, &st.buf.as_slice()[..total], &mut eintr)
    };
    opts.interrupted_retries += eintr;
    let done = done.map_err(|e| {
        opts.wr_unrecovered_errs += 1;
        Error::other(format!("{}: write: {e}", opts.outf))
    })?;
    if done < total {
        opts.wr_unrecovered_errs += 1;
        return Err(Error::other(format!(
            "{}: pipe consumed only {done} of {total} bytes",
            opts.outf
        )));
    }
    opts.out_full += st.ocbpt as i64;
    if st.partial_write_bytes > 0 {
        opts.out_partial += 1;
    }
    st.bytes_of += done;
    Ok(())
}

fn tape_write(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let total = st.ocbpt as usize * opts.obs as usize + st.partial_write_bytes as usize;
    let mut retried_ew = false;
    loop {
        let res = {
            let mut f = opts.out_file.as_ref().expect("output not open");
            f.write(&st.buf.as_slice()[..total])
        };
        match res {
            Ok(n) if n == total => {
                opts.out_full += st.ocbpt as i64;
                if st.partial_write_bytes > 0 {
                    opts.out_partial += 1;
                }
                st.bytes_of += n;
                return Ok(());
            }
            Ok(n) => {
                opts.wr_unrecovered_errs += 1;
                return Err(Error::other(format!(
                    "{}: short tape write ({n} of {total} bytes)",
                    opts.outf
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                opts.interrupted_retries += 1;
            }
            Err(e)
                if e.raw_os_error() == Some(libc::ENOSPC)
                    && opts.oflag.ignoreew
                    && !retried_ew =>
            {
                if !EW_REPORTED.swap(true, Ordering::Relaxed) {
                    vprint!(2, "{}: early warning before end of tape, retrying", opts.outf);
                }
                retried_ew = true;
            }
            Err(e) => {
                opts.wr_unrecovered_errs += 1;
                return Err(Error::other(format!("{}: write: {e}", opts.outf)));
            }
        }
    }
}

fn pt_write(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let obs_pi = opts.obs_pi as usize;
    // Pass-through writes move whole blocks; a trailing partial is either
    // padded out with zeros or dropped with a note.
    if st.partial_write_bytes > 0 {
        let padded = (st.ocbpt as usize + 1) * obs_pi;
        if opts.oflag.pad && padded <= st.buf.as_slice().len() {
            let total = st.ocbpt as usize * obs_pi + st.partial_write_bytes as usize;
            st.buf.as_mut_slice()[total..padded].fill(0);
            st.ocbpt += 1;
        } else {
            vprint!(
                1,
                "{}: {} trailing bytes do not fill a block and are not written (no pad)",
                opts.outf,
                st.partial_write_bytes
            );
        }
        st.partial_write_bytes = 0;
    }

    let chunk_blocks = if opts.obpc > 0 { opts.obpc } else { st.ocbpt.max(1) };
    let mut blk: u32 = 0;
    while blk < st.ocbpt {
        let nblk = chunk_blocks.min(st.ocbpt - blk);
        let lba = (opts.seek + blk as i64) as u64;
        let lo = blk as usize * obs_pi;
        let hi = (blk + nblk) as usize * obs_pi;
        if opts.oflag.sparse > 0 && all_zeros(&st.buf.as_slice()[lo..hi]) {
            opts.out_sparse += nblk as i64;
            if opts.oflag.trim {
                pt_trim(opts, lba, nblk);
            }
        } else {
            pt_write_chunk(opts, st, lba, nblk, lo..hi)?;
        }
        opts.out_full += nblk as i64;
        blk += nblk;
    }
    Ok(())
}

fn pt_write_chunk(
    opts: &mut Opts,
    st: &mut CopyState,
    lba: u64,
    blocks: u32,
    range: std::ops::Range<usize>,
) -> Result<()> {
    let mut retries_left = opts.retries;
    loop {
        let mut eintr = 0u32;
        let res = {
            let pt = opts.out_pt.as_mut().expect("pass-through output not open");
            loop {
                match pt.write(lba, blocks, &st.buf.as_slice()[range.clone()]) {
                    Ok(s) => break Ok(s),
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => eintr += 1,
                    Err(e) => break Err(e),
                }
            }
        };
        opts.interrupted_retries += eintr;
        let status = res.map_err(|e| {
            opts.wr_unrecovered_errs += 1;
            Error::other(format!("{}: write: {e}", opts.outf))
        })?;
        match status {
            PtStatus::Good => {
                st.bytes_of += range.len();
                return Ok(());
            }
            PtStatus::Recovered => {
                opts.wr_recovered_errs += 1;
                st.bytes_of += range.len();
                return Ok(());
            }
            PtStatus::UnitAttention | PtStatus::AbortedCommand if retries_left > 0 => {
                retries_left -= 1;
                opts.num_retries += 1;
                vprint!(2, "{}: write at lba 0x{:x} retried", opts.outf, lba);
            }
            other => {
                opts.wr_unrecovered_errs += 1;
                return Err(Error::new(
                    if matches!(other, PtStatus::Protection) && opts.wrprotect > 0 {
                        Category::ProtectionWithInfo
                    } else {
                        other.category()
                    },
                    format!("{}: write failed at lba 0x{:x}", opts.outf, lba),
                ));
            }
        }
    }
}

/// De-allocation is advisory: failures count but never stop the copy.
fn pt_trim(opts: &mut Opts, lba: u64, blocks: u32) {
    let res = {
        let pt = opts.out_pt.as_mut().expect("pass-through output not open");
        pt.write_same16_unmap(lba, blocks)
    };
    match res {
        Ok(PtStatus::Good) => {}
        Ok(other) => {
            opts.trim_errs += 1;
            vprint!(2, "{}: trim at lba 0x{:x} reported {:?}", opts.outf, lba, other);
        }
        Err(e) => {
            opts.trim_errs += 1;
            vprint!(2, "{}: trim at lba 0x{:x} failed: {}", opts.outf, lba, e);
        }
    }
}
