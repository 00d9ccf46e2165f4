//! Read dispatch.
//!
//! One entry point, [`read_transfer`], keyed on the input's type bits:
//! pass-through READ, fifo/stream accumulation, tape reads with their
//! recoverable short-read marker, and positioned block/regular reads with a
//! one-block probe to tell end-of-file from a latent medium error.
//!
//! The continue-on-error sub-protocol lives here too: when `iflag=coe` is
//! set, an unrecoverable stretch is re-read one block at a time, failing
//! blocks are substituted with zeros and logged, and a run of consecutive
//! bad blocks longer than `coe_limit` aborts the copy.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Category, Error, Result};
use crate::io::copy::{CopyState, LeaveReason};
use crate::io::file_type::FileTypes;
use crate::opts::Opts;
use crate::pt::PtStatus;
use crate::vprint;

/// Reads until `buf` is full or EOF, retrying EINTR.  Returns the byte
/// count reached and the error that stopped the loop, if any.
fn read_full(mut f: &std::fs::File, buf: &mut [u8], eintr: &mut u32) -> (usize, Option<std::io::Error>) {
    let mut got = 0;
    while got < buf.len() {
        match f.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                *eintr += 1;
            }
            Err(e) => return (got, Some(e)),
        }
    }
    (got, None)
}

fn is_medium_errno(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EIO) | Some(libc::EREMOTEIO))
}

/// Dispatches one transfer's worth of reading into `st.buf`, updating the
/// input counters and the shrink/leave fields on short input.
pub fn read_transfer(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    if opts.in_type.contains(FileTypes::PT) {
        pt_read(opts, st)
    } else if opts.in_type.contains(FileTypes::TAPE) {
        tape_read(opts, st)
    } else if opts.reading_fifo {
        fifo_read(opts, st)
    } else {
        file_read(opts, st)
    }
}

/// Applies a short read of `got` payload bytes to the iteration plan.
fn shrink_to(opts: &mut Opts, st: &mut CopyState, got: usize, reason: LeaveReason) {
    let ibs = opts.ibs as usize;
    let obs = opts.obs as usize;
    let whole_in = got / ibs;
    let rem_in = got % ibs;
    opts.in_full += whole_in as i64;
    if rem_in > 0 {
        opts.in_partial += 1;
    }
    st.icbpt = (whole_in + usize::from(rem_in > 0)) as u32;
    st.ocbpt = (got / obs) as u32;
    st.partial_write_bytes = (got % obs) as u32;
    st.bytes_read = got;
    st.leave_after_write = true;
    st.leave_reason = reason;
    // The unread tail must not leak previous iterations into a padded or
    // partially-compared output block.
    let planned = st.planned_bytes;
    st.buf.as_mut_slice()[got..planned].fill(0);
}

// ── Block / regular file input ────────────────────────────────────────────────

fn file_read(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let ibs = opts.ibs as usize;
    let want = st.icbpt as usize * opts.ibs_pi as usize;
    let offset = opts.skip * opts.ibs_pi as i64;

    let mut eintr = 0u32;
    let (got, err) = {
        let f = opts.in_file.as_ref().expect("input not open");
        if st.if_filepos != offset {
            (&*f)
                .seek(SeekFrom::Start(offset as u64))
                .map_err(|e| Error::file(format!("{}: seek: {e}", opts.inf)))?;
        } else {
            vprint!(4, "{}: input already positioned at {}", opts.inf, offset);
        }
        read_full(f, &mut st.buf.as_mut_slice()[..want], &mut eintr)
    };
    opts.interrupted_retries += eintr;
    st.if_filepos = offset + got as i64;

    if let Some(e) = err {
        if is_medium_errno(&e) {
            if opts.iflag.coe {
                return coe_file_recover(opts, st, (got / ibs) as u32, offset);
            }
            return Err(Error::medium(format!("{}: read: {e}", opts.inf)));
        }
        return Err(Error::other(format!("{}: read: {e}", opts.inf)));
    }

    if got == want {
        opts.in_full += st.icbpt as i64;
        st.bytes_read = got;
        return Ok(());
    }

    // Short read: one extra block tells EOF from a quiet medium hole.
    let mut probe = vec![0u8; ibs];
    let mut eintr = 0u32;
    let (probe_got, probe_err) = {
        let f = opts.in_file.as_ref().expect("input not open");
        read_full(f, &mut probe, &mut eintr)
    };
    opts.interrupted_retries += eintr;
    if probe_err.is_none() && probe_got == 0 {
        shrink_to(opts, st, got, LeaveReason::Eof);
        return Ok(());
    }
    // Data (or another error) lives past the gap: this was a medium error.
    st.if_filepos = -1;
    if opts.iflag.coe {
        return coe_file_recover(opts, st, (got / ibs) as u32, offset);
    }
    Err(Error::medium(format!(
        "{}: short read at byte {} hides a medium error",
        opts.inf,
        offset + got as i64
    )))
}

/// One-block-at-a-time recovery from `start_blk` to the end of the planned
/// transfer.  The prefix of whole good blocks is kept as read.
fn coe_file_recover(opts: &mut Opts, st: &mut CopyState, start_blk: u32, offset: i64) -> Result<()> {
    let ibs = opts.ibs_pi as usize;
    opts.in_full += start_blk as i64;
    for b in start_blk..st.icbpt {
        let blk_off = offset + b as i64 * ibs as i64;
        let lba = opts.skip as u64 + b as u64;
        let range = b as usize * ibs..(b as usize + 1) * ibs;

        let mut eintr = 0u32;
        let (got, err) = {
            let f = opts.in_file.as_ref().expect("input not open");
            match (&*f).seek(SeekFrom::Start(blk_off as u64)) {
                Ok(_) => read_full(f, &mut st.buf.as_mut_slice()[range.clone()], &mut eintr),
                Err(e) => (0, Some(e)),
            }
        };
        opts.interrupted_retries += eintr;

        match err {
            None if got == ibs => {
                opts.coe_count = 0;
                opts.in_full += 1;
            }
            None if got == 0 && b > start_blk => {
                // Ran off the end during recovery: stop at b blocks, all of
                // which are already counted.
                st.if_filepos = blk_off;
                let done = b as usize * ibs;
                st.icbpt = b;
                st.ocbpt = (done / opts.obs as usize) as u32;
                st.partial_write_bytes = (done % opts.obs as usize) as u32;
                st.bytes_read = done;
                st.leave_after_write = true;
                st.leave_reason = LeaveReason::Eof;
                let planned = st.planned_bytes;
                st.buf.as_mut_slice()[done..planned].fill(0);
                return Ok(());
            }
            _ => {
                opts.coe_count += 1;
                if opts.coe_limit > 0 && opts.coe_count > opts.coe_limit {
                    return Err(Error::medium(format!(
                        "{}: {} consecutive unrecovered blocks exceed coe_limit",
                        opts.inf, opts.coe_count
                    )));
                }
                st.buf.as_mut_slice()[range].fill(0);
                opts.note_unrecovered(lba, lba);
                opts.in_partial += 1;
                opts.err_to_report = Category::MediumHard.exit_code();
                if let Some(log) = opts.errblk.as_mut() {
                    let _ = log.put(lba);
                }
                vprint!(1, "{}: zero-filled unreadable lba 0x{:x}", opts.inf, lba);
            }
        }
    }
    st.if_filepos = -1;
    st.bytes_read = st.icbpt as usize * ibs;
    Ok(())
}

// ── Fifo / stream input ───────────────────────────────────────────────────────

fn fifo_read(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let want = st.icbpt as usize * opts.ibs as usize;
    let mut eintr = 0u32;
    let (got, err) = {
        let f = opts.in_file.as_ref().expect("input not open");
        read_full(f, &mut st.buf.as_mut_slice()[..want], &mut eintr)
    };
    opts.interrupted_retries += eintr;
    if let Some(e) = err {
        return Err(Error::other(format!("{}: read: {e}", opts.inf)));
    }
    if got == want {
        opts.in_full += st.icbpt as i64;
        st.bytes_read = got;
    } else {
        shrink_to(opts, st, got, LeaveReason::Eof);
    }
    Ok(())
}

// ── Tape input ────────────────────────────────────────────────────────────────

fn tape_read(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let want = st.icbpt as usize * opts.ibs as usize;
    let got = loop {
        let res = {
            let mut f = opts.in_file.as_ref().expect("input not open");
            f.read(&mut st.buf.as_mut_slice()[..want])
        };
        match res {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                opts.interrupted_retries += 1;
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOMEM) | Some(libc::EOVERFLOW)) => {
                return Err(Error::other(format!(
                    "{}: tape block larger than requested read",
                    opts.inf
                )));
            }
            Err(e) if is_medium_errno(&e) => {
                return Err(Error::medium(format!("{}: read: {e}", opts.inf)));
            }
            Err(e) => return Err(Error::other(format!("{}: read: {e}", opts.inf))),
        }
    };
    if got == want {
        opts.in_full += st.icbpt as i64;
        st.bytes_read = got;
    } else if got == 0 {
        shrink_to(opts, st, 0, LeaveReason::Eof);
    } else {
        // Tape short reads are ordinary (variable block sizes); the loop may
        // continue after the matching short write.
        shrink_to(opts, st, got, LeaveReason::TapeShortRead);
    }
    Ok(())
}

// ── Pass-through input ────────────────────────────────────────────────────────

fn pt_read(opts: &mut Opts, st: &mut CopyState) -> Result<()> {
    let lba = opts.skip as u64;
    let want_blocks = st.icbpt;
    let mut retries_left = opts.retries;

    loop {
        let mut eintr = 0u32;
        let outcome = {
            let pt = opts.in_pt.as_mut().expect("pass-through input not open");
            loop {
                match pt.read(lba, want_blocks, st.buf.as_mut_slice()) {
                    Ok(o) => break Ok(o),
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => eintr += 1,
                    Err(e) => break Err(e),
                }
            }
        };
        opts.interrupted_retries += eintr;
        let outcome = outcome.map_err(|e| Error::other(format!("{}: read: {e}", opts.inf)))?;

        match outcome.status {
            PtStatus::Good | PtStatus::Recovered => {
                if outcome.status == PtStatus::Recovered {
                    opts.recovered_errs += 1;
                    opts.err_to_report = Category::Other.exit_code();
                }
                if outcome.blocks < want_blocks {
                    // Pass-through short reads carry no partial tail and are
                    // taken as the end of the device.
                    let ibs = opts.ibs as usize;
                    let obs = opts.obs as usize;
                    opts.in_full += outcome.blocks as i64;
                    st.icbpt = outcome.blocks;
                    st.ocbpt = ((outcome.blocks as usize * ibs) / obs) as u32;
                    st.partial_write_bytes = 0;
                    st.bytes_read = outcome.blocks as usize * opts.ibs_pi as usize;
                    st.leave_after_write = true;
                    st.leave_reason = LeaveReason::Eof;
                } else {
                    opts.in_full += want_blocks as i64;
                    st.bytes_read = want_blocks as usize * opts.ibs_pi as usize;
                }
                return Ok(());
            }
            PtStatus::UnitAttention | PtStatus::AbortedCommand if retries_left > 0 => {
                retries_left -= 1;
                opts.num_retries += 1;
                vprint!(2, "{}: read at lba 0x{:x} retried", opts.inf, lba);
            }
            PtStatus::MediumHard { lba: bad } => {
                if opts.iflag.coe {
                    let first_bad = bad.map(|l| l.saturating_sub(lba) as u32).unwrap_or(0);
                    return coe_pt_recover(opts, st, first_bad.min(want_blocks));
                }
                return Err(Error::medium(format!(
                    "{}: medium error reading lba 0x{:x}",
                    opts.inf,
                    bad.unwrap_or(lba)
                )));
            }
            other => {
                return Err(Error::new(
                    other.category(),
                    format!("{}: read failed at lba 0x{:x}", opts.inf, lba),
                ))
            }
        }
    }
}

/// Pass-through flavour of continue-on-error: keep the good prefix, then
/// re-read one block at a time, substituting zeros for the unreadable ones.
fn coe_pt_recover(opts: &mut Opts, st: &mut CopyState, start_blk: u32) -> Result<()> {
    let bs = opts.ibs_pi as usize;
    opts.in_full += start_blk as i64;
    for b in start_blk..st.icbpt {
        let lba = opts.skip as u64 + b as u64;
        let range = b as usize * bs..(b as usize + 1) * bs;
        let mut retries_left = opts.retries;

        let ok = loop {
            let mut eintr = 0u32;
            let res = {
                let pt = opts.in_pt.as_mut().expect("pass-through input not open");
                loop {
                    match pt.read(lba, 1, &mut st.buf.as_mut_slice()[range.clone()]) {
                        Ok(o) => break Ok(o),
                        Err(e) if e.raw_os_error() == Some(libc::EINTR) => eintr += 1,
                        Err(e) => break Err(e),
                    }
                }
            };
            opts.interrupted_retries += eintr;
            match res {
                Ok(o) if o.status.data_good() && o.blocks == 1 => {
                    if o.status == PtStatus::Recovered {
                        opts.recovered_errs += 1;
                    }
                    break true;
                }
                Ok(o)
                    if matches!(
                        o.status,
                        PtStatus::UnitAttention | PtStatus::AbortedCommand
                    ) && retries_left > 0 =>
                {
                    retries_left -= 1;
                    opts.num_retries += 1;
                }
                Ok(_) => break false,
                Err(e) => {
                    return Err(Error::other(format!("{}: read: {e}", opts.inf)));
                }
            }
        };

        if ok {
            opts.coe_count = 0;
            opts.in_full += 1;
        } else {
            opts.coe_count += 1;
            if opts.coe_limit > 0 && opts.coe_count > opts.coe_limit {
                return Err(Error::medium(format!(
                    "{}: {} consecutive unrecovered blocks exceed coe_limit",
                    opts.inf, opts.coe_count
                )));
            }
            st.buf.as_mut_slice()[range].fill(0);
            opts.note_unrecovered(lba, lba);
            opts.in_partial += 1;
            opts.err_to_report = Category::MediumHard.exit_code();
            if let Some(log) = opts.errblk.as_mut() {
                let _ = log.put(lba);
            }
            vprint!(1, "{}: zero-filled unreadable lba 0x{:x}", opts.inf, lba);
        }
    }
    st.bytes_read = st.icbpt as usize * bs;
    Ok(())
}
