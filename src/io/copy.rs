//! The copy loop.
//!
//! Per iteration: PLAN the transfer size, READ through the input dispatch,
//! mirror to OFILE2, then WRITE through the output dispatch (which applies
//! sparing and sparse filtering), and ADVANCE the cursors.  Signals are
//! drained at the top of the iteration and again just before the write.
//! A short input marks `leave_after_write`: the planned blocks still reach
//! the output, then the loop stops (except after a tape short read, which
//! is ordinary and lets the loop continue).
//!
//! [`finish`] runs the end-of-run work: data syncs, SCSI cache sync, the
//! tape filemark policy, and closing in a fixed order (transfer buffers are
//! freed when the loop's state drops, before any handle is closed).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::fd::AsRawFd;
use std::time::Instant;

use crate::error::{Category, Error, Result};
use crate::io::file_type::FileTypes;
use crate::io::read::read_transfer;
use crate::io::sparse::sparse_post_pass;
use crate::io::stats::{print_stats, print_throughput};
use crate::io::tape;
use crate::io::write::{write_of2, write_transfer};
use crate::opts::Opts;
use crate::pt::PtStatus;
use crate::signals::{Drained, SignalBroker};
use crate::{vprint, warn_user};

// ── Page-aligned transfer buffer ──────────────────────────────────────────────

/// Transfer buffer allocated on a page boundary, as O_DIRECT endpoints
/// require.  Zero-initialised.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

impl AlignedBuf {
    pub fn new(len: usize) -> AlignedBuf {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let align = if page > 0 { page as usize } else { 4096 };
        let layout = Layout::from_size_align(len.max(align), align).expect("buffer layout");
        // SAFETY: layout has nonzero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "transfer buffer allocation failed");
        AlignedBuf { ptr, len, layout }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr covers len bytes for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr covers len bytes for the life of self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in new().
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// ── Per-iteration state ───────────────────────────────────────────────────────

/// Why the loop must stop after the pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    None,
    Eof,
    /// Ordinary on tape; the loop continues after the matching short write.
    TapeShortRead,
}

/// Working state of the loop: the per-iteration plan plus the tracked file
/// positions and the transfer buffers (owned here so they are freed before
/// the finaliser closes any handle).
pub struct CopyState {
    /// Input blocks this iteration (shrinks on short reads).
    pub icbpt: u32,
    /// Output blocks this iteration.
    pub ocbpt: u32,
    /// Trailing bytes that do not fill an output block.
    pub partial_write_bytes: u32,
    /// Bytes the current plan covers; short reads zero the tail up to here.
    pub planned_bytes: usize,
    /// Believed byte offsets of the descriptors; −1 forces a seek.
    pub if_filepos: i64,
    pub of_filepos: i64,
    pub bytes_read: usize,
    pub bytes_of: usize,
    pub bytes_of2: usize,
    pub leave_after_write: bool,
    pub leave_reason: LeaveReason,
    pub buf: AlignedBuf,
    pub sparing_buf: Option<Vec<u8>>,
}

impl CopyState {
    pub fn new(opts: &Opts) -> CopyState {
        let buf_len = opts.ibs_pi as usize * opts.bpt_i as usize;
        let sparing_buf = if opts.oflag.sparing {
            // Whole-transfer read-back plus room for a partial tail.
            Some(vec![0u8; opts.obpt() as usize * opts.obs as usize + opts.obs as usize])
        } else {
            None
        };
        CopyState {
            icbpt: 0,
            ocbpt: 0,
            partial_write_bytes: 0,
            planned_bytes: 0,
            if_filepos: 0,
            of_filepos: 0,
            bytes_read: 0,
            bytes_of: 0,
            bytes_of2: 0,
            leave_after_write: false,
            leave_reason: LeaveReason::None,
            buf: AlignedBuf::new(buf_len),
            sparing_buf,
        }
    }
}

// ── Signal drain ──────────────────────────────────────────────────────────────

fn drain_signals(opts: &mut Opts, broker: &SignalBroker) {
    match broker.poll() {
        Some(Drained::Interrupt(sig)) => {
            eprintln!();
            print_stats(opts, true);
            print_throughput(opts, false);
            if opts.out_type.contains(FileTypes::REG) && !opts.prealloc_resize {
                vprint!(1, "to pick up where this stopped, re-run with oflag=resume");
            }
            broker.forward_interrupt(sig);
            // Only reached when the default disposition did not terminate.
            std::process::exit(Category::Other.exit_code());
        }
        Some(Drained::Info) => {
            print_stats(opts, true);
            print_throughput(opts, true);
        }
        None => {}
    }
}

// ── Pre-flight checks that need opened endpoints ──────────────────────────────

fn pre_copy_checks(opts: &mut Opts) -> Result<()> {
    if opts.oflag.sparing
        && !(opts.out_type.contains(FileTypes::REG) || opts.out_type.contains(FileTypes::BLOCK))
    {
        return Err(Error::syntax(
            "oflag=sparing needs a readable, seekable output file",
        ));
    }
    if opts.oflag.sparse > 0
        && (opts.out_type.contains(FileTypes::FIFO) || opts.out_type.contains(FileTypes::TAPE))
    {
        warn_user!("sparse has no meaning on a stream output; ignored");
        opts.oflag.sparse = 0;
    }
    if opts.oflag.trim && !opts.out_type.contains(FileTypes::PT) {
        warn_user!("trim/unmap needs a pass-through output; ignored");
        opts.oflag.trim = false;
    }
    if opts.rdprotect > 0 && !opts.in_type.contains(FileTypes::PT) {
        return Err(Error::syntax(
            "protect= read field needs a pass-through input",
        ));
    }
    if opts.wrprotect > 0 && !opts.out_type.contains(FileTypes::PT) {
        return Err(Error::syntax(
            "protect= write field needs a pass-through output",
        ));
    }
    Ok(())
}

// ── The loop ──────────────────────────────────────────────────────────────────

/// Runs the whole copy.  `broker` is absent only under test.
pub fn do_copy(opts: &mut Opts, broker: Option<&SignalBroker>) -> Result<()> {
    pre_copy_checks(opts)?;
    opts.start_tm = Some(Instant::now());
    if opts.dd_count == 0 {
        return Ok(());
    }
    let mut st = CopyState::new(opts);

    loop {
        if let Some(b) = broker {
            drain_signals(opts, b);
        }
        if opts.dd_count == 0 {
            break;
        }

        // PLAN
        let planned: u32 = if opts.dd_count < 0 {
            opts.bpt_i
        } else {
            opts.bpt_i.min(opts.dd_count as u32)
        };
        st.icbpt = planned;
        let in_bytes = planned as usize * opts.ibs as usize;
        st.ocbpt = (in_bytes / opts.obs as usize) as u32;
        st.partial_write_bytes = (in_bytes % opts.obs as usize) as u32;
        st.planned_bytes = planned as usize * opts.ibs_pi as usize;
        st.leave_after_write = false;
        st.leave_reason = LeaveReason::None;
        st.bytes_read = 0;
        st.bytes_of = 0;
        st.bytes_of2 = 0;
        if st.partial_write_bytes > 0 {
            // The unfilled tail of the last output block must not carry
            // ghost data from an earlier iteration.
            st.buf.as_mut_slice()[..st.planned_bytes].fill(0);
        }

        read_transfer(opts, &mut st)?;
        if st.bytes_read == 0 {
            st.partial_write_bytes = 0;
            break;
        }

        write_of2(opts, &mut st)?;
        if let Some(b) = broker {
            drain_signals(opts, b);
        }
        write_transfer(opts, &mut st)?;

        // ADVANCE
        opts.skip += st.icbpt as i64;
        opts.seek += st.ocbpt as i64;
        if opts.dd_count > 0 {
            opts.dd_count -= st.icbpt as i64;
        }
        if opts.oflag.nocache {
            if let Some(f) = opts.out_file.as_ref() {
                // SAFETY: advisory call on our own descriptor.
                unsafe {
                    libc::posix_fadvise(f.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
                }
            }
        }
        if opts.iflag.nocache {
            if let Some(f) = opts.in_file.as_ref() {
                // SAFETY: advisory call on our own descriptor.
                unsafe {
                    libc::posix_fadvise(f.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
                }
            }
        }

        if st.leave_after_write {
            if st.leave_reason == LeaveReason::TapeShortRead {
                continue;
            }
            break;
        }
    }

    let want_len = opts.seek as u64 * opts.obs as u64 + st.partial_write_bytes as u64;
    drop(st);
    sparse_post_pass(opts, want_len)?;
    Ok(())
}

// ── Finalisation ──────────────────────────────────────────────────────────────

/// End-of-run work: syncs, cache flush, tape filemark, close order.
pub fn finish(opts: &mut Opts) -> Result<()> {
    if let Some(f) = opts.out_file.as_ref() {
        if opts.oflag.fsync {
            f.sync_all()
                .map_err(|e| Error::file(format!("{}: fsync: {e}", opts.outf)))?;
        } else if opts.oflag.fdatasync {
            f.sync_data()
                .map_err(|e| Error::file(format!("{}: fdatasync: {e}", opts.outf)))?;
        }
    }
    if opts.oflag.ssync {
        if let Some(pt) = opts.out_pt.as_mut() {
            match pt.sync_cache() {
                Ok(PtStatus::Good) => {}
                Ok(other) => warn_user!("{}: synchronize cache reported {:?}", opts.outf, other),
                Err(e) => warn_user!("{}: synchronize cache failed: {}", opts.outf, e),
            }
        }
    }
    // The held type survives any mid-run re-derivation of out_type.
    if opts.out_type_hold.contains(FileTypes::TAPE) {
        if let Some(f) = opts.out_file.as_ref() {
            tape::finalize_output(f, opts.oflag.nofm)
                .unwrap_or_else(|e| warn_user!("{}: filemark handling: {}", opts.outf, e));
        }
    }
    // Fixed teardown order: secondary output, primary output, input.
    // Pass-through handles close through their provider's drop.
    opts.out2_file = None;
    opts.out_file = None;
    opts.out_pt = None;
    opts.in_file = None;
    opts.in_pt = None;
    opts.errblk = None;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt::{Capacity, PtProvider, ReadOutcome};
    use std::collections::HashSet;
    use std::fs::OpenOptions;
    use std::io;
    use tempfile::TempDir;

    // ── In-memory pass-through double ─────────────────────────────────────────
    //
    // State lives behind an Rc so a test can keep a handle and inspect what
    // reached the "device" after the engine is done with its boxed provider.

    use std::cell::RefCell;
    use std::rc::Rc;

    struct RamInner {
        data: Vec<u8>,
        bs: u32,
        bad_lbas: HashSet<u64>,
        /// Ranges handed to WRITE SAME/UNMAP.
        unmapped: Vec<(u64, u32)>,
        /// Unit attentions still pending (consumed one per command).
        pending_ua: u32,
    }

    #[derive(Clone)]
    struct RamPt {
        inner: Rc<RefCell<RamInner>>,
    }

    impl RamPt {
        fn new(blocks: u64, bs: u32) -> RamPt {
            RamPt {
                inner: Rc::new(RefCell::new(RamInner {
                    data: vec![0u8; (blocks * bs as u64) as usize],
                    bs,
                    bad_lbas: HashSet::new(),
                    unmapped: Vec::new(),
                    pending_ua: 0,
                })),
            }
        }

        fn fill(&self, pattern: u8) {
            self.inner.borrow_mut().data.fill(pattern);
        }

        fn mark_bad(&self, lba: u64) {
            self.inner.borrow_mut().bad_lbas.insert(lba);
        }

        fn set_pending_ua(&self, n: u32) {
            self.inner.borrow_mut().pending_ua = n;
        }

        fn data(&self) -> Vec<u8> {
            self.inner.borrow().data.clone()
        }

        fn unmapped(&self) -> Vec<(u64, u32)> {
            self.inner.borrow().unmapped.clone()
        }
    }

    impl PtProvider for RamPt {
        fn read_capacity(&mut self) -> io::Result<(PtStatus, Option<Capacity>)> {
            let mut inner = self.inner.borrow_mut();
            if inner.pending_ua > 0 {
                inner.pending_ua -= 1;
                return Ok((PtStatus::UnitAttention, None));
            }
            let num_sects = inner.data.len() as u64 / inner.bs as u64;
            Ok((
                PtStatus::Good,
                Some(Capacity {
                    num_sects,
                    sect_size: inner.bs,
                    prot_en: false,
                    p_i_exp: 0,
                }),
            ))
        }

        fn read(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            let mut inner = self.inner.borrow_mut();
            if inner.pending_ua > 0 {
                inner.pending_ua -= 1;
                return Ok(ReadOutcome {
                    status: PtStatus::UnitAttention,
                    blocks: 0,
                });
            }
            let bs = inner.bs as usize;
            for b in 0..blocks as u64 {
                if inner.bad_lbas.contains(&(lba + b)) {
                    return Ok(ReadOutcome {
                        status: PtStatus::MediumHard { lba: Some(lba + b) },
                        blocks: 0,
                    });
                }
            }
            let end = ((lba + blocks as u64) * bs as u64).min(inner.data.len() as u64);
            let start = (lba * bs as u64).min(end);
            let got = (end - start) as usize;
            buf[..got].copy_from_slice(&inner.data[start as usize..end as usize]);
            Ok(ReadOutcome {
                status: PtStatus::Good,
                blocks: (got / bs) as u32,
            })
        }

        fn write(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> io::Result<PtStatus> {
            let mut inner = self.inner.borrow_mut();
            let bs = inner.bs as usize;
            let start = lba as usize * bs;
            let len = blocks as usize * bs;
            if start + len > inner.data.len() {
                return Ok(PtStatus::MediumHard { lba: Some(lba) });
            }
            inner.data[start..start + len].copy_from_slice(&buf[..len]);
            Ok(PtStatus::Good)
        }

        fn write_same16_unmap(&mut self, lba: u64, blocks: u32) -> io::Result<PtStatus> {
            let mut inner = self.inner.borrow_mut();
            let bs = inner.bs as usize;
            let start = lba as usize * bs;
            let len = blocks as usize * bs;
            if start + len > inner.data.len() {
                return Ok(PtStatus::InvalidOp);
            }
            inner.data[start..start + len].fill(0);
            inner.unmapped.push((lba, blocks));
            Ok(PtStatus::Good)
        }

        fn sync_cache(&mut self) -> io::Result<PtStatus> {
            Ok(PtStatus::Good)
        }

        fn set_block_size(&mut self, block_size: u32) {
            self.inner.borrow_mut().bs = block_size;
        }
    }

    // ── Scaffolding ───────────────────────────────────────────────────────────

    fn reg_to_reg(dir: &TempDir, src_data: &[u8]) -> Opts {
        let mut o = Opts::default();
        o.inf = dir.path().join("src").to_str().unwrap().to_owned();
        o.outf = dir.path().join("dst").to_str().unwrap().to_owned();
        std::fs::write(&o.inf, src_data).unwrap();
        crate::io::open::open_input(&mut o).unwrap();
        crate::io::open::open_output(&mut o).unwrap();
        o
    }

    fn run_copy(o: &mut Opts) {
        crate::io::calc::calc_count(o).unwrap();
        do_copy(o, None).unwrap();
    }

    // ── Plain copies ──────────────────────────────────────────────────────────

    #[test]
    fn ten_block_copy_counts_and_content() {
        let dir = TempDir::new().unwrap();
        let src: Vec<u8> = vec![0u8; 10 * 512];
        let mut o = reg_to_reg(&dir, &src);
        o.dd_count = 10;
        run_copy(&mut o);
        assert_eq!(o.in_full, 10);
        assert_eq!(o.out_full, 10);
        assert_eq!(o.in_partial, 0);
        assert_eq!(o.out_partial, 0);
        let dst = std::fs::read(&o.outf).unwrap();
        assert_eq!(dst.len(), 5120);
        assert_eq!(dst, src);
    }

    #[test]
    fn mismatched_block_sizes_couple_correctly() {
        let dir = TempDir::new().unwrap();
        let src: Vec<u8> = (0..8 * 512).map(|i| (i % 251) as u8).collect();
        let mut o = reg_to_reg(&dir, &src);
        o.ibs = 512;
        o.obs = 1024;
        o.update_pi_block_sizes();
        o.bpt_i = 4;
        o.dd_count = 8;
        run_copy(&mut o);
        assert_eq!(o.in_full, 8);
        assert_eq!(o.out_full, 4);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    #[test]
    fn skip_and_seek_offset_both_sides() {
        let dir = TempDir::new().unwrap();
        let src: Vec<u8> = (0..6 * 512).map(|i| (i / 512) as u8 + 1).collect();
        let mut o = reg_to_reg(&dir, &src);
        o.skip = 2;
        o.seek = 3;
        run_copy(&mut o);
        assert_eq!(o.in_full, 4);
        let dst = std::fs::read(&o.outf).unwrap();
        assert_eq!(dst.len(), (3 + 4) * 512);
        assert!(dst[..3 * 512].iter().all(|&b| b == 0));
        assert_eq!(&dst[3 * 512..], &src[2 * 512..]);
    }

    #[test]
    fn partial_tail_block_is_written_and_counted() {
        let dir = TempDir::new().unwrap();
        let src = vec![9u8; 2 * 512 + 100];
        let mut o = reg_to_reg(&dir, &src);
        run_copy(&mut o);
        assert_eq!(o.in_full, 2);
        assert_eq!(o.in_partial, 1);
        assert_eq!(o.out_full, 2);
        assert_eq!(o.out_partial, 1);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    #[test]
    fn counter_law_holds_at_termination() {
        let dir = TempDir::new().unwrap();
        let src = vec![3u8; 7 * 512];
        let mut o = reg_to_reg(&dir, &src);
        o.ibs = 512;
        o.obs = 256;
        o.update_pi_block_sizes();
        o.bpt_i = 4;
        run_copy(&mut o);
        let in_bytes = o.ibs as i64 * (o.in_full + o.in_partial);
        let out_bytes = o.obs as i64 * (o.out_full + o.out_partial);
        assert_eq!(in_bytes, out_bytes);
        assert_eq!(o.in_full, 7);
        assert_eq!(o.out_full, 14);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    // ── Secondary output ──────────────────────────────────────────────────────

    #[test]
    fn of2_receives_every_byte_read() {
        let dir = TempDir::new().unwrap();
        let src: Vec<u8> = (0..5 * 512).map(|i| (i % 199) as u8).collect();
        let mut o = reg_to_reg(&dir, &src);
        o.out2f = dir.path().join("mirror").to_str().unwrap().to_owned();
        crate::io::open::open_output2(&mut o).unwrap();
        run_copy(&mut o);
        assert_eq!(std::fs::read(&o.out2f).unwrap(), src);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    // ── Sparse ────────────────────────────────────────────────────────────────

    #[test]
    fn sparse_skips_zero_blocks_and_materialises_tail() {
        let dir = TempDir::new().unwrap();
        let mut src = vec![0u8; 4096];
        src.extend_from_slice(&[b'A'; 512]);
        src.extend_from_slice(&vec![0u8; 4096]);
        let mut o = reg_to_reg(&dir, &src);
        o.oflag.sparse = 1;
        run_copy(&mut o);
        let dst = std::fs::read(&o.outf).unwrap();
        assert_eq!(dst.len(), src.len());
        assert!(dst[..4096].iter().all(|&b| b == 0));
        assert!(dst[4096..4608].iter().all(|&b| b == b'A'));
        assert!(dst[4608..].iter().all(|&b| b == 0));
        assert!(o.out_sparse >= 16);
        assert_eq!(o.in_full, 17);
    }

    #[test]
    fn sparse_copy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut src = vec![0u8; 2048];
        src.extend_from_slice(&[7u8; 512]);
        src.extend_from_slice(&vec![0u8; 1024]);
        let mut o = reg_to_reg(&dir, &src);
        o.oflag.sparse = 1;
        run_copy(&mut o);
        let first = std::fs::read(&o.outf).unwrap();

        let mut o2 = Opts::default();
        o2.inf = o.inf.clone();
        o2.outf = o.outf.clone();
        o2.oflag.sparse = 1;
        crate::io::open::open_input(&mut o2).unwrap();
        crate::io::open::open_output(&mut o2).unwrap();
        run_copy(&mut o2);
        let second = std::fs::read(&o2.outf).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fine_grained_sparse_keeps_nonzero_chunks() {
        let dir = TempDir::new().unwrap();
        // 8 blocks: zero, data, zero, data...
        let mut src = Vec::new();
        for i in 0..8u8 {
            let fill = if i % 2 == 0 { 0 } else { i };
            src.extend_from_slice(&vec![fill; 512]);
        }
        let mut o = reg_to_reg(&dir, &src);
        o.oflag.sparse = 1;
        o.obpc = 1; // compare block by block
        o.bpt_i = 8;
        run_copy(&mut o);
        assert_eq!(o.out_sparse, 4);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    // ── Sparing ───────────────────────────────────────────────────────────────

    #[test]
    fn sparing_skips_matching_destination() {
        let dir = TempDir::new().unwrap();
        let src: Vec<u8> = (0..4 * 512).map(|i| (i % 241) as u8).collect();
        let mut o = reg_to_reg(&dir, &src);
        std::fs::write(&o.outf, &src).unwrap();
        // Re-open to pick up the now-identical destination with sparing.
        o.out_file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&o.outf)
                .unwrap(),
        );
        o.oflag.sparing = true;
        run_copy(&mut o);
        assert_eq!(o.out_full, 4);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    #[test]
    fn fine_grained_sparing_rewrites_only_mismatches() {
        let dir = TempDir::new().unwrap();
        let src: Vec<u8> = vec![0xAA; 4 * 512];
        let mut o = reg_to_reg(&dir, &src);
        // Destination differs in block 2 only.
        let mut dst = src.clone();
        dst[2 * 512..3 * 512].fill(0x55);
        std::fs::write(&o.outf, &dst).unwrap();
        o.out_file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&o.outf)
                .unwrap(),
        );
        o.oflag.sparing = true;
        o.obpc = 1;
        run_copy(&mut o);
        assert_eq!(std::fs::read(&o.outf).unwrap(), src);
    }

    #[test]
    fn sparing_without_seekable_output_is_rejected() {
        let mut o = Opts::default();
        o.out_type = FileTypes::NULL;
        o.oflag.sparing = true;
        o.dd_count = 1;
        let err = do_copy(&mut o, None).unwrap_err();
        assert_eq!(err.category, Category::Syntax);
    }

    // ── Pass-through paths ────────────────────────────────────────────────────

    fn pt_input_opts(dir: &TempDir, ram: RamPt) -> Opts {
        let mut o = Opts::default();
        o.inf = "/dev/sg7".to_owned(); // label only; traffic goes to the double
        o.outf = dir.path().join("dst").to_str().unwrap().to_owned();
        o.in_type = FileTypes::CHR | FileTypes::PT;
        o.in_pt = Some(Box::new(ram));
        crate::io::open::open_output(&mut o).unwrap();
        o
    }

    #[test]
    fn pt_read_copies_device_contents() {
        let dir = TempDir::new().unwrap();
        let ram = RamPt::new(64, 512);
        ram.fill(0x5a);
        let mut o = pt_input_opts(&dir, ram);
        run_copy(&mut o);
        assert_eq!(o.in_full, 64);
        let dst = std::fs::read(&o.outf).unwrap();
        assert_eq!(dst.len(), 64 * 512);
        assert!(dst.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn read_capacity_unit_attention_is_retried_once() {
        let dir = TempDir::new().unwrap();
        let ram = RamPt::new(8, 512);
        ram.set_pending_ua(1);
        let mut o = pt_input_opts(&dir, ram);
        crate::io::calc::calc_count(&mut o).unwrap();
        assert_eq!(o.dd_count, 8);
    }

    #[test]
    fn coe_substitutes_zeros_and_counts() {
        let dir = TempDir::new().unwrap();
        let ram = RamPt::new(16, 512);
        ram.fill(0x77);
        ram.mark_bad(5);
        ram.mark_bad(9);
        let mut o = pt_input_opts(&dir, ram);
        o.iflag.coe = true;
        run_copy(&mut o);
        assert_eq!(o.unrecovered_errs, 2);
        assert_eq!(o.in_partial, 2);
        assert_eq!(o.in_full, 14);
        assert_eq!(o.lowest_unrecovered, 5);
        assert_eq!(o.highest_unrecovered, 9);
        assert_eq!(o.err_to_report, Category::MediumHard.exit_code());
        let dst = std::fs::read(&o.outf).unwrap();
        assert!(dst[5 * 512..6 * 512].iter().all(|&b| b == 0));
        assert!(dst[9 * 512..10 * 512].iter().all(|&b| b == 0));
        assert!(dst[..5 * 512].iter().all(|&b| b == 0x77));
    }

    #[test]
    fn coe_limit_aborts_on_consecutive_run() {
        let dir = TempDir::new().unwrap();
        let ram = RamPt::new(16, 512);
        ram.fill(0x11);
        for lba in 4..9 {
            ram.mark_bad(lba);
        }
        let mut o = pt_input_opts(&dir, ram);
        o.iflag.coe = true;
        o.coe_limit = 3;
        crate::io::calc::calc_count(&mut o).unwrap();
        let err = do_copy(&mut o, None).unwrap_err();
        assert_eq!(err.category, Category::MediumHard);
        // The 4th consecutive bad block aborts without being substituted.
        assert_eq!(o.unrecovered_errs, 3);
    }

    #[test]
    fn without_coe_a_medium_error_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ram = RamPt::new(8, 512);
        ram.mark_bad(3);
        let mut o = pt_input_opts(&dir, ram);
        crate::io::calc::calc_count(&mut o).unwrap();
        let err = do_copy(&mut o, None).unwrap_err();
        assert_eq!(err.category, Category::MediumHard);
    }

    #[test]
    fn pt_output_trim_unmaps_zero_runs() {
        let dir = TempDir::new().unwrap();
        let mut src = vec![0u8; 2 * 512];
        src.extend_from_slice(&[1u8; 512]);
        src.extend_from_slice(&vec![0u8; 512]);
        let src_path = dir.path().join("src");
        std::fs::write(&src_path, &src).unwrap();

        let mut o = Opts::default();
        o.inf = src_path.to_str().unwrap().to_owned();
        o.outf = "/dev/sg8".to_owned();
        crate::io::open::open_input(&mut o).unwrap();
        o.out_type = FileTypes::CHR | FileTypes::PT;
        o.out_type_hold = o.out_type;
        let ram = RamPt::new(8, 512);
        ram.fill(0xff);
        o.out_pt = Some(Box::new(ram.clone()));
        o.oflag.norcap = true;
        o.oflag.sparse = 1;
        o.oflag.trim = true;
        o.obpc = 1;
        run_copy(&mut o);
        assert_eq!(o.out_sparse, 3);

        let data = ram.data();
        assert_eq!(ram.unmapped().len(), 3);
        assert!(data[..2 * 512].iter().all(|&b| b == 0));
        assert!(data[2 * 512..3 * 512].iter().all(|&b| b == 1));
        assert!(data[3 * 512..4 * 512].iter().all(|&b| b == 0));
    }

    #[test]
    fn nowrite_touches_nothing_but_counts() {
        let dir = TempDir::new().unwrap();
        let src = vec![4u8; 4 * 512];
        let mut o = reg_to_reg(&dir, &src);
        o.oflag.nowrite = true;
        run_copy(&mut o);
        assert_eq!(o.out_full, 4);
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 0);
    }

    // ── Finalisation ──────────────────────────────────────────────────────────

    #[test]
    fn finish_closes_everything() {
        let dir = TempDir::new().unwrap();
        let src = vec![1u8; 512];
        let mut o = reg_to_reg(&dir, &src);
        o.oflag.fdatasync = true;
        run_copy(&mut o);
        finish(&mut o).unwrap();
        assert!(o.in_file.is_none());
        assert!(o.out_file.is_none());
        assert!(o.out_pt.is_none());
    }
}
