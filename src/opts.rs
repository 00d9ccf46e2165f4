//! The process-wide options record.
//!
//! [`Opts`] gathers everything the engine needs for one run: block geometry,
//! positional cursors, endpoint handles and type bits, per-side flag vectors,
//! protection-information fields, and the counters the final report prints.
//! It is built by the CLI layer, threaded `&mut` through open / calculate /
//! copy / finish, and dropped at process exit.  Per-iteration working state
//! lives in [`crate::io::copy::CopyState`] instead, so nothing here aliases
//! between iterations.

use std::fs::File;
use std::time::Instant;

use crate::cli::constants::{DEF_BLOCK_SIZE, DEF_SCSI_CDBSZ};
use crate::io::errblk::ErrblkLog;
use crate::io::file_type::FileTypes;
use crate::pt::PtProvider;

// ── Per-side flag vector ──────────────────────────────────────────────────────

/// One side's `iflag=` / `oflag=` selections (plus the `conv=` shortcuts that
/// map onto the same bits).  All default to off.
#[derive(Debug, Clone, Default)]
pub struct FlagSet {
    pub append: bool,
    pub coe: bool,
    pub direct: bool,
    pub dpo: bool,
    pub errblk: bool,
    pub excl: bool,
    pub fdatasync: bool,
    pub flock: bool,
    pub force: bool,
    pub fsync: bool,
    pub fua: bool,
    pub fua_nv: bool,
    pub ignoreew: bool,
    pub nocache: bool,
    pub nofm: bool,
    pub norcap: bool,
    pub nowrite: bool,
    pub pad: bool,
    pub prealloc: bool,
    pub pt: bool,
    pub rarc: bool,
    pub resume: bool,
    pub self_same: bool,
    pub sparing: bool,
    /// Sparse level: 0 = off, 1 = skip zero blocks and materialise the tail,
    /// >1 = skip zero blocks and leave the length to the filesystem.
    pub sparse: u32,
    pub ssync: bool,
    pub strunc: bool,
    pub sync: bool,
    pub trim: bool,
    pub trunc: bool,
}

// ── Options record ────────────────────────────────────────────────────────────

/// Everything one run of the engine needs, in one aggregate.
pub struct Opts {
    // Block geometry.  The `_pi` variants are inflated by the per-block
    // protection-information bytes when rdprotect/wrprotect are nonzero.
    pub ibs: u32,
    pub obs: u32,
    pub ibs_pi: u32,
    pub obs_pi: u32,
    /// Input blocks fetched per copy-loop iteration.
    pub bpt_i: u32,
    pub bpt_given: bool,
    /// Output blocks per fine-grained sparse/sparing comparison chunk;
    /// 0 compares a whole transfer at once.
    pub obpc: u32,

    // Positional cursors, in block units of the respective side.
    pub skip: i64,
    pub seek: i64,
    /// Remaining input blocks; −1 means derive from capacities.
    pub dd_count: i64,

    // Endpoints.
    pub inf: String,
    pub outf: String,
    pub out2f: String,
    pub in_file: Option<File>,
    pub out_file: Option<File>,
    pub out2_file: Option<File>,
    pub in_pt: Option<Box<dyn PtProvider>>,
    pub out_pt: Option<Box<dyn PtProvider>>,
    pub in_type: FileTypes,
    pub out_type: FileTypes,
    pub out2_type: FileTypes,
    /// `out_type` as first categorised; stable across re-derivations.
    pub out_type_hold: FileTypes,
    pub iflag: FlagSet,
    pub oflag: FlagSet,
    /// Input is a fifo/char/tape stream: no capacity-based count inference,
    /// no seeking on the input side.
    pub reading_fifo: bool,

    // Protection information.
    pub rdprotect: u8,
    pub wrprotect: u8,
    pub rdp_i_exp: u8,
    pub wrp_i_exp: u8,

    // Pass-through tunables.
    pub cdbsz_in: u32,
    pub cdbsz_out: u32,
    pub cdbsz_given: bool,
    pub retries: u32,

    // Signal policy: false masks caught signals during I/O so they are only
    // seen at the drain point; true lets syscalls take EINTR.
    pub interrupt_io: bool,

    // Continue-on-error.
    pub coe_limit: u32,
    pub coe_count: u32,

    // Counters for the final report.
    pub in_full: i64,
    pub in_partial: i64,
    pub out_full: i64,
    pub out_partial: i64,
    pub out_sparse: i64,
    pub out_sparse_partial: i64,
    pub recovered_errs: u32,
    pub unrecovered_errs: u32,
    pub wr_recovered_errs: u32,
    pub wr_unrecovered_errs: u32,
    pub trim_errs: u32,
    pub num_retries: u32,
    pub interrupted_retries: u32,
    /// LBA range of unrecovered read errors; `highest_unrecovered < 0` means
    /// none seen yet.
    pub lowest_unrecovered: u64,
    pub highest_unrecovered: i64,
    /// Input/output block cursors of the first unrecovered error, for the
    /// restart hint printed with the final report.
    pub lowest_skip: i64,
    pub lowest_seek: i64,

    /// Non-fatal category observed mid-run, surfaced as the exit code when
    /// the copy otherwise ends 0.
    pub err_to_report: i32,

    /// Monotonic start of the copy; `None` until the loop begins.
    pub start_tm: Option<Instant>,

    /// Unrecovered-LBA log, open while `iflag=errblk` is active.
    pub errblk: Option<ErrblkLog>,

    /// Pre-allocation changed the file size (non-keep-size path), which
    /// defeats a later `oflag=resume`.
    pub prealloc_resize: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            ibs: DEF_BLOCK_SIZE,
            obs: DEF_BLOCK_SIZE,
            ibs_pi: DEF_BLOCK_SIZE,
            obs_pi: DEF_BLOCK_SIZE,
            bpt_i: default_bpt(DEF_BLOCK_SIZE),
            bpt_given: false,
            obpc: 0,
            skip: 0,
            seek: 0,
            dd_count: -1,
            inf: String::new(),
            outf: String::new(),
            out2f: String::new(),
            in_file: None,
            out_file: None,
            out2_file: None,
            in_pt: None,
            out_pt: None,
            in_type: FileTypes::empty(),
            out_type: FileTypes::empty(),
            out2_type: FileTypes::empty(),
            out_type_hold: FileTypes::empty(),
            iflag: FlagSet::default(),
            oflag: FlagSet::default(),
            reading_fifo: false,
            rdprotect: 0,
            wrprotect: 0,
            rdp_i_exp: 0,
            wrp_i_exp: 0,
            cdbsz_in: DEF_SCSI_CDBSZ,
            cdbsz_out: DEF_SCSI_CDBSZ,
            cdbsz_given: false,
            retries: 0,
            interrupt_io: false,
            coe_limit: 0,
            coe_count: 0,
            in_full: 0,
            in_partial: 0,
            out_full: 0,
            out_partial: 0,
            out_sparse: 0,
            out_sparse_partial: 0,
            recovered_errs: 0,
            unrecovered_errs: 0,
            wr_recovered_errs: 0,
            wr_unrecovered_errs: 0,
            trim_errs: 0,
            num_retries: 0,
            interrupted_retries: 0,
            lowest_unrecovered: 0,
            highest_unrecovered: -1,
            lowest_skip: -1,
            lowest_seek: -1,
            err_to_report: 0,
            start_tm: None,
            errblk: None,
            prealloc_resize: false,
        }
    }
}

impl Opts {
    /// Output blocks produced by one full transfer of `bpt_i` input blocks.
    #[inline]
    pub fn obpt(&self) -> u32 {
        ((self.bpt_i as u64 * self.ibs as u64) / self.obs as u64) as u32
    }

    /// Extra bytes per input block carried for protection information.
    #[inline]
    pub fn in_pi_bytes(&self) -> u32 {
        if self.rdprotect > 0 {
            8 << self.rdp_i_exp
        } else {
            0
        }
    }

    /// Extra bytes per output block carried for protection information.
    #[inline]
    pub fn out_pi_bytes(&self) -> u32 {
        if self.wrprotect > 0 {
            8 << self.wrp_i_exp
        } else {
            0
        }
    }

    /// Refreshes `ibs_pi`/`obs_pi` after protection fields settle.
    pub fn update_pi_block_sizes(&mut self) {
        self.ibs_pi = self.ibs + self.in_pi_bytes();
        self.obs_pi = self.obs + self.out_pi_bytes();
    }

    /// Seconds since the copy loop started, or `None` before it has.
    pub fn elapsed_secs(&self) -> Option<f64> {
        self.start_tm.map(|t| t.elapsed().as_secs_f64())
    }

    /// Records an unrecovered read error covering `lba ..= lba_end`.
    pub fn note_unrecovered(&mut self, lba: u64, lba_end: u64) {
        self.unrecovered_errs += 1;
        if self.highest_unrecovered < 0 {
            self.lowest_unrecovered = lba;
            self.highest_unrecovered = lba_end as i64;
            self.lowest_skip = self.skip;
            self.lowest_seek = self.seek;
        } else {
            if lba < self.lowest_unrecovered {
                self.lowest_unrecovered = lba;
            }
            if (lba_end as i64) > self.highest_unrecovered {
                self.highest_unrecovered = lba_end as i64;
            }
        }
    }
}

// ── bpt default table ─────────────────────────────────────────────────────────

/// Default input blocks-per-transfer for a given input block size: small
/// blocks batch aggressively, large blocks transfer one at a time.
pub fn default_bpt(ibs: u32) -> u32 {
    if ibs < 8 {
        8192
    } else if ibs < 64 {
        1024
    } else if ibs < 1024 {
        128
    } else if ibs < 8192 {
        16
    } else if ibs < 32768 {
        4
    } else {
        1
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
