//! SCSI pass-through provider.
//!
//! The copy engine never talks to a pass-through channel directly; it goes
//! through [`PtProvider`], which exposes exactly the command set the engine
//! needs: READ CAPACITY, READ, WRITE, WRITE SAME (16) with the UNMAP bit,
//! and SYNCHRONIZE CACHE.  The Linux implementation over the SG_IO ioctl
//! lives in [`sg`]; tests substitute in-memory doubles.
//!
//! Outcomes are reported on two levels: transport failures (the ioctl itself
//! failed) surface as `io::Error`, while SCSI-level conditions parsed from
//! sense data surface as [`PtStatus`] values the caller turns into retry or
//! abort decisions.

use std::io;

pub mod cdb;
pub mod sense;
pub mod sg;

// ── Command outcome categories ────────────────────────────────────────────────

/// SCSI-level outcome of one pass-through command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtStatus {
    Good,
    /// Sense key RECOVERED ERROR: data is valid, worth counting.
    Recovered,
    UnitAttention,
    AbortedCommand,
    /// Medium or hardware error; the failing LBA when the sense information
    /// field was valid.
    MediumHard { lba: Option<u64> },
    InvalidOp,
    NotReady,
    /// Data-protect sense key (protection-information check failed).
    Protection,
    /// Anything else (vendor sense, transport oddities).
    Other,
}

impl PtStatus {
    /// True for outcomes whose data phase can be trusted.
    #[inline]
    pub fn data_good(self) -> bool {
        matches!(self, PtStatus::Good | PtStatus::Recovered)
    }

    /// The exit-status category this outcome maps to when it ends the copy.
    pub fn category(self) -> crate::error::Category {
        use crate::error::Category;
        match self {
            PtStatus::Good | PtStatus::Recovered => Category::Other,
            PtStatus::UnitAttention => Category::UnitAttention,
            PtStatus::AbortedCommand => Category::AbortedCommand,
            PtStatus::MediumHard { .. } => Category::MediumHard,
            PtStatus::InvalidOp => Category::InvalidOp,
            PtStatus::NotReady => Category::NotReady,
            PtStatus::Protection => Category::Protection,
            PtStatus::Other => Category::Other,
        }
    }
}

/// Device capacity reported by READ CAPACITY.
#[derive(Debug, Clone, Copy)]
pub struct Capacity {
    pub num_sects: u64,
    pub sect_size: u32,
    /// Protection information enabled on the medium.
    pub prot_en: bool,
    /// Protection-interval exponent (extra bytes per block = 8 << exp).
    pub p_i_exp: u8,
}

/// READ outcome: status plus the number of whole blocks transferred
/// (shorter than requested when the device returned a residual).
#[derive(Debug, Clone, Copy)]
pub struct ReadOutcome {
    pub status: PtStatus,
    pub blocks: u32,
}

// ── Provider contract ─────────────────────────────────────────────────────────

/// Per-endpoint pass-through configuration, fixed at open time.
#[derive(Debug, Clone)]
pub struct PtConfig {
    /// CDB size for READ/WRITE: 6, 10, 12, 16 or 32.
    pub cdbsz: u32,
    /// RDPROTECT/WRPROTECT field (0..7).
    pub protect: u8,
    /// Bytes moved per logical block, including protection-information bytes.
    pub block_size: u32,
    pub dpo: bool,
    pub fua: bool,
    pub fua_nv: bool,
    /// Rebuild-assist recovery control (READ only).
    pub rarc: bool,
    /// Command timeout in milliseconds.
    pub timeout_ms: u32,
}

impl Default for PtConfig {
    fn default() -> Self {
        PtConfig {
            cdbsz: crate::cli::constants::DEF_SCSI_CDBSZ,
            protect: 0,
            block_size: crate::cli::constants::DEF_BLOCK_SIZE,
            dpo: false,
            fua: false,
            fua_nv: false,
            rarc: false,
            timeout_ms: DEF_PT_TIMEOUT_MS,
        }
    }
}

/// Default pass-through command timeout (60 s).
pub const DEF_PT_TIMEOUT_MS: u32 = 60_000;

/// The command set the copy engine issues over a pass-through channel.
///
/// One provider instance owns one opened device node; dropping it closes
/// the node.
pub trait PtProvider {
    /// READ CAPACITY (16, falling back from 10 when the device overflows
    /// the 32-bit reply).
    fn read_capacity(&mut self) -> io::Result<(PtStatus, Option<Capacity>)>;

    /// READ `blocks` logical blocks starting at `lba` into `buf`.
    /// `buf` must hold `blocks * block_size` bytes.
    fn read(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// WRITE `blocks` logical blocks starting at `lba` from `buf`.
    fn write(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> io::Result<PtStatus>;

    /// WRITE SAME (16) with the UNMAP bit over `lba .. lba+blocks`,
    /// de-allocating the range.
    fn write_same16_unmap(&mut self, lba: u64, blocks: u32) -> io::Result<PtStatus>;

    /// SYNCHRONIZE CACHE over the whole device.
    fn sync_cache(&mut self) -> io::Result<PtStatus>;

    /// Adjusts the bytes-per-block the provider moves.  Called once the
    /// protection-interval exponent is known from READ CAPACITY.
    fn set_block_size(&mut self, block_size: u32);
}
