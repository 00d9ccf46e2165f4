//! Command-line operand parsing.
//!
//! Operands are order-independent `key=value` tokens (`if=`, `of=`, `bs=`,
//! `iflag=`, ...) plus the long flags `--help`, `--verbose` and
//! `--version`.  The entry points are [`parse_args`] (reads
//! `std::env::args()`) and [`parse_args_from`] (takes an explicit slice,
//! suitable for unit tests).  Both return a [`ParsedArgs`] carrying a fully
//! validated [`Opts`]; every bad operand is reported as a one-line
//! `bad usage:` message.
//!
//! Numeric values accept the dd family's multiplier suffixes (`c` `w` `b`
//! `k` `K` `KiB` `KB` and the m/g equivalents), `0x`/trailing-`h` hex, and
//! the `NxM` product form.

use anyhow::anyhow;

use crate::cli::constants::{set_suppress_xfer_report, set_verbosity, DEF_BLOCK_SIZE};
use crate::opts::{default_bpt, FlagSet, Opts};

// ── Output type ───────────────────────────────────────────────────────────────

/// Result of a successful parse.
pub struct ParsedArgs {
    pub opts: Opts,
    /// `--help` / `--version` was handled; exit 0 without copying.
    pub exit_early: bool,
    /// `verbose=` was negative: stderr is to be pointed at the null sink.
    pub quiet_stderr: bool,
}

// ── Numeric operand parsing ───────────────────────────────────────────────────

/// Parses a numeric operand with multiplier suffixes, hex forms, and the
/// `NxM` product form.
pub fn parse_num(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty number".to_owned());
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).map_err(|_| format!("bad hex number '{s}'"));
    }
    if let Some(hex) = s.strip_suffix(['h', 'H']) {
        return i64::from_str_radix(hex, 16).map_err(|_| format!("bad hex number '{s}'"));
    }
    // Product form: both factors parsed recursively ("2x1024").
    if let Some((a, b)) = s.split_once('x') {
        if !a.is_empty() && !b.is_empty() {
            let lhs = parse_num(a)?;
            let rhs = parse_num(b)?;
            return lhs
                .checked_mul(rhs)
                .ok_or_else(|| format!("'{s}' overflows"));
        }
    }
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(digits_end);
    let num: i64 = num_str.parse().map_err(|_| format!("bad number '{s}'"))?;
    let mult: i64 = match suffix {
        "" | "c" | "C" => 1,
        "w" | "W" => 2,
        "b" | "B" => 512,
        "k" | "KiB" => 1024,
        "K" | "KB" | "kB" => 1000,
        "m" | "MiB" => 1024 * 1024,
        "M" | "MB" => 1_000_000,
        "g" | "GiB" => 1024 * 1024 * 1024,
        "G" | "GB" => 1_000_000_000,
        _ => return Err(format!("bad multiplier suffix '{suffix}'")),
    };
    num.checked_mul(mult).ok_or_else(|| format!("'{s}' overflows"))
}

fn parse_u32(key: &str, val: &str) -> anyhow::Result<u32> {
    let n = parse_num(val).map_err(|e| anyhow!("bad usage: {key}=: {e}"))?;
    u32::try_from(n).map_err(|_| anyhow!("bad usage: {key}= must be a non-negative 32-bit value"))
}

// ── Flag lists ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    In,
    Out,
}

fn parse_flags(list: &str, fs: &mut FlagSet, side: Side) -> anyhow::Result<()> {
    let side_name = if side == Side::In { "iflag" } else { "oflag" };
    for flag in list.split(',') {
        let out_only = matches!(
            flag,
            "append"
                | "fdatasync"
                | "fsync"
                | "ignoreew"
                | "nofm"
                | "nowrite"
                | "pre-alloc"
                | "prealloc"
                | "resume"
                | "sparing"
                | "sparse"
                | "ssync"
                | "strunc"
                | "trim"
                | "unmap"
                | "trunc"
        );
        let in_only = matches!(flag, "errblk" | "rarc");
        if out_only && side == Side::In {
            return Err(anyhow!("bad usage: {flag} is an output flag (oflag=)"));
        }
        if in_only && side == Side::Out {
            return Err(anyhow!("bad usage: {flag} is an input flag (iflag=)"));
        }
        match flag {
            "append" => fs.append = true,
            "coe" => fs.coe = true,
            "direct" => fs.direct = true,
            "dpo" => fs.dpo = true,
            "errblk" => fs.errblk = true,
            "excl" => fs.excl = true,
            "fdatasync" => fs.fdatasync = true,
            "flock" => fs.flock = true,
            "force" => fs.force = true,
            "fsync" => fs.fsync = true,
            "fua" => fs.fua = true,
            "fua_nv" => fs.fua_nv = true,
            "ignoreew" => fs.ignoreew = true,
            "nocache" => fs.nocache = true,
            "nofm" => fs.nofm = true,
            "norcap" => fs.norcap = true,
            "nowrite" => fs.nowrite = true,
            "null" => {}
            "pad" => fs.pad = true,
            "pre-alloc" | "prealloc" => fs.prealloc = true,
            "pt" => fs.pt = true,
            "rarc" => fs.rarc = true,
            "resume" => fs.resume = true,
            "self" => fs.self_same = true,
            "sparing" => fs.sparing = true,
            "sparse" => fs.sparse += 1,
            "ssync" => fs.ssync = true,
            "strunc" => fs.strunc = true,
            "sync" => fs.sync = true,
            "trim" | "unmap" => fs.trim = true,
            "trunc" => fs.trunc = true,
            "" => {}
            other => return Err(anyhow!("bad usage: unknown {side_name} '{other}'")),
        }
    }
    Ok(())
}

fn parse_conv(list: &str, opts: &mut Opts) -> anyhow::Result<()> {
    for conv in list.split(',') {
        match conv {
            "fdatasync" => opts.oflag.fdatasync = true,
            "fsync" => opts.oflag.fsync = true,
            "noerror" => opts.iflag.coe = true,
            // Inherited quirk: notrunc is accepted and does nothing, even
            // next to oflag=trunc.
            "notrunc" => {}
            "null" => {}
            "resume" => opts.oflag.resume = true,
            "sparing" => opts.oflag.sparing = true,
            "sparse" => opts.oflag.sparse += 1,
            "sync" => opts.oflag.pad = true,
            "trunc" => opts.oflag.trunc = true,
            "" => {}
            other => return Err(anyhow!("bad usage: unknown conv '{other}'")),
        }
    }
    Ok(())
}

// ── Main parse ────────────────────────────────────────────────────────────────

/// Parses `std::env::args()` (skipping argv[0]).
pub fn parse_args() -> anyhow::Result<ParsedArgs> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    parse_args_from(&argv)
}

/// Parses an explicit operand list.
pub fn parse_args_from(argv: &[String]) -> anyhow::Result<ParsedArgs> {
    let mut opts = Opts::default();
    let mut exit_early = false;
    let mut quiet_stderr = false;
    let mut bs_given: Option<u32> = None;
    let mut ibs_given: Option<u32> = None;
    let mut obs_given: Option<u32> = None;
    let mut verbose_level: i32 = 1;

    for arg in argv {
        if let Some((key, value)) = arg.split_once('=') {
            match key {
                "if" => opts.inf = value.to_owned(),
                "of" => opts.outf = value.to_owned(),
                "of2" => opts.out2f = value.to_owned(),
                "bs" => bs_given = Some(parse_u32(key, value)?),
                "ibs" => ibs_given = Some(parse_u32(key, value)?),
                "obs" => obs_given = Some(parse_u32(key, value)?),
                "bpt" => {
                    let (bpt_str, obpc_str) = match value.split_once(',') {
                        Some((a, b)) => (a, Some(b)),
                        None => (value, None),
                    };
                    opts.bpt_i = parse_u32(key, bpt_str)?;
                    if opts.bpt_i == 0 {
                        return Err(anyhow!("bad usage: bpt= must be at least 1"));
                    }
                    opts.bpt_given = true;
                    if let Some(oc) = obpc_str {
                        opts.obpc = parse_u32(key, oc)?;
                    }
                }
                "cdbsz" => {
                    let sz = parse_u32(key, value)?;
                    if !matches!(sz, 6 | 10 | 12 | 16 | 32) {
                        return Err(anyhow!("bad usage: cdbsz= must be 6, 10, 12, 16 or 32"));
                    }
                    opts.cdbsz_in = sz;
                    opts.cdbsz_out = sz;
                    opts.cdbsz_given = true;
                }
                "coe" => opts.iflag.coe = parse_u32(key, value)? > 0,
                "coe_limit" => opts.coe_limit = parse_u32(key, value)?,
                "conv" => parse_conv(value, &mut opts)?,
                "count" => {
                    let n = parse_num(value).map_err(|e| anyhow!("bad usage: count=: {e}"))?;
                    if n < -1 {
                        return Err(anyhow!("bad usage: count= cannot be below -1"));
                    }
                    opts.dd_count = n;
                }
                "iflag" => parse_flags(value, &mut opts.iflag, Side::In)?,
                "oflag" => parse_flags(value, &mut opts.oflag, Side::Out)?,
                "intio" => opts.interrupt_io = parse_u32(key, value)? > 0,
                "skip" | "iseek" => {
                    let n = parse_num(value).map_err(|e| anyhow!("bad usage: {key}=: {e}"))?;
                    if n < 0 {
                        return Err(anyhow!("bad usage: {key}= cannot be negative"));
                    }
                    opts.skip = n;
                }
                "seek" | "oseek" => {
                    let n = parse_num(value).map_err(|e| anyhow!("bad usage: {key}=: {e}"))?;
                    if n < 0 {
                        return Err(anyhow!("bad usage: {key}= cannot be negative"));
                    }
                    opts.seek = n;
                }
                "protect" => {
                    let (rdp, wrp) = match value.split_once(',') {
                        Some((a, b)) => (a, Some(b)),
                        None => (value, None),
                    };
                    let rd = parse_u32(key, rdp)?;
                    if rd > 7 {
                        return Err(anyhow!("bad usage: protect= fields are 0..7"));
                    }
                    opts.rdprotect = rd as u8;
                    if let Some(w) = wrp {
                        let wr = parse_u32(key, w)?;
                        if wr > 7 {
                            return Err(anyhow!("bad usage: protect= fields are 0..7"));
                        }
                        opts.wrprotect = wr as u8;
                    }
                }
                "retries" => opts.retries = parse_u32(key, value)?,
                "status" => match value {
                    "noxfer" => set_suppress_xfer_report(true),
                    "null" | "none" => {}
                    other => return Err(anyhow!("bad usage: unknown status '{other}'")),
                },
                "verbose" => {
                    verbose_level = parse_num(value)
                        .map_err(|e| anyhow!("bad usage: verbose=: {e}"))?
                        as i32;
                }
                other => return Err(anyhow!("bad usage: unrecognised operand '{other}='")),
            }
        } else {
            match arg.as_str() {
                "--help" | "-h" => {
                    crate::cli::help::print_usage();
                    exit_early = true;
                }
                "--version" | "-V" => {
                    crate::cli::help::print_version();
                    exit_early = true;
                }
                "--verbose" => verbose_level += 1,
                other => return Err(anyhow!("bad usage: unrecognised operand '{other}'")),
            }
        }
    }
    if exit_early {
        return Ok(ParsedArgs {
            opts,
            exit_early,
            quiet_stderr,
        });
    }

    // ── Cross-operand policies ────────────────────────────────────────────────

    if bs_given.is_some() && (ibs_given.is_some() || obs_given.is_some()) {
        return Err(anyhow!("bad usage: bs= excludes ibs= and obs="));
    }
    if let Some(bs) = bs_given {
        opts.ibs = bs;
        opts.obs = bs;
    } else {
        opts.ibs = ibs_given.unwrap_or(DEF_BLOCK_SIZE);
        opts.obs = obs_given.unwrap_or(DEF_BLOCK_SIZE);
    }
    if opts.ibs == 0 || opts.obs == 0 {
        return Err(anyhow!("bad usage: block sizes must be at least 1"));
    }
    if !opts.bpt_given {
        opts.bpt_i = default_bpt(opts.ibs);
    }
    if opts.ibs != opts.obs {
        let span = opts.ibs as u64 * opts.bpt_i as u64;
        if span % opts.obs as u64 != 0 {
            return Err(anyhow!(
                "bad usage: with ibs != obs, ibs*bpt ({span}) must be a multiple of obs"
            ));
        }
    }
    if opts.inf.is_empty() {
        return Err(anyhow!("bad usage: if= is required"));
    }
    if (opts.iflag.self_same || opts.oflag.self_same) && opts.outf.is_empty() {
        opts.outf = opts.inf.clone();
    }
    if opts.oflag.trunc && opts.oflag.sparing {
        return Err(anyhow!("bad usage: oflag=trunc cannot be used with sparing"));
    }
    if opts.oflag.append && opts.seek > 0 {
        return Err(anyhow!("bad usage: oflag=append cannot be used with seek="));
    }
    if (opts.rdprotect > 0 || opts.wrprotect > 0) && opts.ibs != opts.obs {
        return Err(anyhow!(
            "bad usage: protection information needs ibs equal to obs"
        ));
    }

    if verbose_level < 0 {
        quiet_stderr = true;
        set_verbosity(0);
    } else {
        set_verbosity(verbose_level);
    }
    opts.update_pi_block_sizes();

    Ok(ParsedArgs {
        opts,
        exit_early,
        quiet_stderr,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
