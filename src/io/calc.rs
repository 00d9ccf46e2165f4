//! Capacity and count resolution.
//!
//! Reconciles device capacities, file sizes, the skip/seek cursors and the
//! user's `count=` into the final `dd_count`.  Pass-through endpoints are
//! asked with READ CAPACITY (retried once on unit attention or an aborted
//! command); plain block devices go through the kernel capacity oracle;
//! regular input files use their byte length.  `oflag=resume` then advances
//! the cursors over output that is already in place.

use std::fs::File;

use crate::error::{Category, Error, Result};
use crate::io::blkdev::get_blkdev_capacity;
use crate::io::file_type::FileTypes;
use crate::opts::Opts;
use crate::pt::{Capacity, PtProvider, PtStatus};
use crate::{vprint, warn_user};

/// READ CAPACITY with the single mandated retry.
fn pt_read_capacity(pt: &mut dyn PtProvider, path: &str) -> Result<Option<Capacity>> {
    for attempt in 0..2 {
        let (status, cap) = pt
            .read_capacity()
            .map_err(|e| Error::file(format!("{path}: read capacity: {e}")))?;
        match status {
            PtStatus::Good | PtStatus::Recovered => return Ok(cap),
            PtStatus::UnitAttention | PtStatus::AbortedCommand if attempt == 0 => {
                vprint!(2, "{}: read capacity reported {:?}, retrying", path, status);
                continue;
            }
            other => {
                return Err(Error::new(
                    other.category(),
                    format!("{path}: read capacity failed"),
                ))
            }
        }
    }
    unreachable!()
}

/// Outcome of sizing one endpoint: sectors in that side's block-size units,
/// or −1 when unknowable.
struct SideSize {
    num_sect: i64,
}

fn size_input(opts: &mut Opts) -> Result<SideSize> {
    let ft = opts.in_type;
    if opts.reading_fifo {
        return Ok(SideSize { num_sect: -1 });
    }
    if ft.contains(FileTypes::PT) && !opts.iflag.norcap {
        let path = opts.inf.clone();
        let pt = opts.in_pt.as_mut().expect("pass-through input not open");
        let Some(cap) = pt_read_capacity(pt.as_mut(), &path)? else {
            return Ok(SideSize { num_sect: -1 });
        };
        if cap.sect_size != opts.ibs {
            warn_user!(
                "{}: device block size {} disagrees with ibs {}",
                path,
                cap.sect_size,
                opts.ibs
            );
            if !opts.iflag.force {
                return Err(Error::file(format!(
                    "{path}: block size mismatch; give iflag=force to proceed"
                )));
            }
        }
        if cap.prot_en && opts.rdprotect > 0 {
            opts.rdp_i_exp = cap.p_i_exp;
            opts.update_pi_block_sizes();
            let bs = opts.ibs_pi;
            opts.in_pt.as_mut().unwrap().set_block_size(bs);
        }
        if ft.contains(FileTypes::BLOCK) {
            // Kernel and pass-through views of the same node must agree.
            if let Ok(f) = File::open(&path) {
                if let Ok((sects, ssz)) = get_blkdev_capacity(&f) {
                    let kernel_bytes = sects as u128 * ssz as u128;
                    let pt_bytes = cap.num_sects as u128 * cap.sect_size as u128;
                    if kernel_bytes != pt_bytes {
                        warn_user!(
                            "{}: kernel sees {} bytes but the device reports {}",
                            path,
                            kernel_bytes,
                            pt_bytes
                        );
                        if !opts.iflag.force {
                            return Err(Error::file(format!(
                                "{path}: capacity mismatch; give iflag=force to proceed"
                            )));
                        }
                    }
                }
            }
        }
        let bytes = cap.num_sects as u128 * cap.sect_size as u128;
        return Ok(SideSize {
            num_sect: (bytes / opts.ibs as u128) as i64,
        });
    }
    if ft.contains(FileTypes::BLOCK) && !ft.contains(FileTypes::PT) {
        let file = opts.in_file.as_ref().expect("block input not open");
        let (sects, ssz) =
            get_blkdev_capacity(file).map_err(|e| Error::file(format!("{}: {e}", opts.inf)))?;
        let bytes = sects as u128 * ssz as u128;
        return Ok(SideSize {
            num_sect: (bytes / opts.ibs as u128) as i64,
        });
    }
    if ft.contains(FileTypes::REG) {
        let len = opts
            .in_file
            .as_ref()
            .expect("regular input not open")
            .metadata()
            .map_err(|e| Error::file(format!("{}: {e}", opts.inf)))?
            .len();
        let whole = len / opts.ibs as u64;
        let residual = len % opts.ibs as u64;
        return Ok(SideSize {
            num_sect: (whole + u64::from(residual != 0)) as i64,
        });
    }
    Ok(SideSize { num_sect: -1 })
}

fn size_output(opts: &mut Opts) -> Result<SideSize> {
    let ft = opts.out_type;
    if ft.contains(FileTypes::PT) && !opts.oflag.norcap {
        let path = opts.outf.clone();
        let pt = opts.out_pt.as_mut().expect("pass-through output not open");
        let Some(cap) = pt_read_capacity(pt.as_mut(), &path)? else {
            return Ok(SideSize { num_sect: -1 });
        };
        if cap.sect_size != opts.obs {
            warn_user!(
                "{}: device block size {} disagrees with obs {}",
                path,
                cap.sect_size,
                opts.obs
            );
            if !opts.oflag.force {
                return Err(Error::file(format!(
                    "{path}: block size mismatch; give oflag=force to proceed"
                )));
            }
        }
        if cap.prot_en && opts.wrprotect > 0 {
            opts.wrp_i_exp = cap.p_i_exp;
            opts.update_pi_block_sizes();
            let bs = opts.obs_pi;
            opts.out_pt.as_mut().unwrap().set_block_size(bs);
        }
        let bytes = cap.num_sects as u128 * cap.sect_size as u128;
        return Ok(SideSize {
            num_sect: (bytes / opts.obs as u128) as i64,
        });
    }
    if ft.contains(FileTypes::BLOCK) && !ft.contains(FileTypes::PT) {
        let file = opts.out_file.as_ref().expect("block output not open");
        let (sects, ssz) =
            get_blkdev_capacity(file).map_err(|e| Error::file(format!("{}: {e}", opts.outf)))?;
        let bytes = sects as u128 * ssz as u128;
        return Ok(SideSize {
            num_sect: (bytes / opts.obs as u128) as i64,
        });
    }
    // Regular output files grow on demand; they impose no derived bound.
    Ok(SideSize { num_sect: -1 })
}

/// Advances skip/seek/dd_count over output already written, in whole
/// `bpt_i` multiples so a resumed run re-enters the loop on a transfer
/// boundary.
fn apply_resume(opts: &mut Opts) -> Result<()> {
    if !(opts.oflag.resume && opts.out_type.contains(FileTypes::REG)) {
        return Ok(());
    }
    let len = opts
        .out_file
        .as_ref()
        .expect("regular output not open")
        .metadata()
        .map_err(|e| Error::file(format!("{}: {e}", opts.outf)))?
        .len();
    let done_out = len / opts.obs as u64;
    let done_in = (done_out * opts.obs as u64) / opts.ibs as u64;
    let aligned = done_in - done_in % opts.bpt_i as u64;
    if aligned == 0 {
        return Ok(());
    }
    let advance_out = (aligned * opts.ibs as u64) / opts.obs as u64;
    opts.skip += aligned as i64;
    opts.seek += advance_out as i64;
    if opts.dd_count > 0 {
        opts.dd_count = (opts.dd_count - aligned as i64).max(0);
    }
    vprint!(
        2,
        "{}: resuming after {} input blocks already copied",
        opts.outf,
        aligned
    );
    Ok(())
}

/// Resolves the final `dd_count`.
pub fn calc_count(opts: &mut Opts) -> Result<()> {
    let in_side = size_input(opts)?;
    let out_side = size_output(opts)?;

    if opts.dd_count < 0 {
        let in_rem_bytes = if in_side.num_sect >= 0 {
            Some(((in_side.num_sect - opts.skip).max(0) as u128) * opts.ibs as u128)
        } else {
            None
        };
        let out_rem_bytes = if out_side.num_sect >= 0 {
            Some(((out_side.num_sect - opts.seek).max(0) as u128) * opts.obs as u128)
        } else {
            None
        };
        opts.dd_count = match (in_rem_bytes, out_rem_bytes) {
            (Some(i), Some(o)) => (i.min(o) / opts.ibs as u128) as i64,
            (Some(i), None) => (i / opts.ibs as u128) as i64,
            (None, Some(o)) => (o / opts.ibs as u128) as i64,
            (None, None) => {
                if opts.reading_fifo {
                    -1
                } else {
                    return Err(Error::new(
                        Category::Other,
                        "could not determine a count; give count=",
                    ));
                }
            }
        };
    }

    apply_resume(opts)?;
    vprint!(
        2,
        "count={}, skip={}, seek={}",
        opts.dd_count,
        opts.skip,
        opts.seek
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn opts_with_reg_input(dir: &TempDir, in_len: usize) -> Opts {
        let mut o = Opts::default();
        o.inf = dir.path().join("src").to_str().unwrap().to_owned();
        std::fs::write(&o.inf, vec![1u8; in_len]).unwrap();
        o.in_file = Some(File::open(&o.inf).unwrap());
        o.in_type = FileTypes::REG;
        o.out_type = FileTypes::NULL;
        o.out_type_hold = o.out_type;
        o
    }

    #[test]
    fn regular_input_derives_count_rounding_up() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_with_reg_input(&dir, 512 * 10);
        calc_count(&mut o).unwrap();
        assert_eq!(o.dd_count, 10);

        let mut o = opts_with_reg_input(&dir, 512 * 10 + 1);
        calc_count(&mut o).unwrap();
        assert_eq!(o.dd_count, 11);
    }

    #[test]
    fn skip_reduces_derived_count() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_with_reg_input(&dir, 512 * 10);
        o.skip = 4;
        calc_count(&mut o).unwrap();
        assert_eq!(o.dd_count, 6);
    }

    #[test]
    fn explicit_count_is_kept() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_with_reg_input(&dir, 512 * 10);
        o.dd_count = 3;
        calc_count(&mut o).unwrap();
        assert_eq!(o.dd_count, 3);
    }

    #[test]
    fn fifo_without_count_stays_unbounded() {
        let mut o = Opts::default();
        o.reading_fifo = true;
        o.in_type = FileTypes::FIFO;
        o.out_type = FileTypes::NULL;
        calc_count(&mut o).unwrap();
        assert_eq!(o.dd_count, -1);
    }

    #[test]
    fn unsizable_endpoints_without_count_fail() {
        let mut o = Opts::default();
        o.in_type = FileTypes::OTHER;
        o.out_type = FileTypes::NULL;
        assert!(calc_count(&mut o).is_err());
    }

    #[test]
    fn resume_advances_whole_transfers_only() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_with_reg_input(&dir, 512 * 100);
        o.outf = dir.path().join("dst").to_str().unwrap().to_owned();
        // 40 blocks already present; bpt_i 16 → resume on the 32-block line.
        std::fs::write(&o.outf, vec![2u8; 512 * 40]).unwrap();
        o.out_file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&o.outf)
                .unwrap(),
        );
        o.out_type = FileTypes::REG;
        o.out_type_hold = o.out_type;
        o.oflag.resume = true;
        o.bpt_i = 16;
        calc_count(&mut o).unwrap();
        assert_eq!(o.skip, 32);
        assert_eq!(o.seek, 32);
        assert_eq!(o.dd_count, 68);
    }

    #[test]
    fn resume_with_explicit_count_subtracts_done_blocks() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_with_reg_input(&dir, 512 * 100);
        o.outf = dir.path().join("dst").to_str().unwrap().to_owned();
        std::fs::write(&o.outf, vec![2u8; 512 * 40]).unwrap();
        o.out_file = Some(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&o.outf)
                .unwrap(),
        );
        o.out_type = FileTypes::REG;
        o.oflag.resume = true;
        o.bpt_i = 8;
        o.dd_count = 100;
        calc_count(&mut o).unwrap();
        assert_eq!(o.skip, 40);
        assert_eq!(o.seek, 40);
        assert_eq!(o.dd_count, 60);
    }
}
