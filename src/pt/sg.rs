//! Linux SG_IO pass-through transport.
//!
//! Drives /dev/sg* (and bsg) nodes through the SG_IO ioctl: one
//! `sg_io_hdr` per command, sense buffer captured on CHECK CONDITION and
//! categorised by [`crate::pt::sense`].  Devices are opened read-write
//! (commands flow both ways regardless of data direction) with O_NONBLOCK
//! during open so an absent medium cannot hang the process, then switched
//! back to blocking.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use super::cdb::{self, RwFlags};
use super::sense;
use super::{Capacity, PtConfig, PtProvider, PtStatus, ReadOutcome};
use crate::vprint;

// ── sg_io_hdr (scsi/sg.h) ─────────────────────────────────────────────────────

const SG_INTERFACE_ID_ORIG: libc::c_int = 'S' as libc::c_int;
const SG_DXFER_NONE: libc::c_int = -1;
const SG_DXFER_TO_DEV: libc::c_int = -2;
const SG_DXFER_FROM_DEV: libc::c_int = -3;

const SENSE_BUFF_LEN: usize = 64;

#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *mut libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

nix::ioctl_readwrite_bad!(sg_io, 0x2285, SgIoHdr);

/// Data phase of one command.
enum DataDir<'a> {
    None,
    FromDev(&'a mut [u8]),
    ToDev(&'a [u8]),
}

/// Outcome of one SG_IO round trip.
struct CmdResult {
    status: PtStatus,
    /// Bytes requested but not transferred.
    resid: i32,
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// One opened SCSI generic node plus its fixed per-endpoint configuration.
pub struct SgPt {
    file: File,
    path: String,
    cfg: PtConfig,
}

impl SgPt {
    /// Opens `path` for pass-through commands.
    ///
    /// Tries read-write first (needed for WRITE and WRITE SAME); falls back
    /// to read-only when write access is denied and the caller only reads.
    pub fn open(path: &str, write_side: bool, cfg: PtConfig) -> io::Result<SgPt> {
        let rw = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path);
        let file = match rw {
            Ok(f) => f,
            Err(e) if !write_side && e.kind() == io::ErrorKind::PermissionDenied => {
                OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(path)?
            }
            Err(e) => return Err(e),
        };

        // Back to blocking for the actual command traffic.
        // SAFETY: plain fcntl on our own descriptor.
        unsafe {
            let flags = libc::fcntl(file.as_raw_fd(), libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(SgPt {
            file,
            path: path.to_owned(),
            cfg,
        })
    }

    fn do_command(&mut self, cdb_bytes: &[u8], data: DataDir<'_>) -> io::Result<CmdResult> {
        let mut cdb = cdb_bytes.to_vec();
        let mut sense = [0u8; SENSE_BUFF_LEN];
        let (dir, len, ptr) = match data {
            DataDir::None => (SG_DXFER_NONE, 0u32, std::ptr::null_mut()),
            DataDir::FromDev(buf) => (
                SG_DXFER_FROM_DEV,
                buf.len() as u32,
                buf.as_mut_ptr() as *mut libc::c_void,
            ),
            DataDir::ToDev(buf) => (
                SG_DXFER_TO_DEV,
                buf.len() as u32,
                buf.as_ptr() as *mut libc::c_void,
            ),
        };
        let mut hdr = SgIoHdr {
            interface_id: SG_INTERFACE_ID_ORIG,
            dxfer_direction: dir,
            cmd_len: cdb.len() as libc::c_uchar,
            mx_sb_len: SENSE_BUFF_LEN as libc::c_uchar,
            iovec_count: 0,
            dxfer_len: len,
            dxferp: ptr,
            cmdp: cdb.as_mut_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: self.cfg.timeout_ms,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        // SAFETY: hdr, cdb and sense outlive the ioctl; dxferp points at a
        // live buffer of dxfer_len bytes.
        unsafe {
            sg_io(self.file.as_raw_fd(), &mut hdr)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        }

        let status = if hdr.status == 0 && hdr.host_status == 0 && hdr.driver_status == 0 {
            PtStatus::Good
        } else if hdr.sb_len_wr > 0 {
            match sense::parse(&sense[..hdr.sb_len_wr as usize]) {
                Some(si) => {
                    vprint!(
                        3,
                        "{}: sense key 0x{:x} asc 0x{:x} ascq 0x{:x}",
                        self.path,
                        si.sense_key,
                        si.asc,
                        si.ascq
                    );
                    sense::categorize(&si)
                }
                None => PtStatus::Other,
            }
        } else {
            vprint!(
                3,
                "{}: transport trouble: status 0x{:x} host 0x{:x} driver 0x{:x}",
                self.path,
                hdr.status,
                hdr.host_status,
                hdr.driver_status
            );
            PtStatus::Other
        };

        Ok(CmdResult {
            status,
            resid: hdr.resid,
        })
    }

    fn rw_flags(&self) -> RwFlags {
        RwFlags {
            protect: self.cfg.protect,
            dpo: self.cfg.dpo,
            fua: self.cfg.fua,
            fua_nv: self.cfg.fua_nv,
            rarc: self.cfg.rarc,
        }
    }

    /// Picks the CDB size for one transfer, promoting to 16 bytes when the
    /// configured size cannot address `lba`/`blocks` or carry the requested
    /// option bits.
    fn effective_cdbsz(&self, lba: u64, blocks: u32) -> u32 {
        let six_with_bits = self.cfg.cdbsz == 6
            && (self.cfg.protect > 0 || self.cfg.dpo || self.cfg.fua || self.cfg.fua_nv);
        if cdb::fits(self.cfg.cdbsz, lba, blocks) && !six_with_bits {
            self.cfg.cdbsz
        } else {
            vprint!(
                2,
                "{}: promoting CDB size {} to 16 for lba 0x{:x}, count {}",
                self.path,
                self.cfg.cdbsz,
                lba,
                blocks
            );
            16
        }
    }
}

impl PtProvider for SgPt {
    fn read_capacity(&mut self) -> io::Result<(PtStatus, Option<Capacity>)> {
        let mut reply = [0u8; 32];
        let c = cdb::build_read_capacity16(reply.len() as u32);
        let res = self.do_command(&c, DataDir::FromDev(&mut reply))?;
        match res.status {
            PtStatus::Good | PtStatus::Recovered => {
                let last_lba = u64::from_be_bytes(reply[0..8].try_into().unwrap());
                let sect_size = u32::from_be_bytes(reply[8..12].try_into().unwrap());
                let prot_en = reply[12] & 0x1 != 0;
                let p_i_exp = (reply[13] >> 4) & 0xf;
                Ok((
                    PtStatus::Good,
                    Some(Capacity {
                        num_sects: last_lba.wrapping_add(1),
                        sect_size,
                        prot_en,
                        p_i_exp,
                    }),
                ))
            }
            PtStatus::InvalidOp => {
                // Older device: 10-byte form, no protection fields.
                let mut reply = [0u8; 8];
                let c = cdb::build_read_capacity10();
                let res = self.do_command(&c, DataDir::FromDev(&mut reply))?;
                if !res.status.data_good() {
                    return Ok((res.status, None));
                }
                let last_lba = u32::from_be_bytes(reply[0..4].try_into().unwrap());
                let sect_size = u32::from_be_bytes(reply[4..8].try_into().unwrap());
                Ok((
                    PtStatus::Good,
                    Some(Capacity {
                        num_sects: last_lba as u64 + 1,
                        sect_size,
                        prot_en: false,
                        p_i_exp: 0,
                    }),
                ))
            }
            other => Ok((other, None)),
        }
    }

    fn read(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let want = blocks as usize * self.cfg.block_size as usize;
        debug_assert!(buf.len() >= want);
        let cdbsz = self.effective_cdbsz(lba, blocks);
        let c = cdb::build_rw(true, cdbsz, lba, blocks, self.rw_flags())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let res = self.do_command(&c, DataDir::FromDev(&mut buf[..want]))?;
        let moved = want.saturating_sub(res.resid.max(0) as usize);
        Ok(ReadOutcome {
            status: res.status,
            blocks: (moved / self.cfg.block_size as usize) as u32,
        })
    }

    fn write(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> io::Result<PtStatus> {
        let want = blocks as usize * self.cfg.block_size as usize;
        debug_assert!(buf.len() >= want);
        let cdbsz = self.effective_cdbsz(lba, blocks);
        let c = cdb::build_rw(false, cdbsz, lba, blocks, self.rw_flags())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let res = self.do_command(&c, DataDir::ToDev(&buf[..want]))?;
        Ok(res.status)
    }

    fn write_same16_unmap(&mut self, lba: u64, blocks: u32) -> io::Result<PtStatus> {
        let zeros = vec![0u8; self.cfg.block_size as usize];
        let c = cdb::build_write_same16_unmap(lba, blocks);
        let res = self.do_command(&c, DataDir::ToDev(&zeros))?;
        Ok(res.status)
    }

    fn sync_cache(&mut self) -> io::Result<PtStatus> {
        let c = cdb::build_sync_cache10();
        let res = self.do_command(&c, DataDir::None)?;
        Ok(res.status)
    }

    fn set_block_size(&mut self, block_size: u32) {
        self.cfg.block_size = block_size;
    }
}
