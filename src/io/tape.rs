//! Tape end-of-run handling over the st driver's MTIOCTOP ioctl.
//!
//! Closing a tape output normally writes one filemark so the copied data
//! reads back as a complete file.  `oflag=nofm` suppresses the mark and
//! instead issues a zero-count backspace, which flushes the driver's
//! buffer without marking.  The immediate-mode mark (MTWEOFI) is used so
//! close does not stall behind the drive; the non-immediate fallback covers
//! older drivers that reject it.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

#[repr(C)]
pub struct Mtop {
    pub mt_op: libc::c_short,
    pub mt_count: libc::c_int,
}

// MTIOCTOP is _IOW('m', 1, struct mtop).
nix::ioctl_write_ptr!(ioctl_mtioctop, b'm', 1, Mtop);

/// Backward space records.
const MTBSR: libc::c_short = 4;
/// Write an end-of-file record (mark).
const MTWEOF: libc::c_short = 5;
/// Write an end-of-file record in immediate mode.
const MTWEOFI: libc::c_short = 35;

fn mt_op(file: &File, op: libc::c_short, count: libc::c_int) -> io::Result<()> {
    let arg = Mtop {
        mt_op: op,
        mt_count: count,
    };
    // SAFETY: arg is a valid mtop for the life of the call.
    unsafe {
        ioctl_mtioctop(file.as_raw_fd(), &arg)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(())
}

/// Applies the end-of-copy filemark policy to a tape output.
pub fn finalize_output(file: &File, nofm: bool) -> io::Result<()> {
    if nofm {
        // Flush buffered records without writing a mark.
        return mt_op(file, MTBSR, 0);
    }
    match mt_op(file, MTWEOFI, 1) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTTY) => Err(e),
        Err(_) => mt_op(file, MTWEOF, 1),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A regular file is not a tape; the ioctl must fail without side
    /// effects rather than pretend success.
    #[test]
    fn non_tape_descriptor_is_rejected() {
        let f = tempfile::tempfile().unwrap();
        assert!(finalize_output(&f, false).is_err());
        assert!(finalize_output(&f, true).is_err());
    }
}
