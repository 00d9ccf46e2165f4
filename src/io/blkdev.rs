//! Block-device capacity oracle.
//!
//! For block devices reached through ordinary file I/O (no pass-through),
//! the kernel is asked directly: BLKGETSIZE64 for the byte length and
//! BLKSSZGET for the logical sector size.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

// BLKGETSIZE64 is _IOR(0x12, 114, size_t); BLKSSZGET is the bare _IO(0x12, 104)
// that still writes through its int argument.
nix::ioctl_read!(ioctl_blkgetsize64, 0x12, 114, u64);
nix::ioctl_read_bad!(ioctl_blksszget, 0x1268, libc::c_int);

/// Returns `(num_sectors, sector_size)` of an opened block device, where
/// `num_sectors` counts `sector_size`-byte units.
pub fn get_blkdev_capacity(file: &File) -> io::Result<(u64, u32)> {
    let fd = file.as_raw_fd();
    let mut bytes: u64 = 0;
    let mut ssz: libc::c_int = 0;
    // SAFETY: fd is a live descriptor and both out-pointers are valid.
    unsafe {
        ioctl_blkgetsize64(fd, &mut bytes).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        ioctl_blksszget(fd, &mut ssz).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    }
    if ssz <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "kernel reported a nonsensical sector size",
        ));
    }
    Ok((bytes / ssz as u64, ssz as u32))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A regular file is not a block device; both ioctls must fail cleanly.
    #[test]
    fn regular_file_is_rejected() {
        let f = tempfile::tempfile().unwrap();
        assert!(get_blkdev_capacity(&f).is_err());
    }
}
