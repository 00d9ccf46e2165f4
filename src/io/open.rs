//! Endpoint opening.
//!
//! Applies each side's flag vector to produce the right open mode: direct,
//! exclusive and sync bits, O_CREAT policy, truncation, append, advisory
//! locking and read-ahead advice.  Pass-through endpoints are opened through
//! the provider instead of plain file I/O.
//!
//! Pre-allocation is a separate step ([`prealloc_output`]) because it needs
//! the resolved `dd_count`; the caller runs it after the capacity/count
//! calculator.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::OpenOptionsExt;

use crate::error::{Category, Error, Result};
use crate::io::file_type::{categorize, force_pt, pt_on_tape, FileTypes};
use crate::opts::Opts;
use crate::pt::sg::SgPt;
use crate::pt::PtConfig;
use crate::vprint;

/// Duplicates a standard descriptor into an owned `File`.
fn dup_std_fd(fd: libc::c_int) -> io::Result<File> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: dup is a fresh descriptor we own exclusively.
    Ok(unsafe { File::from_raw_fd(dup) })
}

/// Takes the advisory whole-file lock, non-blocking.
fn take_flock(file: &File, path: &str) -> Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(Error::new(
            Category::FlockErr,
            format!("{path}: advisory lock held elsewhere"),
        ));
    }
    Ok(())
}

fn pt_config(opts: &Opts, write_side: bool) -> PtConfig {
    if write_side {
        PtConfig {
            cdbsz: opts.cdbsz_out,
            protect: opts.wrprotect,
            block_size: opts.obs_pi,
            dpo: opts.oflag.dpo,
            fua: opts.oflag.fua,
            fua_nv: opts.oflag.fua_nv,
            rarc: false,
            ..Default::default()
        }
    } else {
        PtConfig {
            cdbsz: opts.cdbsz_in,
            protect: opts.rdprotect,
            block_size: opts.ibs_pi,
            dpo: opts.iflag.dpo,
            fua: opts.iflag.fua,
            fua_nv: opts.iflag.fua_nv,
            rarc: opts.iflag.rarc,
            ..Default::default()
        }
    }
}

// ── Input ─────────────────────────────────────────────────────────────────────

/// Opens IFILE per `iflag`, filling `opts.in_file`/`opts.in_pt` and
/// `opts.in_type`.
pub fn open_input(opts: &mut Opts) -> Result<()> {
    let path = opts.inf.clone();
    if path == "-" {
        opts.in_type = FileTypes::FIFO;
        opts.reading_fifo = true;
        opts.in_file =
            Some(dup_std_fd(0).map_err(|e| Error::file(format!("standard input: {e}")))?);
        return Ok(());
    }

    let mut ft = categorize(&path);
    if opts.iflag.pt {
        ft = force_pt(ft);
    }
    if pt_on_tape(ft) {
        return Err(Error::syntax(format!(
            "{path}: tape via pass-through is unsupported"
        )));
    }
    if ft.contains(FileTypes::ERROR) {
        return Err(Error::file(format!("{path}: cannot access")));
    }
    opts.in_type = ft;
    vprint!(3, "{}: input categorised as {}", path, ft);

    if ft.contains(FileTypes::PT) {
        let pt = SgPt::open(&path, false, pt_config(opts, false))
            .map_err(|e| Error::file(format!("{path}: {e}")))?;
        opts.in_pt = Some(Box::new(pt));
        return Ok(());
    }

    let mut custom = 0;
    if opts.iflag.direct {
        custom |= libc::O_DIRECT;
    }
    if opts.iflag.excl {
        custom |= libc::O_EXCL;
    }
    if opts.iflag.sync {
        custom |= libc::O_SYNC;
    }
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(custom)
        .open(&path)
        .map_err(|e| Error::file(format!("{path}: {e}")))?;

    if ft.contains(FileTypes::FIFO) || ft.contains(FileTypes::CHR) || ft.contains(FileTypes::TAPE)
    {
        opts.reading_fifo = true;
    }
    if opts.iflag.flock {
        take_flock(&file, &path)?;
    }
    if opts.iflag.nocache {
        // SAFETY: advisory call on our own descriptor.
        unsafe {
            libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
        }
    }
    opts.in_file = Some(file);
    Ok(())
}

// ── Output ────────────────────────────────────────────────────────────────────

/// Opens OFILE per `oflag`, filling `opts.out_file`/`opts.out_pt`,
/// `opts.out_type` and `opts.out_type_hold`.
pub fn open_output(opts: &mut Opts) -> Result<()> {
    let path = opts.outf.clone();
    if path.is_empty() || path == "." {
        opts.out_type = FileTypes::NULL;
        opts.out_type_hold = opts.out_type;
        return Ok(());
    }
    if path == "-" {
        opts.out_type = FileTypes::FIFO;
        opts.out_type_hold = opts.out_type;
        opts.out_file =
            Some(dup_std_fd(1).map_err(|e| Error::file(format!("standard output: {e}")))?);
        return Ok(());
    }

    let mut ft = categorize(&path);
    if opts.oflag.pt {
        ft = force_pt(ft);
    }
    if pt_on_tape(ft) {
        return Err(Error::syntax(format!(
            "{path}: tape via pass-through is unsupported"
        )));
    }
    let creating = ft.contains(FileTypes::ERROR);
    if creating {
        ft = FileTypes::REG;
    }
    opts.out_type = ft;
    opts.out_type_hold = ft;
    vprint!(3, "{}: output categorised as {}", path, ft);

    if ft.contains(FileTypes::PT) {
        let pt = SgPt::open(&path, true, pt_config(opts, true))
            .map_err(|e| Error::file(format!("{path}: {e}")))?;
        opts.out_pt = Some(Box::new(pt));
        return Ok(());
    }

    // Sparing must read the destination before deciding to write.
    let want_read = opts.oflag.sparing;
    let trunc_ok = opts.oflag.trunc && !opts.oflag.resume && !opts.oflag.append;
    if opts.oflag.trunc && !trunc_ok {
        vprint!(2, "{}: trunc ignored with resume/append", path);
    }

    let mut custom = 0;
    if opts.oflag.direct {
        custom |= libc::O_DIRECT;
    }
    if opts.oflag.sync {
        custom |= libc::O_SYNC;
    }
    let mut oo = OpenOptions::new();
    oo.write(true).read(want_read).custom_flags(custom);
    if ft.contains(FileTypes::REG) {
        if opts.oflag.excl {
            oo.create_new(true);
        } else {
            oo.create(true);
        }
        if trunc_ok && opts.seek == 0 {
            oo.truncate(true);
        }
        if opts.oflag.append {
            oo.append(true);
        }
    }
    let file = oo
        .open(&path)
        .map_err(|e| Error::file(format!("{path}: {e}")))?;

    // trunc with a nonzero seek trims an oversized existing file to exactly
    // seek blocks so the copy fills from that point.
    if trunc_ok && opts.seek > 0 && ft.contains(FileTypes::REG) {
        let want = opts.seek as u64 * opts.obs as u64;
        let len = file
            .metadata()
            .map_err(|e| Error::file(format!("{path}: {e}")))?
            .len();
        if len > want {
            file.set_len(want)
                .map_err(|e| Error::file(format!("{path}: {e}")))?;
        }
    }

    if opts.oflag.flock {
        take_flock(&file, &path)?;
    }
    opts.out_file = Some(file);
    Ok(())
}

/// Opens the secondary output (regular file or fifo only).
pub fn open_output2(opts: &mut Opts) -> Result<()> {
    let path = opts.out2f.clone();
    if path.is_empty() {
        return Ok(());
    }
    if path == "-" {
        opts.out2_type = FileTypes::FIFO;
        opts.out2_file =
            Some(dup_std_fd(1).map_err(|e| Error::file(format!("standard output: {e}")))?);
        return Ok(());
    }
    let ft = categorize(&path);
    if !(ft.contains(FileTypes::ERROR) || ft.contains(FileTypes::REG) || ft.contains(FileTypes::FIFO))
    {
        return Err(Error::syntax(format!(
            "of2={path}: only a regular file or fifo is accepted"
        )));
    }
    opts.out2_type = if ft.contains(FileTypes::FIFO) {
        FileTypes::FIFO
    } else {
        FileTypes::REG
    };
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(opts.out2_type.contains(FileTypes::REG))
        .open(&path)
        .map_err(|e| Error::file(format!("{path}: {e}")))?;
    opts.out2_file = Some(file);
    Ok(())
}

// ── Pre-allocation ────────────────────────────────────────────────────────────

/// Pre-allocates OFILE once the final count is known.
///
/// The Linux keep-size path leaves the file length alone so a later
/// `oflag=resume` still works; the portable fallback changes the size and
/// therefore defeats resume, which is recorded in `opts.prealloc_resize`.
pub fn prealloc_output(opts: &mut Opts) -> Result<()> {
    if !opts.oflag.prealloc || opts.dd_count <= 0 {
        return Ok(());
    }
    let Some(file) = opts.out_file.as_ref() else {
        return Ok(());
    };
    if !opts.out_type.contains(FileTypes::REG) {
        return Ok(());
    }
    let want = opts.seek as u64 * opts.obs as u64
        + (opts.dd_count as u64 * opts.ibs as u64).div_ceil(opts.obs as u64) * opts.obs as u64;
    let fd = file.as_raw_fd();

    #[cfg(target_os = "linux")]
    {
        // SAFETY: fallocate on our own descriptor; keep-size never moves EOF.
        let rc =
            unsafe { libc::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, 0, want as libc::off_t) };
        if rc == 0 {
            return Ok(());
        }
        vprint!(
            2,
            "{}: fallocate keep-size failed: {}",
            opts.outf,
            io::Error::last_os_error()
        );
    }

    let rc = unsafe { libc::posix_fallocate(fd, 0, want as libc::off_t) };
    if rc != 0 {
        return Err(Error::file(format!(
            "{}: pre-allocation failed: {}",
            opts.outf,
            io::Error::from_raw_os_error(rc)
        )));
    }
    opts.prealloc_resize = true;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts_for(dir: &TempDir, inf: &str, outf: &str) -> Opts {
        let mut o = Opts::default();
        o.inf = dir.path().join(inf).to_str().unwrap().to_owned();
        o.outf = dir.path().join(outf).to_str().unwrap().to_owned();
        o
    }

    #[test]
    fn missing_input_is_a_file_error() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "absent", "out");
        let err = open_input(&mut o).unwrap_err();
        assert_eq!(err.category, Category::FileError);
    }

    #[test]
    fn missing_output_is_created_as_regular() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "in", "newfile");
        std::fs::write(&o.inf, b"x").unwrap();
        open_output(&mut o).unwrap();
        assert!(o.out_type.contains(FileTypes::REG));
        assert!(std::path::Path::new(&o.outf).exists());
    }

    #[test]
    fn null_sink_paths_open_nothing() {
        let mut o = Opts::default();
        o.outf = ".".to_owned();
        open_output(&mut o).unwrap();
        assert!(o.out_type.contains(FileTypes::NULL));
        assert!(o.out_file.is_none());

        let mut o = Opts::default();
        o.outf = String::new();
        open_output(&mut o).unwrap();
        assert!(o.out_type.contains(FileTypes::NULL));
    }

    #[test]
    fn excl_refuses_existing_output() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "in", "exists");
        std::fs::write(&o.outf, b"old").unwrap();
        o.oflag.excl = true;
        assert!(open_output(&mut o).is_err());
    }

    #[test]
    fn trunc_with_seek_trims_to_seek_blocks() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "in", "trimme");
        std::fs::write(&o.outf, vec![7u8; 4096]).unwrap();
        o.oflag.trunc = true;
        o.seek = 2; // 2 * 512 = 1024
        open_output(&mut o).unwrap();
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 1024);
    }

    #[test]
    fn trunc_is_ignored_with_resume() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "in", "keepme");
        std::fs::write(&o.outf, vec![7u8; 4096]).unwrap();
        o.oflag.trunc = true;
        o.oflag.resume = true;
        open_output(&mut o).unwrap();
        assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 4096);
    }

    #[test]
    fn sparing_opens_output_readable() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "in", "dst");
        std::fs::write(&o.outf, vec![0u8; 512]).unwrap();
        o.oflag.sparing = true;
        open_output(&mut o).unwrap();
        use std::io::Read;
        let mut buf = [0u8; 16];
        o.out_file.as_mut().unwrap().read_exact(&mut buf).unwrap();
    }

    #[test]
    fn of2_rejects_directories() {
        let dir = TempDir::new().unwrap();
        let mut o = Opts::default();
        o.out2f = dir.path().to_str().unwrap().to_owned();
        assert!(open_output2(&mut o).is_err());
    }

    #[test]
    fn prealloc_keep_size_leaves_length_for_resume() {
        let dir = TempDir::new().unwrap();
        let mut o = opts_for(&dir, "in", "prealloc");
        o.oflag.prealloc = true;
        o.dd_count = 16;
        open_output(&mut o).unwrap();
        prealloc_output(&mut o).unwrap();
        #[cfg(target_os = "linux")]
        {
            assert_eq!(std::fs::metadata(&o.outf).unwrap().len(), 0);
            assert!(!o.prealloc_resize);
        }
    }
}
