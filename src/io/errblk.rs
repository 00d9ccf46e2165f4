//! Unrecovered-LBA log.
//!
//! With `iflag=errblk`, every logical block the continue-on-error machinery
//! gives up on is appended to `errblk.txt` in the current directory, one
//! `0x<lba>` (or `0x<lba>-0x<lba_end>` range) per line, bracketed by
//! timestamped start/stop comments so runs can be told apart.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use crate::cli::constants::ERRBLK_FILE;

/// Formats the current local time as `YYYY-MM-DD HH:MM:SS`.
fn local_timestamp() -> String {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: now is a valid time_t and tm is a zeroed out-param.
    unsafe { libc::localtime_r(&now, &mut tm) };
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec
    )
}

/// An open unrecovered-LBA log.  Dropping it writes the stop marker.
pub struct ErrblkLog {
    file: File,
}

impl ErrblkLog {
    /// Opens (appending) the log and writes the start marker.
    pub fn open() -> io::Result<ErrblkLog> {
        Self::open_at(ERRBLK_FILE)
    }

    /// Like [`ErrblkLog::open`] but at an explicit path (tests).
    pub fn open_at(path: &str) -> io::Result<ErrblkLog> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "# start: {}", local_timestamp())?;
        Ok(ErrblkLog { file })
    }

    /// Logs a single unreadable LBA.
    pub fn put(&mut self, lba: u64) -> io::Result<()> {
        writeln!(self.file, "0x{lba:x}")
    }

    /// Logs an inclusive range of unreadable LBAs.
    pub fn put_range(&mut self, lba: u64, lba_end: u64) -> io::Result<()> {
        if lba_end <= lba {
            self.put(lba)
        } else {
            writeln!(self.file, "0x{lba:x}-0x{lba_end:x}")
        }
    }
}

impl Drop for ErrblkLog {
    fn drop(&mut self) {
        let _ = writeln!(self.file, "# stop: {}", local_timestamp());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_brackets_entries_with_start_and_stop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("errblk.txt");
        let path_str = path.to_str().unwrap();
        {
            let mut log = ErrblkLog::open_at(path_str).unwrap();
            log.put(0x1234).unwrap();
            log.put_range(0x2000, 0x2007).unwrap();
            log.put_range(0x3000, 0x3000).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# start: "));
        assert_eq!(lines[1], "0x1234");
        assert_eq!(lines[2], "0x2000-0x2007");
        assert_eq!(lines[3], "0x3000");
        assert!(lines[4].starts_with("# stop: "));
    }

    #[test]
    fn reopening_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("errblk.txt");
        let path_str = path.to_str().unwrap();
        {
            let mut log = ErrblkLog::open_at(path_str).unwrap();
            log.put(1).unwrap();
        }
        {
            let mut log = ErrblkLog::open_at(path_str).unwrap();
            log.put(2).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("# start: ").count(), 2);
        assert_eq!(text.matches("# stop: ").count(), 2);
    }

    #[test]
    fn timestamp_shape() {
        let ts = local_timestamp();
        // YYYY-MM-DD HH:MM:SS
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[13..14], ":");
    }
}
