//! Path categorisation.
//!
//! [`categorize`] stats a path and reduces it to a small bitset of type bits
//! that open and I/O dispatch key on.  A path can carry more than one bit:
//! a SCSI generic node is both a character device and pass-through capable,
//! and the `pt` flag can force the pass-through bit onto a block device.

use std::path::Path;
use std::sync::OnceLock;

use nix::sys::stat::{major, stat, SFlag};

// ── Type bitset ───────────────────────────────────────────────────────────────

/// Endpoint type bits.  Stored as a plain bitset so combinations (CHR|PT,
/// BLOCK|PT) stay cheap to test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTypes(u32);

impl FileTypes {
    pub const REG: FileTypes = FileTypes(1 << 0);
    pub const BLOCK: FileTypes = FileTypes(1 << 1);
    pub const CHR: FileTypes = FileTypes(1 << 2);
    pub const FIFO: FileTypes = FileTypes(1 << 3);
    pub const PT: FileTypes = FileTypes(1 << 4);
    pub const TAPE: FileTypes = FileTypes(1 << 5);
    pub const NULL: FileTypes = FileTypes(1 << 6);
    pub const OTHER: FileTypes = FileTypes(1 << 7);
    pub const ERROR: FileTypes = FileTypes(1 << 8);

    #[inline]
    pub const fn empty() -> FileTypes {
        FileTypes(0)
    }

    #[inline]
    pub fn contains(self, other: FileTypes) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: FileTypes) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FileTypes {
    type Output = FileTypes;
    fn bitor(self, rhs: FileTypes) -> FileTypes {
        FileTypes(self.0 | rhs.0)
    }
}

impl std::fmt::Display for FileTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (FileTypes::NULL, "null device"),
            (FileTypes::PT, "pass-through"),
            (FileTypes::TAPE, "tape"),
            (FileTypes::BLOCK, "block device"),
            (FileTypes::CHR, "char device"),
            (FileTypes::FIFO, "fifo"),
            (FileTypes::REG, "regular file"),
            (FileTypes::OTHER, "other"),
            (FileTypes::ERROR, "unable to stat"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            names.push("empty");
        }
        f.write_str(&names.join(", "))
    }
}

// ── Linux device majors ───────────────────────────────────────────────────────

/// Character major of /dev/sg* SCSI generic nodes.
const SCSI_GENERIC_MAJOR: u64 = 21;
/// Character major of /dev/st* and /dev/nst* SCSI tape nodes.
const SCSI_TAPE_MAJOR: u64 = 9;
/// /dev/null is character 1:3.
const MEM_MAJOR: u64 = 1;
const DEV_NULL_MINOR: u64 = 3;

/// Character major of the block-SCSI-generic (bsg) driver.  Dynamic, so it
/// is looked up in /proc/devices once and cached for the run.
fn bsg_major() -> u64 {
    static BSG_MAJOR: OnceLock<u64> = OnceLock::new();
    *BSG_MAJOR.get_or_init(|| {
        let Ok(devices) = std::fs::read_to_string("/proc/devices") else {
            return 0;
        };
        for line in devices.lines() {
            let mut it = line.split_whitespace();
            if let (Some(num), Some(name)) = (it.next(), it.next()) {
                if name == "bsg" {
                    return num.parse().unwrap_or(0);
                }
            }
        }
        0
    })
}

// ── Categorisation ────────────────────────────────────────────────────────────

/// Classifies `path` into its type bitset.
///
/// A single dot is the null sink.  stat failure yields [`FileTypes::ERROR`]
/// (a missing output file is handled by the opener, which creates it).
pub fn categorize(path: &str) -> FileTypes {
    if path == "." {
        return FileTypes::NULL;
    }
    let st = match stat(Path::new(path)) {
        Ok(st) => st,
        Err(_) => return FileTypes::ERROR,
    };
    // The format field is an enumeration, not independent bits.
    let fmt = st.st_mode & SFlag::S_IFMT.bits();
    let mut ft = FileTypes::empty();
    if fmt == SFlag::S_IFCHR.bits() {
        ft.insert(FileTypes::CHR);
        let maj = major(st.st_rdev);
        let min = nix::sys::stat::minor(st.st_rdev);
        if maj == MEM_MAJOR && min == DEV_NULL_MINOR {
            ft.insert(FileTypes::NULL);
        } else if maj == SCSI_GENERIC_MAJOR || (bsg_major() > 0 && maj == bsg_major()) {
            ft.insert(FileTypes::PT);
        } else if maj == SCSI_TAPE_MAJOR {
            ft.insert(FileTypes::TAPE);
        }
    } else if fmt == SFlag::S_IFBLK.bits() {
        ft.insert(FileTypes::BLOCK);
    } else if fmt == SFlag::S_IFIFO.bits() {
        ft.insert(FileTypes::FIFO);
    } else if fmt == SFlag::S_IFREG.bits() {
        ft.insert(FileTypes::REG);
    } else {
        ft.insert(FileTypes::OTHER);
    }
    ft
}

/// Applies the `pt` flag to a categorised endpoint: pass-through membership
/// may be forced onto block, tape or other nodes.  Tape via pass-through is
/// unsupported and rejected by the caller via [`pt_on_tape`].
pub fn force_pt(mut ft: FileTypes) -> FileTypes {
    if ft.contains(FileTypes::BLOCK)
        || ft.contains(FileTypes::TAPE)
        || ft.contains(FileTypes::OTHER)
    {
        ft.insert(FileTypes::PT);
    }
    ft
}

/// True when the bitset carries the unsupported PT∧TAPE combination.
#[inline]
pub fn pt_on_tape(ft: FileTypes) -> bool {
    ft.contains(FileTypes::PT) && ft.contains(FileTypes::TAPE)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
