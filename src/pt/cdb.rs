//! CDB construction for the commands the engine issues.
//!
//! Builders return the exact byte vector to hand to the transport; LBA and
//! transfer-length fields are packed big-endian per SBC.  Each READ/WRITE
//! size has hard field limits; [`fits`] lets callers decide on automatic
//! promotion to a 16-byte CDB before building.

// Operation codes.
const READ_6: u8 = 0x08;
const READ_10: u8 = 0x28;
const READ_12: u8 = 0xa8;
const READ_16: u8 = 0x88;
const WRITE_6: u8 = 0x0a;
const WRITE_10: u8 = 0x2a;
const WRITE_12: u8 = 0xaa;
const WRITE_16: u8 = 0x8a;
const VARIABLE_LEN: u8 = 0x7f;
const WRITE_SAME_16: u8 = 0x93;
const SYNC_CACHE_10: u8 = 0x35;
const READ_CAPACITY_10: u8 = 0x25;
const SERVICE_ACTION_IN_16: u8 = 0x9e;
const SAI_READ_CAPACITY_16: u8 = 0x10;

const SA_READ_32: u16 = 0x0009;
const SA_WRITE_32: u16 = 0x000b;

/// Per-command option bits folded into the CDB flags byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct RwFlags {
    /// RDPROTECT/WRPROTECT (0..7).
    pub protect: u8,
    pub dpo: bool,
    pub fua: bool,
    pub fua_nv: bool,
    /// READ-only rebuild-assist bit; ignored for writes.
    pub rarc: bool,
}

impl RwFlags {
    fn byte(&self, is_read: bool) -> u8 {
        let mut b = (self.protect & 0x7) << 5;
        if self.dpo {
            b |= 0x10;
        }
        if self.fua {
            b |= 0x08;
        }
        if is_read && self.rarc {
            b |= 0x04;
        }
        if self.fua_nv {
            b |= 0x02;
        }
        b
    }
}

/// True when `lba` and `blocks` fit the address/count fields of a
/// `cdbsz`-byte READ/WRITE.  The 6-byte form additionally cannot carry
/// protection or cache-control bits.
pub fn fits(cdbsz: u32, lba: u64, blocks: u32) -> bool {
    match cdbsz {
        6 => lba <= 0x1f_ffff && blocks <= 256,
        10 => lba <= u32::MAX as u64 && blocks <= u16::MAX as u32,
        12 => lba <= u32::MAX as u64,
        16 | 32 => true,
        _ => false,
    }
}

/// Builds a READ or WRITE CDB of the requested size.
///
/// Returns `Err` with a short description when the fields do not fit, or
/// when option bits are requested on the 6-byte form which cannot encode
/// them.
pub fn build_rw(
    is_read: bool,
    cdbsz: u32,
    lba: u64,
    blocks: u32,
    flags: RwFlags,
) -> Result<Vec<u8>, String> {
    if !fits(cdbsz, lba, blocks) {
        return Err(format!(
            "lba 0x{lba:x} / count {blocks} overflow a {cdbsz}-byte CDB"
        ));
    }
    match cdbsz {
        6 => {
            if flags.protect != 0 || flags.dpo || flags.fua || flags.fua_nv {
                return Err("6-byte CDB cannot carry protect/dpo/fua bits".to_owned());
            }
            let mut c = vec![0u8; 6];
            c[0] = if is_read { READ_6 } else { WRITE_6 };
            c[1] = ((lba >> 16) & 0x1f) as u8;
            c[2] = (lba >> 8) as u8;
            c[3] = lba as u8;
            // 0 encodes 256 blocks in the 6-byte form.
            c[4] = if blocks == 256 { 0 } else { blocks as u8 };
            Ok(c)
        }
        10 => {
            let mut c = vec![0u8; 10];
            c[0] = if is_read { READ_10 } else { WRITE_10 };
            c[1] = flags.byte(is_read);
            c[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
            c[7..9].copy_from_slice(&(blocks as u16).to_be_bytes());
            Ok(c)
        }
        12 => {
            let mut c = vec![0u8; 12];
            c[0] = if is_read { READ_12 } else { WRITE_12 };
            c[1] = flags.byte(is_read);
            c[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
            c[6..10].copy_from_slice(&blocks.to_be_bytes());
            Ok(c)
        }
        16 => {
            let mut c = vec![0u8; 16];
            c[0] = if is_read { READ_16 } else { WRITE_16 };
            c[1] = flags.byte(is_read);
            c[2..10].copy_from_slice(&lba.to_be_bytes());
            c[10..14].copy_from_slice(&blocks.to_be_bytes());
            Ok(c)
        }
        32 => {
            let mut c = vec![0u8; 32];
            c[0] = VARIABLE_LEN;
            c[7] = 0x18; // additional CDB length
            let sa = if is_read { SA_READ_32 } else { SA_WRITE_32 };
            c[8..10].copy_from_slice(&sa.to_be_bytes());
            c[10] = flags.byte(is_read);
            c[12..20].copy_from_slice(&lba.to_be_bytes());
            c[28..32].copy_from_slice(&blocks.to_be_bytes());
            Ok(c)
        }
        other => Err(format!("unsupported CDB size {other}")),
    }
}

/// WRITE SAME (16) with the UNMAP bit set over `lba .. lba+blocks`.
pub fn build_write_same16_unmap(lba: u64, blocks: u32) -> Vec<u8> {
    let mut c = vec![0u8; 16];
    c[0] = WRITE_SAME_16;
    c[1] = 0x08; // UNMAP
    c[2..10].copy_from_slice(&lba.to_be_bytes());
    c[10..14].copy_from_slice(&blocks.to_be_bytes());
    c
}

/// SYNCHRONIZE CACHE (10) over the whole device.
pub fn build_sync_cache10() -> Vec<u8> {
    let mut c = vec![0u8; 10];
    c[0] = SYNC_CACHE_10;
    c
}

/// READ CAPACITY (10).  Reply is 8 bytes: last LBA, block length.
pub fn build_read_capacity10() -> Vec<u8> {
    let mut c = vec![0u8; 10];
    c[0] = READ_CAPACITY_10;
    c
}

/// READ CAPACITY (16).  Reply is 32 bytes and includes protection fields.
pub fn build_read_capacity16(alloc_len: u32) -> Vec<u8> {
    let mut c = vec![0u8; 16];
    c[0] = SERVICE_ACTION_IN_16;
    c[1] = SAI_READ_CAPACITY_16;
    c[10..14].copy_from_slice(&alloc_len.to_be_bytes());
    c
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read10_packs_lba_and_count_big_endian() {
        let c = build_rw(true, 10, 0x0102_0304, 0x0506, RwFlags::default()).unwrap();
        assert_eq!(c.len(), 10);
        assert_eq!(c[0], 0x28);
        assert_eq!(&c[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&c[7..9], &[0x05, 0x06]);
    }

    #[test]
    fn write16_carries_protect_and_fua() {
        let flags = RwFlags {
            protect: 3,
            fua: true,
            ..Default::default()
        };
        let c = build_rw(false, 16, 1 << 40, 8, flags).unwrap();
        assert_eq!(c[0], 0x8a);
        assert_eq!(c[1], (3 << 5) | 0x08);
        assert_eq!(u64::from_be_bytes(c[2..10].try_into().unwrap()), 1 << 40);
        assert_eq!(u32::from_be_bytes(c[10..14].try_into().unwrap()), 8);
    }

    #[test]
    fn rarc_is_read_only() {
        let flags = RwFlags {
            rarc: true,
            ..Default::default()
        };
        let r = build_rw(true, 10, 0, 1, flags).unwrap();
        assert_eq!(r[1] & 0x04, 0x04);
        let w = build_rw(false, 10, 0, 1, flags).unwrap();
        assert_eq!(w[1] & 0x04, 0);
    }

    #[test]
    fn cdb6_count_256_encodes_as_zero() {
        let c = build_rw(true, 6, 0x1234, 256, RwFlags::default()).unwrap();
        assert_eq!(c[4], 0);
    }

    #[test]
    fn cdb6_rejects_option_bits_and_big_lba() {
        let flags = RwFlags {
            fua: true,
            ..Default::default()
        };
        assert!(build_rw(true, 6, 0, 1, flags).is_err());
        assert!(build_rw(true, 6, 0x20_0000, 1, RwFlags::default()).is_err());
    }

    #[test]
    fn fits_matches_field_limits() {
        assert!(fits(10, u32::MAX as u64, 0xffff));
        assert!(!fits(10, u32::MAX as u64 + 1, 1));
        assert!(!fits(10, 0, 0x1_0000));
        assert!(fits(16, u64::MAX, u32::MAX));
        assert!(fits(12, u32::MAX as u64, 0x10_0000));
    }

    #[test]
    fn cdb32_uses_variable_length_form() {
        let c = build_rw(false, 32, 0xaabb_ccdd_0011_2233, 16, RwFlags::default()).unwrap();
        assert_eq!(c.len(), 32);
        assert_eq!(c[0], 0x7f);
        assert_eq!(c[7], 0x18);
        assert_eq!(u16::from_be_bytes(c[8..10].try_into().unwrap()), 0x000b);
        assert_eq!(
            u64::from_be_bytes(c[12..20].try_into().unwrap()),
            0xaabb_ccdd_0011_2233
        );
        assert_eq!(u32::from_be_bytes(c[28..32].try_into().unwrap()), 16);
    }

    #[test]
    fn write_same16_sets_unmap_bit() {
        let c = build_write_same16_unmap(0x10, 0x400);
        assert_eq!(c[0], 0x93);
        assert_eq!(c[1], 0x08);
        assert_eq!(u64::from_be_bytes(c[2..10].try_into().unwrap()), 0x10);
        assert_eq!(u32::from_be_bytes(c[10..14].try_into().unwrap()), 0x400);
    }

    #[test]
    fn read_capacity16_allocation_length() {
        let c = build_read_capacity16(32);
        assert_eq!(c[0], 0x9e);
        assert_eq!(c[1], 0x10);
        assert_eq!(u32::from_be_bytes(c[10..14].try_into().unwrap()), 32);
    }
}
