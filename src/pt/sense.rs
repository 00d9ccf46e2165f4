//! Sense-data categorisation.
//!
//! Reduces a raw sense buffer (fixed or descriptor format) to a [`PtStatus`]
//! and, for medium errors, extracts the failing LBA from the information
//! field when the device marked it valid.

use super::PtStatus;

// Sense keys (SPC).
const SK_RECOVERED: u8 = 0x1;
const SK_NOT_READY: u8 = 0x2;
const SK_MEDIUM_ERROR: u8 = 0x3;
const SK_HARDWARE_ERROR: u8 = 0x4;
const SK_ILLEGAL_REQUEST: u8 = 0x5;
const SK_UNIT_ATTENTION: u8 = 0x6;
const SK_DATA_PROTECT: u8 = 0x7;
const SK_ABORTED_COMMAND: u8 = 0xb;

/// Decoded essentials of one sense buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenseInfo {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// Information field when the valid bit was set (fixed format) or an
    /// information descriptor was present (descriptor format).
    pub info: Option<u64>,
}

/// Parses a sense buffer in either fixed (0x70/0x71) or descriptor
/// (0x72/0x73) format.  Returns `None` when the buffer is too short or the
/// response code is unrecognised.
pub fn parse(sense: &[u8]) -> Option<SenseInfo> {
    if sense.len() < 8 {
        return None;
    }
    let resp = sense[0] & 0x7f;
    match resp {
        0x70 | 0x71 => {
            let mut si = SenseInfo {
                sense_key: sense[2] & 0xf,
                ..Default::default()
            };
            if sense.len() > 13 {
                si.asc = sense[12];
                si.ascq = sense[13];
            }
            if sense[0] & 0x80 != 0 {
                let raw = u32::from_be_bytes([sense[3], sense[4], sense[5], sense[6]]);
                si.info = Some(raw as u64);
            }
            Some(si)
        }
        0x72 | 0x73 => {
            let mut si = SenseInfo {
                sense_key: sense[1] & 0xf,
                asc: sense[2],
                ascq: sense[3],
                ..Default::default()
            };
            // Walk the descriptor list for an information descriptor (0x00).
            let add_len = sense.get(7).copied().unwrap_or(0) as usize;
            let mut off = 8;
            let end = (8 + add_len).min(sense.len());
            while off + 2 <= end {
                let dtype = sense[off];
                let dlen = sense[off + 1] as usize;
                if dtype == 0x00 && off + 12 <= end && sense[off + 2] & 0x80 != 0 {
                    si.info = Some(u64::from_be_bytes(
                        sense[off + 4..off + 12].try_into().unwrap(),
                    ));
                    break;
                }
                off += dlen + 2;
            }
            Some(si)
        }
        _ => None,
    }
}

/// Maps decoded sense to the outcome category the engine dispatches on.
pub fn categorize(si: &SenseInfo) -> PtStatus {
    match si.sense_key {
        SK_RECOVERED => PtStatus::Recovered,
        SK_NOT_READY => PtStatus::NotReady,
        SK_MEDIUM_ERROR | SK_HARDWARE_ERROR => PtStatus::MediumHard { lba: si.info },
        SK_ILLEGAL_REQUEST => PtStatus::InvalidOp,
        SK_UNIT_ATTENTION => PtStatus::UnitAttention,
        SK_DATA_PROTECT => PtStatus::Protection,
        SK_ABORTED_COMMAND => PtStatus::AbortedCommand,
        _ => PtStatus::Other,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_sense(key: u8, asc: u8, ascq: u8) -> [u8; 18] {
        let mut s = [0u8; 18];
        s[0] = 0x70;
        s[2] = key;
        s[7] = 10;
        s[12] = asc;
        s[13] = ascq;
        s
    }

    #[test]
    fn fixed_medium_error_with_info_carries_lba() {
        let mut s = fixed_sense(0x3, 0x11, 0x00);
        s[0] |= 0x80;
        s[3..7].copy_from_slice(&0x1234u32.to_be_bytes());
        let si = parse(&s).unwrap();
        assert_eq!(si.sense_key, 0x3);
        assert_eq!(si.info, Some(0x1234));
        assert_eq!(categorize(&si), PtStatus::MediumHard { lba: Some(0x1234) });
    }

    #[test]
    fn fixed_medium_error_without_valid_bit_has_no_lba() {
        let s = fixed_sense(0x3, 0x11, 0x00);
        let si = parse(&s).unwrap();
        assert_eq!(categorize(&si), PtStatus::MediumHard { lba: None });
    }

    #[test]
    fn unit_attention_and_aborted_map_to_their_categories() {
        let si = parse(&fixed_sense(0x6, 0x29, 0x00)).unwrap();
        assert_eq!(categorize(&si), PtStatus::UnitAttention);
        let si = parse(&fixed_sense(0xb, 0x47, 0x00)).unwrap();
        assert_eq!(categorize(&si), PtStatus::AbortedCommand);
    }

    #[test]
    fn descriptor_format_information_descriptor() {
        let mut s = [0u8; 24];
        s[0] = 0x72;
        s[1] = 0x3; // medium error
        s[2] = 0x11;
        s[7] = 14; // additional length
        s[8] = 0x00; // information descriptor
        s[9] = 10;
        s[10] = 0x80; // valid
        s[12..20].copy_from_slice(&0xdead_beefu64.to_be_bytes());
        let si = parse(&s).unwrap();
        assert_eq!(si.info, Some(0xdead_beef));
        assert_eq!(
            categorize(&si),
            PtStatus::MediumHard {
                lba: Some(0xdead_beef)
            }
        );
    }

    #[test]
    fn short_or_garbage_sense_is_none() {
        assert!(parse(&[0x70, 0, 0]).is_none());
        assert!(parse(&[0x55; 18]).is_none());
    }
}
