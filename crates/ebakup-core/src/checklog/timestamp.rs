//! The packed calendar timestamp used by the verification log.
//!
//! Bit layout, least significant first: year (12 bits), month (4), day of
//! month (5), two zero pad bits, second of day (17). Five octets,
//! little-endian. The all-zero encoding means "unknown"; any other encoding
//! with an out-of-range calendar component is invalid.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

pub const CHECK_TIME_LEN: usize = 5;

/// A possibly-unknown verification timestamp, second precision, years up
/// to 4095.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckTime(Option<NaiveDateTime>);

impl CheckTime {
    pub fn unknown() -> CheckTime {
        CheckTime(None)
    }

    /// Encode a point in time. Returns `None` for years outside 1..=4095.
    pub fn from_datetime(t: NaiveDateTime) -> Option<CheckTime> {
        if !(1..=4095).contains(&t.year()) {
            return None;
        }
        Some(CheckTime(Some(t.with_nanosecond(0).unwrap_or(t))))
    }

    pub fn datetime(&self) -> Option<NaiveDateTime> {
        self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_none()
    }

    pub fn encode(&self) -> [u8; CHECK_TIME_LEN] {
        let Some(t) = self.0 else {
            return [0; CHECK_TIME_LEN];
        };
        let second_of_day =
            u64::from(t.hour() * 3600 + t.minute() * 60 + t.second());
        let packed: u64 = u64::from(t.year() as u32)
            | (u64::from(t.month()) << 12)
            | (u64::from(t.day()) << 16)
            | (second_of_day << 23);
        let bytes = packed.to_le_bytes();
        [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]
    }

    /// Decode five octets. All-zero is the unknown sentinel; anything else
    /// must be a valid calendar point (including day-for-month).
    pub fn decode(bytes: &[u8; CHECK_TIME_LEN]) -> Option<CheckTime> {
        if bytes.iter().all(|&b| b == 0) {
            return Some(CheckTime(None));
        }
        let mut wide = [0u8; 8];
        wide[..CHECK_TIME_LEN].copy_from_slice(bytes);
        let packed = u64::from_le_bytes(wide);
        let year = (packed & 0xfff) as i32;
        let month = ((packed >> 12) & 0xf) as u32;
        let day = ((packed >> 16) & 0x1f) as u32;
        let pad = (packed >> 21) & 0x3;
        let second_of_day = (packed >> 23) as u32;
        if year == 0 || pad != 0 || second_of_day >= 86400 {
            return None;
        }
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let t = date.and_hms_opt(
            second_of_day / 3600,
            (second_of_day % 3600) / 60,
            second_of_day % 60,
        )?;
        Some(CheckTime(Some(t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn round_trips() {
        for t in [
            at(2025, 1, 2, 3, 4, 5),
            at(1, 1, 1, 0, 0, 0),
            at(4095, 12, 31, 23, 59, 59),
            at(2024, 2, 29, 12, 0, 0),
        ] {
            let encoded = CheckTime::from_datetime(t).unwrap().encode();
            let decoded = CheckTime::decode(&encoded).unwrap();
            assert_eq!(decoded.datetime(), Some(t));
        }
    }

    #[test]
    fn all_zero_is_unknown() {
        let decoded = CheckTime::decode(&[0; 5]).unwrap();
        assert!(decoded.is_unknown());
        assert_eq!(CheckTime::unknown().encode(), [0; 5]);
    }

    #[test]
    fn invalid_day_for_month_is_an_error() {
        // 2025-02-29 does not exist.
        let packed: u64 = 2025 | (2 << 12) | (29 << 16) | (1 << 23);
        let bytes = packed.to_le_bytes();
        let field = [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]];
        assert!(CheckTime::decode(&field).is_none());
    }

    #[test]
    fn nonzero_pad_bits_are_an_error() {
        let packed: u64 = 2025 | (1 << 12) | (1 << 16) | (1 << 21) | (1 << 23);
        let bytes = packed.to_le_bytes();
        let field = [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]];
        assert!(CheckTime::decode(&field).is_none());
    }

    #[test]
    fn year_beyond_field_width_is_rejected() {
        assert!(CheckTime::from_datetime(at(4096, 1, 1, 0, 0, 0)).is_none());
    }
}
