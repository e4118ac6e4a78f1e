use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{EbakupError, Result};

/// The name of a snapshot within a storage: `YYYY/MM-DDThh:mm`, derived from
/// the snapshot's start time at minute granularity. The year is the database
/// subdirectory, the rest is the manifest file name. Names order the same
/// way as their start times.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotName {
    start: NaiveDateTime,
}

impl SnapshotName {
    /// Derive the name for a snapshot starting at `start` (seconds dropped).
    pub fn from_start_time(start: NaiveDateTime) -> Self {
        SnapshotName {
            start: start
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(start),
        }
    }

    /// Parse a `YYYY/MM-DDThh:mm` name.
    pub fn parse(name: &str) -> Result<Self> {
        let bad = || EbakupError::NotFound(format!("invalid snapshot name '{name}'"));
        let (year, rest) = name.split_once('/').ok_or_else(bad)?;
        Self::from_parts(year, rest).ok_or_else(bad)
    }

    /// Assemble from the year directory name and the manifest file name.
    pub fn from_parts(year: &str, file: &str) -> Option<Self> {
        if year.len() != 4 || file.len() != 11 {
            return None;
        }
        let year: i32 = year.parse().ok()?;
        let bytes = file.as_bytes();
        if bytes[2] != b'-' || bytes[5] != b'T' || bytes[8] != b':' {
            return None;
        }
        let month: u32 = file[..2].parse().ok()?;
        let day: u32 = file[3..5].parse().ok()?;
        let hour: u32 = file[6..8].parse().ok()?;
        let minute: u32 = file[9..11].parse().ok()?;
        let start = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
        Some(SnapshotName { start })
    }

    /// The start time this name encodes (minute precision).
    pub fn start_time(&self) -> NaiveDateTime {
        self.start
    }

    /// The year directory under `db/`.
    pub fn year_dir(&self) -> String {
        format!("{:04}", self.start.year())
    }

    /// The manifest file name inside the year directory.
    pub fn file_name(&self) -> String {
        format!(
            "{:02}-{:02}T{:02}:{:02}",
            self.start.month(),
            self.start.day(),
            self.start.hour(),
            self.start.minute()
        )
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.year_dir(), self.file_name())
    }
}

impl fmt::Debug for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotName({}/{})", self.year_dir(), self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let t = NaiveDate::from_ymd_opt(2015, 4, 3)
            .unwrap()
            .and_hms_opt(10, 46, 6)
            .unwrap();
        let name = SnapshotName::from_start_time(t);
        assert_eq!(name.to_string(), "2015/04-03T10:46");
        let parsed = SnapshotName::parse("2015/04-03T10:46").unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.start_time().second(), 0);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(SnapshotName::parse("2015-04-03T10:46").is_err());
        assert!(SnapshotName::parse("2015/04-03 10:46").is_err());
        assert!(SnapshotName::parse("2015/13-03T10:46").is_err());
        assert!(SnapshotName::parse("15/04-03T10:46").is_err());
    }

    #[test]
    fn orders_by_start_time() {
        let a = SnapshotName::parse("2015/04-03T10:46").unwrap();
        let b = SnapshotName::parse("2015/04-03T10:47").unwrap();
        let c = SnapshotName::parse("2016/01-01T00:00").unwrap();
        assert!(a < b && b < c);
    }
}
