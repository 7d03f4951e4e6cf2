//! Local wall clock used to stamp captures and place them in day partitions.

use chrono::{DateTime, FixedOffset, Local, SubsecRound, TimeZone, Utc};

/// Wall clock in either the host's local offset or a fixed configured one.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock {
    offset: Option<FixedOffset>,
}

impl LocalClock {
    /// Clock following the host's local timezone.
    pub fn system() -> Self {
        Self { offset: None }
    }

    /// Clock pinned to a fixed UTC offset.
    pub fn fixed(offset: FixedOffset) -> Self {
        Self {
            offset: Some(offset),
        }
    }

    /// Build from an optional offset in minutes east of UTC.
    ///
    /// Returns `None` when the offset is out of range.
    pub fn from_offset_minutes(minutes: Option<i32>) -> Option<Self> {
        match minutes {
            None => Some(Self::system()),
            Some(m) => FixedOffset::east_opt(m.checked_mul(60)?).map(Self::fixed),
        }
    }

    /// Current local time truncated to milliseconds.
    pub fn now(&self) -> DateTime<FixedOffset> {
        let now = match self.offset {
            Some(offset) => Utc::now().with_timezone(&offset),
            None => Local::now().fixed_offset(),
        };
        now.trunc_subsecs(3)
    }

    /// Convert epoch milliseconds to local time.
    pub fn from_millis(&self, ms: i64) -> Option<DateTime<FixedOffset>> {
        let utc = Utc.timestamp_millis_opt(ms).single()?;
        Some(match self.offset {
            Some(offset) => utc.with_timezone(&offset),
            None => utc.with_timezone(&Local).fixed_offset(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_fixed_offset_conversion() {
        let clock = LocalClock::from_offset_minutes(Some(420)).unwrap();
        // 2024-01-01T00:00:00Z
        let local = clock.from_millis(1_704_067_200_000).unwrap();
        assert_eq!(local.hour(), 7);
        assert_eq!(local.offset().local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn test_out_of_range_offset() {
        assert!(LocalClock::from_offset_minutes(Some(24 * 60)).is_none());
    }

    #[test]
    fn test_now_has_millisecond_precision() {
        let now = LocalClock::system().now();
        assert_eq!(now.nanosecond() % 1_000_000, 0);
    }
}
