use std::time::Duration as StdDuration;

use chrono::DateTime;
use chrono::Duration;
use chrono::DurationRound;
use chrono::Utc;

pub trait DateTimeExt: Sized {
    /// Adds a `std::time::Duration`, saturating at the maximum datetime.
    fn add_std(self, duration: StdDuration) -> Self;

    fn add_days(self, days: u32) -> Self;

    fn sub_days(self, days: u32) -> Self;

    /// Truncates seconds and sub-second fractions.
    fn trunc_to_minute(self) -> Self;
}

impl DateTimeExt for DateTime<Utc> {
    fn add_std(self, duration: StdDuration) -> Self {
        Duration::from_std(duration)
            .ok()
            .and_then(|duration| self.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn add_days(self, days: u32) -> Self {
        self.checked_add_signed(Duration::days(days as i64))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sub_days(self, days: u32) -> Self {
        self.checked_sub_signed(Duration::days(days as i64))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn trunc_to_minute(self) -> Self {
        self.duration_trunc(Duration::minutes(1)).unwrap_or(self)
    }
}
