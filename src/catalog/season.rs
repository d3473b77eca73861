use chrono::{Datelike, NaiveDate};

/// A yearly availability window in `MM-DD` form, e.g. `12-20` to `01-05`.
///
/// The text is kept as configured and parsed against the year being checked.
/// Days past the end of the month clamp to its last day, so `02-29` means
/// Feb 28 in non-leap years.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonalWindow {
    pub start: String,
    pub end: String,
}

impl SeasonalWindow {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Whether `today` falls inside the window, both ends inclusive.
    ///
    /// A start later than the end wraps over New Year. Text that does not
    /// parse as a month-day counts as always in season.
    pub fn contains(&self, today: NaiveDate) -> bool {
        let (Some(start), Some(end)) = (
            month_day(today.year(), &self.start),
            month_day(today.year(), &self.end),
        ) else {
            log::debug!(
                "Unparseable seasonal window {}..{}, treating as in season",
                self.start,
                self.end
            );
            return true;
        };

        if start > end {
            today >= start || today <= end
        } else {
            start <= today && today <= end
        }
    }
}

fn month_day(year: i32, text: &str) -> Option<NaiveDate> {
    let (month, day) = text.trim().split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.len() <= 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(month) || !digits(day) {
        return None;
    }
    let (month, day): (u32, u32) = (month.parse().ok()?, day.parse().ok()?);
    if !(1..=31).contains(&day) {
        return None;
    }
    (day.min(28)..=day)
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
}
