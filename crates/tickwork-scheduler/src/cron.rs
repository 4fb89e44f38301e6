//! Cron expression parsing and evaluation.
//!
//! Six whitespace-separated fields; a five-field expression gets an implicit
//! `0` seconds field:
//! ```text
//! ┌───────────── second (0-59)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12 or JAN-DEC)
//! │ │ │ │ │ ┌───────────── day of week (0-7 or SUN-SAT, 0 and 7 = Sunday)
//! │ │ │ │ │ │
//! * * * * * *
//! ```
//! Day of week is stored normalised to 1-7 with Sunday = 1.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CronError;
use crate::field::CronField;

/// How far ahead `next_date` searches before giving up.
pub const SEARCH_HORIZON_YEARS: i64 = 10;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpression {
    source: String,
    timezone: Tz,
    second: CronField,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpression {
    /// Parse a five- or six-field expression evaluated in `timezone`.
    pub fn parse(expr: &str, timezone: Tz) -> Result<Self, CronError> {
        let mut parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() == 5 {
            parts.insert(0, "0");
        }
        if parts.len() != 6 {
            return Err(CronError::field(
                expr,
                format!("expected 5 or 6 fields, got {}", expr.split_whitespace().count()),
            ));
        }

        let day_of_week = CronField::parse(parts[5], 0, 7, weekday_token)?
            .remap(1, 7, |v| if v == 7 { 1 } else { v + 1 });

        Ok(Self {
            source: expr.trim().to_string(),
            timezone,
            second: CronField::parse(parts[0], 0, 59, numeric_token)?,
            minute: CronField::parse(parts[1], 0, 59, numeric_token)?,
            hour: CronField::parse(parts[2], 0, 23, numeric_token)?,
            day_of_month: CronField::parse(parts[3], 1, 31, numeric_token)?,
            month: CronField::parse(parts[4], 1, 12, month_token)?,
            day_of_week,
        })
    }

    /// The expression text as given.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn second(&self) -> &CronField {
        &self.second
    }

    pub fn minute(&self) -> &CronField {
        &self.minute
    }

    pub fn hour(&self) -> &CronField {
        &self.hour
    }

    pub fn day_of_month(&self) -> &CronField {
        &self.day_of_month
    }

    pub fn month(&self) -> &CronField {
        &self.month
    }

    /// Day-of-week field, normalised to 1-7 with Sunday = 1.
    pub fn day_of_week(&self) -> &CronField {
        &self.day_of_week
    }

    /// First matching instant strictly after `after`.
    ///
    /// Fails with [`CronError::InvalidDate`] when nothing matches within
    /// [`SEARCH_HORIZON_YEARS`] (e.g. `0 0 0 30 2 *`).
    pub fn next_date(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let local_after = after.with_timezone(&self.timezone).naive_local();
        let mut candidate = local_after
            .with_nanosecond(0)
            .unwrap_or(local_after)
            + Duration::seconds(1);
        let horizon = candidate + Duration::days(SEARCH_HORIZON_YEARS * 366);

        loop {
            let local = self.next_local(candidate, horizon)?;
            // A local time can map to zero (DST gap) or two (DST fold) instants.
            let mapped = self.timezone.from_local_datetime(&local);
            let instant = [mapped.earliest(), mapped.latest()]
                .into_iter()
                .flatten()
                .map(|dt| dt.with_timezone(&Utc))
                .find(|dt| *dt > after);
            if let Some(instant) = instant {
                return Ok(instant);
            }
            candidate = local + Duration::seconds(1);
        }
    }

    /// Successive fire instants after `after`, stopping at the first error.
    pub fn upcoming(&self, after: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let mut cursor = after;
        std::iter::from_fn(move || {
            let next = self.next_date(cursor).ok()?;
            cursor = next;
            Some(next)
        })
    }

    /// Calendar search over local wall-clock time.
    ///
    /// Checks month, day, hour, minute, second in that order. The first
    /// component that does not match moves the candidate to the next permitted
    /// value at that granularity (carrying into the coarser unit and resetting
    /// finer units to their first permitted value) and the scan restarts.
    fn next_local(
        &self,
        mut candidate: NaiveDateTime,
        horizon: NaiveDateTime,
    ) -> Result<NaiveDateTime, CronError> {
        loop {
            if candidate > horizon {
                return Err(CronError::InvalidDate(format!(
                    "'{}' has no match within {} years",
                    self.source, SEARCH_HORIZON_YEARS
                )));
            }

            let date = candidate.date();

            if !self.month.contains(date.month()) {
                let (year, month) = match self.month.next_at_or_after(date.month() + 1) {
                    Some(month) => (date.year(), month),
                    None => (date.year() + 1, self.month.first()),
                };
                let first_day = NaiveDate::from_ymd_opt(year, month, 1)
                    .ok_or_else(|| out_of_calendar(&self.source))?;
                candidate = self.start_of_day(first_day)?;
                continue;
            }

            if !self.day_matches(date) {
                let next_day = date
                    .succ_opt()
                    .ok_or_else(|| out_of_calendar(&self.source))?;
                candidate = self.start_of_day(next_day)?;
                continue;
            }

            if !self.hour.contains(candidate.hour()) {
                candidate = match self.hour.next_at_or_after(candidate.hour() + 1) {
                    Some(hour) => self.at(date, hour, self.minute.first(), self.second.first())?,
                    None => {
                        let next_day = date
                            .succ_opt()
                            .ok_or_else(|| out_of_calendar(&self.source))?;
                        self.start_of_day(next_day)?
                    }
                };
                continue;
            }

            if !self.minute.contains(candidate.minute()) {
                candidate = match self.minute.next_at_or_after(candidate.minute() + 1) {
                    Some(minute) => self.at(date, candidate.hour(), minute, self.second.first())?,
                    None => {
                        self.at(
                            date,
                            candidate.hour(),
                            self.minute.first(),
                            self.second.first(),
                        )? + Duration::hours(1)
                    }
                };
                continue;
            }

            if !self.second.contains(candidate.second()) {
                candidate = match self.second.next_at_or_after(candidate.second() + 1) {
                    Some(second) => self.at(date, candidate.hour(), candidate.minute(), second)?,
                    None => {
                        self.at(
                            date,
                            candidate.hour(),
                            candidate.minute(),
                            self.second.first(),
                        )? + Duration::minutes(1)
                    }
                };
                continue;
            }

            return Ok(candidate);
        }
    }

    /// Standard cron day semantics: when both day fields are restricted a day
    /// matching either one is accepted.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday() + 1);
        match (
            self.day_of_month.is_unrestricted(),
            self.day_of_week.is_unrestricted(),
        ) {
            (true, true) => true,
            (false, true) => dom,
            (true, false) => dow,
            (false, false) => dom || dow,
        }
    }

    fn start_of_day(&self, date: NaiveDate) -> Result<NaiveDateTime, CronError> {
        self.at(
            date,
            self.hour.first(),
            self.minute.first(),
            self.second.first(),
        )
    }

    fn at(
        &self,
        date: NaiveDate,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Result<NaiveDateTime, CronError> {
        date.and_hms_opt(hour, minute, second)
            .ok_or_else(|| out_of_calendar(&self.source))
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.source, self.timezone)
    }
}

/// Parses in UTC.
impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s, Tz::UTC)
    }
}

fn out_of_calendar(source: &str) -> CronError {
    CronError::InvalidDate(format!("'{source}' stepped outside the supported calendar"))
}

fn numeric_token(tok: &str) -> Option<u32> {
    tok.parse().ok()
}

fn named_token(tok: &str, names: &[&str], first: u32) -> Option<u32> {
    names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(tok))
        .map(|idx| idx as u32 + first)
}

fn month_token(tok: &str) -> Option<u32> {
    numeric_token(tok).or_else(|| named_token(tok, &MONTH_NAMES, 1))
}

/// Conventional weekday numbering: SUN = 0 … SAT = 6, with 7 also Sunday.
fn weekday_token(tok: &str) -> Option<u32> {
    numeric_token(tok).or_else(|| named_token(tok, &WEEKDAY_NAMES, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn cron(expr: &str) -> CronExpression {
        expr.parse().unwrap()
    }

    #[test]
    fn five_fields_get_zero_seconds() {
        let expr = cron("30 4 * * *");
        assert_eq!(expr.second().values(), &[0]);
        assert_eq!(expr.minute().values(), &[30]);
        assert_eq!(expr.hour().values(), &[4]);
    }

    #[test]
    fn field_count_is_validated() {
        assert!(matches!(
            "* * * *".parse::<CronExpression>(),
            Err(CronError::InvalidField { .. })
        ));
        assert!(matches!(
            "* * * * * * *".parse::<CronExpression>(),
            Err(CronError::InvalidField { .. })
        ));
        assert!("".parse::<CronExpression>().is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!("60 * * * * *".parse::<CronExpression>().is_err());
        assert!("* 25 * * *".parse::<CronExpression>().is_err());
        assert!("* * 0 * *".parse::<CronExpression>().is_err());
        assert!("* * * 13 *".parse::<CronExpression>().is_err());
        assert!("* * * * 8".parse::<CronExpression>().is_err());
        assert!("* * * FOO *".parse::<CronExpression>().is_err());
    }

    #[test]
    fn month_and_weekday_names() {
        let expr = cron("0 0 12 * jan-Mar MON,fri");
        assert_eq!(expr.month().values(), &[1, 2, 3]);
        // Monday = 2, Friday = 6 after normalisation.
        assert_eq!(expr.day_of_week().values(), &[2, 6]);
    }

    #[test]
    fn weekday_zero_and_seven_are_sunday() {
        assert_eq!(cron("0 0 * * 0").day_of_week().values(), &[1]);
        assert_eq!(cron("0 0 * * 7").day_of_week().values(), &[1]);
        assert_eq!(cron("0 0 * * 1-5").day_of_week().values(), &[2, 3, 4, 5, 6]);
        assert_eq!(cron("0 0 * * 5-7").day_of_week().values(), &[1, 6, 7]);
        assert!(cron("0 0 * * 0-6").day_of_week().is_unrestricted());
    }

    #[test]
    fn every_five_seconds() {
        let expr = cron("*/5 * * * * *");
        let mut at = utc(2024, 1, 15, 14, 30, 2);
        for _ in 0..50 {
            let next = expr.next_date(at).unwrap();
            assert!(next > at);
            assert_eq!(next.second() % 5, 0);
            assert!(next - at <= Duration::seconds(5));
            at = next;
        }
    }

    #[test]
    fn next_date_is_exclusive() {
        let expr = cron("*/5 * * * * *");
        let on_slot = utc(2024, 1, 15, 14, 30, 5);
        assert_eq!(expr.next_date(on_slot).unwrap(), utc(2024, 1, 15, 14, 30, 10));

        let fractional = on_slot + Duration::milliseconds(400);
        assert_eq!(expr.next_date(fractional).unwrap(), utc(2024, 1, 15, 14, 30, 10));
    }

    #[test]
    fn top_of_hour_chain_is_3600s_apart() {
        let expr = cron("0 0 * * * *");
        let first = expr.next_date(utc(2024, 2, 28, 22, 17, 41)).unwrap();
        assert_eq!(first, utc(2024, 2, 28, 23, 0, 0));

        let chain: Vec<_> = expr.upcoming(first - Duration::seconds(1)).take(30).collect();
        for pair in chain.windows(2) {
            assert_eq!((pair[1] - pair[0]).num_seconds(), 3600);
        }
    }

    #[test]
    fn five_and_six_field_forms_agree() {
        let six = cron("0 15 10 * * MON-FRI");
        let five = cron("15 10 * * MON-FRI");
        let mut at = utc(2024, 1, 1, 0, 0, 0);
        for _ in 0..20 {
            let a = six.next_date(at).unwrap();
            let b = five.next_date(at).unwrap();
            assert_eq!(a, b);
            at = a;
        }
    }

    #[test]
    fn carries_into_next_day_month_and_year() {
        let expr = cron("0 3 * * *");
        assert_eq!(
            expr.next_date(utc(2024, 1, 15, 14, 30, 0)).unwrap(),
            utc(2024, 1, 16, 3, 0, 0)
        );

        let yearly = cron("0 0 0 1 JAN *");
        assert_eq!(
            yearly.next_date(utc(2024, 6, 1, 0, 0, 0)).unwrap(),
            utc(2025, 1, 1, 0, 0, 0)
        );

        let end_of_month = cron("59 59 23 31 * *");
        assert_eq!(
            end_of_month.next_date(utc(2024, 4, 1, 0, 0, 0)).unwrap(),
            utc(2024, 5, 31, 23, 59, 59)
        );
    }

    #[test]
    fn leap_day() {
        let expr = cron("0 0 12 29 2 *");
        assert_eq!(
            expr.next_date(utc(2024, 3, 1, 0, 0, 0)).unwrap(),
            utc(2028, 2, 29, 12, 0, 0)
        );
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        // The 13th, or any Friday.
        let expr = cron("0 0 0 13 * FRI");
        let fires: Vec<_> = expr.upcoming(utc(2024, 1, 1, 0, 0, 0)).take(3).collect();
        assert_eq!(
            fires,
            vec![
                utc(2024, 1, 5, 0, 0, 0),
                utc(2024, 1, 12, 0, 0, 0),
                utc(2024, 1, 13, 0, 0, 0),
            ]
        );
    }

    #[test]
    fn only_restricted_day_field_counts() {
        let weekdays = cron("0 0 9 * * MON-FRI");
        for fire in weekdays.upcoming(utc(2024, 1, 1, 0, 0, 0)).take(15) {
            assert!(!matches!(fire.weekday(), Weekday::Sat | Weekday::Sun));
            assert_eq!(fire.hour(), 9);
        }

        let first_of_month = cron("0 0 0 1 * ?");
        for fire in first_of_month.upcoming(utc(2024, 1, 1, 0, 0, 0)).take(12) {
            assert_eq!(fire.day(), 1);
        }
    }

    #[test]
    fn impossible_date_hits_horizon() {
        let expr = cron("0 0 0 30 2 *");
        assert!(matches!(
            expr.next_date(utc(2024, 1, 1, 0, 0, 0)),
            Err(CronError::InvalidDate(_))
        ));
        assert_eq!(expr.upcoming(utc(2024, 1, 1, 0, 0, 0)).count(), 0);
    }

    #[test]
    fn evaluates_in_timezone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let expr = CronExpression::parse("0 0 9 * * *", tz).unwrap();
        // CET is UTC+1 in January.
        assert_eq!(
            expr.next_date(utc(2024, 1, 15, 10, 0, 0)).unwrap(),
            utc(2024, 1, 16, 8, 0, 0)
        );
        // CEST is UTC+2 in July.
        assert_eq!(
            expr.next_date(utc(2024, 7, 15, 6, 0, 0)).unwrap(),
            utc(2024, 7, 15, 7, 0, 0)
        );
    }

    #[test]
    fn skips_nonexistent_local_times() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let expr = CronExpression::parse("0 30 2 * * *", tz).unwrap();
        // 02:30 does not exist on 2024-03-10 (spring forward).
        assert_eq!(
            expr.next_date(utc(2024, 3, 10, 5, 0, 0)).unwrap(),
            utc(2024, 3, 11, 6, 30, 0)
        );
    }

    #[test]
    fn repeated_local_time_fires_once() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let expr = CronExpression::parse("0 30 1 * * *", tz).unwrap();
        // 01:30 happens twice on 2024-11-03; the first (EDT) wins.
        let first = expr.next_date(utc(2024, 11, 3, 5, 0, 0)).unwrap();
        assert_eq!(first, utc(2024, 11, 3, 5, 30, 0));
        assert_eq!(expr.next_date(first).unwrap(), utc(2024, 11, 4, 6, 30, 0));
    }

    #[test]
    fn display_includes_timezone() {
        assert_eq!(cron("0 0 * * *").to_string(), "0 0 * * * (UTC)");
    }
}
