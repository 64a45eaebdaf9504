//! Collaboration-date normalization.
//!
//! Models report dates in whatever form the email used: ISO, dotted Korean
//! style, or relative Korean expressions like "지난주 금요일". Everything is
//! resolved against the email's `received_at` and normalized to a
//! `NaiveDate`; time and time zone are discarded downstream.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;

static DOTTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[./](\d{1,2})[./](\d{1,2})\.?$").unwrap());
static MONTH_DAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})[/월]\s*(\d{1,2})일?$").unwrap());
static DAYS_AGO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)일\s*전$").unwrap());
static WEEK_WEEKDAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(지난주|이번주|다음주)\s*([월화수목금토일])요일$").unwrap());

fn korean_weekday(ch: &str) -> Option<Weekday> {
    match ch {
        "월" => Some(Weekday::Mon),
        "화" => Some(Weekday::Tue),
        "수" => Some(Weekday::Wed),
        "목" => Some(Weekday::Thu),
        "금" => Some(Weekday::Fri),
        "토" => Some(Weekday::Sat),
        "일" => Some(Weekday::Sun),
        _ => None,
    }
}

/// The `weekday` within the week containing `base`, weeks starting Monday.
fn weekday_in_week_of(base: NaiveDate, weekday: Weekday) -> NaiveDate {
    let monday = base - Duration::days(i64::from(base.weekday().num_days_from_monday()));
    monday + Duration::days(i64::from(weekday.num_days_from_monday()))
}

/// Resolve a raw date string against the email's receive time.
///
/// Returns `None` for anything unparseable; the field then stays null with
/// confidence 0.0 rather than guessing.
pub fn normalize(raw: &str, received_at: DateTime<Utc>) -> Option<NaiveDate> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let today = received_at.date_naive();

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Some(caps) = DOTTED.captures(text) {
        return NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
    }

    match text {
        "오늘" => return Some(today),
        "어제" => return Some(today - Duration::days(1)),
        "그제" | "그저께" => return Some(today - Duration::days(2)),
        "내일" => return Some(today + Duration::days(1)),
        "모레" => return Some(today + Duration::days(2)),
        _ => {}
    }

    if let Some(caps) = DAYS_AGO.captures(text) {
        let days: i64 = caps[1].parse().ok()?;
        return Some(today - Duration::days(days));
    }

    if let Some(caps) = WEEK_WEEKDAY.captures(text) {
        let weekday = korean_weekday(&caps[2])?;
        let anchor = match &caps[1] {
            "지난주" => today - Duration::days(7),
            "다음주" => today + Duration::days(7),
            _ => today,
        };
        return Some(weekday_in_week_of(anchor, weekday));
    }

    // Month/day without a year: pick the occurrence nearest the receive
    // date, since emails reference both recent and upcoming meetings.
    if let Some(caps) = MONTH_DAY.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let year = today.year();
        let candidates = [
            NaiveDate::from_ymd_opt(year - 1, month, day),
            NaiveDate::from_ymd_opt(year, month, day),
            NaiveDate::from_ymd_opt(year + 1, month, day),
        ];
        return candidates
            .into_iter()
            .flatten()
            .min_by_key(|d| (*d - today).num_days().abs());
    }

    None
}
