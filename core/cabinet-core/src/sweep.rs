//! Time arithmetic for the reminder and overdue passes and the borrower views.
//!
//! The passes themselves live in the daemon (they need storage and a
//! notifier); this module decides *which* records qualify and what to tell
//! the borrower.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::lifecycle::LoanPolicy;
use crate::types::{BorrowRecord, OverdueInfo, ReturnStatus, TimeInfo, TimeLeft};

const MS_PER_MINUTE: i64 = 60 * 1000;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;

/// Due-time bounds `(after, until]` a record must fall in to get a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderWindow {
    pub after: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl ReminderWindow {
    pub fn at(now: DateTime<Utc>, policy: &LoanPolicy) -> Self {
        Self {
            after: now,
            until: now + policy.reminder_window,
        }
    }

    pub fn contains(&self, due_at: DateTime<Utc>) -> bool {
        due_at > self.after && due_at <= self.until
    }
}

pub fn needs_reminder(record: &BorrowRecord, window: &ReminderWindow) -> bool {
    record.status == ReturnStatus::Borrowed && !record.reminder_sent && window.contains(record.due_at)
}

pub fn is_overdue(record: &BorrowRecord, now: DateTime<Utc>) -> bool {
    record.status == ReturnStatus::Borrowed && record.due_at < now
}

/// Whole hours left, rounded up, for the reminder text.
pub fn hours_left_ceil(due_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let remaining = remaining_ms(due_at, now);
    if remaining <= 0 {
        return 0;
    }
    (remaining + MS_PER_HOUR - 1) / MS_PER_HOUR
}

pub fn time_left(due_at: DateTime<Utc>, now: DateTime<Utc>) -> TimeLeft {
    let remaining = remaining_ms(due_at, now).max(0);
    TimeLeft {
        hours: remaining / MS_PER_HOUR,
        minutes: (remaining % MS_PER_HOUR) / MS_PER_MINUTE,
        expired: remaining == 0,
    }
}

pub fn time_info(due_at: DateTime<Utc>, now: DateTime<Utc>) -> TimeInfo {
    let left = time_left(due_at, now);
    TimeInfo {
        hours: left.hours,
        minutes: left.minutes,
        overdue: now > due_at,
        expired: left.expired,
    }
}

pub fn overdue_info(due_at: DateTime<Utc>, now: DateTime<Utc>) -> OverdueInfo {
    let duration_ms = (-remaining_ms(due_at, now)).max(0);
    let hours = duration_ms / MS_PER_HOUR;
    OverdueInfo {
        hours,
        days: hours / 24,
        duration_ms,
    }
}

fn remaining_ms(due_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    due_at.signed_duration_since(now).num_milliseconds()
}

/// Outcome of one reminder pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    /// Claimed by a concurrent pass between selection and claim.
    pub skipped: usize,
}

/// One overdue record as seen by the observational pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueObservation {
    pub record_id: i64,
    pub cabinet_location: String,
    pub borrower_email: String,
    pub overdue_hours: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OverdueReport {
    pub overdue: Vec<OverdueObservation>,
}

/// Builds the overdue report without touching the records.
pub fn observe_overdue(records: &[BorrowRecord], now: DateTime<Utc>) -> OverdueReport {
    let overdue = records
        .iter()
        .filter(|record| is_overdue(record, now))
        .map(|record| OverdueObservation {
            record_id: record.id,
            cabinet_location: record.cabinet_location.clone(),
            borrower_email: record.borrower_email.clone(),
            overdue_hours: overdue_info(record.due_at, now).hours,
        })
        .collect();
    OverdueReport { overdue }
}

const MIN_PASS_INTERVAL_SECS: u64 = 10;

/// Spacing between scheduled passes, floored so a zero interval cannot spin.
pub fn pass_interval(secs: u64) -> std::time::Duration {
    std::time::Duration::from_secs(secs.max(MIN_PASS_INTERVAL_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn record(due_in: Duration, status: ReturnStatus, reminder_sent: bool) -> BorrowRecord {
        BorrowRecord {
            id: 9,
            cabinet_location: "B-04".to_string(),
            package_code: String::new(),
            user_id: "u-1".to_string(),
            borrower_email: "user@example.com".to_string(),
            borrowed_at: now() - Duration::hours(22),
            due_at: now() + due_in,
            returned_at: None,
            status,
            expected_samples: 4,
            returned_samples: None,
            justification: None,
            admin_approved: None,
            admin_comments: None,
            reminder_sent,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn reminder_window_is_open_closed() {
        let window = ReminderWindow::at(now(), &LoanPolicy::default());
        assert!(!window.contains(now()));
        assert!(window.contains(now() + Duration::minutes(90)));
        assert!(window.contains(now() + Duration::hours(2)));
        assert!(!window.contains(now() + Duration::hours(2) + Duration::seconds(1)));
    }

    #[test]
    fn reminder_selection_skips_sent_and_inactive_records() {
        let window = ReminderWindow::at(now(), &LoanPolicy::default());
        let due_soon = Duration::minutes(90);
        assert!(needs_reminder(
            &record(due_soon, ReturnStatus::Borrowed, false),
            &window
        ));
        assert!(!needs_reminder(
            &record(due_soon, ReturnStatus::Borrowed, true),
            &window
        ));
        assert!(!needs_reminder(
            &record(due_soon, ReturnStatus::InProgress, false),
            &window
        ));
    }

    #[test]
    fn hours_left_rounds_up() {
        assert_eq!(hours_left_ceil(now() + Duration::minutes(90), now()), 2);
        assert_eq!(hours_left_ceil(now() + Duration::minutes(60), now()), 1);
        assert_eq!(hours_left_ceil(now() + Duration::seconds(1), now()), 1);
        assert_eq!(hours_left_ceil(now() - Duration::minutes(5), now()), 0);
    }

    #[test]
    fn time_left_floors_and_clamps() {
        let left = time_left(now() + Duration::minutes(135), now());
        assert_eq!((left.hours, left.minutes, left.expired), (2, 15, false));

        let gone = time_left(now() - Duration::hours(1), now());
        assert_eq!((gone.hours, gone.minutes, gone.expired), (0, 0, true));
        assert!(time_info(now() - Duration::hours(1), now()).overdue);
    }

    #[test]
    fn overdue_info_counts_whole_hours_and_days() {
        let info = overdue_info(now() - Duration::hours(49), now());
        assert_eq!(info.hours, 49);
        assert_eq!(info.days, 2);
        assert_eq!(overdue_info(now() + Duration::hours(1), now()).hours, 0);
    }

    #[test]
    fn observe_overdue_reports_only_past_due_borrows() {
        let records = vec![
            record(-Duration::hours(3), ReturnStatus::Borrowed, true),
            record(Duration::hours(3), ReturnStatus::Borrowed, false),
            record(-Duration::hours(3), ReturnStatus::InProgress, false),
        ];
        let report = observe_overdue(&records, now());
        assert_eq!(report.overdue.len(), 1);
        assert_eq!(report.overdue[0].overdue_hours, 3);
    }

    #[test]
    fn pass_interval_has_a_floor() {
        assert_eq!(pass_interval(0).as_secs(), MIN_PASS_INTERVAL_SECS);
        assert_eq!(pass_interval(1800).as_secs(), 1800);
    }
}
