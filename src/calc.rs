use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Completed,
    Expired,
}

impl AssignmentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

/// Percentage of `total` reached by `completed`, clamped to 0..=100.
/// A zero (or negative) total yields 0.
pub fn calculate_progress(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = (completed.max(0) as f64 / total as f64) * 100.0;
    pct.min(100.0)
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive())
}

/// Status shown to users. Completion is checked first (stored `completed`
/// or enough submissions); then a stored `expired` or a past due date
/// expires it.
pub fn effective_status(
    stored: AssignmentStatus,
    submissions: i64,
    required: i64,
    due_date: Option<NaiveDate>,
    today: NaiveDate,
) -> AssignmentStatus {
    if stored == AssignmentStatus::Completed || submissions >= required.max(1) {
        return AssignmentStatus::Completed;
    }
    if stored == AssignmentStatus::Expired {
        return AssignmentStatus::Expired;
    }
    match due_date {
        Some(due) if due < today => AssignmentStatus::Expired,
        _ => AssignmentStatus::Pending,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentProgress {
    pub submissions: i64,
    pub required_submissions: i64,
    pub progress_percent: f64,
    pub status: AssignmentStatus,
}

pub fn assignment_progress(
    stored: AssignmentStatus,
    submissions: i64,
    required: i64,
    due_date: Option<&str>,
    today: NaiveDate,
) -> AssignmentProgress {
    AssignmentProgress {
        submissions,
        required_submissions: required,
        progress_percent: calculate_progress(submissions, required),
        status: effective_status(
            stored,
            submissions,
            required,
            due_date.and_then(parse_date),
            today,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    #[test]
    fn progress_clamps_and_handles_zero_total() {
        assert_eq!(calculate_progress(0, 0), 0.0);
        assert_eq!(calculate_progress(5, 0), 0.0);
        assert_eq!(calculate_progress(1, 4), 25.0);
        assert_eq!(calculate_progress(4, 4), 100.0);
        assert_eq!(calculate_progress(9, 4), 100.0);
    }

    #[test]
    fn completion_wins_over_expiry() {
        let today = day("2025-03-10");
        assert_eq!(
            effective_status(AssignmentStatus::Expired, 5, 1, None, today),
            AssignmentStatus::Completed
        );
        assert_eq!(
            effective_status(AssignmentStatus::Expired, 0, 1, None, today),
            AssignmentStatus::Expired
        );
        assert_eq!(
            effective_status(AssignmentStatus::Pending, 2, 2, Some(day("2025-01-01")), today),
            AssignmentStatus::Completed
        );
        assert_eq!(
            effective_status(AssignmentStatus::Pending, 1, 2, Some(day("2025-03-09")), today),
            AssignmentStatus::Expired
        );
        assert_eq!(
            effective_status(AssignmentStatus::Pending, 1, 2, Some(day("2025-03-10")), today),
            AssignmentStatus::Pending
        );
    }

    #[test]
    fn parse_date_accepts_timestamps() {
        assert_eq!(
            parse_date("2025-02-01T10:30:00+00:00"),
            Some(day("2025-02-01"))
        );
        assert_eq!(parse_date("02/01/2025"), None);
    }

    #[test]
    fn progress_summary_uses_due_date_text() {
        let p = assignment_progress(
            AssignmentStatus::Pending,
            1,
            3,
            Some("2024-12-31"),
            day("2025-01-15"),
        );
        assert_eq!(p.status, AssignmentStatus::Expired);
        assert!((p.progress_percent - 100.0 / 3.0).abs() < 1e-9);
    }
}
