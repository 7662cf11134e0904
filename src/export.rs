use crate::calc;
use anyhow::Context;
use std::path::Path;

pub const REPORT_HEADER: [&str; 9] = [
    "Student Name",
    "Student Email",
    "Skill",
    "Category",
    "Class",
    "Status",
    "Submitted",
    "Evaluator",
    "Evaluation Type",
];

pub const PROGRESS_HEADER: [&str; 6] = [
    "Student",
    "Skill",
    "Status",
    "Completed",
    "Required",
    "Progress",
];

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn push_record(out: &mut String, fields: &[&str]) {
    let line = fields
        .iter()
        .map(|f| csv_quote(f))
        .collect::<Vec<_>>()
        .join(",");
    out.push_str(&line);
    out.push('\n');
}

#[derive(Debug, Clone, Default)]
pub struct ReportRow {
    pub student_name: Option<String>,
    pub student_email: Option<String>,
    pub skill_name: Option<String>,
    pub category_name: Option<String>,
    pub class_name: Option<String>,
    pub status: String,
    pub created_at: String,
    pub evaluator_name: String,
    pub evaluator_type: String,
}

pub fn report_csv(rows: &[ReportRow]) -> String {
    let mut csv = String::new();
    push_record(&mut csv, &REPORT_HEADER);
    for r in rows {
        let submitted = calc::parse_date(&r.created_at)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| r.created_at.clone());
        push_record(
            &mut csv,
            &[
                r.student_name.as_deref().unwrap_or("Unknown"),
                r.student_email.as_deref().unwrap_or("Unknown"),
                r.skill_name.as_deref().unwrap_or("Unknown"),
                r.category_name.as_deref().unwrap_or("Unknown"),
                r.class_name.as_deref().unwrap_or("No Class"),
                &r.status,
                &submitted,
                &r.evaluator_name,
                &r.evaluator_type,
            ],
        );
    }
    csv
}

#[derive(Debug, Clone)]
pub struct ProgressRow {
    pub student_name: String,
    pub skill_name: String,
    pub progress: calc::AssignmentProgress,
}

pub fn progress_csv(rows: &[ProgressRow]) -> String {
    let mut csv = String::new();
    push_record(&mut csv, &PROGRESS_HEADER);
    for r in rows {
        let completed = r.progress.submissions.to_string();
        let required = r.progress.required_submissions.to_string();
        let pct = format!("{}", r.progress.progress_percent.round() as i64);
        push_record(
            &mut csv,
            &[
                &r.student_name,
                &r.skill_name,
                r.progress.status.as_str(),
                &completed,
                &required,
                &pct,
            ],
        );
    }
    csv
}

pub fn write_text_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create directory {}", parent.to_string_lossy())
            })?;
        }
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write {}", path.to_string_lossy()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{AssignmentProgress, AssignmentStatus};

    #[test]
    fn report_fields_with_commas_are_quoted() {
        let rows = vec![ReportRow {
            student_name: Some("Doe, Jane".into()),
            student_email: Some("jane@example.edu".into()),
            skill_name: Some("Venipuncture \"basic\"".into()),
            category_name: None,
            class_name: None,
            status: "submitted".into(),
            created_at: "2025-04-02T08:00:00+00:00".into(),
            evaluator_name: "Dr. Smith".into(),
            evaluator_type: "instructor".into(),
        }];
        let csv = report_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("Student Name,Student Email,Skill,Category,Class,Status,Submitted,Evaluator,Evaluation Type")
        );
        assert_eq!(
            lines.next(),
            Some("\"Doe, Jane\",jane@example.edu,\"Venipuncture \"\"basic\"\"\",Unknown,No Class,submitted,2025-04-02,Dr. Smith,instructor")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn progress_rows_round_percent() {
        let rows = vec![ProgressRow {
            student_name: "Sam".into(),
            skill_name: "Gram stain".into(),
            progress: AssignmentProgress {
                submissions: 1,
                required_submissions: 3,
                progress_percent: 100.0 / 3.0,
                status: AssignmentStatus::Pending,
            },
        }];
        let csv = progress_csv(&rows);
        assert!(csv.ends_with("Sam,Gram stain,pending,1,3,33\n"));
    }
}
