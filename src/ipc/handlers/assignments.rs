use crate::calc::{self, AssignmentProgress, AssignmentStatus};
use crate::db;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::skills::existing_skill_ids;
use crate::ipc::helpers::{
    exists, get_opt_date, get_opt_i64, get_opt_str, get_required_str, get_str_list, load_actor,
    matches_search, require_managed_student, resolve_student_target, run, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentView {
    pub id: String,
    pub skill_id: String,
    pub skill_name: String,
    pub category_name: Option<String>,
    pub student_id: String,
    pub student_name: String,
    pub due_date: Option<String>,
    pub created_at: String,
    #[serde(flatten)]
    pub progress: AssignmentProgress,
}

#[derive(Debug, Default)]
pub struct AssignmentFilter<'a> {
    pub student_id: Option<&'a str>,
    pub instructor_id: Option<&'a str>,
    pub skill_id: Option<&'a str>,
}

/// Assignments with their non-rejected submission counts and effective status.
pub fn load_assignments(
    conn: &Connection,
    filter: &AssignmentFilter<'_>,
) -> Result<Vec<AssignmentView>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               a.id, a.skill_id, s.name, c.name, a.student_id, p.full_name,
               a.required_submissions, a.due_date, a.status, a.created_at,
               (SELECT COUNT(*) FROM skill_logs l
                 WHERE l.assignment_id = a.id AND l.status != 'rejected') AS submissions
             FROM skill_assignments a
             JOIN skills s ON s.id = a.skill_id
             LEFT JOIN skill_categories c ON c.id = s.category_id
             JOIN profiles p ON p.id = a.student_id
             WHERE (?1 IS NULL OR a.student_id = ?1)
               AND (?2 IS NULL OR p.affiliated_instructor = ?2)
               AND (?3 IS NULL OR a.skill_id = ?3)
             ORDER BY p.full_name, s.name, a.created_at",
        )
        .map_err(db_err("db_query_failed"))?;
    let today = db::today();
    let rows = stmt
        .query_map(
            (filter.student_id, filter.instructor_id, filter.skill_id),
            |r| {
                let stored: String = r.get(8)?;
                let required: i64 = r.get(6)?;
                let due_date: Option<String> = r.get(7)?;
                let submissions: i64 = r.get(10)?;
                let stored = AssignmentStatus::parse(&stored).unwrap_or(AssignmentStatus::Pending);
                Ok(AssignmentView {
                    id: r.get(0)?,
                    skill_id: r.get(1)?,
                    skill_name: r.get(2)?,
                    category_name: r.get(3)?,
                    student_id: r.get(4)?,
                    student_name: r.get(5)?,
                    progress: calc::assignment_progress(
                        stored,
                        submissions,
                        required,
                        due_date.as_deref(),
                        today,
                    ),
                    due_date,
                    created_at: r.get(9)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

/// Re-derives the stored status from non-rejected submissions. Only
/// `completed` and `pending` are persisted; expiry is derived from the due
/// date on read. Returns the new status.
pub fn recompute_status(
    conn: &Connection,
    assignment_id: &str,
) -> Result<AssignmentStatus, HandlerErr> {
    let (stored, required, submissions): (String, i64, i64) = conn
        .query_row(
            "SELECT a.status, a.required_submissions,
               (SELECT COUNT(*) FROM skill_logs l
                 WHERE l.assignment_id = a.id AND l.status != 'rejected')
             FROM skill_assignments a WHERE a.id = ?",
            [assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    let stored = AssignmentStatus::parse(&stored).unwrap_or(AssignmentStatus::Pending);
    let next = if submissions >= required.max(1) {
        AssignmentStatus::Completed
    } else {
        AssignmentStatus::Pending
    };
    if next != stored {
        conn.execute(
            "UPDATE skill_assignments SET status = ? WHERE id = ?",
            (next.as_str(), assignment_id),
        )
        .map_err(db_err("db_update_failed"))?;
        info!(assignment_id, status = next.as_str(), "assignment status changed");
    }
    Ok(next)
}

fn assignments_create(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "assign skills")?;
    let skill_ids = existing_skill_ids(ctx.conn, ctx.params, "skillIds")?;
    let student_ids = get_str_list(ctx.params, "studentIds")?;
    if skill_ids.is_empty() || student_ids.is_empty() {
        return Err(HandlerErr::bad_params(
            "select at least one skill and one student",
        ));
    }
    for id in &student_ids {
        require_managed_student(ctx.conn, &actor, id)?;
    }
    let required = get_opt_i64(ctx.params, "requiredSubmissions")?
        .unwrap_or(ctx.config.assignments.default_required_submissions);
    if required < 1 {
        return Err(HandlerErr::bad_params("requiredSubmissions must be at least 1"));
    }
    let due_date = get_opt_date(ctx.params, "dueDate")?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let now = db::now_rfc3339();
    let mut created = Vec::new();
    let mut skipped = 0usize;
    for skill_id in &skill_ids {
        for student_id in &student_ids {
            let n = tx
                .execute(
                    "INSERT OR IGNORE INTO skill_assignments(
                       id, skill_id, student_id, required_submissions, due_date, status, created_at)
                     VALUES(?, ?, ?, ?, ?, 'pending', ?)",
                    (
                        Uuid::new_v4().to_string(),
                        skill_id,
                        student_id,
                        required,
                        &due_date,
                        &now,
                    ),
                )
                .map_err(|e| {
                    HandlerErr::new("db_insert_failed", e.to_string())
                        .with_details(json!({ "table": "skill_assignments" }))
                })?;
            if n == 0 {
                skipped += 1;
            } else {
                created.push(json!({ "skillId": skill_id, "studentId": student_id }));
            }
        }
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(created = created.len(), skipped, "assignments created");

    Ok(json!({
        "created": created.len(),
        "skipped": skipped,
        "assignments": created,
    }))
}

fn assignments_delete(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "remove assignments")?;
    let skill_id = get_required_str(ctx.params, "skillId")?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    require_managed_student(ctx.conn, &actor, &student_id)?;

    let assignment_id: Option<String> = ctx
        .conn
        .query_row(
            "SELECT id FROM skill_assignments WHERE skill_id = ? AND student_id = ?",
            (&skill_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(assignment_id) = assignment_id else {
        return Err(HandlerErr::not_found("assignment not found"));
    };
    if exists(
        ctx.conn,
        "SELECT 1 FROM skill_logs WHERE assignment_id = ?",
        &assignment_id,
    )? {
        return Err(HandlerErr::conflict("assignment already has logged attempts"));
    }

    ctx.conn
        .execute("DELETE FROM skill_assignments WHERE id = ?", [&assignment_id])
        .map_err(db_err("db_delete_failed"))?;
    info!(assignment_id = %assignment_id, "assignment deleted");
    Ok(json!({ "ok": true }))
}

fn assignments_for_skill(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "view skill assignments")?;
    let skill_id = get_required_str(ctx.params, "skillId")?;
    if !exists(ctx.conn, "SELECT 1 FROM skills WHERE id = ?", &skill_id)? {
        return Err(HandlerErr::not_found("skill not found"));
    }
    let search = get_opt_str(ctx.params, "search");
    let page = get_opt_i64(ctx.params, "page")?.unwrap_or(0).max(0);
    let page_size = ctx.config.assignments.page_size.max(1);

    let instructor_filter = match actor.role {
        Role::Admin => None,
        _ => Some(actor.id.as_str()),
    };
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, full_name, email FROM profiles
             WHERE role = 'student' AND (?1 IS NULL OR affiliated_instructor = ?1)
             ORDER BY full_name, email",
        )
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map([instructor_filter], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let students: Vec<_> = students
        .into_iter()
        .filter(|(_, name, email)| matches_search(&[name.as_str(), email.as_str()], search.as_deref()))
        .collect();

    let total = students.len() as i64;
    let start = page.saturating_mul(page_size).min(total) as usize;
    let end = start.saturating_add(page_size as usize).min(total as usize);

    let views = load_assignments(
        ctx.conn,
        &AssignmentFilter {
            instructor_id: instructor_filter,
            skill_id: Some(&skill_id),
            ..Default::default()
        },
    )?;

    let mut assigned = Vec::new();
    let mut unassigned = Vec::new();
    for (id, name, email) in &students[start..end] {
        match views.iter().find(|v| v.student_id == *id) {
            Some(v) => assigned.push(json!({
                "studentId": id,
                "fullName": name,
                "email": email,
                "assignment": v,
            })),
            None => unassigned.push(json!({
                "studentId": id,
                "fullName": name,
                "email": email,
            })),
        }
    }

    let has_more = (end as i64) < total;
    Ok(json!({
        "skillId": skill_id,
        "assigned": assigned,
        "unassigned": unassigned,
        "page": page,
        "pageSize": page_size,
        "total": total,
        "hasMore": has_more,
    }))
}

fn assignments_for_student(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let student = resolve_student_target(ctx, &actor)?;
    let views = load_assignments(
        ctx.conn,
        &AssignmentFilter {
            student_id: Some(&student.id),
            ..Default::default()
        },
    )?;
    let completed = views
        .iter()
        .filter(|v| v.progress.status == AssignmentStatus::Completed)
        .count() as i64;
    Ok(json!({
        "studentId": student.id,
        "assignments": views,
        "completed": completed,
        "total": views.len(),
        "overallProgress": calc::calculate_progress(completed, views.len() as i64),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "assignments.create" => assignments_create,
        "assignments.delete" => assignments_delete,
        "assignments.forSkill" => assignments_for_skill,
        "assignments.forStudent" => assignments_for_student,
        _ => return None,
    };
    Some(run(state, req, handler))
}
