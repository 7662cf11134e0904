use crate::calc::{self, AssignmentStatus};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::assignments::{load_assignments, AssignmentFilter, AssignmentView};
use crate::ipc::handlers::classes::load_owned_class;
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, load_actor, resolve_student_target, run, Actor, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, Params};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};

const RECENT_LIMIT: i64 = 4;
const MAX_RECENT_LIMIT: i64 = 20;

fn count<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<i64, HandlerErr> {
    conn.query_row(sql, params, |r| r.get(0))
        .map_err(db_err("db_query_failed"))
}

/// Instructors see their own students and classes; admins see everything.
fn staff_scope(actor: &Actor) -> Option<&str> {
    match actor.role {
        Role::Admin => None,
        _ => Some(actor.id.as_str()),
    }
}

fn staff_counts(conn: &Connection, scope: Option<&str>) -> Result<Value, HandlerErr> {
    let students = count(
        conn,
        "SELECT COUNT(*) FROM profiles
         WHERE role = 'student' AND (?1 IS NULL OR affiliated_instructor = ?1)",
        [scope],
    )?;
    let submitted_logs = count(
        conn,
        "SELECT COUNT(*) FROM skill_logs l
         JOIN profiles p ON p.id = l.student_id
         WHERE l.status = 'submitted' AND (?1 IS NULL OR p.affiliated_instructor = ?1)",
        [scope],
    )?;
    let skills = count(conn, "SELECT COUNT(*) FROM skills", [])?;
    let classes = count(
        conn,
        "SELECT COUNT(*) FROM classes
         WHERE archived = 0 AND (?1 IS NULL OR instructor_id = ?1)",
        [scope],
    )?;
    let pending_requests = count(
        conn,
        "SELECT COUNT(*) FROM affiliation_requests
         WHERE status = 'pending' AND (?1 IS NULL OR instructor_id = ?1)",
        [scope],
    )?;
    let mut counts = json!({
        "students": students,
        "submittedLogs": submitted_logs,
        "skills": skills,
        "classes": classes,
        "pendingRequests": pending_requests,
    });
    if scope.is_none() {
        counts["instructors"] = json!(count(
            conn,
            "SELECT COUNT(*) FROM profiles WHERE role = 'instructor'",
            [],
        )?);
    }
    Ok(counts)
}

struct StudentRow {
    id: String,
    full_name: String,
    class_id: Option<String>,
}

/// Students in scope with their first active class, optionally only those
/// enrolled in `class_id`.
fn scoped_students(
    conn: &Connection,
    scope: Option<&str>,
    class_id: Option<&str>,
) -> Result<Vec<StudentRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.full_name,
               (SELECT e.class_id FROM class_enrollments e
                  JOIN classes c ON c.id = e.class_id
                 WHERE e.student_id = p.id AND c.archived = 0
                 ORDER BY e.created_at LIMIT 1)
             FROM profiles p
             WHERE p.role = 'student'
               AND (?1 IS NULL OR p.affiliated_instructor = ?1)
               AND (?2 IS NULL OR EXISTS (
                     SELECT 1 FROM class_enrollments e
                      WHERE e.student_id = p.id AND e.class_id = ?2))
             ORDER BY p.full_name, p.email",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((scope, class_id), |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                full_name: r.get(1)?,
                class_id: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn active_classes(conn: &Connection, scope: Option<&str>) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM classes
             WHERE archived = 0 AND (?1 IS NULL OR instructor_id = ?1)
             ORDER BY name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([scope], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn skill_summary(view: &AssignmentView) -> Value {
    json!({
        "skillId": view.skill_id,
        "name": view.skill_name,
        "completed": view.progress.submissions,
        "required": view.progress.required_submissions,
        "progressPercent": view.progress.progress_percent,
        "status": view.progress.status,
    })
}

fn staff_summary(ctx: &Ctx, actor: &Actor) -> Result<Value, HandlerErr> {
    let scope = staff_scope(actor);
    let class_id = get_opt_str(ctx.params, "classId");
    if let Some(id) = &class_id {
        load_owned_class(ctx.conn, actor, id)?;
    }

    let views = load_assignments(
        ctx.conn,
        &AssignmentFilter {
            instructor_id: scope,
            ..Default::default()
        },
    )?;
    let mut by_student: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for v in &views {
        by_student
            .entry(v.student_id.as_str())
            .or_default()
            .push(skill_summary(v));
    }

    let students: Vec<Value> = scoped_students(ctx.conn, scope, class_id.as_deref())?
        .into_iter()
        .map(|s| {
            let skills = by_student.remove(s.id.as_str()).unwrap_or_default();
            json!({
                "id": s.id,
                "fullName": s.full_name,
                "classId": s.class_id,
                "skills": skills,
            })
        })
        .collect();

    Ok(json!({
        "role": actor.role.as_str(),
        "counts": staff_counts(ctx.conn, scope)?,
        "classes": active_classes(ctx.conn, scope)?,
        "students": students,
    }))
}

fn student_summary(ctx: &Ctx, actor: &Actor) -> Result<Value, HandlerErr> {
    let views = load_assignments(
        ctx.conn,
        &AssignmentFilter {
            student_id: Some(&actor.id),
            ..Default::default()
        },
    )?;
    let tally = |status: AssignmentStatus| {
        views.iter().filter(|v| v.progress.status == status).count() as i64
    };
    let completed = tally(AssignmentStatus::Completed);
    let skills: HashSet<&str> = views.iter().map(|v| v.skill_id.as_str()).collect();
    let submitted_logs = count(
        ctx.conn,
        "SELECT COUNT(*) FROM skill_logs WHERE student_id = ? AND status = 'submitted'",
        [&actor.id],
    )?;
    let classes = count(
        ctx.conn,
        "SELECT COUNT(*) FROM class_enrollments e
         JOIN classes c ON c.id = e.class_id
         WHERE e.student_id = ? AND c.archived = 0",
        [&actor.id],
    )?;

    Ok(json!({
        "role": actor.role.as_str(),
        "counts": {
            "assignedSkills": skills.len(),
            "completed": completed,
            "pending": tally(AssignmentStatus::Pending),
            "expired": tally(AssignmentStatus::Expired),
            "submittedLogs": submitted_logs,
            "classes": classes,
        },
        "overallProgress": calc::calculate_progress(completed, views.len() as i64),
        "affiliatedInstructor": actor.affiliated_instructor,
    }))
}

fn dashboard_summary(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    match actor.role {
        Role::Student => student_summary(ctx, &actor),
        Role::Instructor | Role::Admin => staff_summary(ctx, &actor),
    }
}

fn recent_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "description": r.get::<_, String>(2)?,
        "categoryId": r.get::<_, String>(3)?,
        "categoryName": r.get::<_, Option<String>>(4)?,
        "verificationType": r.get::<_, String>(5)?,
        "lastLoggedAt": r.get::<_, String>(6)?,
        "logCount": r.get::<_, i64>(7)?,
    }))
}

fn logged_skills(
    conn: &Connection,
    student_id: &str,
    order_by: &str,
    limit: i64,
) -> Result<Vec<Value>, HandlerErr> {
    let sql = format!(
        "SELECT s.id, s.name, s.description, s.category_id, c.name, s.verification_type,
           MAX(l.created_at), COUNT(*)
         FROM skill_logs l
         JOIN skills s ON s.id = l.skill_id
         LEFT JOIN skill_categories c ON c.id = s.category_id
         WHERE l.student_id = ?1
         GROUP BY s.id
         ORDER BY {}
         LIMIT ?2",
        order_by
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((student_id, limit), recent_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

/// Distinct skills the student logged most recently, and most often.
fn dashboard_recent_skills(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let student = resolve_student_target(ctx, &actor)?;
    let limit = get_opt_i64(ctx.params, "limit")?
        .unwrap_or(RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);

    let recent = logged_skills(
        ctx.conn,
        &student.id,
        "MAX(l.created_at) DESC, MAX(l.rowid) DESC",
        limit,
    )?;
    let frequent = logged_skills(
        ctx.conn,
        &student.id,
        "COUNT(*) DESC, MAX(l.created_at) DESC, MAX(l.rowid) DESC",
        limit,
    )?;
    Ok(json!({
        "studentId": student.id,
        "recent": recent,
        "frequent": frequent,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "dashboard.summary" => dashboard_summary,
        "dashboard.recentSkills" => dashboard_recent_skills,
        _ => return None,
    };
    Some(run(state, req, handler))
}
