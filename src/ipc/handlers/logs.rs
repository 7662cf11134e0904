use crate::calc::{self, AssignmentStatus};
use crate::db;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::assignments::recompute_status;
use crate::ipc::handlers::forms::form_err;
use crate::ipc::handlers::skills::{load_skill, VERIFICATION_TYPES};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, load_actor, require_managed_student, resolve_student_target,
    run, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const LOG_SELECT: &str = "SELECT
       l.id, l.skill_id, s.name, l.student_id, l.assignment_id, l.class_id,
       l.responses, l.status, l.attempt_number, l.evaluator_name, l.evaluator_type,
       l.instructor_signature, l.created_at
     FROM skill_logs l
     JOIN skills s ON s.id = l.skill_id";

fn log_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let responses: String = r.get(6)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "skillId": r.get::<_, String>(1)?,
        "skillName": r.get::<_, String>(2)?,
        "studentId": r.get::<_, String>(3)?,
        "assignmentId": r.get::<_, String>(4)?,
        "classId": r.get::<_, Option<String>>(5)?,
        "responses": serde_json::from_str::<Value>(&responses).unwrap_or(Value::Null),
        "status": r.get::<_, String>(7)?,
        "attemptNumber": r.get::<_, i64>(8)?,
        "evaluatorName": r.get::<_, String>(9)?,
        "evaluatorType": r.get::<_, String>(10)?,
        "instructorSignature": r.get::<_, Option<String>>(11)?,
        "createdAt": r.get::<_, String>(12)?,
    }))
}

fn log_json(conn: &Connection, log_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE l.id = ?", LOG_SELECT), [log_id], log_row)
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("log not found"))
}

fn logs_submit(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Student, "submit skill logs")?;
    let skill_id = get_required_str(ctx.params, "skillId")?;
    let skill = load_skill(ctx.conn, &skill_id)?;

    let assignment: Option<(String, String, i64, Option<String>)> = ctx
        .conn
        .query_row(
            "SELECT a.id, a.status, a.required_submissions, a.due_date
             FROM skill_assignments a
             WHERE a.skill_id = ? AND a.student_id = ?",
            (&skill.id, &actor.id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((assignment_id, stored, required, due_date)) = assignment else {
        return Err(HandlerErr::forbidden("this skill is not assigned to you"));
    };
    let prior: i64 = ctx
        .conn
        .query_row(
            "SELECT COUNT(*) FROM skill_logs WHERE assignment_id = ? AND status != 'rejected'",
            [&assignment_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let stored = AssignmentStatus::parse(&stored).unwrap_or(AssignmentStatus::Pending);
    let status = calc::effective_status(
        stored,
        prior,
        required,
        due_date.as_deref().and_then(calc::parse_date),
        db::today(),
    );
    if status != AssignmentStatus::Pending {
        return Err(HandlerErr::conflict(format!(
            "assignment is {}",
            status.as_str()
        )));
    }

    let Some(evaluator_name) = get_opt_str(ctx.params, "evaluatorName") else {
        return Err(HandlerErr::bad_params("Please provide the evaluator's name"));
    };
    let evaluator_type =
        get_opt_str(ctx.params, "evaluatorType").unwrap_or_else(|| skill.verification_type.clone());
    if !VERIFICATION_TYPES.contains(&evaluator_type.as_str()) {
        return Err(HandlerErr::bad_params(
            "evaluatorType must be one of: peer, instructor",
        ));
    }
    let signature = get_opt_str(ctx.params, "instructorSignature");
    if evaluator_type == "instructor" && signature.is_none() {
        return Err(HandlerErr::bad_params("Instructor signature is required"));
    }

    let responses = match ctx.params.get("responses") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => return Err(HandlerErr::bad_params("responses must be an object")),
    };
    skill
        .schema
        .validate_responses(&responses)
        .map_err(form_err)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let attempts: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM skill_logs WHERE assignment_id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let class_id: Option<String> = tx
        .query_row(
            "SELECT e.class_id
             FROM class_enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE e.student_id = ? AND c.archived = 0
             ORDER BY e.created_at, e.class_id
             LIMIT 1",
            [&actor.id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;

    let log_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO skill_logs(id, skill_id, student_id, assignment_id, class_id, responses,
           status, attempt_number, evaluator_name, evaluator_type, instructor_signature, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 'submitted', ?, ?, ?, ?, ?)",
        (
            &log_id,
            &skill.id,
            &actor.id,
            &assignment_id,
            &class_id,
            Value::Object(responses).to_string(),
            attempts + 1,
            &evaluator_name,
            &evaluator_type,
            &signature,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "skill_logs" }))
    })?;
    let assignment_status = recompute_status(&tx, &assignment_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(
        log_id = %log_id,
        skill_id = %skill.id,
        attempt = attempts + 1,
        status = assignment_status.as_str(),
        "skill log submitted"
    );

    Ok(json!({
        "log": log_json(ctx.conn, &log_id)?,
        "assignmentStatus": assignment_status.as_str(),
    }))
}

fn logs_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let student = resolve_student_target(ctx, &actor)?;
    let skill_id = get_opt_str(ctx.params, "skillId");
    let sql = format!(
        "{} WHERE l.student_id = ?1 AND (?2 IS NULL OR l.skill_id = ?2)
         ORDER BY l.created_at DESC, l.attempt_number DESC",
        LOG_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let logs = stmt
        .query_map((&student.id, &skill_id), log_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "studentId": student.id, "logs": logs }))
}

fn logs_review(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "review skill logs")?;
    let log_id = get_required_str(ctx.params, "logId")?;
    let status = get_required_str(ctx.params, "status")?;
    if !matches!(status.as_str(), "submitted" | "rejected") {
        return Err(HandlerErr::bad_params(
            "status must be one of: submitted, rejected",
        ));
    }

    let row: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT student_id, assignment_id FROM skill_logs WHERE id = ?",
            [&log_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((student_id, assignment_id)) = row else {
        return Err(HandlerErr::not_found("log not found"));
    };
    require_managed_student(ctx.conn, &actor, &student_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE skill_logs SET status = ? WHERE id = ?",
        (&status, &log_id),
    )
    .map_err(db_err("db_update_failed"))?;
    let assignment_status = recompute_status(&tx, &assignment_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(log_id = %log_id, status = %status, "skill log reviewed");

    Ok(json!({
        "log": log_json(ctx.conn, &log_id)?,
        "assignmentStatus": assignment_status.as_str(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "logs.submit" => logs_submit,
        "logs.list" => logs_list,
        "logs.review" => logs_review,
        _ => return None,
    };
    Some(run(state, req, handler))
}
