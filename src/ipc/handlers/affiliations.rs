use crate::db;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    get_opt_bool, get_opt_str, get_required_str, load_actor, require_managed_student, run,
    unenroll_from_instructor, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const REQUEST_SELECT: &str = "SELECT
       r.id, r.student_id, s.full_name, s.email,
       r.instructor_id, i.full_name, r.status, r.created_at
     FROM affiliation_requests r
     JOIN profiles s ON s.id = r.student_id
     JOIN profiles i ON i.id = r.instructor_id";

fn request_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "studentEmail": r.get::<_, String>(3)?,
        "instructorId": r.get::<_, String>(4)?,
        "instructorName": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "createdAt": r.get::<_, String>(7)?,
    }))
}

fn load_request(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE r.id = ?", REQUEST_SELECT),
        [id],
        request_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

/// Drops a student from every class owned by `instructor_id`.
fn affiliations_request(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Student, "request an affiliation")?;
    let code = get_required_str(ctx.params, "instructorCode")?.to_uppercase();

    let instructor_id: Option<String> = ctx
        .conn
        .query_row(
            "SELECT id FROM profiles WHERE role = 'instructor' AND instructor_code = ?",
            [&code],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(instructor_id) = instructor_id else {
        return Err(HandlerErr::not_found("Invalid instructor code"));
    };

    if actor.affiliated_instructor.as_deref() == Some(instructor_id.as_str()) {
        return Err(HandlerErr::conflict("already affiliated with this instructor"));
    }
    let pending = ctx
        .conn
        .query_row(
            "SELECT 1 FROM affiliation_requests
             WHERE student_id = ? AND instructor_id = ? AND status = 'pending'",
            (&actor.id, &instructor_id),
            |_| Ok(()),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if pending {
        return Err(HandlerErr::conflict(
            "a request to this instructor is already pending",
        ));
    }

    let id = Uuid::new_v4().to_string();
    ctx.conn
        .execute(
            "INSERT INTO affiliation_requests(id, student_id, instructor_id, status, created_at)
             VALUES(?, ?, ?, 'pending', ?)",
            (&id, &actor.id, &instructor_id, db::now_rfc3339()),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "affiliation_requests" }))
        })?;
    info!(request_id = %id, student_id = %actor.id, "affiliation requested");

    let request = load_request(ctx.conn, &id)?
        .ok_or_else(|| HandlerErr::not_found("request not found"))?;
    Ok(json!({ "request": request }))
}

fn affiliations_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let status = get_opt_str(ctx.params, "status");
    if let Some(s) = status.as_deref() {
        if !matches!(s, "pending" | "approved" | "rejected") {
            return Err(HandlerErr::bad_params(
                "status must be one of: pending, approved, rejected",
            ));
        }
    }

    // Instructors and admins see pending requests by default; students see
    // their whole history.
    let (owner_clause, owner): (&str, Option<&str>) = match actor.role {
        Role::Student => ("r.student_id = ?1", Some(actor.id.as_str())),
        Role::Instructor => ("r.instructor_id = ?1", Some(actor.id.as_str())),
        Role::Admin => ("?1 IS NULL", None),
    };
    let status = match (actor.role, status) {
        (_, Some(s)) => Some(s),
        (Role::Student, None) => None,
        (_, None) => Some("pending".to_string()),
    };
    let sql = format!(
        "{} WHERE {} AND (?2 IS NULL OR r.status = ?2) ORDER BY r.created_at, r.id",
        REQUEST_SELECT, owner_clause
    );
    let mut stmt = ctx.conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let requests = stmt
        .query_map((owner, status), request_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "requests": requests }))
}

fn affiliations_resolve(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "resolve affiliation requests")?;
    let request_id = get_required_str(ctx.params, "requestId")?;
    let Some(approve) = get_opt_bool(ctx.params, "approve")? else {
        return Err(HandlerErr::bad_params("missing approve"));
    };

    let row: Option<(String, String, String)> = ctx
        .conn
        .query_row(
            "SELECT student_id, instructor_id, status FROM affiliation_requests WHERE id = ?",
            [&request_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((student_id, instructor_id, status)) = row else {
        return Err(HandlerErr::not_found("request not found"));
    };
    if actor.role == Role::Instructor && instructor_id != actor.id {
        return Err(HandlerErr::forbidden("request belongs to another instructor"));
    }
    if status != "pending" {
        return Err(HandlerErr::conflict(format!("request is already {}", status)));
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let new_status = if approve { "approved" } else { "rejected" };
    tx.execute(
        "UPDATE affiliation_requests SET status = ? WHERE id = ?",
        (new_status, &request_id),
    )
    .map_err(db_err("db_update_failed"))?;
    if approve {
        let previous: Option<String> = tx
            .query_row(
                "SELECT affiliated_instructor FROM profiles WHERE id = ?",
                [&student_id],
                |r| r.get(0),
            )
            .map_err(db_err("db_query_failed"))?;
        if let Some(prev) = previous.filter(|p| *p != instructor_id) {
            unenroll_from_instructor(&tx, &student_id, &prev)?;
        }
        tx.execute(
            "UPDATE profiles SET affiliated_instructor = ?, updated_at = ? WHERE id = ?",
            (&instructor_id, db::now_rfc3339(), &student_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(request_id = %request_id, status = new_status, "affiliation resolved");

    let request = load_request(ctx.conn, &request_id)?
        .ok_or_else(|| HandlerErr::not_found("request not found"))?;
    Ok(json!({ "request": request }))
}

fn affiliations_remove(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "remove affiliations")?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    let student = require_managed_student(ctx.conn, &actor, &student_id)?;
    let Some(instructor_id) = student.affiliated_instructor else {
        return Err(HandlerErr::conflict("student has no affiliation"));
    };

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    let removed = unenroll_from_instructor(&tx, &student_id, &instructor_id)?;
    tx.execute(
        "UPDATE profiles SET affiliated_instructor = NULL, updated_at = ? WHERE id = ?",
        (db::now_rfc3339(), &student_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(student_id = %student_id, instructor_id = %instructor_id, "affiliation removed");

    Ok(json!({ "studentId": student_id, "removedEnrollments": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "affiliations.request" => affiliations_request,
        "affiliations.list" => affiliations_list,
        "affiliations.resolve" => affiliations_resolve,
        "affiliations.remove" => affiliations_remove,
        _ => return None,
    };
    Some(run(state, req, handler))
}
