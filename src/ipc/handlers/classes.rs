use crate::db;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    get_opt_bool, get_opt_date, get_opt_str, get_required_str, load_actor, load_profile_role, run,
    Actor, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

// Correlated subquery so the count is not multiplied by joins.
const CLASS_SELECT: &str = "SELECT
       c.id, c.instructor_id, p.full_name, c.name, c.description,
       c.start_date, c.end_date, c.archived, c.created_at,
       (SELECT COUNT(*) FROM class_enrollments e WHERE e.class_id = c.id) AS student_count
     FROM classes c
     JOIN profiles p ON p.id = c.instructor_id";

fn class_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "instructorId": r.get::<_, String>(1)?,
        "instructorName": r.get::<_, String>(2)?,
        "name": r.get::<_, String>(3)?,
        "description": r.get::<_, String>(4)?,
        "startDate": r.get::<_, String>(5)?,
        "endDate": r.get::<_, String>(6)?,
        "archived": r.get::<_, i64>(7)? != 0,
        "createdAt": r.get::<_, String>(8)?,
        "studentCount": r.get::<_, i64>(9)?,
    }))
}

fn class_json(conn: &Connection, class_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE c.id = ?", CLASS_SELECT), [class_id], class_row)
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("class not found"))
}

pub struct ClassRecord {
    pub id: String,
    pub instructor_id: String,
    pub archived: bool,
}

/// A class the actor manages: its instructor, or any admin.
pub fn load_owned_class(
    conn: &Connection,
    actor: &Actor,
    class_id: &str,
) -> Result<ClassRecord, HandlerErr> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, instructor_id, archived FROM classes WHERE id = ?",
            [class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((id, instructor_id, archived)) = row else {
        return Err(HandlerErr::not_found("class not found"));
    };
    match actor.role {
        Role::Admin => {}
        Role::Instructor if instructor_id == actor.id => {}
        _ => return Err(HandlerErr::forbidden("class belongs to another instructor")),
    }
    Ok(ClassRecord {
        id,
        instructor_id,
        archived: archived != 0,
    })
}

fn classes_create(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Instructor, "create classes")?;
    let name = get_required_str(ctx.params, "name")?;
    let description = get_opt_str(ctx.params, "description").unwrap_or_default();
    let Some(start_date) = get_opt_date(ctx.params, "startDate")? else {
        return Err(HandlerErr::bad_params("missing startDate"));
    };
    let Some(end_date) = get_opt_date(ctx.params, "endDate")? else {
        return Err(HandlerErr::bad_params("missing endDate"));
    };
    // Both are YYYY-MM-DD so text order is date order.
    if end_date < start_date {
        return Err(HandlerErr::bad_params("End date must be after start date"));
    }

    let class_id = Uuid::new_v4().to_string();
    ctx.conn
        .execute(
            "INSERT INTO classes(id, instructor_id, name, description, start_date, end_date, archived, created_at)
             VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
            (
                &class_id,
                &actor.id,
                &name,
                &description,
                &start_date,
                &end_date,
                db::now_rfc3339(),
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "classes" }))
        })?;
    info!(class_id = %class_id, instructor_id = %actor.id, "class created");

    Ok(json!({ "class": class_json(ctx.conn, &class_id)? }))
}

fn classes_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let archived = get_opt_bool(ctx.params, "archived")?.unwrap_or(false);
    let scope = match actor.role {
        Role::Admin => "?1 IS NOT NULL",
        Role::Instructor => "c.instructor_id = ?1",
        Role::Student => {
            "c.id IN (SELECT class_id FROM class_enrollments WHERE student_id = ?1)"
        }
    };
    let sql = format!(
        "{} WHERE {} AND c.archived = ?2 ORDER BY c.start_date DESC, c.name",
        CLASS_SELECT, scope
    );
    let mut stmt = ctx.conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let classes = stmt
        .query_map((&actor.id, archived), class_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "classes": classes }))
}

fn set_archived(ctx: &Ctx, archived: bool) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let class_id = get_required_str(ctx.params, "classId")?;
    let class = load_owned_class(ctx.conn, &actor, &class_id)?;
    ctx.conn
        .execute(
            "UPDATE classes SET archived = ? WHERE id = ?",
            (archived, &class.id),
        )
        .map_err(db_err("db_update_failed"))?;
    info!(class_id = %class.id, archived, "class archive flag set");
    Ok(json!({ "class": class_json(ctx.conn, &class.id)? }))
}

fn classes_archive(ctx: &Ctx) -> Result<Value, HandlerErr> {
    set_archived(ctx, true)
}

fn classes_restore(ctx: &Ctx) -> Result<Value, HandlerErr> {
    set_archived(ctx, false)
}

fn student_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    args: P,
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map(args, |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn classes_roster(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let class_id = get_required_str(ctx.params, "classId")?;
    let class = load_owned_class(ctx.conn, &actor, &class_id)?;

    let enrolled = student_rows(
        ctx.conn,
        "SELECT p.id, p.full_name, p.email
         FROM class_enrollments e
         JOIN profiles p ON p.id = e.student_id
         WHERE e.class_id = ?
         ORDER BY p.full_name, p.email",
        [&class.id],
    )?;
    let available = student_rows(
        ctx.conn,
        "SELECT p.id, p.full_name, p.email
         FROM profiles p
         WHERE p.role = 'student'
           AND p.affiliated_instructor = ?2
           AND p.id NOT IN (SELECT student_id FROM class_enrollments WHERE class_id = ?1)
         ORDER BY p.full_name, p.email",
        (&class.id, &class.instructor_id),
    )?;
    Ok(json!({
        "classId": class.id,
        "enrolled": enrolled,
        "available": available,
    }))
}

fn is_enrolled(conn: &Connection, class_id: &str, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM class_enrollments WHERE class_id = ? AND student_id = ?",
        (class_id, student_id),
        |_| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

fn classes_enroll(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let class_id = get_required_str(ctx.params, "classId")?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    let class = load_owned_class(ctx.conn, &actor, &class_id)?;
    if class.archived {
        return Err(HandlerErr::conflict("class is archived"));
    }
    let student = load_profile_role(ctx.conn, &student_id)?
        .filter(|p| p.role == Role::Student)
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    if student.affiliated_instructor.as_deref() != Some(class.instructor_id.as_str()) {
        return Err(HandlerErr::forbidden(
            "student is not affiliated with the class instructor",
        ));
    }
    if is_enrolled(ctx.conn, &class.id, &student.id)? {
        return Err(HandlerErr::conflict("student is already enrolled"));
    }

    ctx.conn
        .execute(
            "INSERT INTO class_enrollments(class_id, student_id, created_at) VALUES(?, ?, ?)",
            (&class.id, &student.id, db::now_rfc3339()),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "class_enrollments" }))
        })?;
    info!(class_id = %class.id, student_id = %student.id, "student enrolled");
    Ok(json!({ "classId": class.id, "studentId": student.id }))
}

fn classes_unenroll(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let class_id = get_required_str(ctx.params, "classId")?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    let class = load_owned_class(ctx.conn, &actor, &class_id)?;

    let n = ctx
        .conn
        .execute(
            "DELETE FROM class_enrollments WHERE class_id = ? AND student_id = ?",
            (&class.id, &student_id),
        )
        .map_err(db_err("db_delete_failed"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("student is not enrolled in this class"));
    }
    info!(class_id = %class.id, student_id = %student_id, "student unenrolled");
    Ok(json!({ "classId": class.id, "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "classes.create" => classes_create,
        "classes.list" => classes_list,
        "classes.archive" => classes_archive,
        "classes.restore" => classes_restore,
        "classes.roster" => classes_roster,
        "classes.enroll" => classes_enroll,
        "classes.unenroll" => classes_unenroll,
        _ => return None,
    };
    Some(run(state, req, handler))
}
