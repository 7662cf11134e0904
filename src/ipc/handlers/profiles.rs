use crate::db;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, load_actor, load_optional_actor, load_profile_role,
    matches_search, run, unenroll_from_instructor, Actor, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const PROFILE_COLS: &str = "id, role, full_name, email, affiliated_instructor, instructor_code, created_at, updated_at";
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

fn profile_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "role": r.get::<_, String>(1)?,
        "fullName": r.get::<_, String>(2)?,
        "email": r.get::<_, String>(3)?,
        "affiliatedInstructor": r.get::<_, Option<String>>(4)?,
        "instructorCode": r.get::<_, Option<String>>(5)?,
        "createdAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, String>(7)?,
    }))
}

pub fn profile_json(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM profiles WHERE id = ?", PROFILE_COLS),
        [id],
        profile_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))
}

fn query_profiles(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map(args, profile_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn count_role(conn: &Connection, role: Role) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM profiles WHERE role = ?",
        [role.as_str()],
        |r| r.get(0),
    )
    .map_err(db_err("db_query_failed"))
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// A fresh instructor code not yet present in the store.
fn new_instructor_code(conn: &Connection) -> Result<String, HandlerErr> {
    for _ in 0..16 {
        let code = random_code();
        let taken = conn
            .query_row(
                "SELECT 1 FROM profiles WHERE instructor_code = ?",
                [&code],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err("db_query_failed"))?
            .is_some();
        if !taken {
            return Ok(code);
        }
    }
    Err(HandlerErr::conflict("could not allocate a unique instructor code"))
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("role must be one of: student, instructor, admin")
    })
}

fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(HandlerErr::bad_params("email is not valid")),
    }
}

fn profiles_create(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let full_name = get_required_str(ctx.params, "fullName")?;
    let email = normalize_email(&get_required_str(ctx.params, "email")?)?;
    let role = match get_opt_str(ctx.params, "role") {
        Some(r) => parse_role(&r)?,
        None => Role::Student,
    };
    let actor = load_optional_actor(ctx)?;

    if role != Role::Student {
        let bootstrap = role == Role::Admin && count_role(ctx.conn, Role::Admin)? == 0;
        if !bootstrap {
            match &actor {
                Some(a) => a.require(Role::Admin, "create instructor or admin accounts")?,
                None => {
                    return Err(HandlerErr::new(
                        "unauthorized",
                        "an admin must create instructor or admin accounts",
                    ))
                }
            }
        }
    }

    let taken = ctx
        .conn
        .query_row("SELECT 1 FROM profiles WHERE email = ?", [&email], |_| Ok(()))
        .optional()
        .map_err(db_err("db_query_failed"))?
        .is_some();
    if taken {
        return Err(HandlerErr::conflict("a profile with this email already exists"));
    }

    let code = match role {
        Role::Instructor => Some(new_instructor_code(ctx.conn)?),
        _ => None,
    };
    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    ctx.conn
        .execute(
            "INSERT INTO profiles(id, role, full_name, email, affiliated_instructor, instructor_code, created_at, updated_at)
             VALUES(?, ?, ?, ?, NULL, ?, ?, ?)",
            (&id, role.as_str(), &full_name, &email, &code, &now, &now),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "profiles" }))
        })?;
    info!(profile_id = %id, role = role.as_str(), "profile created");

    let profile = profile_json(ctx.conn, &id)?
        .ok_or_else(|| HandlerErr::not_found("profile not found"))?;
    Ok(json!({ "profile": profile }))
}

fn can_view(actor: &Actor, target: &Actor) -> bool {
    actor.role == Role::Admin
        || actor.id == target.id
        || target.role == Role::Instructor
        || (actor.role == Role::Instructor
            && target.affiliated_instructor.as_deref() == Some(actor.id.as_str()))
}

fn profiles_get(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let target_id = get_opt_str(ctx.params, "profileId").unwrap_or_else(|| actor.id.clone());
    let target = load_profile_role(ctx.conn, &target_id)?
        .ok_or_else(|| HandlerErr::not_found("profile not found"))?;
    if !can_view(&actor, &target) {
        return Err(HandlerErr::forbidden("not allowed to view this profile"));
    }
    let profile = profile_json(ctx.conn, &target_id)?
        .ok_or_else(|| HandlerErr::not_found("profile not found"))?;
    Ok(json!({ "profile": profile }))
}

fn profiles_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "list all profiles")?;
    let search = get_opt_str(ctx.params, "search");
    let rows = match get_opt_str(ctx.params, "role") {
        Some(r) => {
            let role = parse_role(&r)?;
            query_profiles(
                ctx.conn,
                &format!(
                    "SELECT {} FROM profiles WHERE role = ? ORDER BY full_name, email",
                    PROFILE_COLS
                ),
                &[&role.as_str()],
            )?
        }
        None => query_profiles(
            ctx.conn,
            &format!("SELECT {} FROM profiles ORDER BY full_name, email", PROFILE_COLS),
            &[],
        )?,
    };
    let profiles: Vec<Value> = rows
        .into_iter()
        .filter(|p| {
            matches_search(
                &[
                    p["fullName"].as_str().unwrap_or(""),
                    p["email"].as_str().unwrap_or(""),
                ],
                search.as_deref(),
            )
        })
        .collect();
    Ok(json!({ "profiles": profiles }))
}

fn profiles_update(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let profile_id = get_required_str(ctx.params, "profileId")?;
    let Some(patch) = ctx.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    let target = load_profile_role(ctx.conn, &profile_id)?
        .ok_or_else(|| HandlerErr::not_found("profile not found"))?;

    if actor.role != Role::Admin {
        if actor.id != target.id {
            return Err(HandlerErr::forbidden("only admins may edit other profiles"));
        }
        if patch.keys().any(|k| k != "fullName") {
            return Err(HandlerErr::forbidden("only admins may change roles or affiliations"));
        }
    }

    let full_name = match patch.get("fullName") {
        None | Some(Value::Null) => target.full_name.clone(),
        Some(v) => v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params("patch.fullName must be a non-empty string"))?,
    };
    let role = match patch.get("role") {
        None | Some(Value::Null) => target.role,
        Some(v) => parse_role(v.as_str().unwrap_or(""))?,
    };
    let mut affiliated = match patch.get("affiliatedInstructor") {
        None => target.affiliated_instructor.clone(),
        Some(Value::Null) => None,
        Some(v) => {
            let id = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("patch.affiliatedInstructor must be a string"))?;
            let instructor = load_profile_role(ctx.conn, id)?
                .filter(|p| p.role == Role::Instructor)
                .ok_or_else(|| HandlerErr::not_found("instructor not found"))?;
            Some(instructor.id)
        }
    };
    if role != Role::Student {
        affiliated = None;
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE profiles SET full_name = ?, role = ?, affiliated_instructor = ?, updated_at = ? WHERE id = ?",
        (&full_name, role.as_str(), &affiliated, db::now_rfc3339(), &profile_id),
    )
    .map_err(db_err("db_update_failed"))?;

    if role == Role::Instructor {
        let has_code: Option<String> = tx
            .query_row(
                "SELECT instructor_code FROM profiles WHERE id = ?",
                [&profile_id],
                |r| r.get(0),
            )
            .map_err(db_err("db_query_failed"))?;
        if has_code.is_none() {
            let code = new_instructor_code(&tx)?;
            tx.execute(
                "UPDATE profiles SET instructor_code = ? WHERE id = ?",
                (&code, &profile_id),
            )
            .map_err(db_err("db_update_failed"))?;
        }
    }
    if target.role == Role::Student && role != Role::Student {
        tx.execute(
            "DELETE FROM class_enrollments WHERE student_id = ?",
            [&profile_id],
        )
        .map_err(db_err("db_delete_failed"))?;
    }
    if target.role == Role::Student && role == Role::Student {
        if let Some(prev) = target.affiliated_instructor.as_deref() {
            if affiliated.as_deref() != Some(prev) {
                unenroll_from_instructor(&tx, &profile_id, prev)?;
            }
        }
    }
    if target.role == Role::Instructor && role != Role::Instructor {
        tx.execute(
            "DELETE FROM class_enrollments
             WHERE class_id IN (SELECT id FROM classes WHERE instructor_id = ?)",
            [&profile_id],
        )
        .map_err(db_err("db_delete_failed"))?;
        tx.execute(
            "UPDATE profiles SET affiliated_instructor = NULL WHERE affiliated_instructor = ?",
            [&profile_id],
        )
        .map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    let profile = profile_json(ctx.conn, &profile_id)?
        .ok_or_else(|| HandlerErr::not_found("profile not found"))?;
    Ok(json!({ "profile": profile }))
}

fn instructors_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, full_name, email, instructor_code FROM profiles
             WHERE role = 'instructor' ORDER BY full_name, email",
        )
        .map_err(db_err("db_query_failed"))?;
    let show_code = actor.role == Role::Admin;
    let instructors = stmt
        .query_map([], |r| {
            let code: Option<String> = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "fullName": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "instructorCode": if show_code { code } else { None },
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "instructors": instructors }))
}

fn students_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "list students")?;
    let search = get_opt_str(ctx.params, "search");
    let rows = if actor.role == Role::Admin {
        query_profiles(
            ctx.conn,
            &format!(
                "SELECT {} FROM profiles WHERE role = 'student' ORDER BY full_name, email",
                PROFILE_COLS
            ),
            &[],
        )?
    } else {
        query_profiles(
            ctx.conn,
            &format!(
                "SELECT {} FROM profiles WHERE role = 'student' AND affiliated_instructor = ?
                 ORDER BY full_name, email",
                PROFILE_COLS
            ),
            &[&actor.id],
        )?
    };
    let students: Vec<Value> = rows
        .into_iter()
        .filter(|p| {
            matches_search(
                &[
                    p["fullName"].as_str().unwrap_or(""),
                    p["email"].as_str().unwrap_or(""),
                ],
                search.as_deref(),
            )
        })
        .collect();
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "profiles.create" => profiles_create,
        "profiles.get" => profiles_get,
        "profiles.list" => profiles_list,
        "profiles.update" => profiles_update,
        "instructors.list" => instructors_list,
        "students.list" => students_list,
        _ => return None,
    };
    Some(run(state, req, handler))
}
