use crate::config::DaemonConfig;
use crate::ipc::error::{db_err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

/// What a store-backed handler gets to work with.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub config: &'a DaemonConfig,
    pub params: &'a Value,
}

pub type Handler = fn(&Ctx) -> Result<Value, HandlerErr>;

/// Runs a store-backed handler and renders its outcome.
pub fn run(state: &AppState, req: &Request, handler: Handler) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return respond(
            req,
            Err(HandlerErr::new("no_workspace", "select a workspace first")),
        );
    };
    let ctx = Ctx {
        conn,
        config: &state.config,
        params: &req.params,
    };
    respond(req, handler(&ctx))
}

pub fn respond(req: &Request, res: Result<Value, HandlerErr>) -> Value {
    match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            warn!(method = %req.method, id = %req.id, code = e.code, message = %e.message, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_opt_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_str_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        HandlerErr::bad_params(format!("{} must be a list of ids", key))
                    })
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a list", key))),
    }
}

/// `YYYY-MM-DD`, or `None` when absent.
pub fn get_opt_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = get_opt_str(params, key) else {
        return Ok(None);
    };
    chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Self::Student),
            "instructor" => Some(Self::Instructor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Instructor => "instructor",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    pub full_name: String,
    pub affiliated_instructor: Option<String>,
}

impl Actor {
    pub fn require(&self, role: Role, action: &str) -> Result<(), HandlerErr> {
        self.require_any(&[role], action)
    }

    pub fn require_any(&self, roles: &[Role], action: &str) -> Result<(), HandlerErr> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            Err(HandlerErr::forbidden(format!(
                "a {} may not {}",
                self.role.as_str(),
                action
            )))
        }
    }
}

pub fn load_profile_role(conn: &Connection, id: &str) -> Result<Option<Actor>, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, role, full_name, affiliated_instructor FROM profiles WHERE id = ?",
            [id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((id, role, full_name, affiliated_instructor)) = row else {
        return Ok(None);
    };
    let role = Role::parse(&role).ok_or_else(|| {
        HandlerErr::new("db_query_failed", format!("profile {} has unknown role {}", id, role))
    })?;
    Ok(Some(Actor {
        id,
        role,
        full_name,
        affiliated_instructor,
    }))
}

/// The profile named by `params.actorId`. Identity is trusted, not verified.
pub fn load_actor(ctx: &Ctx) -> Result<Actor, HandlerErr> {
    let Some(actor_id) = get_opt_str(ctx.params, "actorId") else {
        return Err(HandlerErr::new("unauthorized", "missing actorId"));
    };
    load_profile_role(ctx.conn, &actor_id)?
        .ok_or_else(|| HandlerErr::new("unauthorized", "unknown actor"))
}

pub fn load_optional_actor(ctx: &Ctx) -> Result<Option<Actor>, HandlerErr> {
    match get_opt_str(ctx.params, "actorId") {
        Some(_) => load_actor(ctx).map(Some),
        None => Ok(None),
    }
}

/// A student the actor may manage: admins reach everyone, instructors their
/// affiliated students.
pub fn require_managed_student(
    conn: &Connection,
    actor: &Actor,
    student_id: &str,
) -> Result<Actor, HandlerErr> {
    let student = load_profile_role(conn, student_id)?
        .filter(|p| p.role == Role::Student)
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    match actor.role {
        Role::Admin => Ok(student),
        Role::Instructor if student.affiliated_instructor.as_deref() == Some(actor.id.as_str()) => {
            Ok(student)
        }
        Role::Instructor => Err(HandlerErr::forbidden(
            "student is not affiliated with this instructor",
        )),
        Role::Student if student.id == actor.id => Ok(student),
        Role::Student => Err(HandlerErr::forbidden("students may only access their own records")),
    }
}

/// Target student for "mine or theirs" reads: defaults to the actor when the
/// actor is a student.
pub fn resolve_student_target(ctx: &Ctx, actor: &Actor) -> Result<Actor, HandlerErr> {
    match get_opt_str(ctx.params, "studentId") {
        Some(id) => require_managed_student(ctx.conn, actor, &id),
        None if actor.role == Role::Student => Ok(actor.clone()),
        None => Err(HandlerErr::bad_params("missing studentId")),
    }
}

/// Drops a student's enrollments in one instructor's classes.
pub fn unenroll_from_instructor(
    conn: &Connection,
    student_id: &str,
    instructor_id: &str,
) -> Result<usize, HandlerErr> {
    conn.execute(
        "DELETE FROM class_enrollments
         WHERE student_id = ?
           AND class_id IN (SELECT id FROM classes WHERE instructor_id = ?)",
        (student_id, instructor_id),
    )
    .map_err(db_err("db_delete_failed"))
}

pub fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |_| Ok(()))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err("db_query_failed"))
}

/// Case-insensitive "contains" used for search boxes.
pub fn matches_search(haystacks: &[&str], needle: Option<&str>) -> bool {
    let Some(needle) = needle else {
        return true;
    };
    let needle = needle.to_lowercase();
    haystacks.iter().any(|h| h.to_lowercase().contains(&needle))
}
