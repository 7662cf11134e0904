use crate::export::{self, ProgressRow, ReportRow};
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::assignments::{load_assignments, AssignmentFilter};
use crate::ipc::handlers::classes::load_owned_class;
use crate::ipc::helpers::{
    get_opt_str, get_required_str, get_str_list, load_actor, matches_search,
    require_managed_student, run, Actor, Ctx, Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;

struct ReportEntry {
    log_id: String,
    student_id: String,
    class_id: Option<String>,
    row: ReportRow,
}

/// Logs visible to the actor, narrowed by the request's filters.
fn report_entries(ctx: &Ctx, actor: &Actor) -> Result<Vec<ReportEntry>, HandlerErr> {
    let search = get_opt_str(ctx.params, "search");
    let status = get_opt_str(ctx.params, "status");
    if let Some(s) = status.as_deref() {
        if !matches!(s, "submitted" | "rejected") {
            return Err(HandlerErr::bad_params(
                "status must be one of: submitted, rejected",
            ));
        }
    }
    let class_id = get_opt_str(ctx.params, "classId");
    if let (Some(id), Role::Instructor) = (class_id.as_deref(), actor.role) {
        load_owned_class(ctx.conn, actor, id)?;
    }
    let student_ids = get_str_list(ctx.params, "studentIds")?;

    let (student_scope, instructor_scope) = match actor.role {
        Role::Admin => (None, None),
        Role::Instructor => (None, Some(actor.id.as_str())),
        Role::Student => (Some(actor.id.as_str()), None),
    };

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT
               l.id, l.student_id, l.class_id,
               p.full_name, p.email, s.name, c.name, cl.name,
               l.status, l.created_at, l.evaluator_name, l.evaluator_type
             FROM skill_logs l
             LEFT JOIN profiles p ON p.id = l.student_id
             LEFT JOIN skills s ON s.id = l.skill_id
             LEFT JOIN skill_categories c ON c.id = s.category_id
             LEFT JOIN classes cl ON cl.id = l.class_id
             WHERE (?1 IS NULL OR l.student_id = ?1)
               AND (?2 IS NULL OR p.affiliated_instructor = ?2)
               AND (?3 IS NULL OR l.class_id = ?3)
               AND (?4 IS NULL OR l.status = ?4)
             ORDER BY l.created_at DESC, l.id",
        )
        .map_err(db_err("db_query_failed"))?;
    let entries = stmt
        .query_map(
            (student_scope, instructor_scope, &class_id, &status),
            |r| {
                Ok(ReportEntry {
                    log_id: r.get(0)?,
                    student_id: r.get(1)?,
                    class_id: r.get(2)?,
                    row: ReportRow {
                        student_name: r.get(3)?,
                        student_email: r.get(4)?,
                        skill_name: r.get(5)?,
                        category_name: r.get(6)?,
                        class_name: r.get(7)?,
                        status: r.get(8)?,
                        created_at: r.get(9)?,
                        evaluator_name: r.get(10)?,
                        evaluator_type: r.get(11)?,
                    },
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    Ok(entries
        .into_iter()
        .filter(|e| student_ids.is_empty() || student_ids.contains(&e.student_id))
        .filter(|e| {
            matches_search(
                &[
                    e.row.student_name.as_deref().unwrap_or(""),
                    e.row.student_email.as_deref().unwrap_or(""),
                    e.row.skill_name.as_deref().unwrap_or(""),
                ],
                search.as_deref(),
            )
        })
        .collect())
}

fn out_path(params: &Value) -> Result<PathBuf, HandlerErr> {
    get_required_str(params, "outPath").map(PathBuf::from)
}

fn write_export(path: &Path, csv: &str) -> Result<(), HandlerErr> {
    export::write_text_file(path, csv).map_err(|e| {
        HandlerErr::new("io_failed", format!("{e:#}"))
            .with_details(json!({ "path": path.to_string_lossy() }))
    })
}

fn reports_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let entries = report_entries(ctx, &actor)?;
    let rows: Vec<Value> = entries
        .iter()
        .map(|e| {
            json!({
                "logId": e.log_id,
                "studentId": e.student_id,
                "classId": e.class_id,
                "studentName": e.row.student_name,
                "studentEmail": e.row.student_email,
                "skillName": e.row.skill_name,
                "categoryName": e.row.category_name,
                "className": e.row.class_name,
                "status": e.row.status,
                "createdAt": e.row.created_at,
                "evaluatorName": e.row.evaluator_name,
                "evaluatorType": e.row.evaluator_type,
            })
        })
        .collect();
    Ok(json!({ "rows": rows }))
}

fn reports_export_csv(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    let path = out_path(ctx.params)?;
    let entries = report_entries(ctx, &actor)?;
    let rows: Vec<ReportRow> = entries.into_iter().map(|e| e.row).collect();
    write_export(&path, &export::report_csv(&rows))?;
    info!(path = %path.to_string_lossy(), rows = rows.len(), "report exported");
    Ok(json!({ "path": path.to_string_lossy(), "rowsExported": rows.len() }))
}

fn reports_export_progress_csv(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require_any(&[Role::Instructor, Role::Admin], "export student progress")?;
    let path = out_path(ctx.params)?;
    let student_id = get_opt_str(ctx.params, "studentId");
    if let Some(id) = student_id.as_deref() {
        require_managed_student(ctx.conn, &actor, id)?;
    }
    let views = load_assignments(
        ctx.conn,
        &AssignmentFilter {
            student_id: student_id.as_deref(),
            instructor_id: match actor.role {
                Role::Admin => None,
                _ => Some(actor.id.as_str()),
            },
            skill_id: None,
        },
    )?;
    let rows: Vec<ProgressRow> = views
        .into_iter()
        .map(|v| ProgressRow {
            student_name: v.student_name,
            skill_name: v.skill_name,
            progress: v.progress,
        })
        .collect();
    write_export(&path, &export::progress_csv(&rows))?;
    info!(path = %path.to_string_lossy(), rows = rows.len(), "progress exported");
    Ok(json!({ "path": path.to_string_lossy(), "rowsExported": rows.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "reports.list" => reports_list,
        "reports.exportCsv" => reports_export_csv,
        "reports.exportProgressCsv" => reports_export_progress_csv,
        _ => return None,
    };
    Some(run(state, req, handler))
}
