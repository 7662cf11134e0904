use crate::db;
use crate::forms::FormSchema;
use crate::import;
use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::handlers::forms::form_err;
use crate::ipc::helpers::{
    exists, get_opt_bool, get_opt_str, get_required_str, get_str_list, load_actor, matches_search, run, Ctx,
    Handler, Role,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

pub const VERIFICATION_TYPES: [&str; 2] = ["peer", "instructor"];

const SKILL_SELECT: &str = "SELECT
       s.id, s.name, s.description, s.category_id, c.name,
       s.subcategory_id, sc.name, s.verification_type, s.form_schema,
       s.is_template, s.template_id, s.created_at, s.updated_at
     FROM skills s
     LEFT JOIN skill_categories c ON c.id = s.category_id
     LEFT JOIN skill_subcategories sc ON sc.id = s.subcategory_id";

/// The parts of a skill other handlers need.
pub struct SkillRecord {
    pub id: String,
    pub name: String,
    pub verification_type: String,
    pub schema: FormSchema,
    pub is_template: bool,
}

fn parse_stored_schema(raw: Option<String>) -> Result<FormSchema, HandlerErr> {
    let Some(raw) = raw else {
        return Ok(FormSchema::default());
    };
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("stored form schema: {}", e)))?;
    FormSchema::from_value(&value)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("stored form schema: {}", e)))
}

pub fn load_skill(conn: &Connection, skill_id: &str) -> Result<SkillRecord, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, name, verification_type, form_schema, is_template
             FROM skills WHERE id = ?",
            [skill_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((id, name, verification_type, raw, is_template)) = row else {
        return Err(HandlerErr::not_found("skill not found"));
    };
    Ok(SkillRecord {
        id,
        name,
        verification_type,
        schema: parse_stored_schema(raw)?,
        is_template: is_template != 0,
    })
}

fn skill_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(Value, Option<String>)> {
    let raw: Option<String> = r.get(8)?;
    let v = json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "description": r.get::<_, String>(2)?,
        "categoryId": r.get::<_, String>(3)?,
        "categoryName": r.get::<_, Option<String>>(4)?,
        "subcategoryId": r.get::<_, Option<String>>(5)?,
        "subcategoryName": r.get::<_, Option<String>>(6)?,
        "verificationType": r.get::<_, String>(7)?,
        "isTemplate": r.get::<_, i64>(9)? != 0,
        "templateId": r.get::<_, Option<String>>(10)?,
        "createdAt": r.get::<_, String>(11)?,
        "updatedAt": r.get::<_, String>(12)?,
    });
    Ok((v, raw))
}

fn skill_json(conn: &Connection, skill_id: &str, with_fields: bool) -> Result<Value, HandlerErr> {
    let row = conn
        .query_row(&format!("{} WHERE s.id = ?", SKILL_SELECT), [skill_id], skill_row)
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((mut v, raw)) = row else {
        return Err(HandlerErr::not_found("skill not found"));
    };
    let schema = parse_stored_schema(raw)?;
    if with_fields {
        v["fields"] = serde_json::to_value(schema.render()).unwrap_or(Value::Null);
    }
    v["formSchema"] = schema.to_value();
    Ok(v)
}

fn parse_verification_type(raw: Option<String>) -> Result<Option<String>, HandlerErr> {
    match raw {
        None => Ok(None),
        Some(v) if VERIFICATION_TYPES.contains(&v.as_str()) => Ok(Some(v)),
        Some(_) => Err(HandlerErr::bad_params(
            "verificationType must be one of: peer, instructor",
        )),
    }
}

/// Normalized, validated schema from a client value.
fn schema_from_client(raw: Option<&Value>) -> Result<FormSchema, HandlerErr> {
    let mut schema = match raw {
        None => FormSchema::default(),
        Some(v) => FormSchema::from_value(v).map_err(form_err)?,
    };
    schema.normalize();
    schema.validate().map_err(form_err)?;
    Ok(schema)
}

fn schema_text(schema: &FormSchema) -> Result<String, HandlerErr> {
    serde_json::to_string(schema).map_err(|e| HandlerErr::new("bad_params", e.to_string()))
}

fn check_category(
    conn: &Connection,
    category_id: &str,
    subcategory_id: Option<&str>,
) -> Result<(), HandlerErr> {
    if !exists(conn, "SELECT 1 FROM skill_categories WHERE id = ?", category_id)? {
        return Err(HandlerErr::not_found("category not found"));
    }
    if let Some(sub) = subcategory_id {
        let owner: Option<String> = conn
            .query_row(
                "SELECT category_id FROM skill_subcategories WHERE id = ?",
                [sub],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("db_query_failed"))?;
        match owner {
            None => return Err(HandlerErr::not_found("subcategory not found")),
            Some(c) if c != category_id => {
                return Err(HandlerErr::bad_params(
                    "subcategory does not belong to the category",
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn skills_create(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "create skill templates")?;
    let name = get_required_str(ctx.params, "name")?;
    let description = get_opt_str(ctx.params, "description").unwrap_or_default();
    let category_id = get_required_str(ctx.params, "categoryId")?;
    let subcategory_id = get_opt_str(ctx.params, "subcategoryId");
    let verification_type = parse_verification_type(get_opt_str(ctx.params, "verificationType"))?
        .unwrap_or_else(|| "peer".to_string());
    let schema = schema_from_client(ctx.params.get("formSchema"))?;
    check_category(ctx.conn, &category_id, subcategory_id.as_deref())?;

    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    ctx.conn
        .execute(
            "INSERT INTO skills(id, name, description, category_id, subcategory_id,
               verification_type, form_schema, is_template, template_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)",
            (
                &id,
                &name,
                &description,
                &category_id,
                &subcategory_id,
                &verification_type,
                schema_text(&schema)?,
                &now,
                &now,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "skills" }))
        })?;
    info!(skill_id = %id, questions = schema.questions.len(), "skill created");

    Ok(json!({ "skill": skill_json(ctx.conn, &id, false)? }))
}

fn skills_update(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "edit skills")?;
    let skill_id = get_required_str(ctx.params, "skillId")?;
    let Some(patch) = ctx.params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };

    let current = ctx
        .conn
        .query_row(
            "SELECT name, description, category_id, subcategory_id, verification_type
             FROM skills WHERE id = ?",
            [&skill_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((name, description, category_id, subcategory_id, verification_type)) = current else {
        return Err(HandlerErr::not_found("skill not found"));
    };

    let name = match patch.get("name") {
        Some(_) => get_required_str(patch, "name")?,
        None => name,
    };
    let description = match patch.get("description") {
        Some(_) => get_opt_str(patch, "description").unwrap_or_default(),
        None => description,
    };
    let category_changed = patch.get("categoryId").is_some();
    let category_id = match patch.get("categoryId") {
        Some(_) => get_required_str(patch, "categoryId")?,
        None => category_id,
    };
    let subcategory_id = match patch.get("subcategoryId") {
        Some(_) => get_opt_str(patch, "subcategoryId"),
        None if category_changed => None,
        None => subcategory_id,
    };
    let verification_type = parse_verification_type(get_opt_str(patch, "verificationType"))?
        .unwrap_or(verification_type);
    check_category(ctx.conn, &category_id, subcategory_id.as_deref())?;

    let schema = match patch.get("formSchema") {
        Some(v) => Some(schema_from_client(Some(v))?),
        None => None,
    };

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE skills SET name = ?, description = ?, category_id = ?, subcategory_id = ?,
           verification_type = ?, updated_at = ?
         WHERE id = ?",
        (
            &name,
            &description,
            &category_id,
            &subcategory_id,
            &verification_type,
            db::now_rfc3339(),
            &skill_id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    if let Some(schema) = &schema {
        tx.execute(
            "UPDATE skills SET form_schema = ? WHERE id = ?",
            (schema_text(schema)?, &skill_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({ "skill": skill_json(ctx.conn, &skill_id, false)? }))
}

fn skills_delete(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "delete skills")?;
    let skill_id = get_required_str(ctx.params, "skillId")?;
    if !exists(ctx.conn, "SELECT 1 FROM skills WHERE id = ?", &skill_id)? {
        return Err(HandlerErr::not_found("skill not found"));
    }

    let (assignments, derived): (i64, i64) = ctx
        .conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM skill_assignments WHERE skill_id = ?1),
               (SELECT COUNT(*) FROM skills WHERE template_id = ?1)",
            [&skill_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err("db_query_failed"))?;
    if assignments > 0 {
        return Err(HandlerErr::conflict("skill has assignments")
            .with_details(json!({ "assignments": assignments })));
    }
    if derived > 0 {
        return Err(HandlerErr::conflict("skill has instances created from it")
            .with_details(json!({ "instances": derived })));
    }

    ctx.conn
        .execute("DELETE FROM skills WHERE id = ?", [&skill_id])
        .map_err(db_err("db_delete_failed"))?;
    info!(skill_id = %skill_id, "skill deleted");
    Ok(json!({ "ok": true }))
}

fn skills_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let templates_only = get_opt_bool(ctx.params, "templatesOnly")?.unwrap_or(false);
    let category_id = get_opt_str(ctx.params, "categoryId");
    let search = get_opt_str(ctx.params, "search");

    let sql = format!(
        "{} WHERE (?1 = 0 OR s.is_template = 1) AND (?2 IS NULL OR s.category_id = ?2)
         ORDER BY c.name, s.name",
        SKILL_SELECT
    );
    let mut stmt = ctx.conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((templates_only, &category_id), skill_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut skills = Vec::with_capacity(rows.len());
    for (mut v, raw) in rows {
        let keep = matches_search(
            &[
                v["name"].as_str().unwrap_or(""),
                v["description"].as_str().unwrap_or(""),
                v["categoryName"].as_str().unwrap_or(""),
            ],
            search.as_deref(),
        );
        if !keep {
            continue;
        }
        v["questionCount"] = json!(parse_stored_schema(raw)?.questions.len());
        skills.push(v);
    }
    Ok(json!({ "skills": skills }))
}

fn skills_get(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let skill_id = get_required_str(ctx.params, "skillId")?;
    Ok(json!({ "skill": skill_json(ctx.conn, &skill_id, true)? }))
}

fn skills_import_questions(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "edit skills")?;
    let skill_id = get_required_str(ctx.params, "skillId")?;
    let csv = get_required_str(ctx.params, "csv")?;
    let mut skill = load_skill(ctx.conn, &skill_id)?;

    let imported = import::import_questions(&csv)
        .map_err(|e| HandlerErr::new("import_failed", e.to_string()))?;
    let count = imported.len();
    skill.schema.append(imported);
    skill.schema.normalize();
    skill.schema.validate().map_err(form_err)?;

    ctx.conn
        .execute(
            "UPDATE skills SET form_schema = ?, updated_at = ? WHERE id = ?",
            (schema_text(&skill.schema)?, db::now_rfc3339(), &skill.id),
        )
        .map_err(db_err("db_update_failed"))?;
    info!(skill_id = %skill.id, imported = count, "questions imported");

    Ok(json!({
        "imported": count,
        "skill": skill_json(ctx.conn, &skill.id, false)?,
    }))
}

fn skills_instantiate(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "create skills")?;
    let template_id = get_required_str(ctx.params, "templateId")?;
    let template = load_skill(ctx.conn, &template_id)?;
    if !template.is_template {
        return Err(HandlerErr::bad_params("skill is not a template"));
    }
    let name = get_opt_str(ctx.params, "name").unwrap_or_else(|| template.name.clone());

    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    ctx.conn
        .execute(
            "INSERT INTO skills(id, name, description, category_id, subcategory_id,
               verification_type, form_schema, is_template, template_id, created_at, updated_at)
             SELECT ?, ?, description, category_id, subcategory_id,
               verification_type, form_schema, 0, id, ?, ?
             FROM skills WHERE id = ?",
            (&id, &name, &now, &now, &template.id),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "skills" }))
        })?;
    info!(skill_id = %id, template_id = %template.id, "skill instantiated");

    Ok(json!({ "skill": skill_json(ctx.conn, &id, false)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "skills.create" => skills_create,
        "skills.update" => skills_update,
        "skills.delete" => skills_delete,
        "skills.list" => skills_list,
        "skills.get" => skills_get,
        "skills.importQuestions" => skills_import_questions,
        "skills.instantiate" => skills_instantiate,
        _ => return None,
    };
    Some(run(state, req, handler))
}

/// Skill ids named by `key`, each checked to exist.
pub fn existing_skill_ids(
    conn: &Connection,
    params: &Value,
    key: &str,
) -> Result<Vec<String>, HandlerErr> {
    let ids = get_str_list(params, key)?;
    for id in &ids {
        if !exists(conn, "SELECT 1 FROM skills WHERE id = ?", id)? {
            return Err(HandlerErr::not_found(format!("skill not found: {}", id)));
        }
    }
    Ok(ids)
}
