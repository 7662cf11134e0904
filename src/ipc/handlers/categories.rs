use crate::ipc::error::{db_err, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str, load_actor, run, Ctx, Handler, Role};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

struct SubcategoryInput {
    name: String,
    description: String,
}

fn parse_subcategories(params: &Value) -> Result<Vec<SubcategoryInput>, HandlerErr> {
    let items = match params.get("subcategories") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(HandlerErr::bad_params("subcategories must be a list")),
    };
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        // Plain strings are accepted as name-only entries.
        let (name, description) = match item {
            Value::String(s) => (s.trim().to_string(), String::new()),
            Value::Object(_) => (
                get_opt_str(item, "name").unwrap_or_default(),
                get_opt_str(item, "description").unwrap_or_default(),
            ),
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "subcategories[{}] must be a name or an object",
                    i
                )))
            }
        };
        if name.is_empty() {
            return Err(HandlerErr::bad_params(format!(
                "subcategories[{}].name must not be empty",
                i
            )));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(HandlerErr::bad_params(format!(
                "duplicate subcategory: {}",
                name
            )));
        }
        out.push(SubcategoryInput { name, description });
    }
    Ok(out)
}

fn subcategories_of(conn: &Connection, category_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, description FROM skill_subcategories
             WHERE category_id = ? ORDER BY name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([category_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(rows)
}

fn categories_create(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let actor = load_actor(ctx)?;
    actor.require(Role::Admin, "create skill categories")?;
    let name = get_required_str(ctx.params, "name")?;
    let description = get_opt_str(ctx.params, "description").unwrap_or_default();
    let subcategories = parse_subcategories(ctx.params)?;

    let taken: i64 = ctx
        .conn
        .query_row(
            "SELECT COUNT(*) FROM skill_categories WHERE lower(name) = lower(?)",
            [&name],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    if taken > 0 {
        return Err(HandlerErr::conflict("a category with this name already exists"));
    }

    let id = Uuid::new_v4().to_string();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO skill_categories(id, name, description) VALUES(?, ?, ?)",
        (&id, &name, &description),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "skill_categories" }))
    })?;
    for sub in &subcategories {
        tx.execute(
            "INSERT INTO skill_subcategories(id, category_id, name, description) VALUES(?, ?, ?, ?)",
            (Uuid::new_v4().to_string(), &id, &sub.name, &sub.description),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "skill_subcategories" }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    info!(category_id = %id, subcategories = subcategories.len(), "category created");

    Ok(json!({
        "category": {
            "id": id,
            "name": name,
            "description": description,
            "subcategories": subcategories_of(ctx.conn, &id)?,
        }
    }))
}

fn categories_list(ctx: &Ctx) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT c.id, c.name, c.description,
               (SELECT COUNT(*) FROM skills s WHERE s.category_id = c.id) AS skill_count
             FROM skill_categories c
             ORDER BY c.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut categories = Vec::with_capacity(rows.len());
    for (id, name, description, skill_count) in rows {
        let subcategories = subcategories_of(ctx.conn, &id)?;
        categories.push(json!({
            "id": id,
            "name": name,
            "description": description,
            "skillCount": skill_count,
            "subcategories": subcategories,
        }));
    }
    Ok(json!({ "categories": categories }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let handler: Handler = match req.method.as_str() {
        "categories.create" => categories_create,
        "categories.list" => categories_list,
        _ => return None,
    };
    Some(run(state, req, handler))
}
