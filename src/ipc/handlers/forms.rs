//! Store-less form and CSV tooling. These methods work before a workspace is
//! selected so the editor can preview a form while it is being built.

use crate::forms::{FormError, FormSchema};
use crate::import;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_str, respond};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

/// Wire error for a form engine failure; issues travel in `details`.
pub fn form_err(e: FormError) -> HandlerErr {
    let code = match e {
        FormError::Malformed(_) => "bad_params",
        _ => "validation_failed",
    };
    let issues = serde_json::to_value(e.issues()).unwrap_or(Value::Null);
    HandlerErr::new(code, e.to_string()).with_details(json!({ "issues": issues }))
}

fn schema_param(params: &Value) -> Result<FormSchema, HandlerErr> {
    let Some(raw) = params.get("formSchema") else {
        return Err(HandlerErr::bad_params("missing formSchema"));
    };
    FormSchema::from_value(raw).map_err(form_err)
}

fn validate_schema(params: &Value) -> Result<Value, HandlerErr> {
    let mut schema = schema_param(params)?;
    schema.normalize();
    match schema.validate() {
        Ok(()) => Ok(json!({ "valid": true, "issues": [], "formSchema": schema.to_value() })),
        Err(e) => Ok(json!({
            "valid": false,
            "issues": e.issues(),
            "formSchema": schema.to_value(),
        })),
    }
}

fn render(params: &Value) -> Result<Value, HandlerErr> {
    let mut schema = schema_param(params)?;
    schema.normalize();
    schema.validate().map_err(form_err)?;
    Ok(json!({ "fields": schema.render() }))
}

fn validate_responses(params: &Value) -> Result<Value, HandlerErr> {
    let mut schema = schema_param(params)?;
    schema.normalize();
    let responses = match params.get("responses") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => return Err(HandlerErr::bad_params("responses must be an object")),
    };
    match schema.validate_responses(&responses) {
        Ok(()) => Ok(json!({ "valid": true, "issues": [] })),
        Err(e @ FormError::Malformed(_)) => Err(form_err(e)),
        Err(e) => Ok(json!({
            "valid": false,
            "message": e.to_string(),
            "issues": e.issues(),
        })),
    }
}

fn import_questions_csv(params: &Value) -> Result<Value, HandlerErr> {
    let csv = get_required_str(params, "csv")?;
    let questions = import::import_questions(&csv)
        .map_err(|e| HandlerErr::new("import_failed", e.to_string()))?;
    Ok(json!({ "count": questions.len(), "questions": questions }))
}

fn sample_template() -> Result<Value, HandlerErr> {
    Ok(json!({
        "fileName": "skill_questions_template.csv",
        "csv": import::sample_template(),
    }))
}

pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<Value> {
    let res = match req.method.as_str() {
        "forms.validateSchema" => validate_schema(&req.params),
        "forms.render" => render(&req.params),
        "forms.validateResponses" => validate_responses(&req.params),
        "import.questionsCsv" => import_questions_csv(&req.params),
        "import.sampleTemplate" => sample_template(),
        _ => return None,
    };
    Some(respond(req, res))
}
