use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Text,
    Number,
    Checkbox,
    MultipleChoice,
    SelectMultiple,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Checkbox => "checkbox",
            Self::MultipleChoice => "multiple_choice",
            Self::SelectMultiple => "select_multiple",
        }
    }

    /// Choice types carry an options list; the others never do.
    pub fn is_choice(self) -> bool {
        matches!(self, Self::MultipleChoice | Self::SelectMultiple)
    }

    /// Input control a UI should draw for this type.
    pub fn control(self) -> &'static str {
        match self {
            Self::Text => "text_input",
            Self::Number => "number_input",
            Self::Checkbox => "checkbox",
            Self::MultipleChoice => "radio_group",
            Self::SelectMultiple => "checkbox_group",
        }
    }
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(default)]
    pub question_text: String,
    pub response_type: ResponseType,
    #[serde(default = "default_required")]
    pub is_required: bool,
    #[serde(default)]
    pub order_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl Question {
    fn options(&self) -> &[String] {
        self.options.as_deref().unwrap_or(&[])
    }
}

/// Verification form attached to a skill. Persisted as JSON in `skills.form_schema`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormSchema {
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    pub code: &'static str,
    pub message: String,
}

impl FormIssue {
    fn new(question_id: Option<&str>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            question_id: question_id.map(|s| s.to_string()),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormError {
    #[error("form schema is malformed: {0}")]
    Malformed(String),
    #[error("form schema has {} problem(s)", .0.len())]
    InvalidSchema(Vec<FormIssue>),
    #[error("Please fill in all required fields")]
    MissingRequired(Vec<FormIssue>),
    #[error("responses have {} problem(s)", .0.len())]
    InvalidResponses(Vec<FormIssue>),
}

impl FormError {
    pub fn issues(&self) -> &[FormIssue] {
        match self {
            Self::Malformed(_) => &[],
            Self::InvalidSchema(v) | Self::MissingRequired(v) | Self::InvalidResponses(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub question_id: String,
    pub label: String,
    pub response_type: ResponseType,
    pub control: &'static str,
    pub required: bool,
    pub options: Vec<String>,
}

impl FormSchema {
    /// Accepts a stored `form_schema` value; `null` is an empty form.
    pub fn from_value(value: &Value) -> Result<Self, FormError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(|e| FormError::Malformed(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Puts questions in `order_index` order and renumbers them densely.
    pub fn normalize(&mut self) {
        self.questions.sort_by_key(|q| q.order_index);
        for (i, q) in self.questions.iter_mut().enumerate() {
            q.order_index = i as i64;
            q.question_text = q.question_text.trim().to_string();
            if q.response_type.is_choice() {
                let opts = q
                    .options
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|o| o.trim().to_string())
                    .collect::<Vec<_>>();
                q.options = Some(opts);
            } else {
                q.options = None;
            }
        }
    }

    /// Appends questions after the existing ones, keeping their relative order.
    pub fn append(&mut self, questions: Vec<Question>) {
        let base = self
            .questions
            .iter()
            .map(|q| q.order_index + 1)
            .max()
            .unwrap_or(0);
        for (i, mut q) in questions.into_iter().enumerate() {
            q.order_index = base + i as i64;
            self.questions.push(q);
        }
    }

    pub fn validate(&self) -> Result<(), FormError> {
        let mut issues = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for q in &self.questions {
            let qid = Some(q.id.as_str());
            if q.id.trim().is_empty() {
                issues.push(FormIssue::new(None, "missing_id", "question id must not be empty"));
            } else if !seen.insert(q.id.as_str()) {
                issues.push(FormIssue::new(
                    qid,
                    "duplicate_id",
                    format!("question id {} appears more than once", q.id),
                ));
            }
            if q.question_text.trim().is_empty() {
                issues.push(FormIssue::new(qid, "missing_text", "question text must not be empty"));
            }
            if q.response_type.is_choice() {
                let opts = q.options();
                if opts.is_empty() {
                    issues.push(FormIssue::new(
                        qid,
                        "missing_options",
                        format!("{} questions need at least one option", q.response_type.as_str()),
                    ));
                }
                if opts.iter().any(|o| o.trim().is_empty()) {
                    issues.push(FormIssue::new(qid, "blank_option", "options must not be blank"));
                }
                let mut distinct: HashSet<&str> = HashSet::new();
                if opts.iter().any(|o| !distinct.insert(o.trim())) {
                    issues.push(FormIssue::new(qid, "duplicate_option", "options must be distinct"));
                }
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(FormError::InvalidSchema(issues))
        }
    }

    pub fn render(&self) -> Vec<FieldDescriptor> {
        let mut ordered: Vec<&Question> = self.questions.iter().collect();
        ordered.sort_by_key(|q| q.order_index);
        ordered
            .into_iter()
            .map(|q| FieldDescriptor {
                question_id: q.id.clone(),
                label: q.question_text.clone(),
                response_type: q.response_type,
                control: q.response_type.control(),
                required: q.is_required,
                options: q.options().to_vec(),
            })
            .collect()
    }

    /// Checks a response map keyed by question id. Missing required answers are
    /// reported ahead of type problems so the caller can show a single prompt.
    pub fn validate_responses(&self, responses: &Map<String, Value>) -> Result<(), FormError> {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();

        for q in &self.questions {
            let answer = responses.get(&q.id).filter(|v| is_present(v));
            let Some(answer) = answer else {
                if q.is_required {
                    missing.push(FormIssue::new(
                        Some(&q.id),
                        "required",
                        format!("{} is required", q.question_text),
                    ));
                }
                continue;
            };
            if let Err(message) = check_answer(q, answer) {
                invalid.push(FormIssue::new(Some(&q.id), "bad_response", message));
            }
        }

        let known: HashSet<&str> = self.questions.iter().map(|q| q.id.as_str()).collect();
        for key in responses.keys() {
            if !known.contains(key.as_str()) {
                invalid.push(FormIssue::new(
                    Some(key),
                    "unknown_question",
                    "response does not match any question",
                ));
            }
        }

        if !missing.is_empty() {
            return Err(FormError::MissingRequired(missing));
        }
        if !invalid.is_empty() {
            return Err(FormError::InvalidResponses(invalid));
        }
        Ok(())
    }
}

fn is_present(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    }
}

fn check_answer(q: &Question, answer: &Value) -> Result<(), String> {
    match q.response_type {
        ResponseType::Text => match answer {
            Value::String(_) => Ok(()),
            _ => Err("expected text".into()),
        },
        ResponseType::Number => match answer {
            Value::Number(_) => Ok(()),
            Value::String(s) if s.trim().parse::<f64>().is_ok() => Ok(()),
            _ => Err("expected a number".into()),
        },
        ResponseType::Checkbox => match answer {
            Value::Bool(_) => Ok(()),
            _ => Err("expected true or false".into()),
        },
        ResponseType::MultipleChoice => {
            let Some(choice) = answer.as_str() else {
                return Err("expected one option".into());
            };
            if q.options().iter().any(|o| o == choice) {
                Ok(())
            } else {
                Err(format!("{} is not one of the options", choice))
            }
        }
        ResponseType::SelectMultiple => {
            let Some(items) = answer.as_array() else {
                return Err("expected a list of options".into());
            };
            let mut seen: HashSet<&str> = HashSet::new();
            for item in items {
                let Some(choice) = item.as_str() else {
                    return Err("expected a list of options".into());
                };
                if !q.options().iter().any(|o| o == choice) {
                    return Err(format!("{} is not one of the options", choice));
                }
                if !seen.insert(choice) {
                    return Err(format!("{} selected more than once", choice));
                }
            }
            Ok(())
        }
    }
}
