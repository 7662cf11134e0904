#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_with(None)
}

pub fn spawn_sidecar_with_config(config: &Path) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_with(Some(config))
}

fn spawn_with(config: Option<&Path>) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_skilltrackd");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("SKILLTRACKD_CONFIG")
        .env("SKILLTRACKD_LOG", "warn");
    if let Some(path) = config {
        cmd.env("SKILLTRACKD_CONFIG", path);
    }
    let mut child = cmd.spawn().expect("spawn skilltrackd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn read_response(reader: &mut BufReader<ChildStdout>) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Sends a request expected to fail and returns its `error` object.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

pub fn error_code(error: &Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn str_at<'a>(v: &'a Value, pointer: &str) -> &'a str {
    v.pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, v))
}

/// An admin, an instructor with one affiliated student, and one
/// unaffiliated student.
pub struct People {
    pub admin: String,
    pub instructor: String,
    pub instructor_code: String,
    pub student: String,
    pub loner: String,
}

pub fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

pub fn seed_people(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> People {
    let admin = request_ok(
        stdin,
        reader,
        "seed-admin",
        "profiles.create",
        json!({ "fullName": "Ada Admin", "email": "admin@example.edu", "role": "admin" }),
    );
    let admin = str_at(&admin, "/profile/id").to_string();

    let instructor = request_ok(
        stdin,
        reader,
        "seed-instructor",
        "profiles.create",
        json!({
            "actorId": admin,
            "fullName": "Ivan Instructor",
            "email": "ivan@example.edu",
            "role": "instructor"
        }),
    );
    let instructor_code = str_at(&instructor, "/profile/instructorCode").to_string();
    let instructor = str_at(&instructor, "/profile/id").to_string();

    let student = request_ok(
        stdin,
        reader,
        "seed-student",
        "profiles.create",
        json!({ "fullName": "Sam Student", "email": "sam@example.edu" }),
    );
    let student = str_at(&student, "/profile/id").to_string();

    let loner = request_ok(
        stdin,
        reader,
        "seed-loner",
        "profiles.create",
        json!({ "fullName": "Lee Loner", "email": "lee@example.edu" }),
    );
    let loner = str_at(&loner, "/profile/id").to_string();

    let req = request_ok(
        stdin,
        reader,
        "seed-aff",
        "affiliations.request",
        json!({ "actorId": student, "instructorCode": instructor_code }),
    );
    request_ok(
        stdin,
        reader,
        "seed-approve",
        "affiliations.resolve",
        json!({
            "actorId": instructor,
            "requestId": str_at(&req, "/request/id"),
            "approve": true
        }),
    );

    People {
        admin,
        instructor,
        instructor_code,
        student,
        loner,
    }
}

/// A category plus one template skill whose form has a required text
/// question `q1` and an optional checkbox `q2`.
pub fn seed_skill(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    name: &str,
) -> String {
    let category = request_ok(
        stdin,
        reader,
        &format!("seed-cat-{}", name),
        "categories.create",
        json!({ "actorId": admin, "name": format!("{} category", name) }),
    );
    let skill = request_ok(
        stdin,
        reader,
        &format!("seed-skill-{}", name),
        "skills.create",
        json!({
            "actorId": admin,
            "name": name,
            "categoryId": str_at(&category, "/category/id"),
            "formSchema": {
                "questions": [
                    {
                        "id": "q1",
                        "question_text": "Describe the procedure",
                        "response_type": "text",
                        "is_required": true,
                        "order_index": 0
                    },
                    {
                        "id": "q2",
                        "question_text": "Supervised?",
                        "response_type": "checkbox",
                        "is_required": false,
                        "order_index": 1
                    }
                ]
            }
        }),
    );
    str_at(&skill, "/skill/id").to_string()
}
