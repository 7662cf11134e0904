use serde_json::json;

mod test_support;

use test_support::{
    error_code, request_err, request_ok, seed_people, select_workspace, spawn_sidecar, str_at,
    temp_dir,
};

#[test]
fn only_the_first_admin_may_self_register() {
    let workspace = temp_dir("skilltrack-profiles-bootstrap");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "profiles.create",
        json!({ "fullName": "First Admin", "email": "First@Example.edu", "role": "admin" }),
    );
    assert_eq!(str_at(&admin, "/profile/email"), "first@example.edu");
    let admin_id = str_at(&admin, "/profile/id").to_string();

    let err = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "profiles.create",
        json!({ "fullName": "Second", "email": "second@example.edu", "role": "admin" }),
    );
    assert_eq!(error_code(&err), "unauthorized");

    let err = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "profiles.create",
        json!({ "fullName": "Dup", "email": "first@example.edu" }),
    );
    assert_eq!(error_code(&err), "conflict");

    let instructor = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "profiles.create",
        json!({
            "actorId": admin_id,
            "fullName": "Teach",
            "email": "teach@example.edu",
            "role": "instructor"
        }),
    );
    let code = str_at(&instructor, "/profile/instructorCode");
    assert_eq!(code.len(), 8);
    assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "profiles.list",
        json!({ "actorId": admin_id, "role": "instructor" }),
    );
    assert_eq!(listed["profiles"].as_array().map(|a| a.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn affiliation_requests_flow_through_the_instructor() {
    let workspace = temp_dir("skilltrack-affiliations");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let people = seed_people(&mut stdin, &mut reader);

    let sam = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "profiles.get",
        json!({ "actorId": people.student }),
    );
    assert_eq!(
        sam["profile"]["affiliatedInstructor"].as_str(),
        Some(people.instructor.as_str())
    );

    let err = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "affiliations.request",
        json!({ "actorId": people.loner, "instructorCode": "ZZZZZZZZ" }),
    );
    assert_eq!(error_code(&err), "not_found");
    assert_eq!(err["message"].as_str(), Some("Invalid instructor code"));

    let lowered = people.instructor_code.to_lowercase();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "affiliations.request",
        json!({ "actorId": people.loner, "instructorCode": lowered }),
    );
    let err = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "affiliations.request",
        json!({ "actorId": people.loner, "instructorCode": people.instructor_code }),
    );
    assert_eq!(error_code(&err), "conflict");

    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "affiliations.list",
        json!({ "actorId": people.instructor }),
    );
    let requests = pending["requests"].as_array().expect("requests");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["studentName"].as_str(), Some("Lee Loner"));
    let request_id = requests[0]["id"].as_str().expect("id").to_string();

    let err = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "affiliations.resolve",
        json!({ "actorId": people.student, "requestId": request_id, "approve": true }),
    );
    assert_eq!(error_code(&err), "forbidden");

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "affiliations.resolve",
        json!({ "actorId": people.instructor, "requestId": request_id, "approve": false }),
    );
    assert_eq!(str_at(&resolved, "/request/status"), "rejected");

    let err = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "affiliations.resolve",
        json!({ "actorId": people.instructor, "requestId": request_id, "approve": true }),
    );
    assert_eq!(error_code(&err), "conflict");

    let students = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "actorId": people.instructor }),
    );
    let ids: Vec<&str> = students["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["id"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(ids, vec![people.student.as_str()]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn removing_an_affiliation_drops_class_enrollments() {
    let workspace = temp_dir("skilltrack-affiliation-remove");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let people = seed_people(&mut stdin, &mut reader);

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({
            "actorId": people.instructor,
            "name": "Lab A",
            "startDate": "2025-01-06",
            "endDate": "2025-05-30"
        }),
    );
    let class_id = str_at(&class, "/class/id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.enroll",
        json!({ "actorId": people.instructor, "classId": class_id, "studentId": people.student }),
    );

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "affiliations.remove",
        json!({ "actorId": people.instructor, "studentId": people.student }),
    );
    assert_eq!(removed["removedEnrollments"].as_u64(), Some(1));

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.roster",
        json!({ "actorId": people.instructor, "classId": class_id }),
    );
    assert_eq!(roster["enrolled"], json!([]));
    assert_eq!(roster["available"], json!([]));

    let err = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "profiles.get",
        json!({ "actorId": people.instructor, "profileId": people.student }),
    );
    assert_eq!(error_code(&err), "forbidden");

    let err = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "profiles.update",
        json!({
            "actorId": people.student,
            "profileId": people.student,
            "patch": { "role": "admin" }
        }),
    );
    assert_eq!(error_code(&err), "forbidden");

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "profiles.update",
        json!({
            "actorId": people.student,
            "profileId": people.student,
            "patch": { "fullName": "Samantha Student" }
        }),
    );
    assert_eq!(str_at(&renamed, "/profile/fullName"), "Samantha Student");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reassigning_or_demoting_drops_stale_enrollments() {
    let workspace = temp_dir("skilltrack-reaffiliate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let people = seed_people(&mut stdin, &mut reader);

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "profiles.create",
        json!({
            "actorId": people.admin,
            "fullName": "Olga Other",
            "email": "olga@example.edu",
            "role": "instructor"
        }),
    );
    let other = str_at(&other, "/profile/id").to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({
            "actorId": people.instructor,
            "name": "Lab A",
            "startDate": "2025-01-06",
            "endDate": "2025-05-30"
        }),
    );
    let class_id = str_at(&class, "/class/id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.enroll",
        json!({ "actorId": people.instructor, "classId": class_id, "studentId": people.student }),
    );

    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "profiles.update",
        json!({
            "actorId": people.admin,
            "profileId": people.student,
            "patch": { "affiliatedInstructor": other }
        }),
    );
    assert_eq!(str_at(&moved, "/profile/affiliatedInstructor"), other);

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.roster",
        json!({ "actorId": people.instructor, "classId": class_id }),
    );
    assert_eq!(roster["enrolled"], json!([]));

    // Back to the first instructor, re-enroll, then demote that instructor.
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "profiles.update",
        json!({
            "actorId": people.admin,
            "profileId": people.student,
            "patch": { "affiliatedInstructor": people.instructor }
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.enroll",
        json!({ "actorId": people.instructor, "classId": class_id, "studentId": people.student }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "profiles.update",
        json!({
            "actorId": people.admin,
            "profileId": people.instructor,
            "patch": { "role": "student" }
        }),
    );
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.roster",
        json!({ "actorId": people.admin, "classId": class_id }),
    );
    assert_eq!(roster["enrolled"], json!([]));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "profiles.get",
        json!({ "actorId": people.admin, "profileId": people.student }),
    );
    assert!(student["profile"]["affiliatedInstructor"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
