use serde_json::json;

mod test_support;

use test_support::{
    error_code, request_err, request_ok, seed_people, seed_skill, select_workspace, spawn_sidecar,
    str_at, temp_dir,
};

#[test]
fn categories_and_skills_are_admin_managed() {
    let workspace = temp_dir("skilltrack-skills-admin");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let people = seed_people(&mut stdin, &mut reader);

    let err = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "categories.create",
        json!({ "actorId": people.instructor, "name": "Airway" }),
    );
    assert_eq!(error_code(&err), "forbidden");

    let category = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "categories.create",
        json!({
            "actorId": people.admin,
            "name": "Airway",
            "subcategories": ["Basic", { "name": "Advanced", "description": "ALS" }]
        }),
    );
    let category_id = str_at(&category, "/category/id").to_string();
    assert_eq!(
        category["category"]["subcategories"]
            .as_array()
            .map(|a| a.len()),
        Some(2)
    );

    let err = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "categories.create",
        json!({ "actorId": people.admin, "name": "airway" }),
    );
    assert_eq!(error_code(&err), "conflict");

    let err = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "skills.create",
        json!({
            "actorId": people.admin,
            "name": "Bad form",
            "categoryId": category_id,
            "formSchema": { "questions": [
                { "id": "x", "question_text": "Pick", "response_type": "multiple_choice" }
            ] }
        }),
    );
    assert_eq!(error_code(&err), "validation_failed");
    assert_eq!(
        err["details"]["issues"][0]["code"].as_str(),
        Some("missing_options")
    );

    let skill = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "skills.create",
        json!({
            "actorId": people.admin,
            "name": "Bag-valve mask",
            "categoryId": category_id,
            "verificationType": "instructor"
        }),
    );
    assert_eq!(str_at(&skill, "/skill/verificationType"), "instructor");
    assert_eq!(skill["skill"]["isTemplate"].as_bool(), Some(true));
    let skill_id = str_at(&skill, "/skill/id").to_string();

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "skills.update",
        json!({
            "actorId": people.admin,
            "skillId": skill_id,
            "patch": { "description": "Two-person technique" }
        }),
    );
    assert_eq!(
        str_at(&updated, "/skill/description"),
        "Two-person technique"
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "skills.list",
        json!({ "search": "valve" }),
    );
    assert_eq!(listed["skills"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(listed["skills"][0]["questionCount"].as_u64(), Some(0));

    let categories = request_ok(&mut stdin, &mut reader, "8", "categories.list", json!({}));
    assert_eq!(categories["categories"][0]["skillCount"].as_i64(), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn imported_questions_are_appended_to_the_form() {
    let workspace = temp_dir("skilltrack-skills-import");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let people = seed_people(&mut stdin, &mut reader);
    let skill_id = seed_skill(&mut stdin, &mut reader, &people.admin, "IV insertion");

    let csv = "questiontype,questiontext,required,option1,option2\n\
               Select all,Which sites?,yes,Arm,Hand\n";
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "skills.importQuestions",
        json!({ "actorId": people.admin, "skillId": skill_id, "csv": csv }),
    );
    assert_eq!(res["imported"].as_u64(), Some(1));

    let skill = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "skills.get",
        json!({ "skillId": skill_id }),
    );
    let fields = skill["skill"]["fields"].as_array().expect("fields");
    assert_eq!(fields.len(), 3);
    assert_eq!(fields[0]["questionId"].as_str(), Some("q1"));
    assert_eq!(fields[2]["control"].as_str(), Some("checkbox_group"));
    assert_eq!(fields[2]["options"], json!(["Arm", "Hand"]));
    assert_eq!(
        skill["skill"]["formSchema"]["questions"][2]["order_index"].as_i64(),
        Some(2)
    );

    let err = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "skills.importQuestions",
        json!({ "actorId": people.admin, "skillId": skill_id, "csv": "Foo\nbar\n" }),
    );
    assert_eq!(error_code(&err), "import_failed");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn instances_copy_templates_and_delete_is_guarded() {
    let workspace = temp_dir("skilltrack-skills-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let people = seed_people(&mut stdin, &mut reader);
    let template_id = seed_skill(&mut stdin, &mut reader, &people.admin, "Suturing");

    let instance = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "skills.instantiate",
        json!({ "actorId": people.admin, "templateId": template_id, "name": "Suturing (Spring)" }),
    );
    let instance_id = str_at(&instance, "/skill/id").to_string();
    assert_eq!(instance["skill"]["isTemplate"].as_bool(), Some(false));
    assert_eq!(
        instance["skill"]["templateId"].as_str(),
        Some(template_id.as_str())
    );
    assert_eq!(
        instance["skill"]["formSchema"]["questions"]
            .as_array()
            .map(|a| a.len()),
        Some(2)
    );

    let templates = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "skills.list",
        json!({ "templatesOnly": true }),
    );
    assert_eq!(templates["skills"].as_array().map(|a| a.len()), Some(1));

    let err = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "skills.delete",
        json!({ "actorId": people.admin, "skillId": template_id }),
    );
    assert_eq!(error_code(&err), "conflict");

    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({
            "actorId": people.instructor,
            "skillIds": [instance_id],
            "studentIds": [people.student]
        }),
    );
    let err = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "skills.delete",
        json!({ "actorId": people.admin, "skillId": instance_id }),
    );
    assert_eq!(error_code(&err), "conflict");

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.delete",
        json!({
            "actorId": people.instructor,
            "skillId": instance_id,
            "studentId": people.student
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "skills.delete",
        json!({ "actorId": people.admin, "skillId": instance_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "skills.delete",
        json!({ "actorId": people.admin, "skillId": template_id }),
    );
    let err = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "skills.get",
        json!({ "skillId": template_id }),
    );
    assert_eq!(error_code(&err), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
