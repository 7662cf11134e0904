use crate::retry::{self, RetryError, RetryPolicy, STORE_BUSY_ERRORS};
use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DB_FILE: &str = "skilltrack.sqlite3";

pub fn open_db(workspace: &Path, policy: &RetryPolicy) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!("failed to create workspace {}", workspace.to_string_lossy())
    })?;
    let db_path = workspace.join(DB_FILE);
    let policy = policy.clone().with_patterns(STORE_BUSY_ERRORS);

    let conn = retry::retry_operation(&policy, |_| open_and_migrate(&db_path)).map_err(
        |e| match e {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => {
                last.context(format!("store still busy after {} attempts", attempts))
            }
        },
    )?;
    info!(path = %db_path.to_string_lossy(), "store opened");
    Ok(conn)
}

fn open_and_migrate(db_path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_millis(250))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            affiliated_instructor TEXT,
            instructor_code TEXT UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(affiliated_instructor) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profiles_role ON profiles(role)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profiles_instructor ON profiles(affiliated_instructor)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS affiliation_requests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            instructor_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES profiles(id),
            FOREIGN KEY(instructor_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_affiliation_requests_instructor ON affiliation_requests(instructor_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_categories(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_subcategories(
            id TEXT PRIMARY KEY,
            category_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(category_id) REFERENCES skill_categories(id),
            UNIQUE(category_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skills(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            category_id TEXT NOT NULL,
            subcategory_id TEXT,
            verification_type TEXT NOT NULL DEFAULT 'peer',
            form_schema TEXT,
            is_template INTEGER NOT NULL DEFAULT 1,
            template_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(category_id) REFERENCES skill_categories(id),
            FOREIGN KEY(subcategory_id) REFERENCES skill_subcategories(id),
            FOREIGN KEY(template_id) REFERENCES skills(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skills_category ON skills(category_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            instructor_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(instructor_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_instructor ON classes(instructor_id, archived)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_enrollments_student ON class_enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_assignments(
            id TEXT PRIMARY KEY,
            skill_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            required_submissions INTEGER NOT NULL DEFAULT 1,
            due_date TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            FOREIGN KEY(skill_id) REFERENCES skills(id),
            FOREIGN KEY(student_id) REFERENCES profiles(id),
            UNIQUE(skill_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_assignments_student ON skill_assignments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_logs(
            id TEXT PRIMARY KEY,
            skill_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            assignment_id TEXT NOT NULL,
            class_id TEXT,
            responses TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'submitted',
            attempt_number INTEGER NOT NULL,
            evaluator_name TEXT NOT NULL,
            evaluator_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(skill_id) REFERENCES skills(id),
            FOREIGN KEY(student_id) REFERENCES profiles(id),
            FOREIGN KEY(assignment_id) REFERENCES skill_assignments(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_column(&conn, "skill_logs", "instructor_signature", "TEXT")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_logs_student ON skill_logs(student_id, skill_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skill_logs_assignment ON skill_logs(assignment_id)",
        [],
    )?;

    Ok(conn)
}

/// Additive migration for columns introduced after a store was first created.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
        [],
    )?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn today() -> chrono::NaiveDate {
    chrono::Utc::now().date_naive()
}
