use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_add_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let email = req.params.get("email").and_then(|v| v.as_str());

    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name, email) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
        (&teacher_id, &name, email),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id, "name": name }))
}

fn handle_add_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let program_id = match req.params.get("programId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing programId", None),
    };
    let level_id = match req.params.get("levelId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing levelId", None),
    };
    let student_id = req
        .params
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, program_id, level_id) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           program_id = excluded.program_id,
           level_id = excluded.level_id",
        (&student_id, &name, &program_id, &level_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roster.addTeacher" => Some(handle_add_teacher(state, req)),
        "roster.addStudent" => Some(handle_add_student(state, req)),
        _ => None,
    }
}
