use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, LifecycleError};
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

/// Participation upsert keyed by (live_class_id, student_id). The first join
/// timestamp wins; the latest leave wins. Deployments that never provisioned
/// the attendance table get a soft success instead of an error, since
/// participation tracking is optional.
fn record_event(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let table_present = db::table_exists(conn, "attendance_events").map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
    })?;
    if !table_present {
        return Ok(json!({ "tracked": false }));
    }

    let live_class_id = get_required_str(params, "liveClassId")?;
    let student_id = get_required_str(params, "studentId")?;
    let event = get_required_str(params, "event")?;
    let technical_data = params
        .get("technicalData")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string());
    let timestamp = params
        .get("timestamp")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            chrono::Local::now()
                .naive_local()
                .format("%Y-%m-%dT%H:%M:%S")
                .to_string()
        });

    if let Err(e) = lifecycle::load(conn, &live_class_id) {
        return Err(match e {
            LifecycleError::NotFound => HandlerErr {
                code: "not_found",
                message: "live class not found".to_string(),
            },
            other => HandlerErr {
                code: "db_query_failed",
                message: other.to_string(),
            },
        });
    }

    let result = match event.as_str() {
        "join" => conn.execute(
            "INSERT INTO attendance_events(
                live_class_id, student_id, joined_at, technical_data, updated_at
             ) VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(live_class_id, student_id) DO UPDATE SET
               joined_at = COALESCE(attendance_events.joined_at, excluded.joined_at),
               technical_data = COALESCE(excluded.technical_data, attendance_events.technical_data),
               updated_at = excluded.updated_at",
            (
                &live_class_id,
                &student_id,
                &timestamp,
                technical_data.as_deref(),
                &timestamp,
            ),
        ),
        "leave" => conn.execute(
            "INSERT INTO attendance_events(
                live_class_id, student_id, left_at, technical_data, updated_at
             ) VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(live_class_id, student_id) DO UPDATE SET
               left_at = excluded.left_at,
               technical_data = COALESCE(excluded.technical_data, attendance_events.technical_data),
               updated_at = excluded.updated_at",
            (
                &live_class_id,
                &student_id,
                &timestamp,
                technical_data.as_deref(),
                &timestamp,
            ),
        ),
        other => return Err(bad_params(format!("event must be join or leave, got {}", other))),
    };

    if let Err(e) = result {
        return Err(HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
        });
    }

    Ok(json!({ "tracked": true }))
}

fn handle_event(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match record_event(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.event" => Some(handle_event(state, req)),
        _ => None,
    }
}
