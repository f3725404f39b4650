use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, LifecycleError};
use crate::notify::{self, Audience, EventType};
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

fn dispatch(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let live_class_id = get_required_str(params, "liveClassId")?;
    let event_raw = get_required_str(params, "type")?;
    let audience_raw = get_required_str(params, "recipients")?;
    let message = params.get("message").and_then(|v| v.as_str());

    let event = EventType::parse(&event_raw)
        .ok_or_else(|| bad_params(format!("unknown notification type: {}", event_raw)))?;
    let audience = Audience::parse(&audience_raw)
        .ok_or_else(|| bad_params(format!("unknown recipients selector: {}", audience_raw)))?;

    let row = lifecycle::load(conn, &live_class_id).map_err(|e| match e {
        LifecycleError::NotFound => HandlerErr {
            code: "not_found",
            message: "live class not found".to_string(),
        },
        other => HandlerErr {
            code: "db_query_failed",
            message: other.to_string(),
        },
    })?;

    let ctx = notify::SessionContext {
        live_class_id: &row.id,
        title: &row.title,
        teacher_id: &row.teacher_id,
        program_id: &row.program_id,
        level_id: &row.level_id,
        start_time: &row.start_time,
    };
    let now = chrono::Local::now().naive_local();
    let inserted = notify::notify(conn, &ctx, event, audience, message, now).map_err(|e| {
        HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
        }
    })?;

    Ok(json!({ "recipients": inserted }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let live_class_id = params.get("liveClassId").and_then(|v| v.as_str());

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "liveClassId": r.get::<_, String>(1)?,
            "eventType": r.get::<_, String>(2)?,
            "audience": r.get::<_, String>(3)?,
            "recipientId": r.get::<_, String>(4)?,
            "recipientRole": r.get::<_, String>(5)?,
            "message": r.get::<_, String>(6)?,
            "createdAt": r.get::<_, String>(7)?,
        }))
    };

    let rows = if let Some(id) = live_class_id {
        let mut stmt = conn
            .prepare(
                "SELECT id, live_class_id, event_type, audience, recipient_id,
                        recipient_role, message, created_at
                 FROM notifications WHERE live_class_id = ?
                 ORDER BY created_at, recipient_id",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
            })?;
        stmt.query_map([id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        let mut stmt = conn
            .prepare(
                "SELECT id, live_class_id, event_type, audience, recipient_id,
                        recipient_role, message, created_at
                 FROM notifications ORDER BY created_at, recipient_id",
            )
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
            })?;
        stmt.query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    }
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
    })?;

    Ok(json!({ "notifications": rows }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.liveClass" => Some(with_conn(state, req, dispatch)),
        "notifications.list" => Some(with_conn(state, req, list)),
        _ => None,
    }
}
