use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, LifecycleError, LiveClassRow, NewLiveClass, SchedulePatch, Status};
use crate::meeting::{self, Platform};
use crate::schedule;
use chrono::NaiveDateTime;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<LifecycleError> for HandlerErr {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Validation(m) => HandlerErr {
                code: "invalid_transition",
                message: m,
                details: None,
            },
            LifecycleError::WindowRejected(m) => HandlerErr {
                code: "start_rejected",
                message: m,
                details: None,
            },
            LifecycleError::NotFound => HandlerErr {
                code: "not_found",
                message: "live class not found".to_string(),
                details: None,
            },
            LifecycleError::Store(e) => HandlerErr {
                code: "db_write_failed",
                message: e.to_string(),
                details: None,
            },
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn row_to_json(row: &LiveClassRow, now: NaiveDateTime) -> serde_json::Value {
    let mut out = json!({
        "id": row.id,
        "title": row.title,
        "description": row.description,
        "scheduledDate": row.scheduled_date,
        "startTime": row.start_time,
        "endTime": row.end_time,
        "status": row.status.as_str(),
        "meetingPlatform": row.meeting_platform,
        "meetingLink": row.meeting_link,
        "startedAt": row.started_at,
        "endedAt": row.ended_at,
        "preClassBuffer": row.pre_class_buffer,
        "maxParticipants": row.max_participants,
        "recordingEnabled": row.recording_enabled,
        "waitingRoomEnabled": row.waiting_room_enabled,
        "teacherId": row.teacher_id,
        "subjectId": row.subject_id,
        "levelId": row.level_id,
        "programId": row.program_id,
        "paperId": row.paper_id,
        "createdAt": row.created_at,
    });
    // Display hints derived from raw times. These deliberately ignore the
    // stored status; the two can disagree until the next sweep reconciles
    // them, and the UI shows the hint while the status column stays the
    // source of truth for transitions.
    if let Some(date) = row.date() {
        let (s, e) = (row.start_min(), row.end_min());
        out["displayStatus"] = json!(schedule::derived_status(date, s, e, now).as_str());
        out["startTimeMessage"] = json!(schedule::start_time_message(date, s, e, now));
        out["timeUntilClass"] = json!(schedule::time_until_class(date, s, e, now));
    }
    out
}

fn parse_new_live_class(params: &serde_json::Value) -> Result<NewLiveClass, HandlerErr> {
    Ok(NewLiveClass {
        title: get_required_str(params, "title")?,
        description: get_opt_str(params, "description"),
        scheduled_date: get_required_str(params, "scheduledDate")?,
        start_time: get_required_str(params, "startTime")?,
        end_time: get_required_str(params, "endTime")?,
        subject_id: get_required_str(params, "subjectId")?,
        level_id: get_required_str(params, "levelId")?,
        program_id: get_required_str(params, "programId")?,
        teacher_id: get_required_str(params, "teacherId")?,
        paper_id: get_opt_str(params, "paperId"),
        meeting_platform: get_opt_str(params, "meetingPlatform"),
        meeting_link: get_opt_str(params, "meetingLink"),
        pre_class_buffer: params.get("preClassBuffer").and_then(|v| v.as_i64()),
        max_participants: params.get("maxParticipants").and_then(|v| v.as_i64()),
        recording_enabled: params.get("recordingEnabled").and_then(|v| v.as_bool()),
        waiting_room_enabled: params.get("waitingRoomEnabled").and_then(|v| v.as_bool()),
    })
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let new = parse_new_live_class(params)?;
    let created = lifecycle::create_live_class(conn, &new, now_local(), &mut rand::thread_rng())
        .map_err(|e| match e {
            // Creation problems are caller input problems, not transitions.
            LifecycleError::Validation(m) => HandlerErr::bad_params(m),
            other => HandlerErr::from(other),
        })?;
    Ok(json!({
        "liveClassId": created.id,
        "status": "scheduled",
        "meetingPlatform": created.meeting_platform,
        "meetingPassword": created.meeting_password,
    }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(teacher_id) = get_opt_str(params, "teacherId") {
        clauses.push("teacher_id = ?");
        binds.push(Value::Text(teacher_id));
    }
    if let Some(subject_id) = get_opt_str(params, "subjectId") {
        clauses.push("subject_id = ?");
        binds.push(Value::Text(subject_id));
    }
    if let Some(status) = get_opt_str(params, "status") {
        if Status::parse(&status).is_none() {
            return Err(HandlerErr::bad_params(format!(
                "unknown status filter: {}",
                status
            )));
        }
        clauses.push("status = ?");
        binds.push(Value::Text(status));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM live_classes{} ORDER BY scheduled_date, start_time",
        lifecycle::ROW_COLUMNS,
        where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds), lifecycle::row_from)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    let now = now_local();
    let out: Vec<serde_json::Value> = rows.iter().map(|r| row_to_json(r, now)).collect();
    Ok(json!({ "liveClasses": out }))
}

fn get_one(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "liveClassId")?;
    let row = lifecycle::load(conn, &id)?;
    let mut out = row_to_json(&row, now_local());
    let platform = Platform::parse(&row.meeting_platform);
    out["embedConfig"] =
        serde_json::to_value(meeting::embed_defaults(platform)).unwrap_or(json!({}));
    Ok(json!({ "liveClass": out }))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "liveClassId")?;
    let patch_params = params.get("patch").cloned().unwrap_or(json!({}));
    let patch = SchedulePatch {
        title: get_opt_str(&patch_params, "title"),
        description: get_opt_str(&patch_params, "description"),
        scheduled_date: get_opt_str(&patch_params, "scheduledDate"),
        start_time: get_opt_str(&patch_params, "startTime"),
        end_time: get_opt_str(&patch_params, "endTime"),
        meeting_platform: get_opt_str(&patch_params, "meetingPlatform"),
        pre_class_buffer: patch_params.get("preClassBuffer").and_then(|v| v.as_i64()),
        max_participants: patch_params.get("maxParticipants").and_then(|v| v.as_i64()),
        recording_enabled: patch_params.get("recordingEnabled").and_then(|v| v.as_bool()),
        waiting_room_enabled: patch_params
            .get("waitingRoomEnabled")
            .and_then(|v| v.as_bool()),
    };
    lifecycle::update_schedule(conn, &id, &patch)?;
    let row = lifecycle::load(conn, &id)?;
    Ok(json!({ "liveClass": row_to_json(&row, now_local()) }))
}

fn update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "liveClassId")?;
    let target = get_required_str(params, "status")?;
    let actor_is_admin = params
        .get("actorIsAdmin")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let now = now_local();

    match target.as_str() {
        "ongoing" => {
            let outcome =
                lifecycle::request_start(conn, &id, actor_is_admin, now, &mut rand::thread_rng())?;
            Ok(json!({
                "status": "ongoing",
                "already": outcome.already,
                "startedAt": outcome.started_at,
                "meetingLink": outcome.meeting_link,
            }))
        }
        "completed" => {
            let outcome = lifecycle::request_complete(conn, &id, now)?;
            Ok(json!({
                "status": "completed",
                "already": outcome.already,
                "endedAt": outcome.ended_at,
                "termination": outcome
                    .termination
                    .map(|t| serde_json::to_value(t).unwrap_or(json!(null))),
            }))
        }
        "cancelled" => {
            let outcome = lifecycle::request_cancel(conn, &id)?;
            Ok(json!({ "status": "cancelled", "already": outcome.already }))
        }
        other => Err(HandlerErr::bad_params(format!(
            "unsupported target status: {}",
            other
        ))),
    }
}

fn auto_status(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let report = lifecycle::sweep(conn, now_local(), &mut rand::thread_rng());
    Ok(json!({
        "started": report.started,
        "ended": report.ended,
        "reminders": report.reminders,
        "errors": report.errors,
    }))
}

fn generate_meeting(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let platform = Platform::parse(&get_required_str(params, "platform")?);
    let generated = meeting::generate(platform, &mut rand::thread_rng());
    Ok(json!({
        "link": generated.link,
        "platform": generated.platform,
        "passcode": generated.passcode,
        "embedConfig": serde_json::to_value(generated.embed).unwrap_or(json!({})),
    }))
}

fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
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
        "liveClasses.create" => Some(with_conn(state, req, create)),
        "liveClasses.list" => Some(with_conn(state, req, list)),
        "liveClasses.get" => Some(with_conn(state, req, get_one)),
        "liveClasses.update" => Some(with_conn(state, req, update)),
        "liveClasses.updateStatus" => Some(with_conn(state, req, update_status)),
        "liveClasses.autoStatus" => Some(with_conn(state, req, |conn, _| auto_status(conn))),
        "meetings.generate" => {
            let resp = match generate_meeting(&req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            };
            Some(resp)
        }
        _ => None,
    }
}
