use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_liveclassd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn liveclassd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("liveclass-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "roster.addTeacher",
        json!({ "teacherId": "t1", "name": "Ms. Mensah" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "roster.addStudent",
        json!({
            "studentId": "s1",
            "name": "Asha",
            "programId": "prog-1",
            "levelId": "lvl-1"
        }),
    );

    let created = request(
        &mut stdin,
        &mut reader,
        "5",
        "liveClasses.create",
        json!({
            "title": "Smoke Class",
            "scheduledDate": "2099-01-04",
            "startTime": "10:00",
            "endTime": "11:00",
            "subjectId": "sub-1",
            "levelId": "lvl-1",
            "programId": "prog-1",
            "teacherId": "t1",
            "meetingPlatform": "zoom"
        }),
    );
    let live_class_id = created
        .get("result")
        .and_then(|v| v.get("liveClassId"))
        .and_then(|v| v.as_str())
        .expect("liveClassId")
        .to_string();
    let password = created
        .get("result")
        .and_then(|v| v.get("meetingPassword"))
        .and_then(|v| v.as_str())
        .expect("meetingPassword");
    assert!(!password.is_empty());

    let _ = request(&mut stdin, &mut reader, "6", "liveClasses.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "liveClasses.list",
        json!({ "teacherId": "t1", "status": "scheduled" }),
    );
    let fetched = request(
        &mut stdin,
        &mut reader,
        "8",
        "liveClasses.get",
        json!({ "liveClassId": live_class_id }),
    );
    let embed = fetched
        .get("result")
        .and_then(|v| v.get("liveClass"))
        .and_then(|v| v.get("embedConfig"))
        .expect("embedConfig");
    assert!(embed.get("muteOnEntry").is_some());

    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "liveClasses.update",
        json!({
            "liveClassId": live_class_id,
            "patch": { "title": "Smoke Class (renamed)", "endTime": "11:30" }
        }),
    );
    let generated = request(
        &mut stdin,
        &mut reader,
        "10",
        "meetings.generate",
        json!({ "platform": "zoom" }),
    );
    let link = generated
        .get("result")
        .and_then(|v| v.get("link"))
        .and_then(|v| v.as_str())
        .expect("generated link");
    assert!(link.starts_with("https://zoom.us/j/"));

    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "notifications.liveClass",
        json!({
            "liveClassId": live_class_id,
            "type": "reminder_30min",
            "recipients": "both"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "notifications.list",
        json!({ "liveClassId": live_class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.event",
        json!({
            "liveClassId": live_class_id,
            "studentId": "s1",
            "event": "join"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "liveClasses.autoStatus",
        json!({}),
    );
    let cancelled = request(
        &mut stdin,
        &mut reader,
        "15",
        "liveClasses.updateStatus",
        json!({ "liveClassId": live_class_id, "status": "cancelled" }),
    );
    assert_eq!(
        cancelled
            .get("result")
            .and_then(|v| v.get("status"))
            .and_then(|v| v.as_str()),
        Some("cancelled")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
