use chrono::Timelike;
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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Start one minute ago (clamped inside today), end at the last minute of
/// the day, so the sweep observes an in-window scheduled class.
fn open_window() -> (String, String, String) {
    let now = chrono::Local::now().naive_local();
    let date = now.date().format("%Y-%m-%d").to_string();
    let mins = (now.time().hour() * 60 + now.time().minute()).saturating_sub(1);
    let start = mins.min(23 * 60 + 57);
    (
        date,
        format!("{:02}:{:02}", start / 60, start % 60),
        "23:59".to_string(),
    )
}

fn tomorrow() -> String {
    (chrono::Local::now().date_naive() + chrono::Duration::days(1))
        .format("%Y-%m-%d")
        .to_string()
}

#[test]
fn sweep_starts_due_classes_once_and_settles() {
    let workspace = temp_dir("liveclass-sweep");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roster.addStudent",
        json!({
            "studentId": "s1",
            "name": "Asha",
            "programId": "prog-1",
            "levelId": "lvl-1"
        }),
    );

    let (date, start, end) = open_window();
    let due = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "liveClasses.create",
        json!({
            "title": "Due Now",
            "scheduledDate": date,
            "startTime": start,
            "endTime": end,
            "subjectId": "sub-1",
            "levelId": "lvl-1",
            "programId": "prog-1",
            "teacherId": "t1"
        }),
    );
    let due_id = due
        .get("liveClassId")
        .and_then(|v| v.as_str())
        .expect("liveClassId")
        .to_string();
    // A class tomorrow is untouched by today's sweep.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "liveClasses.create",
        json!({
            "title": "Tomorrow",
            "scheduledDate": tomorrow(),
            "startTime": "10:00",
            "endTime": "11:00",
            "subjectId": "sub-1",
            "levelId": "lvl-1",
            "programId": "prog-1",
            "teacherId": "t1"
        }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "liveClasses.autoStatus",
        json!({}),
    );
    assert_eq!(first.get("started").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(first.get("ended").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(first.get("errors").and_then(|v| v.as_u64()), Some(0));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "liveClasses.get",
        json!({ "liveClassId": due_id }),
    );
    let row = fetched.get("liveClass").expect("liveClass");
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("ongoing"));
    assert!(row
        .get("meetingLink")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .starts_with("https://meet.jit.si/"));

    // The enrolled student was told the class started.
    let ledger = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "notifications.list",
        json!({ "liveClassId": due_id }),
    );
    let started_events: Vec<_> = ledger
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications")
        .iter()
        .filter(|r| r.get("eventType").and_then(|v| v.as_str()) == Some("class_started"))
        .collect();
    assert_eq!(started_events.len(), 1);
    assert_eq!(
        started_events[0]
            .get("recipientId")
            .and_then(|v| v.as_str()),
        Some("s1")
    );

    // An immediate second sweep applies nothing new.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "liveClasses.autoStatus",
        json!({}),
    );
    assert_eq!(second.get("started").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(second.get("ended").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(second.get("reminders").and_then(|v| v.as_u64()), Some(0));

    let ledger = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "notifications.list",
        json!({ "liveClassId": due_id }),
    );
    let started_events = ledger
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications")
        .iter()
        .filter(|r| r.get("eventType").and_then(|v| v.as_str()) == Some("class_started"))
        .count();
    assert_eq!(started_events, 1, "second sweep must not re-notify");
}
