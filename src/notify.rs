use chrono::NaiveDateTime;
use rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Reminder30Min,
    Reminder5Min,
    ClassStarting,
    ClassStarted,
    ClassEnded,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<EventType> {
        match raw {
            "reminder_30min" => Some(EventType::Reminder30Min),
            "reminder_5min" => Some(EventType::Reminder5Min),
            "class_starting" => Some(EventType::ClassStarting),
            "class_started" => Some(EventType::ClassStarted),
            "class_ended" => Some(EventType::ClassEnded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Reminder30Min => "reminder_30min",
            EventType::Reminder5Min => "reminder_5min",
            EventType::ClassStarting => "class_starting",
            EventType::ClassStarted => "class_started",
            EventType::ClassEnded => "class_ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Teachers,
    Students,
    Both,
}

impl Audience {
    pub fn parse(raw: &str) -> Option<Audience> {
        match raw {
            "teachers" => Some(Audience::Teachers),
            "students" => Some(Audience::Students),
            "both" => Some(Audience::Both),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Teachers => "teachers",
            Audience::Students => "students",
            Audience::Both => "both",
        }
    }
}

/// The slice of a live-class row the dispatcher needs to resolve recipients
/// and word the message.
pub struct SessionContext<'a> {
    pub live_class_id: &'a str,
    pub title: &'a str,
    pub teacher_id: &'a str,
    pub program_id: &'a str,
    pub level_id: &'a str,
    pub start_time: &'a str,
}

fn default_message(event: EventType, ctx: &SessionContext) -> String {
    match event {
        EventType::Reminder30Min => {
            format!("Reminder: \"{}\" starts at {} (30 minutes)", ctx.title, ctx.start_time)
        }
        EventType::Reminder5Min => {
            format!("Reminder: \"{}\" starts at {} (5 minutes)", ctx.title, ctx.start_time)
        }
        EventType::ClassStarting => format!("\"{}\" is starting now", ctx.title),
        EventType::ClassStarted => format!("\"{}\" has started, join now", ctx.title),
        EventType::ClassEnded => format!("\"{}\" has ended", ctx.title),
    }
}

struct Recipient {
    id: String,
    role: &'static str,
}

fn resolve_recipients(
    conn: &Connection,
    ctx: &SessionContext,
    audience: Audience,
) -> anyhow::Result<Vec<Recipient>> {
    let mut out = Vec::new();
    if matches!(audience, Audience::Teachers | Audience::Both) {
        out.push(Recipient {
            id: ctx.teacher_id.to_string(),
            role: "teacher",
        });
    }
    if matches!(audience, Audience::Students | Audience::Both) {
        let mut stmt = conn.prepare(
            "SELECT id FROM students WHERE program_id = ? AND level_id = ? ORDER BY id",
        )?;
        let ids = stmt
            .query_map((ctx.program_id, ctx.level_id), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        out.extend(ids.into_iter().map(|id| Recipient {
            id,
            role: "student",
        }));
    }
    Ok(out)
}

/// Fan an event out to the resolved audience. Returns how many ledger rows
/// were actually inserted; rows already present (same class, event, and
/// recipient) are absorbed by the unique key, which is what keeps repeated
/// sweeps and racing transitions from double-notifying anyone.
///
/// Callers on the transition path treat this as fire-and-forget: errors are
/// logged at the call site and never fail the transition itself.
pub fn notify(
    conn: &Connection,
    ctx: &SessionContext,
    event: EventType,
    audience: Audience,
    override_message: Option<&str>,
    now: NaiveDateTime,
) -> anyhow::Result<usize> {
    let message = override_message
        .map(|m| m.to_string())
        .unwrap_or_else(|| default_message(event, ctx));
    let created_at = now.format("%Y-%m-%dT%H:%M:%S").to_string();

    let mut inserted = 0usize;
    for r in resolve_recipients(conn, ctx, audience)? {
        let n = conn.execute(
            "INSERT OR IGNORE INTO notifications(
                id, live_class_id, event_type, audience, recipient_id,
                recipient_role, message, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                ctx.live_class_id,
                event.as_str(),
                audience.as_str(),
                &r.id,
                r.role,
                &message,
                &created_at,
            ),
        )?;
        inserted += n;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed(conn: &Connection) {
        conn.execute(
            "INSERT INTO students(id, name, program_id, level_id) VALUES
                ('s1', 'Asha', 'prog-1', 'lvl-1'),
                ('s2', 'Binta', 'prog-1', 'lvl-1'),
                ('s3', 'Kwame', 'prog-2', 'lvl-1')",
            [],
        )
        .expect("seed students");
        conn.execute(
            "INSERT INTO live_classes(
                id, title, scheduled_date, start_time, end_time, status,
                meeting_platform, meeting_password, teacher_id, subject_id,
                level_id, program_id, created_at
             ) VALUES('lc1', 'Algebra', '2025-03-10', '10:00', '11:00',
                'scheduled', 'Jitsi Meet', 'pw', 't1', 'sub-1', 'lvl-1',
                'prog-1', '2025-03-01T00:00:00')",
            [],
        )
        .expect("seed class");
    }

    fn ctx<'a>() -> SessionContext<'a> {
        SessionContext {
            live_class_id: "lc1",
            title: "Algebra",
            teacher_id: "t1",
            program_id: "prog-1",
            level_id: "lvl-1",
            start_time: "10:00",
        }
    }

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2025, 3, 10)
            .expect("date")
            .and_hms_opt(9, 0, 0)
            .expect("time")
    }

    #[test]
    fn both_audience_reaches_teacher_and_matching_students() {
        let conn = test_conn();
        seed(&conn);
        let n = notify(&conn, &ctx(), EventType::ClassStarting, Audience::Both, None, now())
            .expect("notify");
        // t1 plus s1/s2; s3 is in another program.
        assert_eq!(n, 3);
    }

    #[test]
    fn refire_is_absorbed_by_the_ledger() {
        let conn = test_conn();
        seed(&conn);
        let first = notify(
            &conn,
            &ctx(),
            EventType::Reminder30Min,
            Audience::Students,
            None,
            now(),
        )
        .expect("notify");
        assert_eq!(first, 2);
        let second = notify(
            &conn,
            &ctx(),
            EventType::Reminder30Min,
            Audience::Students,
            None,
            now(),
        )
        .expect("notify again");
        assert_eq!(second, 0);
    }

    #[test]
    fn override_message_is_stored_verbatim() {
        let conn = test_conn();
        seed(&conn);
        notify(
            &conn,
            &ctx(),
            EventType::ClassEnded,
            Audience::Students,
            Some("See you next week"),
            now(),
        )
        .expect("notify");
        let msg: String = conn
            .query_row(
                "SELECT message FROM notifications WHERE recipient_id = 's1'",
                [],
                |r| r.get(0),
            )
            .expect("stored message");
        assert_eq!(msg, "See you next week");
    }
}
