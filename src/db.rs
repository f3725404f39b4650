use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("liveclass.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // The sweeper and interactive start/complete calls race; let losers wait
    // out a writer instead of surfacing SQLITE_BUSY.
    conn.busy_timeout(Duration::from_secs(30))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            program_id TEXT NOT NULL,
            level_id TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_program_level ON students(program_id, level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS live_classes(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            scheduled_date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            meeting_platform TEXT NOT NULL,
            meeting_link TEXT,
            meeting_password TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            pre_class_buffer INTEGER NOT NULL DEFAULT 15,
            max_participants INTEGER NOT NULL DEFAULT 50,
            recording_enabled INTEGER NOT NULL DEFAULT 0,
            waiting_room_enabled INTEGER NOT NULL DEFAULT 1,
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            level_id TEXT NOT NULL,
            program_id TEXT NOT NULL,
            paper_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_live_classes_status ON live_classes(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_live_classes_teacher ON live_classes(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_live_classes_date ON live_classes(scheduled_date)",
        [],
    )?;

    // Workspaces created before the buffer/waiting-room settings existed need
    // the columns added and backfilled with the defaults.
    ensure_live_classes_settings_columns(conn)?;

    // Dispatch ledger. The unique key is what makes reminder and sweep
    // fan-out idempotent: a re-fired event lands on INSERT OR IGNORE.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            live_class_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            audience TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            recipient_role TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(live_class_id) REFERENCES live_classes(id),
            UNIQUE(live_class_id, event_type, recipient_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_class ON notifications(live_class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_events(
            live_class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            joined_at TEXT,
            left_at TEXT,
            technical_data TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(live_class_id, student_id),
            FOREIGN KEY(live_class_id) REFERENCES live_classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_events_student ON attendance_events(student_id)",
        [],
    )?;

    Ok(())
}

fn ensure_live_classes_settings_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "live_classes", "pre_class_buffer")? {
        conn.execute(
            "ALTER TABLE live_classes ADD COLUMN pre_class_buffer INTEGER NOT NULL DEFAULT 15",
            [],
        )?;
    }
    if !table_has_column(conn, "live_classes", "waiting_room_enabled")? {
        conn.execute(
            "ALTER TABLE live_classes ADD COLUMN waiting_room_enabled INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    if !table_has_column(conn, "live_classes", "paper_id")? {
        conn.execute("ALTER TABLE live_classes ADD COLUMN paper_id TEXT", [])?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [table],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
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
