use crate::meeting::{self, Platform, TerminationResult};
use crate::notify::{self, Audience, EventType, SessionContext};
use crate::schedule;
use chrono::{NaiveDate, NaiveDateTime};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

pub const DEFAULT_MAX_PARTICIPANTS: i64 = 50;

const REMINDER_LONG_LEAD_MIN: i64 = 30;
const REMINDER_SHORT_LEAD_MIN: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
}

impl Status {
    pub fn parse(raw: &str) -> Option<Status> {
        match raw {
            "scheduled" => Some(Status::Scheduled),
            "ongoing" => Some(Status::Ongoing),
            "completed" => Some(Status::Completed),
            "cancelled" => Some(Status::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Scheduled => "scheduled",
            Status::Ongoing => "ongoing",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct LiveClassRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub scheduled_date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: Status,
    pub meeting_platform: String,
    pub meeting_link: Option<String>,
    pub meeting_password: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub pre_class_buffer: i64,
    pub max_participants: i64,
    pub recording_enabled: bool,
    pub waiting_room_enabled: bool,
    pub teacher_id: String,
    pub subject_id: String,
    pub level_id: String,
    pub program_id: String,
    pub paper_id: Option<String>,
    pub created_at: String,
}

impl LiveClassRow {
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.scheduled_date.trim(), "%Y-%m-%d").ok()
    }

    pub fn start_min(&self) -> u32 {
        schedule::parse_time_minutes(&self.start_time)
    }

    pub fn end_min(&self) -> u32 {
        schedule::parse_time_minutes(&self.end_time)
    }

    fn context(&self) -> SessionContext<'_> {
        SessionContext {
            live_class_id: &self.id,
            title: &self.title,
            teacher_id: &self.teacher_id,
            program_id: &self.program_id,
            level_id: &self.level_id,
            start_time: &self.start_time,
        }
    }
}

/// Expected rejections are values the caller can word back to the user;
/// store trouble propagates separately so the boundary can report a 500-class
/// failure instead of a validation message.
#[derive(Debug)]
pub enum LifecycleError {
    /// Bad input or an impossible transition.
    Validation(String),
    /// Start refused by the time-window gate; carries the human reason.
    WindowRejected(String),
    NotFound,
    Store(anyhow::Error),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Validation(m) => write!(f, "{}", m),
            LifecycleError::WindowRejected(m) => write!(f, "{}", m),
            LifecycleError::NotFound => write!(f, "live class not found"),
            LifecycleError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl From<rusqlite::Error> for LifecycleError {
    fn from(e: rusqlite::Error) -> Self {
        LifecycleError::Store(e.into())
    }
}

fn ts(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub const ROW_COLUMNS: &str = "id, title, description, scheduled_date, start_time, end_time, status,
     meeting_platform, meeting_link, meeting_password, started_at, ended_at,
     pre_class_buffer, max_participants, recording_enabled, waiting_room_enabled,
     teacher_id, subject_id, level_id, program_id, paper_id, created_at";

pub fn row_from(r: &rusqlite::Row) -> rusqlite::Result<LiveClassRow> {
    let status_raw: String = r.get(6)?;
    Ok(LiveClassRow {
        id: r.get(0)?,
        title: r.get(1)?,
        description: r.get(2)?,
        scheduled_date: r.get(3)?,
        start_time: r.get(4)?,
        end_time: r.get(5)?,
        // Unknown status text would mean outside interference; read it as
        // terminal so we never transition it.
        status: Status::parse(&status_raw).unwrap_or(Status::Cancelled),
        meeting_platform: r.get(7)?,
        meeting_link: r.get(8)?,
        meeting_password: r.get(9)?,
        started_at: r.get(10)?,
        ended_at: r.get(11)?,
        pre_class_buffer: r.get(12)?,
        max_participants: r.get(13)?,
        recording_enabled: r.get::<_, i64>(14)? != 0,
        waiting_room_enabled: r.get::<_, i64>(15)? != 0,
        teacher_id: r.get(16)?,
        subject_id: r.get(17)?,
        level_id: r.get(18)?,
        program_id: r.get(19)?,
        paper_id: r.get(20)?,
        created_at: r.get(21)?,
    })
}

pub fn load(conn: &Connection, id: &str) -> Result<LiveClassRow, LifecycleError> {
    let sql = format!("SELECT {} FROM live_classes WHERE id = ?", ROW_COLUMNS);
    conn.query_row(&sql, [id], row_from)
        .optional()?
        .ok_or(LifecycleError::NotFound)
}

#[derive(Debug, Clone, Default)]
pub struct NewLiveClass {
    pub title: String,
    pub description: Option<String>,
    pub scheduled_date: String,
    pub start_time: String,
    pub end_time: String,
    pub subject_id: String,
    pub level_id: String,
    pub program_id: String,
    pub teacher_id: String,
    pub paper_id: Option<String>,
    pub meeting_platform: Option<String>,
    pub meeting_link: Option<String>,
    pub pre_class_buffer: Option<i64>,
    pub max_participants: Option<i64>,
    pub recording_enabled: Option<bool>,
    pub waiting_room_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CreatedLiveClass {
    pub id: String,
    pub meeting_password: String,
    pub meeting_platform: String,
}

pub fn create_live_class(
    conn: &Connection,
    new: &NewLiveClass,
    now: NaiveDateTime,
    rng: &mut impl Rng,
) -> Result<CreatedLiveClass, LifecycleError> {
    for (field, value) in [
        ("title", &new.title),
        ("scheduledDate", &new.scheduled_date),
        ("startTime", &new.start_time),
        ("endTime", &new.end_time),
        ("subjectId", &new.subject_id),
        ("levelId", &new.level_id),
        ("programId", &new.program_id),
        ("teacherId", &new.teacher_id),
    ] {
        if value.trim().is_empty() {
            return Err(LifecycleError::Validation(format!("missing {}", field)));
        }
    }

    if NaiveDate::parse_from_str(new.scheduled_date.trim(), "%Y-%m-%d").is_err() {
        return Err(LifecycleError::Validation(
            "scheduledDate must be YYYY-MM-DD".to_string(),
        ));
    }

    let start_min = schedule::parse_time_minutes(&new.start_time);
    let end_min = schedule::parse_time_minutes(&new.end_time);
    if end_min <= start_min {
        return Err(LifecycleError::Validation(
            "endTime must be after startTime".to_string(),
        ));
    }

    let platform = Platform::parse(new.meeting_platform.as_deref().unwrap_or(""));
    let buffer = new
        .pre_class_buffer
        .unwrap_or(schedule::DEFAULT_PRE_CLASS_BUFFER_MIN)
        .max(0);
    let max_participants = new
        .max_participants
        .unwrap_or(DEFAULT_MAX_PARTICIPANTS)
        .max(1);
    let password = meeting::generate_password(rng);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO live_classes(
            id, title, description, scheduled_date, start_time, end_time,
            status, meeting_platform, meeting_link, meeting_password,
            pre_class_buffer, max_participants, recording_enabled,
            waiting_room_enabled, teacher_id, subject_id, level_id,
            program_id, paper_id, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, 'scheduled', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            new.title.trim(),
            new.description.as_deref(),
            new.scheduled_date.trim(),
            schedule::format_minutes(start_min),
            schedule::format_minutes(end_min),
            platform.label(),
            new.meeting_link.as_deref(),
            &password,
            buffer,
            max_participants,
            new.recording_enabled.unwrap_or(false) as i64,
            new.waiting_room_enabled.unwrap_or(true) as i64,
            new.teacher_id.trim(),
            new.subject_id.trim(),
            new.level_id.trim(),
            new.program_id.trim(),
            new.paper_id.as_deref(),
            ts(now),
        ],
    )?;

    Ok(CreatedLiveClass {
        id,
        meeting_password: password,
        meeting_platform: platform.label().to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// True when the row was already ongoing (a racer or repeat call);
    /// nothing was applied and nothing was notified.
    pub already: bool,
    pub started_at: Option<String>,
    pub meeting_link: Option<String>,
}

/// scheduled -> ongoing, gated by the time window. The write is a
/// compare-and-swap on the prior status so a concurrent sweep and a user
/// clicking "start" cannot both apply: the loser's write matches zero rows.
pub fn request_start(
    conn: &Connection,
    id: &str,
    actor_is_admin: bool,
    now: NaiveDateTime,
    rng: &mut impl Rng,
) -> Result<StartOutcome, LifecycleError> {
    let row = load(conn, id)?;

    match row.status {
        Status::Ongoing => {
            return Ok(StartOutcome {
                already: true,
                started_at: row.started_at,
                meeting_link: row.meeting_link,
            })
        }
        Status::Completed | Status::Cancelled => {
            return Err(LifecycleError::Validation(format!(
                "cannot start a {} class",
                row.status.as_str()
            )))
        }
        Status::Scheduled => {}
    }

    let date = row.date().ok_or_else(|| {
        LifecycleError::Validation("stored scheduled date is not valid".to_string())
    })?;
    let check = schedule::can_start(
        date,
        row.start_min(),
        row.end_min(),
        row.pre_class_buffer,
        actor_is_admin,
        now,
    );
    if !check.allowed {
        return Err(LifecycleError::WindowRejected(
            check
                .reason
                .unwrap_or_else(|| "class cannot start now".to_string()),
        ));
    }

    let link = match &row.meeting_link {
        Some(l) if !l.trim().is_empty() => l.clone(),
        _ => meeting::generate(Platform::parse(&row.meeting_platform), rng).link,
    };
    let started_at = ts(now);

    let changed = conn.execute(
        "UPDATE live_classes
         SET status = 'ongoing', started_at = ?, meeting_link = ?
         WHERE id = ? AND status = 'scheduled'",
        (&started_at, &link, id),
    )?;
    if changed == 0 {
        // A racer got there first; report their result, fire nothing.
        let current = load(conn, id)?;
        return Ok(StartOutcome {
            already: true,
            started_at: current.started_at,
            meeting_link: current.meeting_link,
        });
    }

    if let Err(e) = notify::notify(
        conn,
        &row.context(),
        EventType::ClassStarting,
        Audience::Both,
        None,
        now,
    ) {
        log::warn!("class_starting fan-out failed for {}: {}", id, e);
    }

    Ok(StartOutcome {
        already: false,
        started_at: Some(started_at),
        meeting_link: Some(link),
    })
}

#[derive(Debug, Clone)]
pub struct CompleteOutcome {
    pub already: bool,
    pub ended_at: Option<String>,
    /// Best-effort termination report; None when the row was already
    /// completed and nothing was re-terminated.
    pub termination: Option<TerminationResult>,
}

/// ongoing -> completed. Termination and the student notification are both
/// best-effort: their failure is logged and never fails the completion.
pub fn request_complete(
    conn: &Connection,
    id: &str,
    now: NaiveDateTime,
) -> Result<CompleteOutcome, LifecycleError> {
    let row = load(conn, id)?;

    match row.status {
        Status::Completed => {
            return Ok(CompleteOutcome {
                already: true,
                ended_at: row.ended_at,
                termination: None,
            })
        }
        Status::Scheduled => {
            return Err(LifecycleError::Validation(
                "class has not started yet".to_string(),
            ))
        }
        Status::Cancelled => {
            return Err(LifecycleError::Validation(
                "cannot complete a cancelled class".to_string(),
            ))
        }
        Status::Ongoing => {}
    }

    let ended_at = ts(now);
    let changed = conn.execute(
        "UPDATE live_classes
         SET status = 'completed', ended_at = ?
         WHERE id = ? AND status = 'ongoing'",
        (&ended_at, id),
    )?;
    if changed == 0 {
        let current = load(conn, id)?;
        return Ok(CompleteOutcome {
            already: true,
            ended_at: current.ended_at,
            termination: None,
        });
    }

    let termination = meeting::terminate(
        Platform::parse(&row.meeting_platform),
        row.meeting_link.as_deref(),
    );
    if !termination.success {
        log::warn!("meeting termination soft-failed for {}: {}", id, termination.message);
    }

    if let Err(e) = notify::notify(
        conn,
        &row.context(),
        EventType::ClassEnded,
        Audience::Students,
        None,
        now,
    ) {
        log::warn!("class_ended fan-out failed for {}: {}", id, e);
    }

    Ok(CompleteOutcome {
        already: false,
        ended_at: Some(ended_at),
        termination: Some(termination),
    })
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub already: bool,
}

/// Any non-terminal state -> cancelled. started_at, if set, is preserved;
/// ended_at stays NULL. All schedule fields freeze from here on.
pub fn request_cancel(conn: &Connection, id: &str) -> Result<CancelOutcome, LifecycleError> {
    let row = load(conn, id)?;

    match row.status {
        Status::Cancelled => return Ok(CancelOutcome { already: true }),
        Status::Completed => {
            return Err(LifecycleError::Validation(
                "cannot cancel a completed class".to_string(),
            ))
        }
        Status::Scheduled | Status::Ongoing => {}
    }

    let changed = conn.execute(
        "UPDATE live_classes
         SET status = 'cancelled'
         WHERE id = ? AND status IN ('scheduled', 'ongoing')",
        [id],
    )?;
    Ok(CancelOutcome {
        already: changed == 0,
    })
}

#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub scheduled_date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub meeting_platform: Option<String>,
    pub pre_class_buffer: Option<i64>,
    pub max_participants: Option<i64>,
    pub recording_enabled: Option<bool>,
    pub waiting_room_enabled: Option<bool>,
}

/// Edit schedule fields. Terminal rows are frozen: completed and cancelled
/// classes reject every edit.
pub fn update_schedule(
    conn: &Connection,
    id: &str,
    patch: &SchedulePatch,
) -> Result<(), LifecycleError> {
    let row = load(conn, id)?;
    if row.status.is_terminal() {
        return Err(LifecycleError::Validation(format!(
            "a {} class can no longer be edited",
            row.status.as_str()
        )));
    }

    let scheduled_date = patch
        .scheduled_date
        .clone()
        .unwrap_or_else(|| row.scheduled_date.clone());
    if NaiveDate::parse_from_str(scheduled_date.trim(), "%Y-%m-%d").is_err() {
        return Err(LifecycleError::Validation(
            "scheduledDate must be YYYY-MM-DD".to_string(),
        ));
    }

    let start_min = patch
        .start_time
        .as_deref()
        .map(schedule::parse_time_minutes)
        .unwrap_or_else(|| row.start_min());
    let end_min = patch
        .end_time
        .as_deref()
        .map(schedule::parse_time_minutes)
        .unwrap_or_else(|| row.end_min());
    if end_min <= start_min {
        return Err(LifecycleError::Validation(
            "endTime must be after startTime".to_string(),
        ));
    }

    let title = patch.title.clone().unwrap_or_else(|| row.title.clone());
    if title.trim().is_empty() {
        return Err(LifecycleError::Validation(
            "title must not be empty".to_string(),
        ));
    }
    let platform = patch
        .meeting_platform
        .as_deref()
        .map(|p| Platform::parse(p).label().to_string())
        .unwrap_or_else(|| row.meeting_platform.clone());

    let changed = conn.execute(
        "UPDATE live_classes
         SET title = ?, description = ?, scheduled_date = ?, start_time = ?,
             end_time = ?, meeting_platform = ?, pre_class_buffer = ?,
             max_participants = ?, recording_enabled = ?, waiting_room_enabled = ?
         WHERE id = ? AND status IN ('scheduled', 'ongoing')",
        rusqlite::params![
            title.trim(),
            patch
                .description
                .clone()
                .or_else(|| row.description.clone()),
            scheduled_date.trim(),
            schedule::format_minutes(start_min),
            schedule::format_minutes(end_min),
            platform,
            patch.pre_class_buffer.unwrap_or(row.pre_class_buffer).max(0),
            patch
                .max_participants
                .unwrap_or(row.max_participants)
                .max(1),
            patch.recording_enabled.unwrap_or(row.recording_enabled) as i64,
            patch
                .waiting_room_enabled
                .unwrap_or(row.waiting_room_enabled) as i64,
            id,
        ],
    )?;
    if changed == 0 {
        // The row went terminal between the read and the write.
        return Err(LifecycleError::Validation(
            "class can no longer be edited".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub started: usize,
    pub ended: usize,
    pub reminders: usize,
    pub errors: usize,
}

/// One reconciliation pass: fire due reminders, start scheduled classes whose
/// window contains `now`, end ongoing classes past their end time.
///
/// Reminders are re-derived from (now vs start) on every tick instead of
/// being armed as one-shot timers, so a restart between ticks loses nothing;
/// the ledger's unique key absorbs re-fires. Each row is handled
/// independently: one bad row is logged and counted, the sweep moves on.
pub fn sweep(conn: &Connection, now: NaiveDateTime, rng: &mut impl Rng) -> SweepReport {
    let mut report = SweepReport::default();

    let rows = match load_active(conn) {
        Ok(rows) => rows,
        Err(e) => {
            log::warn!("sweep could not list live classes: {}", e);
            report.errors += 1;
            return report;
        }
    };

    for row in rows {
        match sweep_one(conn, &row, now, rng) {
            Ok((started, ended, reminders)) => {
                report.started += started;
                report.ended += ended;
                report.reminders += reminders;
            }
            Err(e) => {
                log::warn!("sweep failed for live class {}: {}", row.id, e);
                report.errors += 1;
            }
        }
    }
    report
}

fn load_active(conn: &Connection) -> Result<Vec<LiveClassRow>, LifecycleError> {
    let sql = format!(
        "SELECT {} FROM live_classes WHERE status IN ('scheduled', 'ongoing')
         ORDER BY scheduled_date, start_time",
        ROW_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_from)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn sweep_one(
    conn: &Connection,
    row: &LiveClassRow,
    now: NaiveDateTime,
    rng: &mut impl Rng,
) -> Result<(usize, usize, usize), LifecycleError> {
    let Some(date) = row.date() else {
        // Unparseable date: nothing time-based can be decided for this row.
        return Err(LifecycleError::Validation(format!(
            "scheduled date {:?} is not valid",
            row.scheduled_date
        )));
    };
    let start_at = schedule::combine(date, row.start_min());
    let end_at = schedule::combine(date, row.end_min());

    let mut started = 0usize;
    let mut ended = 0usize;
    let mut reminders = 0usize;

    if row.status == Status::Scheduled {
        let lead = (start_at - now).num_minutes();
        if lead > 0 && lead <= REMINDER_LONG_LEAD_MIN {
            if fire_reminder(conn, row, EventType::Reminder30Min, now)? {
                reminders += 1;
            }
        }
        if lead > 0 && lead <= REMINDER_SHORT_LEAD_MIN {
            if fire_reminder(conn, row, EventType::Reminder5Min, now)? {
                reminders += 1;
            }
        }

        if start_at <= now && now <= end_at {
            started += sweep_start(conn, row, now, rng)?;
        }
    }

    if row.status == Status::Ongoing && now >= end_at {
        let outcome = request_complete(conn, &row.id, now)?;
        if !outcome.already {
            ended += 1;
        }
    }

    Ok((started, ended, reminders))
}

fn fire_reminder(
    conn: &Connection,
    row: &LiveClassRow,
    event: EventType,
    now: NaiveDateTime,
) -> Result<bool, LifecycleError> {
    let inserted = notify::notify(conn, &row.context(), event, Audience::Both, None, now)
        .map_err(LifecycleError::Store)?;
    Ok(inserted > 0)
}

/// Sweeper-side start: the window already contains `now`, so there is no
/// gate to apply; the CAS alone decides against racers. Fan-out goes to the
/// enrolled students ("class_started"), matching the scheduled-job behavior
/// rather than the interactive one.
fn sweep_start(
    conn: &Connection,
    row: &LiveClassRow,
    now: NaiveDateTime,
    rng: &mut impl Rng,
) -> Result<usize, LifecycleError> {
    let link = match &row.meeting_link {
        Some(l) if !l.trim().is_empty() => l.clone(),
        _ => meeting::generate(Platform::parse(&row.meeting_platform), rng).link,
    };
    let changed = conn.execute(
        "UPDATE live_classes
         SET status = 'ongoing', started_at = ?, meeting_link = ?
         WHERE id = ? AND status = 'scheduled'",
        (ts(now), &link, &row.id),
    )?;
    if changed == 0 {
        return Ok(0);
    }

    if let Err(e) = notify::notify(
        conn,
        &row.context(),
        EventType::ClassStarted,
        Audience::Students,
        None,
        now,
    ) {
        log::warn!("class_started fan-out failed for {}: {}", row.id, e);
    }
    Ok(1)
}
