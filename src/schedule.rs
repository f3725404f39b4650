use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

pub const DEFAULT_PRE_CLASS_BUFFER_MIN: i64 = 15;

/// Parse a time-of-day string to minutes since midnight.
///
/// Accepts `HH:MM`, `HH:MM:SS`, and an optional `AM`/`PM` suffix (with or
/// without a space). Malformed input normalizes to 0 (midnight) instead of
/// failing; schedule rows imported from older workspaces carry some junk and
/// the scheduler UI must keep rendering.
pub fn parse_time_minutes(raw: &str) -> u32 {
    let t = raw.trim().to_ascii_uppercase();
    let (body, am, pm) = if let Some(stripped) = t.strip_suffix("PM") {
        (stripped.trim_end(), false, true)
    } else if let Some(stripped) = t.strip_suffix("AM") {
        (stripped.trim_end(), true, false)
    } else {
        (t.as_str(), false, false)
    };

    let mut parts = body.split(':');
    let mut hour: u32 = parts
        .next()
        .and_then(|p| p.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let minute: u32 = parts
        .next()
        .and_then(|p| p.trim().parse::<u32>().ok())
        .unwrap_or(0);
    // Seconds, if present, are dropped: all scheduling comparisons are at
    // minute granularity.

    if pm && hour != 12 {
        hour += 12;
    }
    if am && hour == 12 {
        hour = 0;
    }

    let hour = hour.min(23);
    let minute = minute.min(59);
    hour * 60 + minute
}

pub fn format_minutes(minutes: u32) -> String {
    let m = minutes.min(23 * 60 + 59);
    format!("{:02}:{:02}", m / 60, m % 60)
}

pub fn combine(date: NaiveDate, minutes: u32) -> NaiveDateTime {
    let m = minutes.min(23 * 60 + 59);
    // m is capped within the day, so this is always Some.
    let time = NaiveTime::from_hms_opt(m / 60, m % 60, 0).unwrap_or_default();
    date.and_time(time)
}

/// Truncate to minute granularity so seconds never tip a window comparison.
fn to_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|n| n.with_nanosecond(0))
        .unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl StartCheck {
    fn allow() -> Self {
        StartCheck {
            allowed: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        StartCheck {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Decide whether a class may move to "ongoing" at `now`.
///
/// The window is `[start - buffer, end]`. An admin override drops the lower
/// bound (force-start early) but never the upper one: nothing starts after
/// its own end time.
pub fn can_start(
    date: NaiveDate,
    start_min: u32,
    end_min: u32,
    buffer_min: i64,
    admin_override: bool,
    now: NaiveDateTime,
) -> StartCheck {
    let now = to_minute(now);
    let start_at = combine(date, start_min);
    let end_at = combine(date, end_min);

    if now > end_at {
        let ago = (now - end_at).num_minutes();
        return StartCheck::reject(format!(
            "Class window has already elapsed (ended {}m ago)",
            ago
        ));
    }

    let earliest = start_at - ChronoDuration::minutes(buffer_min.max(0));
    if !admin_override && now < earliest {
        let wait = (start_at - now).num_minutes();
        return StartCheck::reject(format!(
            "Class has not reached its scheduled start window yet (starts in {}m)",
            wait
        ));
    }

    StartCheck::allow()
}

/// Display status derived from raw times. This is a UI hint only; the stored
/// status column stays authoritative and the sweeper reconciles the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedStatus {
    Upcoming,
    InProgress,
    Ended,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Upcoming => "upcoming",
            DerivedStatus::InProgress => "in_progress",
            DerivedStatus::Ended => "ended",
        }
    }
}

pub fn derived_status(
    date: NaiveDate,
    start_min: u32,
    end_min: u32,
    now: NaiveDateTime,
) -> DerivedStatus {
    let now = to_minute(now);
    if now > combine(date, end_min) {
        DerivedStatus::Ended
    } else if now >= combine(date, start_min) {
        DerivedStatus::InProgress
    } else {
        DerivedStatus::Upcoming
    }
}

pub fn start_time_message(
    date: NaiveDate,
    start_min: u32,
    end_min: u32,
    now: NaiveDateTime,
) -> String {
    let now = to_minute(now);
    let start_at = combine(date, start_min);
    let end_at = combine(date, end_min);

    if now > end_at {
        return "Class has ended".to_string();
    }
    if now == start_at {
        return "Starting now".to_string();
    }
    if now > start_at {
        return "Class is currently running".to_string();
    }
    let mins = (start_at - now).num_minutes();
    if mins >= 60 {
        format!("Starts in {}h {}m", mins / 60, mins % 60)
    } else {
        format!("Starts in {}m", mins)
    }
}

/// Short countdown string for list views.
pub fn time_until_class(
    date: NaiveDate,
    start_min: u32,
    end_min: u32,
    now: NaiveDateTime,
) -> String {
    let now = to_minute(now);
    let start_at = combine(date, start_min);
    let end_at = combine(date, end_min);

    if now > end_at {
        return "Ended".to_string();
    }
    if now == start_at {
        return "Starting now".to_string();
    }
    if now > start_at {
        return "In progress".to_string();
    }
    let mins = (start_at - now).num_minutes();
    if mins >= 60 {
        format!("{}h {}m", mins / 60, mins % 60)
    } else {
        format!("{}m", mins)
    }
}
