use rand::Rng;
use serde::Serialize;
use std::time::Duration;

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    JitsiMeet,
    GoogleMeet,
    Zoom,
    Teams,
}

impl Platform {
    /// Case-insensitive parse over the conventional spellings. Unrecognized
    /// platforms fall back to Jitsi Meet, which needs no account to host.
    pub fn parse(raw: &str) -> Platform {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jitsi" | "jitsi meet" => Platform::JitsiMeet,
            "google" | "google meet" | "meet" => Platform::GoogleMeet,
            "zoom" => Platform::Zoom,
            "teams" | "microsoft teams" => Platform::Teams,
            _ => Platform::JitsiMeet,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Platform::JitsiMeet => "Jitsi Meet",
            Platform::GoogleMeet => "Google Meet",
            Platform::Zoom => "Zoom",
            Platform::Teams => "Teams",
        }
    }

    pub fn termination_capability(&self) -> TerminationCapability {
        match self {
            // Jitsi rooms are ephemeral and can be released without an account.
            Platform::JitsiMeet => TerminationCapability::Full,
            // The rest need an authenticated platform API we don't hold
            // credentials for; we can only advise.
            Platform::GoogleMeet | Platform::Zoom | Platform::Teams => {
                TerminationCapability::Advisory
            }
        }
    }
}

/// Static per-platform hints the UI passes through to its embedding iframe.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedConfig {
    #[serde(rename = "muteOnEntry")]
    pub mute_on_entry: bool,
    #[serde(rename = "lobbyEnabled")]
    pub lobby_enabled: bool,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct GeneratedMeeting {
    pub link: String,
    pub platform: &'static str,
    pub passcode: Option<String>,
    pub embed: EmbedConfig,
}

pub fn embed_defaults(platform: Platform) -> EmbedConfig {
    match platform {
        Platform::JitsiMeet => EmbedConfig {
            mute_on_entry: true,
            lobby_enabled: true,
            width: 1280,
            height: 720,
        },
        Platform::GoogleMeet => EmbedConfig {
            mute_on_entry: false,
            lobby_enabled: true,
            width: 1280,
            height: 720,
        },
        Platform::Zoom => EmbedConfig {
            mute_on_entry: true,
            lobby_enabled: true,
            width: 1024,
            height: 576,
        },
        Platform::Teams => EmbedConfig {
            mute_on_entry: true,
            lobby_enabled: false,
            width: 1280,
            height: 720,
        },
    }
}

/// `xxx-xxxx-xxx` lowercase-letter room code, the shape Jitsi and Google Meet
/// both use for generated rooms.
fn room_code(rng: &mut impl Rng) -> String {
    let mut out = String::with_capacity(12);
    for (i, len) in [3usize, 4, 3].iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        for _ in 0..*len {
            out.push(rng.gen_range(b'a'..=b'z') as char);
        }
    }
    out
}

fn base36(rng: &mut impl Rng, len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn digits(rng: &mut impl Rng, len: usize) -> String {
    (0..len).map(|_| rng.gen_range(b'0'..=b'9') as char).collect()
}

fn alnum(rng: &mut impl Rng, len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Produce a meeting URL in the requested platform's conventional shape.
/// This is cosmetic: no account or capacity is provisioned on the platform.
pub fn generate(platform: Platform, rng: &mut impl Rng) -> GeneratedMeeting {
    let (link, passcode) = match platform {
        Platform::JitsiMeet => (format!("https://meet.jit.si/{}", room_code(rng)), None),
        Platform::GoogleMeet => (format!("https://meet.google.com/{}", room_code(rng)), None),
        Platform::Zoom => (
            format!("https://zoom.us/j/{}", digits(rng, 11)),
            Some(alnum(rng, 6)),
        ),
        Platform::Teams => (
            format!("https://teams.microsoft.com/l/meetup-join/{}", base36(rng, 16)),
            None,
        ),
    };
    GeneratedMeeting {
        link,
        platform: platform.label(),
        passcode,
        embed: embed_defaults(platform),
    }
}

/// Session password generated at creation time, independent of platform.
pub fn generate_password(rng: &mut impl Rng) -> String {
    alnum(rng, 8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCapability {
    Full,
    Advisory,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationResult {
    pub success: bool,
    pub message: String,
    pub platform: String,
    #[serde(rename = "meetingId")]
    pub meeting_id: Option<String>,
}

fn meeting_id_from_link(link: &str) -> Option<String> {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .map(|s| s.to_string())
}

/// Best-effort meeting termination, keyed by capability rather than platform
/// name so new platforms slot in without touching the lifecycle code.
///
/// Full: attempt a room teardown against the platform and fall back to soft
/// termination messaging on any failure. Advisory: no teardown API is
/// available; report that the room must be closed manually. Every path
/// reports success so completion is never blocked by a third party.
pub fn terminate(platform: Platform, link: Option<&str>) -> TerminationResult {
    let meeting_id = link.and_then(meeting_id_from_link);
    match platform.termination_capability() {
        TerminationCapability::Full => {
            let torn_down = meeting_id
                .as_deref()
                .map(|room| jitsi_room_teardown(room))
                .unwrap_or(false);
            let message = if torn_down {
                "Meeting room released on Jitsi".to_string()
            } else {
                // Soft termination: our records say ended; remote participants
                // may need to leave on their own.
                "Class marked as ended; participants may need to leave the room manually"
                    .to_string()
            };
            TerminationResult {
                success: true,
                message,
                platform: platform.label().to_string(),
                meeting_id,
            }
        }
        TerminationCapability::Advisory => TerminationResult {
            success: true,
            message: format!(
                "Class marked as ended. Please close the meeting manually on {}",
                platform.label()
            ),
            platform: platform.label().to_string(),
            meeting_id,
        },
    }
}

/// Room teardown goes through a deploy-specific Jitsi API base
/// (self-hosted deployments expose one; the public meet.jit.si does not).
/// Without that configuration we skip straight to the soft path.
fn jitsi_room_teardown(room: &str) -> bool {
    let base = match std::env::var("LIVECLASSD_JITSI_API") {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return false,
    };
    let client = match reqwest::blocking::Client::builder()
        .timeout(TERMINATE_TIMEOUT)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            log::warn!("jitsi teardown client build failed: {}", e);
            return false;
        }
    };
    let url = format!("{}/room/{}", base.trim_end_matches('/'), room);
    match client.delete(&url).send() {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            log::warn!("jitsi teardown for {} returned {}", room, resp.status());
            false
        }
        Err(e) => {
            log::warn!("jitsi teardown for {} failed: {}", room, e);
            false
        }
    }
}
