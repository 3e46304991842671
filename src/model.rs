use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Grow the span by `pad` on both sides.
    pub fn padded(&self, pad: Ms) -> Span {
        Span::new(self.start - pad, self.end + pad)
    }
}

// ── Working-hour template ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<chrono::Weekday> for DayOfWeek {
    fn from(w: chrono::Weekday) -> Self {
        match w {
            chrono::Weekday::Mon => DayOfWeek::Mon,
            chrono::Weekday::Tue => DayOfWeek::Tue,
            chrono::Weekday::Wed => DayOfWeek::Wed,
            chrono::Weekday::Thu => DayOfWeek::Thu,
            chrono::Weekday::Fri => DayOfWeek::Fri,
            chrono::Weekday::Sat => DayOfWeek::Sat,
            chrono::Weekday::Sun => DayOfWeek::Sun,
        }
    }
}

/// An open block of clock time, `HH:MM-HH:MM`, in minutes since local midnight.
/// `end` may be 1440 (24:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockBlock {
    pub start_min: u32,
    pub end_min: u32,
}

impl ClockBlock {
    pub fn new(start_min: u32, end_min: u32) -> Result<Self, String> {
        if end_min > 24 * 60 {
            return Err(format!("block end {end_min} past 24:00"));
        }
        if start_min >= end_min {
            return Err(format!(
                "block start {} must be before end {}",
                fmt_clock(start_min),
                fmt_clock(end_min)
            ));
        }
        Ok(Self { start_min, end_min })
    }
}

fn parse_clock(s: &str) -> Result<u32, String> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("bad clock time: {s}"))?;
    let h: u32 = h.parse().map_err(|_| format!("bad hour in {s}"))?;
    let m: u32 = m.parse().map_err(|_| format!("bad minute in {s}"))?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(format!("clock time out of range: {s}"));
    }
    Ok(h * 60 + m)
}

fn fmt_clock(min: u32) -> String {
    format!("{:02}:{:02}", min / 60, min % 60)
}

impl FromStr for ClockBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got {s}"))?;
        ClockBlock::new(parse_clock(a)?, parse_clock(b)?)
    }
}

impl TryFrom<String> for ClockBlock {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClockBlock> for String {
    fn from(b: ClockBlock) -> String {
        b.to_string()
    }
}

impl fmt::Display for ClockBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", fmt_clock(self.start_min), fmt_clock(self.end_min))
    }
}

/// Weekly template: day → open blocks in host-local time. Missing days are closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingHours(pub BTreeMap<DayOfWeek, Vec<ClockBlock>>);

impl WorkingHours {
    /// Parse `{"mon": ["09:00-17:00"], ...}`. Blocks are sorted and must not overlap.
    pub fn from_json(s: &str) -> Result<Self, String> {
        let mut wh: WorkingHours =
            serde_json::from_str(s).map_err(|e| format!("bad working_hours: {e}"))?;
        for (day, blocks) in wh.0.iter_mut() {
            blocks.sort_by_key(|b| b.start_min);
            if blocks.len() > crate::limits::MAX_BLOCKS_PER_DAY {
                return Err(format!("too many blocks on {day:?}"));
            }
            if blocks.windows(2).any(|w| w[1].start_min < w[0].end_min) {
                return Err(format!("overlapping blocks on {day:?}"));
            }
        }
        Ok(wh)
    }

    pub fn blocks_for(&self, day: DayOfWeek) -> &[ClockBlock] {
        self.0.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

// ── Host configuration ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingProfile {
    pub host_id: Ulid,
    /// IANA timezone name, validated on write.
    pub timezone: String,
    pub working_hours: WorkingHours,
    pub slot_minutes: u32,
    pub buffer_minutes: u32,
    pub min_notice_minutes: u32,
    /// Attached calendars; the first one receives mirrored events.
    pub calendars: Vec<String>,
    /// Reminder offsets in minutes before start, passed through to notifications.
    pub reminders: Vec<u32>,
}

impl SchedulingProfile {
    pub fn primary_calendar(&self) -> Option<&str> {
        self.calendars.first().map(String::as_str)
    }
}

/// A booking link's override of the profile. `None` fields fall back to the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: Ulid,
    pub host_id: Ulid,
    pub slug: String,
    pub title: Option<String>,
    pub duration_minutes: Option<u32>,
    pub buffer_minutes: Option<u32>,
    pub min_notice_minutes: Option<u32>,
    pub working_hours: Option<WorkingHours>,
    pub requires_confirmation: bool,
}

// ── Bookings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Confirmed,
    Canceled,
}

impl BookingStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BookingSource {
    #[default]
    Direct,
    PublicLink,
    AutomatedAgent,
}

impl BookingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingSource::Direct => "direct",
            BookingSource::PublicLink => "public-link",
            BookingSource::AutomatedAgent => "automated-agent",
        }
    }
}

impl FromStr for BookingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(BookingSource::Direct),
            "public-link" | "public_link" | "link" => Ok(BookingSource::PublicLink),
            "automated-agent" | "automated_agent" | "agent" => Ok(BookingSource::AutomatedAgent),
            other => Err(format!("unknown booking source: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl Guest {
    /// Normalized identity the action tokens are bound to.
    pub fn identity(&self) -> String {
        self.email.trim().to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleEntry {
    pub start: Ms,
    pub end: Ms,
    pub changed_at: Ms,
}

/// Outcome of mirroring a booking onto the host's primary calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MirrorStatus {
    #[default]
    None,
    Mirrored,
    /// The provider write failed; left for out-of-band reconciliation.
    Failed,
}

impl MirrorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorStatus::None => "none",
            MirrorStatus::Mirrored => "mirrored",
            MirrorStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub host_id: Ulid,
    pub event_type_id: Option<Ulid>,
    pub guest: Guest,
    pub span: Span,
    /// Display timezone of the guest.
    pub timezone: String,
    pub status: BookingStatus,
    pub source: BookingSource,
    pub reschedule_count: u32,
    pub history: Vec<RescheduleEntry>,
    pub consumed_nonces: BTreeSet<Ulid>,
    pub external_event_id: Option<String>,
    /// Calendar holding `external_event_id`.
    pub external_calendar_id: Option<String>,
    pub mirror_status: MirrorStatus,
    pub created_at: Ms,
    pub canceled_at: Option<Ms>,
    /// Bumped on every applied transition.
    pub version: u64,
}

/// WAL record format. Flat where possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfileUpserted {
        profile: SchedulingProfile,
    },
    EventTypeCreated {
        event_type: EventType,
    },
    EventTypeUpdated {
        event_type: EventType,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingConfirmed {
        id: Ulid,
        host_id: Ulid,
    },
    BookingRescheduled {
        id: Ulid,
        host_id: Ulid,
        span: Span,
        changed_at: Ms,
        consumed_nonce: Ulid,
    },
    BookingCanceled {
        id: Ulid,
        host_id: Ulid,
        consumed_nonce: Ulid,
        canceled_at: Ms,
    },
    BookingMirrored {
        id: Ulid,
        host_id: Ulid,
        external_event_id: Option<String>,
        calendar_id: Option<String>,
        status: MirrorStatus,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProfileUpserted { .. } => "profile_upserted",
            Event::EventTypeCreated { .. } => "event_type_created",
            Event::EventTypeUpdated { .. } => "event_type_updated",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingConfirmed { .. } => "booking_confirmed",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
            Event::BookingCanceled { .. } => "booking_canceled",
            Event::BookingMirrored { .. } => "booking_mirrored",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// What the guest gets back from a create or reschedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking: Booking,
    /// Only minted on create; a reschedule leaves the cancel token untouched.
    pub cancel_token: Option<String>,
    pub reschedule_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert_eq!(s.padded(10), Span::new(90, 210));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn clock_block_parse() {
        let b: ClockBlock = "09:00-17:30".parse().unwrap();
        assert_eq!(b.start_min, 9 * 60);
        assert_eq!(b.end_min, 17 * 60 + 30);
        assert_eq!(b.to_string(), "09:00-17:30");

        let full: ClockBlock = "00:00-24:00".parse().unwrap();
        assert_eq!(full.end_min, 1440);
    }

    #[test]
    fn clock_block_rejects_garbage() {
        assert!("17:00-09:00".parse::<ClockBlock>().is_err());
        assert!("09:00".parse::<ClockBlock>().is_err());
        assert!("09:60-10:00".parse::<ClockBlock>().is_err());
        assert!("24:30-25:00".parse::<ClockBlock>().is_err());
    }

    #[test]
    fn working_hours_from_json() {
        let wh = WorkingHours::from_json(r#"{"mon": ["13:00-17:00", "09:00-12:00"], "fri": []}"#)
            .unwrap();
        let mon = wh.blocks_for(DayOfWeek::Mon);
        assert_eq!(mon.len(), 2);
        assert_eq!(mon[0].start_min, 9 * 60); // sorted
        assert!(wh.blocks_for(DayOfWeek::Fri).is_empty());
        assert!(wh.blocks_for(DayOfWeek::Sun).is_empty());
    }

    #[test]
    fn working_hours_rejects_overlap() {
        let err = WorkingHours::from_json(r#"{"tue": ["09:00-12:00", "11:00-13:00"]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn booking_source_parse() {
        assert_eq!("agent".parse::<BookingSource>().unwrap(), BookingSource::AutomatedAgent);
        assert_eq!("public-link".parse::<BookingSource>().unwrap(), BookingSource::PublicLink);
        assert!("carrier-pigeon".parse::<BookingSource>().is_err());
    }

    #[test]
    fn guest_identity_normalized() {
        let g = Guest {
            name: "Ada".into(),
            email: "  Ada@Example.COM ".into(),
            phone: None,
        };
        assert_eq!(g.identity(), "ada@example.com");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ProfileUpserted {
            profile: SchedulingProfile {
                host_id: Ulid::new(),
                timezone: "Europe/Berlin".into(),
                working_hours: WorkingHours::from_json(r#"{"mon": ["09:00-17:00"]}"#).unwrap(),
                slot_minutes: 30,
                buffer_minutes: 0,
                min_notice_minutes: 0,
                calendars: vec!["primary".into()],
                reminders: vec![60],
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
