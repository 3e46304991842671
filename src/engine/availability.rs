use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::model::*;

use super::EngineError;

// ── Rule resolution ───────────────────────────────────────────────

/// Profile and event type collapsed into the values availability runs on.
#[derive(Debug, Clone)]
pub struct EffectiveRules {
    pub tz: Tz,
    pub working_hours: WorkingHours,
    pub duration_minutes: u32,
    pub buffer_minutes: u32,
    pub min_notice_minutes: u32,
}

impl EffectiveRules {
    /// Event-type overrides win field by field; unset fields fall back to the profile.
    pub fn resolve(
        profile: &SchedulingProfile,
        event_type: Option<&EventType>,
    ) -> Result<Self, EngineError> {
        let tz = parse_tz(&profile.timezone)?;
        let pick = |over: Option<u32>, base: u32| over.unwrap_or(base);
        let rules = match event_type {
            Some(et) => Self {
                tz,
                working_hours: et
                    .working_hours
                    .clone()
                    .unwrap_or_else(|| profile.working_hours.clone()),
                duration_minutes: pick(et.duration_minutes, profile.slot_minutes),
                buffer_minutes: pick(et.buffer_minutes, profile.buffer_minutes),
                min_notice_minutes: pick(et.min_notice_minutes, profile.min_notice_minutes),
            },
            None => Self {
                tz,
                working_hours: profile.working_hours.clone(),
                duration_minutes: profile.slot_minutes,
                buffer_minutes: profile.buffer_minutes,
                min_notice_minutes: profile.min_notice_minutes,
            },
        };
        Ok(rules)
    }

    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }

    pub fn buffer_ms(&self) -> Ms {
        self.buffer_minutes as Ms * MINUTE_MS
    }

    pub fn min_notice_ms(&self) -> Ms {
        self.min_notice_minutes as Ms * MINUTE_MS
    }
}

pub fn parse_tz(name: &str) -> Result<Tz, EngineError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| EngineError::invalid(format!("unknown timezone '{name}'")))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(format!("bad date '{s}', expected YYYY-MM-DD")))
}

// ── Local ↔ UTC ──────────────────────────────────────────────────

/// Map a local wall-clock time to UTC. Nonexistent times give `None`,
/// ambiguous ones take the earlier instant.
fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> Option<Ms> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

fn utc_to_local(tz: Tz, ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&tz).naive_local())
}

/// First instant of `date` in `tz`. Some zones skip midnight on DST days, so
/// walk forward until a wall-clock time exists.
fn start_of_day(tz: Tz, date: NaiveDate) -> Option<Ms> {
    let midnight = date.and_time(NaiveTime::MIN);
    (0..=16).find_map(|step| local_to_utc(tz, midnight + TimeDelta::minutes(15 * step)))
}

// ── Slot generation ──────────────────────────────────────────────

/// Candidate slots for `date` as seen in `guest_tz`, in chronological order.
///
/// Slots are laid out in host-local time: from each block's start, emit a
/// `duration` slot and advance by `duration + buffer` while the slot still
/// ends inside the block. Conversion to UTC happens per slot. Slots whose
/// local start does not exist are dropped. Only slots starting inside the
/// guest's day and no earlier than `now + min_notice` survive.
pub fn generate_slots(
    rules: &EffectiveRules,
    date: NaiveDate,
    guest_tz: Tz,
    duration_minutes: u32,
    now: Ms,
) -> Result<Vec<Span>, EngineError> {
    if duration_minutes == 0 {
        return Err(EngineError::invalid("duration must be positive"));
    }
    if duration_minutes > crate::limits::MAX_SLOT_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    let next = date
        .succ_opt()
        .ok_or_else(|| EngineError::invalid("date out of range"))?;
    let (Some(window_start), Some(window_end)) =
        (start_of_day(guest_tz, date), start_of_day(guest_tz, next))
    else {
        return Err(EngineError::invalid("date out of range"));
    };
    let earliest_start = now.saturating_add(rules.min_notice_ms());
    let duration_ms = duration_minutes as Ms * MINUTE_MS;
    let step = (duration_minutes + rules.buffer_minutes) as i64;

    let (Some(first), Some(last)) = (
        utc_to_local(rules.tz, window_start),
        utc_to_local(rules.tz, window_end - 1),
    ) else {
        return Ok(Vec::new());
    };

    let mut slots = Vec::new();
    let mut host_date = first.date();
    while host_date <= last.date() {
        let midnight = host_date.and_time(NaiveTime::MIN);
        for block in rules.working_hours.blocks_for(host_date.weekday().into()) {
            let mut cursor = block.start_min as i64;
            while cursor + duration_minutes as i64 <= block.end_min as i64 {
                let local = midnight + TimeDelta::minutes(cursor);
                cursor += step;
                let Some(start) = local_to_utc(rules.tz, local) else {
                    continue;
                };
                if start < window_start || start >= window_end || start < earliest_start {
                    continue;
                }
                slots.push(Span::new(start, start + duration_ms));
            }
        }
        let Some(d) = host_date.succ_opt() else { break };
        host_date = d;
    }

    slots.sort_by_key(|s| s.start);
    slots.dedup();
    Ok(slots)
}

/// True when `span` starts at a real local time and ends inside one working block.
pub fn fits_working_block(rules: &EffectiveRules, span: &Span) -> bool {
    let Some(local) = utc_to_local(rules.tz, span.start) else {
        return false;
    };
    // Round trip rejects instants that land in a fold's second pass
    if local_to_utc(rules.tz, local) != Some(span.start) {
        return false;
    }
    let start_s = local.time().num_seconds_from_midnight() as i64;
    let end_s = start_s + (span.duration_ms() + 999) / 1000;
    rules
        .working_hours
        .blocks_for(local.date().weekday().into())
        .iter()
        .any(|b| b.start_min as i64 * 60 <= start_s && end_s <= b.end_min as i64 * 60)
}

/// True when `span` is a slot `generate_slots` would lay out: exactly the
/// effective duration, starting on the `duration + buffer` grid of a block.
pub fn is_offered_slot(rules: &EffectiveRules, span: &Span) -> bool {
    if span.duration_ms() != rules.duration_ms() || !fits_working_block(rules, span) {
        return false;
    }
    let Some(local) = utc_to_local(rules.tz, span.start) else {
        return false;
    };
    let time = local.time();
    if time.second() != 0 || time.nanosecond() != 0 {
        return false;
    }
    let start_min = (time.hour() * 60 + time.minute()) as i64;
    let step = (rules.duration_minutes + rules.buffer_minutes) as i64;
    rules
        .working_hours
        .blocks_for(local.date().weekday().into())
        .iter()
        .any(|b| {
            let offset = start_min - b.start_min as i64;
            offset >= 0
                && offset % step == 0
                && start_min + rules.duration_minutes as i64 <= b.end_min as i64
        })
}

// ── Interval helpers ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Drop candidates that intersect any busy interval. Both inputs sorted by
/// start; `busy` merged. Linear in the sum of lengths.
pub fn filter_slots(candidates: &[Span], busy: &[Span]) -> Vec<Span> {
    let mut out = Vec::with_capacity(candidates.len());
    let mut bi = 0;
    for slot in candidates {
        while bi < busy.len() && busy[bi].end <= slot.start {
            bi += 1;
        }
        let blocked = busy[bi..]
            .iter()
            .take_while(|b| b.start < slot.end)
            .any(|b| b.overlaps(slot));
        if !blocked {
            out.push(*slot);
        }
    }
    out
}
