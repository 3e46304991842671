use ulid::Ulid;

use crate::model::*;

use super::availability::{EffectiveRules, filter_slots, generate_slots, parse_date, parse_tz};
use super::busy::{BusyResolution, resolve_busy};
use super::{Engine, EngineError, SharedBooking};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityRequest {
    pub host_id: Ulid,
    /// `YYYY-MM-DD` in the guest's timezone.
    pub date: String,
    pub timezone: Option<String>,
    pub duration_minutes: Option<u32>,
    pub event_type: Option<String>,
}

/// Free slots for one guest-local day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub slots: Vec<Span>,
    /// Calendars that didn't answer; their busy time is missing from `slots`.
    pub unknown_sources: Vec<String>,
    pub timezone: String,
}

impl Engine {
    pub fn get_profile(&self, host_id: &Ulid) -> Result<SchedulingProfile, EngineError> {
        self.profiles
            .get(host_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::not_found("profile for host", host_id))
    }

    pub(super) fn event_type_by_slug(&self, host_id: Ulid, slug: &str) -> Result<EventType, EngineError> {
        let id = self
            .slugs
            .get(&(host_id, slug.to_string()))
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::not_found("event type", slug))?;
        self.event_types
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("event type", slug))
    }

    pub async fn compute_availability(&self, req: &AvailabilityRequest) -> Result<Availability, EngineError> {
        let profile = self.get_profile(&req.host_id)?;
        let event_type = req
            .event_type
            .as_deref()
            .map(|slug| self.event_type_by_slug(req.host_id, slug))
            .transpose()?;
        let rules = EffectiveRules::resolve(&profile, event_type.as_ref())?;
        let date = parse_date(&req.date)?;
        let timezone = req
            .timezone
            .as_deref()
            .map(str::trim)
            .unwrap_or(profile.timezone.as_str())
            .to_string();
        let guest_tz = parse_tz(&timezone)?;
        let duration = req.duration_minutes.unwrap_or(rules.duration_minutes);

        let candidates = generate_slots(&rules, date, guest_tz, duration, self.now())?;
        let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
            return Ok(Availability {
                slots: Vec::new(),
                unknown_sources: Vec::new(),
                timezone,
            });
        };

        let window = Span::new(first.start, last.end).padded(rules.buffer_ms());
        let busy = self.busy_for(&profile, &rules, window, None, &[]).await;
        Ok(Availability {
            slots: filter_slots(&candidates, &busy.busy),
            unknown_sources: busy.unknown,
            timezone,
        })
    }

    /// External busy time plus the host's own active bookings (padded by the
    /// buffer), minus `exclude`.
    pub(super) async fn busy_for(
        &self,
        profile: &SchedulingProfile,
        rules: &EffectiveRules,
        window: Span,
        exclude: Option<Ulid>,
        ignore: &[Span],
    ) -> BusyResolution {
        let buffer = rules.buffer_ms();
        let mut own = Vec::new();
        for shared in self.host_handles(&profile.host_id) {
            let b = shared.read().await;
            if b.status.is_active() && Some(b.id) != exclude {
                own.push(b.span.padded(buffer));
            }
        }
        resolve_busy(
            self.services.calendar.as_ref(),
            &profile.calendars,
            window,
            self.services.calendar_timeout,
            &own,
            ignore,
        )
        .await
    }

    fn host_handles(&self, host_id: &Ulid) -> Vec<SharedBooking> {
        let Some(ids) = self.host_bookings.get(host_id).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.booking_handle(id)).collect()
    }

    pub async fn get_booking(&self, id: &Ulid) -> Result<Booking, EngineError> {
        let shared = self
            .booking_handle(id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let b = shared.read().await;
        Ok(b.clone())
    }

    /// A host's bookings in start order.
    pub async fn list_bookings(&self, host_id: &Ulid, active_only: bool) -> Vec<Booking> {
        let mut out = Vec::new();
        for shared in self.host_handles(host_id) {
            let b = shared.read().await;
            if !active_only || b.status.is_active() {
                out.push(b.clone());
            }
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    pub fn list_event_types(&self, host_id: &Ulid) -> Vec<EventType> {
        let mut out: Vec<EventType> = self
            .event_types
            .iter()
            .filter(|e| e.host_id == *host_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        out
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}
