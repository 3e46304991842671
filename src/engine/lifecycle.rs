use std::collections::BTreeSet;
use std::future::Future;

use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::{CalendarError, MirrorEvent};
use crate::limits::*;
use crate::model::*;
use crate::notify::NoticeTokens;
use crate::observability as obs;
use crate::token::{TokenClaims, TokenPurpose, TokenSigner};

use super::availability::{
    EffectiveRules, filter_slots, fits_working_block, is_offered_slot, parse_tz,
};
use super::conflict::validate_span;
use super::{Engine, EngineError, SharedBooking};

/// A guest's request for a specific interval.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub host_id: Ulid,
    /// Event type slug; the profile's defaults apply when absent.
    pub event_type: Option<String>,
    pub span: Span,
    pub guest: Guest,
    /// Guest display timezone; defaults to the host's.
    pub timezone: Option<String>,
    pub source: BookingSource,
}

// ── Input validation ─────────────────────────────────────────────

fn validate_profile(p: &SchedulingProfile) -> Result<(), EngineError> {
    parse_tz(&p.timezone)?;
    if p.slot_minutes == 0 {
        return Err(EngineError::invalid("slot_minutes must be positive"));
    }
    if p.slot_minutes > MAX_SLOT_MINUTES {
        return Err(EngineError::LimitExceeded("slot_minutes too large"));
    }
    if p.buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::LimitExceeded("buffer_minutes too large"));
    }
    if p.min_notice_minutes > MAX_NOTICE_MINUTES {
        return Err(EngineError::LimitExceeded("min_notice_minutes too large"));
    }
    if p.calendars.len() > MAX_CALENDARS_PER_PROFILE {
        return Err(EngineError::LimitExceeded("too many calendars"));
    }
    if p
        .calendars
        .iter()
        .any(|c| c.is_empty() || c.len() > MAX_CALENDAR_ID_LEN)
    {
        return Err(EngineError::invalid("bad calendar id"));
    }
    if p.reminders.len() > MAX_REMINDERS {
        return Err(EngineError::LimitExceeded("too many reminders"));
    }
    validate_hours(&p.working_hours)
}

fn validate_hours(wh: &WorkingHours) -> Result<(), EngineError> {
    for (day, blocks) in &wh.0 {
        if blocks.len() > MAX_BLOCKS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many blocks in a day"));
        }
        if blocks.windows(2).any(|w| w[1].start_min < w[0].end_min) {
            return Err(EngineError::invalid(format!(
                "blocks on {day:?} must be sorted and disjoint"
            )));
        }
    }
    Ok(())
}

fn validate_slug(slug: &str) -> Result<(), EngineError> {
    if slug.is_empty() {
        return Err(EngineError::invalid("slug required"));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(EngineError::LimitExceeded("slug too long"));
    }
    if !slug
        .bytes()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-')
    {
        return Err(EngineError::invalid(format!(
            "slug '{slug}' may only hold a-z, 0-9 and '-'"
        )));
    }
    Ok(())
}

fn validate_event_type(et: &EventType) -> Result<(), EngineError> {
    validate_slug(&et.slug)?;
    if et.title.as_ref().is_some_and(|t| t.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    match et.duration_minutes {
        Some(0) => return Err(EngineError::invalid("duration_minutes must be positive")),
        Some(d) if d > MAX_SLOT_MINUTES => {
            return Err(EngineError::LimitExceeded("duration_minutes too large"));
        }
        _ => {}
    }
    if et.buffer_minutes.is_some_and(|b| b > MAX_BUFFER_MINUTES) {
        return Err(EngineError::LimitExceeded("buffer_minutes too large"));
    }
    if et.min_notice_minutes.is_some_and(|n| n > MAX_NOTICE_MINUTES) {
        return Err(EngineError::LimitExceeded("min_notice_minutes too large"));
    }
    if let Some(wh) = &et.working_hours {
        validate_hours(wh)?;
    }
    Ok(())
}

fn validate_guest(guest: Guest) -> Result<Guest, EngineError> {
    let name = guest.name.trim().to_string();
    let email = guest.email.trim().to_string();
    if name.is_empty() {
        return Err(EngineError::invalid("guest name required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("guest name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("guest email too long"));
    }
    let plausible = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty()
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
    });
    if !plausible {
        return Err(EngineError::invalid(format!("bad guest email '{email}'")));
    }
    let phone = guest
        .phone
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    if let Some(p) = &phone
        && (p.len() > 32
            || !p
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')')))
    {
        return Err(EngineError::invalid(format!("bad guest phone '{p}'")));
    }
    Ok(Guest { name, email, phone })
}

fn mirror_event(booking: &Booking, title: Option<&str>) -> MirrorEvent {
    MirrorEvent {
        booking_id: booking.id,
        span: booking.span,
        summary: format!("{} with {}", title.unwrap_or("Meeting"), booking.guest.name),
        attendee_email: booking.guest.email.clone(),
    }
}

impl Engine {
    // ── Host configuration ───────────────────────────────────────

    pub async fn upsert_profile(&self, profile: SchedulingProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let _commit = self.commit_gate.read().await;
        self.wal_append(&Event::ProfileUpserted {
            profile: profile.clone(),
        })
        .await?;
        info!(host = %profile.host_id, tz = %profile.timezone, "profile upserted");
        self.profiles.insert(profile.host_id, profile);
        Ok(())
    }

    pub async fn create_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        validate_event_type(&event_type)?;
        if !self.profiles.contains_key(&event_type.host_id) {
            return Err(EngineError::not_found("profile for host", event_type.host_id));
        }
        if self.event_types.contains_key(&event_type.id) {
            return Err(EngineError::invalid(format!(
                "event type {} already exists",
                event_type.id
            )));
        }
        let per_host = self
            .event_types
            .iter()
            .filter(|e| e.host_id == event_type.host_id)
            .count();
        if per_host >= MAX_EVENT_TYPES_PER_HOST {
            return Err(EngineError::LimitExceeded("too many event types"));
        }

        let key = (event_type.host_id, event_type.slug.clone());
        match self.slugs.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::invalid(format!(
                    "slug '{}' already in use",
                    event_type.slug
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(event_type.id);
            }
        }

        let _commit = self.commit_gate.read().await;
        let event = Event::EventTypeCreated {
            event_type: event_type.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.slugs.remove(&key);
            return Err(e);
        }
        info!(host = %event_type.host_id, slug = %event_type.slug, "event type created");
        self.event_types.insert(event_type.id, event_type);
        Ok(())
    }

    /// Replace an event type's settings. The slug cannot change.
    pub async fn update_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        validate_event_type(&event_type)?;
        let current = self
            .event_types
            .get(&event_type.id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::not_found("event type", event_type.id))?;
        if current.host_id != event_type.host_id {
            return Err(EngineError::invalid("event type belongs to another host"));
        }
        if current.slug != event_type.slug {
            return Err(EngineError::invalid(format!(
                "slug is immutable (is '{}')",
                current.slug
            )));
        }

        let _commit = self.commit_gate.read().await;
        self.wal_append(&Event::EventTypeUpdated {
            event_type: event_type.clone(),
        })
        .await?;
        self.event_types.insert(event_type.id, event_type);
        Ok(())
    }

    // ── Booking lifecycle ────────────────────────────────────────

    pub async fn create_booking(&self, req: NewBooking) -> Result<BookingReceipt, EngineError> {
        validate_span(&req.span)?;
        let guest = validate_guest(req.guest)?;
        let profile = self.get_profile(&req.host_id)?;
        let event_type = req
            .event_type
            .as_deref()
            .map(|slug| self.event_type_by_slug(req.host_id, slug))
            .transpose()?;
        let rules = EffectiveRules::resolve(&profile, event_type.as_ref())?;
        let timezone = match req.timezone {
            Some(tz) => {
                parse_tz(&tz)?;
                tz.trim().to_string()
            }
            None => profile.timezone.clone(),
        };
        let now = self.now();
        self.check_slot_rules(&rules, &req.span, now)?;
        if self.bookings.len() >= MAX_BOOKINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        self.ensure_free(&profile, &rules, req.span, None).await?;

        let id = Ulid::new();
        let host_id = req.host_id;
        let status = if event_type.as_ref().is_some_and(|e| e.requires_confirmation) {
            BookingStatus::Scheduled
        } else {
            BookingStatus::Confirmed
        };
        let booking = Booking {
            id,
            host_id,
            event_type_id: event_type.as_ref().map(|e| e.id),
            guest,
            span: req.span,
            timezone,
            status,
            source: req.source,
            reschedule_count: 0,
            history: Vec::new(),
            consumed_nonces: BTreeSet::new(),
            external_event_id: None,
            external_calendar_id: None,
            mirror_status: MirrorStatus::None,
            created_at: now,
            canceled_at: None,
            version: 1,
        };

        {
            let _commit = self.commit_gate.read().await;
            if let Err(e) = self.ledger.claim(host_id, id, req.span, rules.buffer_ms()) {
                metrics::counter!(obs::SLOT_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
            let event = Event::BookingCreated {
                booking: booking.clone(),
            };
            if let Err(e) = self.wal_append(&event).await {
                self.ledger.release(host_id, id);
                return Err(e);
            }
            self.insert_booking(booking.clone());
        }
        metrics::counter!(obs::BOOKINGS_CREATED_TOTAL, "source" => booking.source.as_str())
            .increment(1);
        info!(booking = %id, host = %host_id, start = booking.span.start, "booking created");

        let identity = booking.guest.identity();
        let signer = &self.services.signer;
        let cancel_token = signer.issue(id, TokenPurpose::Cancel, &identity, Ulid::new(), now);
        let reschedule_token =
            signer.issue(id, TokenPurpose::Reschedule, &identity, Ulid::new(), now);

        let title = event_type.as_ref().and_then(|e| e.title.as_deref());
        let booking = self.mirror_created(&profile, booking, title).await;

        let tokens = NoticeTokens {
            cancel: Some(cancel_token.clone()),
            reschedule: Some(reschedule_token.clone()),
        };
        if let Err(e) = self
            .services
            .dispatcher
            .send_created(&booking, &tokens, &profile.reminders)
            .await
        {
            warn!(booking = %id, "created notice not sent: {e}");
            metrics::counter!(obs::DISPATCH_FAILURES_TOTAL).increment(1);
        }

        Ok(BookingReceipt {
            booking,
            cancel_token: Some(cancel_token),
            reschedule_token,
        })
    }

    /// Host approval of a booking made through a confirmation-gated event type.
    pub async fn confirm_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let shared = self
            .booking_handle(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        let _commit = self.commit_gate.read().await;
        let mut guard = shared.write().await;
        match guard.status {
            BookingStatus::Canceled => return Err(EngineError::BookingAlreadyTerminal(booking_id)),
            BookingStatus::Confirmed => return Ok(guard.clone()),
            BookingStatus::Scheduled => {}
        }
        let event = Event::BookingConfirmed {
            id: booking_id,
            host_id: guard.host_id,
        };
        self.persist_booking(&mut guard, &event).await?;
        info!(booking = %booking_id, "booking confirmed");
        Ok(guard.clone())
    }

    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        token: &str,
        new_span: Span,
    ) -> Result<BookingReceipt, EngineError> {
        let (claims, shared) = self.open_token(booking_id, token, TokenPurpose::Reschedule)?;
        let snapshot = shared.read().await.clone();
        let now = self.now();
        self.authorize(&snapshot, &claims, now)?;
        if snapshot.reschedule_count >= MAX_RESCHEDULES {
            return Err(EngineError::RescheduleBudgetExhausted(MAX_RESCHEDULES));
        }

        validate_span(&new_span)?;
        let profile = self.get_profile(&snapshot.host_id)?;
        let event_type = snapshot
            .event_type_id
            .and_then(|id| self.event_types.get(&id).map(|e| e.value().clone()));
        let rules = EffectiveRules::resolve(&profile, event_type.as_ref())?;
        self.check_slot_rules(&rules, &new_span, now)?;
        self.ensure_free(&profile, &rules, new_span, Some(&snapshot)).await?;

        let booking = {
            let _commit = self.commit_gate.read().await;
            let mut guard = shared.write().await;
            // Calendars were consulted without the lock; the booking may have
            // moved on since.
            self.authorize(&guard, &claims, now)?;
            if guard.reschedule_count >= MAX_RESCHEDULES {
                return Err(EngineError::RescheduleBudgetExhausted(MAX_RESCHEDULES));
            }
            let old_span = guard.span;
            let buffer = rules.buffer_ms();
            if let Err(e) = self.ledger.begin_move(guard.host_id, booking_id, new_span, buffer) {
                metrics::counter!(obs::SLOT_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
            let event = Event::BookingRescheduled {
                id: booking_id,
                host_id: guard.host_id,
                span: new_span,
                changed_at: now,
                consumed_nonce: claims.nonce,
            };
            if let Err(e) = self.persist_booking(&mut guard, &event).await {
                warn!(booking = %booking_id, "reschedule not persisted, keeping old slot: {e}");
                self.ledger.settle_move(guard.host_id, booking_id, old_span);
                return Err(e);
            }
            self.ledger.settle_move(guard.host_id, booking_id, new_span);
            guard.clone()
        };
        metrics::counter!(obs::BOOKINGS_RESCHEDULED_TOTAL).increment(1);
        info!(
            booking = %booking_id,
            count = booking.reschedule_count,
            start = booking.span.start,
            "booking rescheduled"
        );

        let reschedule_token = self.services.signer.issue(
            booking_id,
            TokenPurpose::Reschedule,
            &booking.guest.identity(),
            Ulid::new(),
            now,
        );

        let title = event_type.as_ref().and_then(|e| e.title.as_deref());
        let booking = self.mirror_moved(&profile, booking, title).await;

        let tokens = NoticeTokens {
            cancel: None,
            reschedule: Some(reschedule_token.clone()),
        };
        if let Err(e) = self
            .services
            .dispatcher
            .send_rescheduled(&booking, &tokens, &profile.reminders)
            .await
        {
            warn!(booking = %booking_id, "rescheduled notice not sent: {e}");
            metrics::counter!(obs::DISPATCH_FAILURES_TOTAL).increment(1);
        }

        Ok(BookingReceipt {
            booking,
            cancel_token: None,
            reschedule_token,
        })
    }

    pub async fn cancel_booking(&self, booking_id: Ulid, token: &str) -> Result<Booking, EngineError> {
        let (claims, shared) = self.open_token(booking_id, token, TokenPurpose::Cancel)?;
        let now = self.now();

        let booking = {
            let _commit = self.commit_gate.read().await;
            let mut guard = shared.write().await;
            self.authorize(&guard, &claims, now)?;
            let event = Event::BookingCanceled {
                id: booking_id,
                host_id: guard.host_id,
                consumed_nonce: claims.nonce,
                canceled_at: now,
            };
            self.persist_booking(&mut guard, &event).await?;
            self.ledger.release(guard.host_id, booking_id);
            guard.clone()
        };
        metrics::counter!(obs::BOOKINGS_CANCELED_TOTAL).increment(1);
        info!(booking = %booking_id, "booking canceled");

        let booking = self.unmirror(booking).await;

        if let Err(e) = self.services.dispatcher.send_canceled(&booking).await {
            warn!(booking = %booking_id, "canceled notice not sent: {e}");
            metrics::counter!(obs::DISPATCH_FAILURES_TOTAL).increment(1);
        }
        Ok(booking)
    }

    // ── Token checks ─────────────────────────────────────────────

    /// Signature, purpose and booking binding. Nothing here needs the booking's state.
    fn open_token(
        &self,
        booking_id: Ulid,
        token: &str,
        purpose: TokenPurpose,
    ) -> Result<(TokenClaims, SharedBooking), EngineError> {
        let claims = self.services.signer.verify(token)?;
        if claims.purpose != purpose {
            return Err(EngineError::TokenInvalid("token purpose mismatch"));
        }
        if claims.booking_id != booking_id {
            return Err(EngineError::TokenInvalid("token not issued for this booking"));
        }
        let shared = self
            .booking_handle(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        Ok((claims, shared))
    }

    /// Guest binding, single use, terminal state, expiry. In that order.
    fn authorize(&self, booking: &Booking, claims: &TokenClaims, now: Ms) -> Result<(), EngineError> {
        if !self
            .services
            .signer
            .guest_matches(claims, &booking.guest.identity())
        {
            return Err(EngineError::TokenInvalid("token not issued to this guest"));
        }
        if booking.consumed_nonces.contains(&claims.nonce) {
            return Err(EngineError::TokenConsumed);
        }
        if booking.status == BookingStatus::Canceled {
            return Err(EngineError::BookingAlreadyTerminal(booking.id));
        }
        TokenSigner::check_expiry(claims, now)?;
        Ok(())
    }

    // ── Slot checks ──────────────────────────────────────────────

    fn check_slot_rules(&self, rules: &EffectiveRules, span: &Span, now: Ms) -> Result<(), EngineError> {
        if !fits_working_block(rules, span) {
            return Err(EngineError::invalid("interval is outside working hours"));
        }
        if !is_offered_slot(rules, span) {
            return Err(EngineError::invalid(format!(
                "interval is not one of the {} minute slots on offer",
                rules.duration_minutes
            )));
        }
        if span.start < now.saturating_add(rules.min_notice_ms()) {
            return Err(EngineError::invalid(format!(
                "interval starts inside the {} minute notice period",
                rules.min_notice_minutes
            )));
        }
        Ok(())
    }

    /// Commit-time check of one interval against live busy time. `moving` is
    /// the booking being rescheduled, whose own time does not count.
    async fn ensure_free(
        &self,
        profile: &SchedulingProfile,
        rules: &EffectiveRules,
        span: Span,
        moving: Option<&Booking>,
    ) -> Result<(), EngineError> {
        let ignore: Vec<Span> = moving
            .filter(|b| b.external_event_id.is_some())
            .map(|b| vec![b.span])
            .unwrap_or_default();
        let window = span.padded(rules.buffer_ms());
        let resolution = self
            .busy_for(profile, rules, window, moving.map(|b| b.id), &ignore)
            .await;
        if filter_slots(&[span], &resolution.busy).is_empty() {
            metrics::counter!(obs::SLOT_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotConflict);
        }
        Ok(())
    }

    // ── Calendar mirroring ───────────────────────────────────────

    async fn calendar_call<T>(
        &self,
        calendar: &str,
        call: impl Future<Output = Result<T, CalendarError>>,
    ) -> Result<T, CalendarError> {
        tokio::time::timeout(self.services.calendar_timeout, call)
            .await
            .unwrap_or_else(|_| Err(CalendarError::Timeout(calendar.to_string())))
    }

    async fn mirror_created(
        &self,
        profile: &SchedulingProfile,
        booking: Booking,
        title: Option<&str>,
    ) -> Booking {
        let Some(calendar) = profile.primary_calendar() else {
            return booking;
        };
        let event = mirror_event(&booking, title);
        let result = self
            .calendar_call(calendar, self.services.calendar.insert_event(calendar, &event))
            .await;
        match result {
            Ok(Some(external)) => {
                self.record_mirror(booking, Some(external), MirrorStatus::Mirrored, calendar)
                    .await
            }
            Ok(None) => booking,
            Err(e) => {
                warn!(booking = %booking.id, "mirror insert failed: {e}");
                metrics::counter!(obs::MIRROR_FAILURES_TOTAL).increment(1);
                self.record_mirror(booking, None, MirrorStatus::Failed, calendar)
                    .await
            }
        }
    }

    async fn mirror_moved(
        &self,
        profile: &SchedulingProfile,
        booking: Booking,
        title: Option<&str>,
    ) -> Booking {
        // An existing event moves within the calendar that holds it
        let held = booking
            .external_event_id
            .as_ref()
            .and(booking.external_calendar_id.clone());
        let Some(calendar) = held.or_else(|| profile.primary_calendar().map(str::to_string)) else {
            return booking;
        };
        let calendar = calendar.as_str();
        let event = mirror_event(&booking, title);
        let result = match booking.external_event_id.as_deref() {
            Some(external) => {
                self.calendar_call(
                    calendar,
                    self.services.calendar.move_event(calendar, external, &event),
                )
                .await
            }
            None => {
                self.calendar_call(calendar, self.services.calendar.insert_event(calendar, &event))
                    .await
            }
        };
        match result {
            Ok(Some(external)) => {
                self.record_mirror(booking, Some(external), MirrorStatus::Mirrored, calendar)
                    .await
            }
            Ok(None) if booking.external_event_id.is_none() => booking,
            Ok(None) => {
                self.record_mirror(booking, None, MirrorStatus::None, calendar)
                    .await
            }
            Err(e) => {
                warn!(booking = %booking.id, "mirror move failed: {e}");
                metrics::counter!(obs::MIRROR_FAILURES_TOTAL).increment(1);
                let keep = booking.external_event_id.clone();
                self.record_mirror(booking, keep, MirrorStatus::Failed, calendar)
                    .await
            }
        }
    }

    /// Delete a canceled booking's mirrored event. Runs at most once per
    /// booking: only the cancel that consumed the token gets here.
    async fn unmirror(&self, booking: Booking) -> Booking {
        let Some(external) = booking.external_event_id.clone() else {
            return booking;
        };
        let Some(calendar) = booking.external_calendar_id.clone().or_else(|| {
            self.profiles
                .get(&booking.host_id)
                .and_then(|p| p.primary_calendar().map(str::to_string))
        }) else {
            return booking;
        };
        let result = self
            .calendar_call(
                &calendar,
                self.services.calendar.delete_event(&calendar, &external),
            )
            .await;
        match result {
            Ok(()) => {
                self.record_mirror(booking, None, MirrorStatus::None, &calendar)
                    .await
            }
            Err(e) => {
                warn!(booking = %booking.id, "mirror delete failed: {e}");
                metrics::counter!(obs::MIRROR_FAILURES_TOTAL).increment(1);
                self.record_mirror(booking, Some(external), MirrorStatus::Failed, &calendar)
                    .await
            }
        }
    }

    /// Persist the outcome of a calendar write. The booking is already
    /// committed; failure to record is logged, never surfaced.
    async fn record_mirror(
        &self,
        fallback: Booking,
        external_event_id: Option<String>,
        status: MirrorStatus,
        calendar: &str,
    ) -> Booking {
        let Some(shared) = self.booking_handle(&fallback.id) else {
            return fallback;
        };
        {
            let _commit = self.commit_gate.read().await;
            let mut guard = shared.write().await;
            if status != MirrorStatus::Mirrored || guard.status != BookingStatus::Canceled {
                self.persist_mirror(&mut guard, external_event_id, calendar, status)
                    .await;
                return guard.clone();
            }
        }
        // Canceled while the insert was in flight
        if let Some(external) = external_event_id
            && let Err(e) = self
                .calendar_call(calendar, self.services.calendar.delete_event(calendar, &external))
                .await
        {
            warn!(booking = %fallback.id, calendar, "orphaned mirror event {external} not deleted: {e}");
            metrics::counter!(obs::MIRROR_FAILURES_TOTAL).increment(1);
            let _commit = self.commit_gate.read().await;
            let mut guard = shared.write().await;
            self.persist_mirror(&mut guard, Some(external), calendar, MirrorStatus::Failed)
                .await;
            return guard.clone();
        }
        shared.read().await.clone()
    }

    /// Caller holds `commit_gate` for reading and the booking's write lock.
    async fn persist_mirror(
        &self,
        booking: &mut Booking,
        external_event_id: Option<String>,
        calendar: &str,
        status: MirrorStatus,
    ) {
        let event = Event::BookingMirrored {
            id: booking.id,
            host_id: booking.host_id,
            calendar_id: external_event_id.as_ref().map(|_| calendar.to_string()),
            external_event_id,
            status,
        };
        if let Err(e) = self.persist_booking(booking, &event).await {
            warn!(booking = %booking.id, "mirror outcome not recorded: {e}");
        }
    }
}
