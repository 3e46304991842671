mod availability;
mod busy;
mod conflict;
mod error;
mod lifecycle;
mod queries;

pub use availability::{
    EffectiveRules, filter_slots, fits_working_block, generate_slots, merge_overlapping, parse_date,
    parse_tz,
};
pub use busy::{BusyResolution, resolve_busy};
pub use conflict::SlotLedger;
pub use error::EngineError;
pub use lifecycle::NewBooking;
pub use queries::{Availability, AvailabilityRequest};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{error, warn};
use ulid::Ulid;

use crate::calendar::CalendarProvider;
use crate::clock::Clock;
use crate::model::*;
use crate::notify::Dispatcher;
use crate::token::TokenSigner;
use crate::wal::Wal;

pub type SharedBooking = Arc<RwLock<Booking>>;

/// Collaborators an engine calls out to. Built once per tenant.
#[derive(Clone)]
pub struct Services {
    pub calendar: Arc<dyn CalendarProvider>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub signer: Arc<TokenSigner>,
    pub clock: Arc<dyn Clock>,
    /// Bound on every single calendar call.
    pub calendar_timeout: Duration,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Snapshot {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the writer wakes
/// joins the same batch and shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut deferred = None;
        match cmd {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
            }
            other => deferred = Some(other),
        }

        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Nobody is told this batch committed, so none of it may stay in the log.
        warn!("wal batch of {} failed: {e}", batch.len());
        if let Err(e) = wal.discard_pending() {
            error!("wal {}: could not discard failed batch: {e}", wal.path().display());
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Snapshot { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut one = vec![(event, response)];
            commit_batch(wal, &mut one);
        }
    }
}

/// One tenant's booking state.
///
/// Profiles and event types sit directly in maps; each booking sits behind
/// its own lock. Every state change goes through the WAL first. Writers hold
/// `commit_gate` for reading while they append and apply; compaction holds it
/// for writing so a snapshot never races an append.
pub struct Engine {
    pub(super) profiles: DashMap<Ulid, SchedulingProfile>,
    pub(super) event_types: DashMap<Ulid, EventType>,
    /// (host, slug) → event type id
    pub(super) slugs: DashMap<(Ulid, String), Ulid>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// host → its booking ids, in creation order
    pub(super) host_bookings: DashMap<Ulid, Vec<Ulid>>,
    pub(super) ledger: SlotLedger,
    pub(super) commit_gate: RwLock<()>,
    pub(super) services: Services,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a booking-level event to a locked booking.
pub(super) fn apply_to_booking(b: &mut Booking, event: &Event) {
    match event {
        Event::BookingConfirmed { .. } => {
            b.status = BookingStatus::Confirmed;
        }
        Event::BookingRescheduled {
            span,
            changed_at,
            consumed_nonce,
            ..
        } => {
            b.history.push(RescheduleEntry {
                start: b.span.start,
                end: b.span.end,
                changed_at: *changed_at,
            });
            b.span = *span;
            b.reschedule_count += 1;
            b.consumed_nonces.insert(*consumed_nonce);
        }
        Event::BookingCanceled {
            consumed_nonce,
            canceled_at,
            ..
        } => {
            b.status = BookingStatus::Canceled;
            b.canceled_at = Some(*canceled_at);
            b.consumed_nonces.insert(*consumed_nonce);
        }
        Event::BookingMirrored {
            external_event_id,
            calendar_id,
            status,
            ..
        } => {
            b.external_event_id = external_event_id.clone();
            b.external_calendar_id = calendar_id.clone();
            b.mirror_status = *status;
        }
        Event::ProfileUpserted { .. }
        | Event::EventTypeCreated { .. }
        | Event::EventTypeUpdated { .. }
        | Event::BookingCreated { .. } => return,
    }
    b.version += 1;
}

fn booking_target(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingConfirmed { id, .. }
        | Event::BookingRescheduled { id, .. }
        | Event::BookingCanceled { id, .. }
        | Event::BookingMirrored { id, .. } => Some(*id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, services: Services) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            profiles: DashMap::new(),
            event_types: DashMap::new(),
            slugs: DashMap::new(),
            bookings: DashMap::new(),
            host_bookings: DashMap::new(),
            ledger: SlotLedger::new(),
            commit_gate: RwLock::new(()),
            services,
            wal_tx,
        };

        // Sole owner of every booking lock here, so try_write always succeeds.
        // Never block: this may run inside the runtime during lazy tenant load.
        for event in &events {
            match booking_target(event) {
                Some(id) => {
                    let Some(shared) = engine.bookings.get(&id).map(|e| e.value().clone()) else {
                        warn!("replay: {} for unknown booking {id}", event.kind());
                        continue;
                    };
                    if let Ok(mut guard) = shared.try_write() {
                        apply_to_booking(&mut guard, event);
                    }
                }
                None => engine.apply_catalog(event),
            }
        }
        engine.rebuild_ledger();

        Ok(engine)
    }

    /// Apply profile, event-type and booking-creation events.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ProfileUpserted { profile } => {
                self.profiles.insert(profile.host_id, profile.clone());
            }
            Event::EventTypeCreated { event_type } | Event::EventTypeUpdated { event_type } => {
                self.slugs
                    .insert((event_type.host_id, event_type.slug.clone()), event_type.id);
                self.event_types.insert(event_type.id, event_type.clone());
            }
            Event::BookingCreated { booking } => {
                self.insert_booking(booking.clone());
            }
            _ => {}
        }
    }

    pub(super) fn insert_booking(&self, booking: Booking) {
        let (id, host_id) = (booking.id, booking.host_id);
        if self
            .bookings
            .insert(id, Arc::new(RwLock::new(booking)))
            .is_none()
        {
            self.host_bookings.entry(host_id).or_default().push(id);
        }
    }

    /// Claims for every active booking, with the buffer their rules give today.
    fn rebuild_ledger(&self) {
        self.ledger.clear();
        let shared: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for b in shared {
            let Ok(guard) = b.try_read() else { continue };
            if !guard.status.is_active() {
                continue;
            }
            let buffer = self.rules_for(&guard).map(|r| r.buffer_ms()).unwrap_or(0);
            self.ledger
                .restore(guard.host_id, guard.id, guard.span, buffer);
        }
    }

    /// Effective rules for an existing booking.
    pub(super) fn rules_for(&self, booking: &Booking) -> Result<EffectiveRules, EngineError> {
        let profile = self
            .profiles
            .get(&booking.host_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| EngineError::not_found("profile for host", booking.host_id))?;
        let event_type = booking
            .event_type_id
            .and_then(|id| self.event_types.get(&id).map(|e| e.value().clone()));
        EffectiveRules::resolve(&profile, event_type.as_ref())
    }

    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply to the locked booking.
    /// Caller holds `commit_gate` for reading and the booking's write lock.
    pub(super) async fn persist_booking(&self, b: &mut Booking, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_booking(b, event);
        Ok(())
    }

    pub(super) fn booking_handle(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn now(&self) -> Ms {
        self.services.clock.now_ms()
    }

    /// Rewrite the WAL as the minimal event list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .profiles
            .iter()
            .map(|p| Event::ProfileUpserted {
                profile: p.value().clone(),
            })
            .collect();
        events.extend(self.event_types.iter().map(|e| Event::EventTypeCreated {
            event_type: e.value().clone(),
        }));

        let shared: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::with_capacity(shared.len());
        for b in shared {
            snapshot.push(b.read().await.clone());
        }
        snapshot.sort_by_key(|b| b.id);
        events.extend(snapshot.into_iter().map(|booking| Event::BookingCreated { booking }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Snapshot {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
