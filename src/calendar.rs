//! External calendar collaborators: busy-time lookup and event mirroring.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Span;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("calendar {0} unreachable")]
    Unreachable(String),
    #[error("calendar {0} timed out")]
    Timeout(String),
    #[error("calendar rejected request: {0}")]
    Rejected(String),
}

/// What gets written onto the host's primary calendar for a booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEvent {
    pub booking_id: Ulid,
    pub span: Span,
    pub summary: String,
    pub attendee_email: String,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Busy spans on `calendar_id` that intersect `window`.
    async fn query_busy(&self, calendar_id: &str, window: Span) -> Result<Vec<Span>, CalendarError>;

    /// Returns the provider's id for the new event, if it issues one.
    async fn insert_event(
        &self,
        calendar_id: &str,
        event: &MirrorEvent,
    ) -> Result<Option<String>, CalendarError>;

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> Result<(), CalendarError>;

    async fn move_event(
        &self,
        calendar_id: &str,
        external_id: &str,
        event: &MirrorEvent,
    ) -> Result<Option<String>, CalendarError> {
        self.delete_event(calendar_id, external_id).await?;
        self.insert_event(calendar_id, event).await
    }
}

/// Provider with no calendars attached: never busy, mirrors nothing.
#[derive(Debug, Default)]
pub struct NoopCalendar;

#[async_trait]
impl CalendarProvider for NoopCalendar {
    async fn query_busy(&self, _: &str, _: Span) -> Result<Vec<Span>, CalendarError> {
        Ok(Vec::new())
    }

    async fn insert_event(&self, _: &str, _: &MirrorEvent) -> Result<Option<String>, CalendarError> {
        Ok(None)
    }

    async fn delete_event(&self, _: &str, _: &str) -> Result<(), CalendarError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredEvent {
    id: String,
    span: Span,
}

/// In-process calendar store. Mirrored events show up as busy time.
#[derive(Debug, Default)]
pub struct LocalCalendar {
    busy: DashMap<String, Vec<Span>>,
    events: DashMap<String, Vec<StoredEvent>>,
    next_id: AtomicU64,
}

impl LocalCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a busy block that didn't come from a booking.
    pub fn add_busy(&self, calendar_id: &str, span: Span) {
        self.busy.entry(calendar_id.to_string()).or_default().push(span);
    }

    pub fn event_count(&self, calendar_id: &str) -> usize {
        self.events.get(calendar_id).map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CalendarProvider for LocalCalendar {
    async fn query_busy(&self, calendar_id: &str, window: Span) -> Result<Vec<Span>, CalendarError> {
        let mut out: Vec<Span> = self
            .busy
            .get(calendar_id)
            .map(|b| b.iter().copied().filter(|s| s.overlaps(&window)).collect())
            .unwrap_or_default();
        if let Some(events) = self.events.get(calendar_id) {
            out.extend(events.iter().map(|e| e.span).filter(|s| s.overlaps(&window)));
        }
        out.sort_by_key(|s| s.start);
        Ok(out)
    }

    async fn insert_event(
        &self,
        calendar_id: &str,
        event: &MirrorEvent,
    ) -> Result<Option<String>, CalendarError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("local-{n}");
        self.events
            .entry(calendar_id.to_string())
            .or_default()
            .push(StoredEvent {
                id: id.clone(),
                span: event.span,
            });
        Ok(Some(id))
    }

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> Result<(), CalendarError> {
        let Some(mut events) = self.events.get_mut(calendar_id) else {
            return Err(CalendarError::Rejected(format!("no event {external_id}")));
        };
        let before = events.len();
        events.retain(|e| e.id != external_id);
        if events.len() == before {
            return Err(CalendarError::Rejected(format!("no event {external_id}")));
        }
        Ok(())
    }
}
