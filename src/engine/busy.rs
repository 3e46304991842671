use std::time::Duration;

use futures::future::join_all;
use tracing::warn;

use crate::calendar::{CalendarError, CalendarProvider};
use crate::model::Span;

use super::availability::merge_overlapping;

/// Merged busy time for a window plus the calendars that could not answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusyResolution {
    pub busy: Vec<Span>,
    pub unknown: Vec<String>,
}

impl BusyResolution {
    pub fn is_degraded(&self) -> bool {
        !self.unknown.is_empty()
    }
}

/// Query every attached calendar concurrently, each under `timeout`, and fold
/// the answers together with `extra` (the host's own bookings). Calendar
/// spans equal to one in `ignore` are dropped; a booking being moved uses
/// this to step over its own mirrored event.
///
/// A calendar that errors or times out contributes nothing and is reported
/// in `unknown`; the rest of the answer still stands.
pub async fn resolve_busy(
    provider: &dyn CalendarProvider,
    calendars: &[String],
    window: Span,
    timeout: Duration,
    extra: &[Span],
    ignore: &[Span],
) -> BusyResolution {
    let lookups = calendars.iter().map(|cal| async move {
        let result = match tokio::time::timeout(timeout, provider.query_busy(cal, window)).await {
            Ok(r) => r,
            Err(_) => Err(CalendarError::Timeout(cal.clone())),
        };
        (cal, result)
    });

    let mut busy: Vec<Span> = extra.iter().copied().filter(|s| s.overlaps(&window)).collect();
    let mut unknown = Vec::new();
    for (cal, result) in join_all(lookups).await {
        match result {
            Ok(spans) => busy.extend(
                spans
                    .into_iter()
                    .filter(|s| s.start < s.end && !ignore.contains(s)),
            ),
            Err(e) => {
                warn!(calendar = %cal, "busy lookup degraded: {e}");
                metrics::counter!(crate::observability::CALENDAR_DEGRADED_TOTAL).increment(1);
                unknown.push(cal.clone());
            }
        }
    }

    busy.sort_by_key(|s| s.start);
    BusyResolution {
        busy: merge_overlapping(&busy),
        unknown,
    }
}
