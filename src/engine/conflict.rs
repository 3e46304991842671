use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::invalid("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    booking_id: Ulid,
    span: Span,
    buffer_ms: Ms,
}

impl Claim {
    fn collides(&self, span: &Span, buffer_ms: Ms) -> bool {
        let pad = self.buffer_ms.max(buffer_ms);
        self.span.start == span.start || self.span.padded(pad).overlaps(span)
    }
}

/// Per-host table of claimed intervals. All checks and writes for one host
/// happen under that host's shard lock, so of two racing claims on the same
/// interval exactly one lands.
#[derive(Debug, Default)]
pub struct SlotLedger {
    claims: DashMap<Ulid, Vec<Claim>>,
}

impl SlotLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, host_id: Ulid, booking_id: Ulid, span: Span, buffer_ms: Ms) -> Result<(), EngineError> {
        let mut entry = self.claims.entry(host_id).or_default();
        if entry.iter().any(|c| c.collides(&span, buffer_ms)) {
            return Err(EngineError::SlotConflict);
        }
        entry.push(Claim {
            booking_id,
            span,
            buffer_ms,
        });
        Ok(())
    }

    /// Claim `span` for a booking that already holds a claim, ignoring its
    /// own. The old claim stays until `settle_move` picks the survivor, so
    /// nobody can take the old interval while the move is being persisted.
    pub fn begin_move(&self, host_id: Ulid, booking_id: Ulid, span: Span, buffer_ms: Ms) -> Result<(), EngineError> {
        let mut entry = self.claims.entry(host_id).or_default();
        if entry
            .iter()
            .any(|c| c.booking_id != booking_id && c.collides(&span, buffer_ms))
        {
            return Err(EngineError::SlotConflict);
        }
        entry.push(Claim {
            booking_id,
            span,
            buffer_ms,
        });
        Ok(())
    }

    /// Drop every claim of a moving booking except one on `kept`: the new
    /// interval once the move committed, the old one if it failed.
    pub fn settle_move(&self, host_id: Ulid, booking_id: Ulid, kept: Span) {
        let Some(mut entry) = self.claims.get_mut(&host_id) else {
            return;
        };
        let mut found = false;
        entry.retain(|c| {
            if c.booking_id != booking_id || (c.span == kept && !found) {
                found |= c.booking_id == booking_id;
                return true;
            }
            false
        });
    }

    /// Record a claim without checking it. Used when rebuilding from the WAL,
    /// where every claim already won once.
    pub(super) fn restore(&self, host_id: Ulid, booking_id: Ulid, span: Span, buffer_ms: Ms) {
        self.claims.entry(host_id).or_default().push(Claim {
            booking_id,
            span,
            buffer_ms,
        });
    }

    pub fn release(&self, host_id: Ulid, booking_id: Ulid) -> bool {
        let Some(mut entry) = self.claims.get_mut(&host_id) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|c| c.booking_id != booking_id);
        entry.len() != before
    }

    /// Would `span` be claimable right now, treating `exclude` as released.
    pub fn is_free(&self, host_id: Ulid, span: &Span, buffer_ms: Ms, exclude: Option<Ulid>) -> bool {
        self.claims.get(&host_id).is_none_or(|claims| {
            !claims
                .iter()
                .any(|c| Some(c.booking_id) != exclude && c.collides(span, buffer_ms))
        })
    }

    pub fn claimed_count(&self, host_id: Ulid) -> usize {
        self.claims.get(&host_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.claims.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = 60_000;

    #[test]
    fn first_writer_wins() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        let a = Ulid::new();
        let b = Ulid::new();
        ledger.claim(host, a, Span::new(0, 30 * M), 0).unwrap();
        assert_eq!(
            ledger.claim(host, b, Span::new(0, 30 * M), 0),
            Err(EngineError::SlotConflict)
        );
        assert_eq!(
            ledger.claim(host, b, Span::new(15 * M, 45 * M), 0),
            Err(EngineError::SlotConflict)
        );
        // adjacent is fine
        ledger.claim(host, b, Span::new(30 * M, 60 * M), 0).unwrap();
        // other host unaffected
        ledger.claim(Ulid::new(), b, Span::new(0, 30 * M), 0).unwrap();
    }

    #[test]
    fn buffer_blocks_adjacent_claims() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        ledger.claim(host, Ulid::new(), Span::new(0, 30 * M), 10 * M).unwrap();
        assert!(ledger.claim(host, Ulid::new(), Span::new(30 * M, 60 * M), 0).is_err());
        ledger.claim(host, Ulid::new(), Span::new(40 * M, 70 * M), 0).unwrap();
    }

    #[test]
    fn move_ignores_own_claim() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        let a = Ulid::new();
        ledger.claim(host, a, Span::new(0, 30 * M), 0).unwrap();
        ledger.begin_move(host, a, Span::new(15 * M, 45 * M), 0).unwrap();
        ledger.settle_move(host, a, Span::new(15 * M, 45 * M));
        assert_eq!(ledger.claimed_count(host), 1);
        assert!(ledger.is_free(host, &Span::new(0, 15 * M), 0, None));
        assert!(!ledger.is_free(host, &Span::new(15 * M, 45 * M), 0, None));
        assert!(ledger.is_free(host, &Span::new(15 * M, 45 * M), 0, Some(a)));
    }

    #[test]
    fn move_onto_other_claim_fails_and_keeps_old() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        let a = Ulid::new();
        let b = Ulid::new();
        ledger.claim(host, a, Span::new(0, 30 * M), 0).unwrap();
        ledger.claim(host, b, Span::new(60 * M, 90 * M), 0).unwrap();
        assert!(ledger.begin_move(host, a, Span::new(60 * M, 90 * M), 0).is_err());
        assert_eq!(ledger.claimed_count(host), 2);
        assert!(!ledger.is_free(host, &Span::new(0, 30 * M), 0, None));
    }

    #[test]
    fn old_interval_stays_held_until_move_settles() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        let a = Ulid::new();
        let old = Span::new(0, 30 * M);
        let new = Span::new(60 * M, 90 * M);
        ledger.claim(host, a, old, 0).unwrap();
        ledger.begin_move(host, a, new, 0).unwrap();

        // a rival booking cannot slip into the old interval mid-move
        assert_eq!(
            ledger.claim(host, Ulid::new(), old, 0),
            Err(EngineError::SlotConflict)
        );

        // the move failed to persist: back to the old interval only
        ledger.settle_move(host, a, old);
        assert_eq!(ledger.claimed_count(host), 1);
        assert!(!ledger.is_free(host, &old, 0, None));
        ledger.claim(host, Ulid::new(), new, 0).unwrap();
    }

    #[test]
    fn settling_a_move_onto_the_same_interval_keeps_one_claim() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        let a = Ulid::new();
        let span = Span::new(0, 30 * M);
        ledger.claim(host, a, span, 0).unwrap();
        ledger.begin_move(host, a, span, 0).unwrap();
        assert_eq!(ledger.claimed_count(host), 2);
        ledger.settle_move(host, a, span);
        assert_eq!(ledger.claimed_count(host), 1);
    }

    #[test]
    fn release_frees_slot() {
        let ledger = SlotLedger::new();
        let host = Ulid::new();
        let a = Ulid::new();
        ledger.claim(host, a, Span::new(0, 30 * M), 0).unwrap();
        assert!(ledger.release(host, a));
        assert!(!ledger.release(host, a));
        ledger.claim(host, Ulid::new(), Span::new(0, 30 * M), 0).unwrap();
    }

    #[test]
    fn validate_span_limits() {
        assert!(validate_span(&Span { start: 10, end: 10 }).is_err());
        assert!(validate_span(&Span { start: -5, end: 10 }).is_err());
        assert!(validate_span(&Span::new(0, 25 * 60 * M)).is_err());
        assert!(validate_span(&Span::new(0, 30 * M)).is_ok());
    }
}
