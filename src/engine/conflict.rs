use crate::limits::*;
use crate::model::*;

use super::store::{Page, ReservationStore, Scan, Window};
use super::EngineError;

pub(crate) const ALREADY_BOOKED: &str = "item already booked for the requested window";

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Check a requested window against `now` and the global limits.
/// `start == now` is accepted; an empty window is not.
pub(crate) fn validate_window(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    if start > end {
        return Err(EngineError::validation("start must be before end"));
    }
    if start == end {
        return Err(EngineError::validation("start and end must differ"));
    }
    if start < now {
        return Err(EngineError::validation("start must not be in the past"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::validation("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::validation("span too wide"));
    }
    Ok(span)
}

/// First APPROVED reservation of `item` overlapping `span`, if any.
/// Advisory: the store repeats this check under the item write lock.
pub(crate) async fn approved_overlap(
    store: &dyn ReservationStore,
    item: ItemId,
    span: Span,
) -> Result<Option<ReservationId>, EngineError> {
    let scan = Scan::on_item(item)
        .with_status(Status::Approved)
        .within(Window::Overlapping(span));
    let hits = store.scan(&scan, Page::first()).await?;
    Ok(hits.first().map(|r| r.id))
}
