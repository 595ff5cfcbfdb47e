use crate::model::*;
use crate::observability::{RESERVATIONS_CREATED_TOTAL, RESERVATION_DECISIONS_TOTAL};

use super::conflict::{approved_overlap, validate_window, ALREADY_BOOKED};
use super::{Engine, EngineError, StoreError};

impl Engine {
    /// Request `item` for `[start, end)` on behalf of `requester`.
    /// The new reservation is WAITING until the item owner decides.
    pub async fn create_reservation(
        &self,
        requester: UserId,
        item_id: ItemId,
        start: Ms,
        end: Ms,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let span = validate_window(start, end, now)?;
        self.require_user(requester).await?;
        let item = self.require_item(item_id).await?;

        if item.owner_id == requester {
            tracing::warn!("user {requester} tried to book own item {item_id}");
            return Err(EngineError::validation("item owner cannot book their own item"));
        }
        if !item.available {
            return Err(EngineError::validation(format!(
                "item {item_id} is not available for booking"
            )));
        }
        if let Some(existing) = approved_overlap(self.store.as_ref(), item_id, span).await? {
            tracing::debug!("item {item_id} window {span:?} overlaps approved {existing}");
            return Err(EngineError::validation(ALREADY_BOOKED));
        }

        // An approval can land between the check above and the insert.
        let reservation = self
            .store
            .insert(item_id, requester, span)
            .await
            .map_err(|e| match e {
                StoreError::Overlap(_) => EngineError::validation(ALREADY_BOOKED),
                other => other.into(),
            })?;

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        tracing::info!(
            "reservation {} created: item {item_id} booker {requester} [{}, {})",
            reservation.id,
            span.start,
            span.end
        );
        Ok(reservation)
    }

    /// Owner decision on a WAITING reservation. Exactly one of several
    /// concurrent decisions succeeds; the others get `Conflict`.
    pub async fn decide_reservation(
        &self,
        id: ReservationId,
        approver: UserId,
        approve: bool,
    ) -> Result<Reservation, EngineError> {
        let reservation = self.require_reservation(id).await?;
        let item = self.require_item(reservation.item_id).await?;

        if item.owner_id != approver {
            tracing::warn!("user {approver} is not the owner of item {}, cannot decide {id}", item.id);
            return Err(EngineError::validation("only the item owner may approve or reject"));
        }
        let Some(target) = reservation.status.decide(approve) else {
            return Err(EngineError::Conflict(format!(
                "reservation already decided: {}",
                reservation.status
            )));
        };
        if target == Status::Approved
            && let Some(other) = approved_overlap(self.store.as_ref(), item.id, reservation.span).await?
            && other != id
        {
            return Err(EngineError::Conflict(format!(
                "window overlaps approved reservation {other}"
            )));
        }

        let decided = self.store.transition(id, Status::Waiting, target).await?;

        let outcome = if approve { "approved" } else { "rejected" };
        metrics::counter!(RESERVATION_DECISIONS_TOTAL, "outcome" => outcome).increment(1);
        tracing::info!("reservation {id} {outcome} by {approver}");
        Ok(decided)
    }
}
