use std::str::FromStr;

use crate::limits::*;
use crate::model::*;
use crate::observability::ENRICHMENT_FAILURES_TOTAL;

use super::store::{Order, Page, Scan, Window};
use super::{Engine, EngineError};

/// Temporal/status filter of a listing, parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateToken {
    All,
    Current,
    Past,
    Future,
    Waiting,
    Rejected,
}

impl FromStr for StateToken {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(StateToken::All),
            "CURRENT" => Ok(StateToken::Current),
            "PAST" => Ok(StateToken::Past),
            "FUTURE" => Ok(StateToken::Future),
            "WAITING" => Ok(StateToken::Waiting),
            "REJECTED" => Ok(StateToken::Rejected),
            _ => Err(EngineError::validation(format!("Unknown state: {s}"))),
        }
    }
}

impl StateToken {
    fn refine(self, scan: Scan, now: Ms) -> Scan {
        match self {
            StateToken::All => scan,
            StateToken::Current => scan.within(Window::Current(now)),
            StateToken::Past => scan.within(Window::Past(now)),
            StateToken::Future => scan.within(Window::Future(now)),
            StateToken::Waiting => scan.with_status(Status::Waiting),
            StateToken::Rejected => scan.with_status(Status::Rejected),
        }
    }
}

/// Whose reservations a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reservations the requester made.
    Booker,
    /// Reservations of items the requester currently owns.
    Owner,
}

fn page_of(page: i64, size: i64) -> Result<Page, EngineError> {
    if page < 0 {
        return Err(EngineError::validation("page must not be negative"));
    }
    if size <= 0 {
        return Err(EngineError::validation("size must be positive"));
    }
    if size > MAX_PAGE_SIZE {
        return Err(EngineError::validation(format!("size must be at most {MAX_PAGE_SIZE}")));
    }
    let offset = page
        .checked_mul(size)
        .ok_or_else(|| EngineError::validation("page out of range"))?;
    Ok(Page::new(offset as usize, size as usize))
}

impl Engine {
    /// A single reservation, visible to its booker and the item's current owner.
    pub async fn get_reservation(
        &self,
        id: ReservationId,
        requester: UserId,
    ) -> Result<Reservation, EngineError> {
        self.require_user(requester).await?;
        let reservation = self.require_reservation(id).await?;
        if reservation.booker_id == requester {
            return Ok(reservation);
        }
        let item = self.require_item(reservation.item_id).await?;
        if item.owner_id != requester {
            tracing::warn!("user {requester} may not view reservation {id}");
            return Err(EngineError::validation("not authorized to view reservation"));
        }
        Ok(reservation)
    }

    /// Page `page` (zero-based) of the requester's reservations in `role`,
    /// filtered by `state`, newest start first.
    pub async fn list_reservations(
        &self,
        requester: UserId,
        role: Role,
        state: &str,
        now: Ms,
        page: i64,
        size: i64,
    ) -> Result<Vec<Reservation>, EngineError> {
        let token: StateToken = state.parse()?;
        let page = page_of(page, size)?;
        self.require_user(requester).await?;

        let scan = match role {
            Role::Booker => Scan::booked_by(requester),
            Role::Owner => {
                let owned = self.items.items_owned_by(requester).await?;
                if owned.is_empty() {
                    return Ok(Vec::new());
                }
                Scan::on_items(owned)
            }
        };
        let scan = token.refine(scan, now).ordered(Order::StartDesc);
        tracing::debug!("listing {role:?} {requester} {token:?} {page:?}");
        Ok(self.store.scan(&scan, page).await?)
    }

    pub async fn list_reservations_for_booker(
        &self,
        booker: UserId,
        state: &str,
        now: Ms,
        page: i64,
        size: i64,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.list_reservations(booker, Role::Booker, state, now, page, size)
            .await
    }

    pub async fn list_reservations_for_owner(
        &self,
        owner: UserId,
        state: &str,
        now: Ms,
        page: i64,
        size: i64,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.list_reservations(owner, Role::Owner, state, now, page, size)
            .await
    }

    /// Latest-ending APPROVED reservation of `item` that ended before `now`,
    /// provided `owner` currently owns the item.
    pub async fn last_booking(
        &self,
        item_id: ItemId,
        owner: UserId,
        now: Ms,
    ) -> Result<Option<Reservation>, EngineError> {
        let Some(item) = self.items.get_item(item_id).await? else {
            return Ok(None);
        };
        if item.owner_id != owner {
            return Ok(None);
        }
        let scan = Scan::on_item(item_id)
            .with_status(Status::Approved)
            .within(Window::Past(now))
            .ordered(Order::EndDesc);
        Ok(self.store.scan(&scan, Page::first()).await?.pop())
    }

    /// Earliest-starting APPROVED reservation of `item` that starts after `now`.
    pub async fn next_booking(
        &self,
        item_id: ItemId,
        now: Ms,
    ) -> Result<Option<Reservation>, EngineError> {
        let scan = Scan::on_item(item_id)
            .with_status(Status::Approved)
            .within(Window::Future(now))
            .ordered(Order::StartAsc);
        Ok(self.store.scan(&scan, Page::first()).await?.pop())
    }

    /// Last/next annotations for an item detail view. Empty unless the
    /// requester is the item's current owner.
    pub async fn item_bookings(
        &self,
        item_id: ItemId,
        requester: UserId,
        now: Ms,
    ) -> Result<ItemBookings, EngineError> {
        let item = self.require_item(item_id).await?;
        if item.owner_id != requester {
            return Ok(ItemBookings::default());
        }
        Ok(ItemBookings {
            last: self.last_booking(item_id, requester, now).await?,
            next: self.next_booking(item_id, now).await?,
        })
    }

    /// Resolve booker and item of each reservation. Lookup failures are
    /// logged and leave the field empty; the listing itself never fails.
    pub async fn enrich(&self, reservations: Vec<Reservation>) -> Vec<ReservationView> {
        let mut views = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            let booker = match self.users.get_user(reservation.booker_id).await {
                Ok(Some(user)) => Some(user),
                Ok(None) => {
                    enrichment_failed(&reservation, "booker", "not found");
                    None
                }
                Err(e) => {
                    enrichment_failed(&reservation, "booker", &e.to_string());
                    None
                }
            };
            let item = match self.items.get_item(reservation.item_id).await {
                Ok(Some(item)) => Some(item),
                Ok(None) => {
                    enrichment_failed(&reservation, "item", "not found");
                    None
                }
                Err(e) => {
                    enrichment_failed(&reservation, "item", &e.to_string());
                    None
                }
            };
            views.push(ReservationView {
                reservation,
                booker,
                item,
            });
        }
        views
    }
}

fn enrichment_failed(reservation: &Reservation, field: &'static str, reason: &str) {
    metrics::counter!(ENRICHMENT_FAILURES_TOTAL, "field" => field).increment(1);
    tracing::warn!("reservation {}: {field} lookup failed: {reason}", reservation.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tokens_parse_case_insensitively() {
        assert_eq!("current".parse::<StateToken>(), Ok(StateToken::Current));
        assert_eq!("Past".parse::<StateToken>(), Ok(StateToken::Past));
        assert_eq!("ALL".parse::<StateToken>(), Ok(StateToken::All));
        let err = "APPROVED".parse::<StateToken>().unwrap_err();
        assert_eq!(err.message(), "Unknown state: APPROVED");
    }

    #[test]
    fn page_validation() {
        assert_eq!(page_of(2, 10).unwrap(), Page::new(20, 10));
        assert!(page_of(-1, 10).is_err());
        assert!(page_of(0, 0).is_err());
        assert!(page_of(0, MAX_PAGE_SIZE + 1).is_err());
        assert!(page_of(i64::MAX, MAX_PAGE_SIZE).is_err());
    }
}
