use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Journal, JournalPermit};

use super::error::StoreError;

pub type SharedLedger = Arc<RwLock<ItemLedger>>;

// ── Scan predicates ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    StartDesc,
    StartAsc,
    EndDesc,
}

/// Temporal predicate relative to an instant or a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// `start <= now <= end`
    Current(Ms),
    /// `end < now`
    Past(Ms),
    /// `start > now`
    Future(Ms),
    /// Half-open overlap with the given span.
    Overlapping(Span),
}

impl Window {
    pub fn admits(&self, span: &Span) -> bool {
        match *self {
            Window::Current(now) => span.is_current_at(now),
            Window::Past(now) => span.end < now,
            Window::Future(now) => span.start > now,
            Window::Overlapping(other) => span.overlaps(&other),
        }
    }
}

/// Filter and order for `ReservationStore::scan`. Unset fields don't filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub booker: Option<UserId>,
    pub items: Option<Vec<ItemId>>,
    pub status: Option<Status>,
    pub window: Option<Window>,
    pub order: Order,
}

impl Scan {
    pub fn booked_by(booker: UserId) -> Self {
        Self {
            booker: Some(booker),
            ..Self::default()
        }
    }

    pub fn on_items(items: Vec<ItemId>) -> Self {
        Self {
            items: Some(items),
            ..Self::default()
        }
    }

    pub fn on_item(item: ItemId) -> Self {
        Self::on_items(vec![item])
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn within(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    pub fn ordered(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        self.booker.is_none_or(|b| r.booker_id == b)
            && self.items.as_ref().is_none_or(|items| items.contains(&r.item_id))
            && self.status.is_none_or(|s| r.status == s)
            && self.window.is_none_or(|w| w.admits(&r.span))
    }

    /// Ties break on id, newest first, so pages are stable.
    fn compare(&self, a: &Reservation, b: &Reservation) -> Ordering {
        let primary = match self.order {
            Order::StartDesc => b.span.start.cmp(&a.span.start),
            Order::StartAsc => a.span.start.cmp(&b.span.start),
            Order::EndDesc => b.span.end.cmp(&a.span.end),
        };
        primary.then_with(|| b.id.cmp(&a.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first() -> Self {
        Self::new(0, 1)
    }

    pub fn everything() -> Self {
        Self::new(0, usize::MAX)
    }
}

// ── Store trait ──────────────────────────────────────────────────

/// Durable keyed storage of reservations.
///
/// Implementations must enforce, atomically per item:
/// - `insert` fails with `Overlap` if the window intersects an APPROVED
///   reservation of the same item;
/// - `transition` applies only if the stored status equals `from`, and a
///   transition to APPROVED fails with `Overlap` under the same rule.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn find_by_id(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    /// Store a new WAITING reservation and assign its id.
    async fn insert(
        &self,
        item_id: ItemId,
        booker_id: UserId,
        span: Span,
    ) -> Result<Reservation, StoreError>;

    /// Compare-and-set the status of a reservation.
    async fn transition(
        &self,
        id: ReservationId,
        from: Status,
        to: Status,
    ) -> Result<Reservation, StoreError>;

    async fn scan(&self, scan: &Scan, page: Page) -> Result<Vec<Reservation>, StoreError>;
}

// ── In-memory implementation ─────────────────────────────────────

#[derive(Default)]
struct Indexes {
    ledgers: DashMap<ItemId, SharedLedger>,
    /// Reverse lookup: reservation id → item id.
    reservation_to_item: DashMap<ReservationId, ItemId>,
    by_booker: DashMap<UserId, Vec<ReservationId>>,
}

impl Indexes {
    fn ledger(&self, item_id: &ItemId) -> Option<SharedLedger> {
        self.ledgers.get(item_id).map(|e| e.value().clone())
    }

    fn ledger_or_create(&self, item_id: ItemId) -> SharedLedger {
        self.ledgers
            .entry(item_id)
            .or_insert_with(|| Arc::new(RwLock::new(ItemLedger::new(item_id))))
            .clone()
    }

    /// Apply an event to a ledger the caller holds the write lock on.
    /// Returns the affected reservation, or `None` if the event no longer fits.
    fn apply(&self, ledger: &mut ItemLedger, event: &Event) -> Option<Reservation> {
        match event {
            Event::ReservationCreated {
                id,
                item_id,
                booker_id,
                span,
            } => {
                let reservation = Reservation {
                    id: *id,
                    item_id: *item_id,
                    booker_id: *booker_id,
                    span: *span,
                    status: Status::Waiting,
                };
                ledger.insert(reservation.clone());
                self.reservation_to_item.insert(*id, *item_id);
                self.by_booker.entry(*booker_id).or_default().push(*id);
                Some(reservation)
            }
            Event::ReservationDecided { id, from, to, .. } => {
                let reservation = ledger.get_mut(id)?;
                if reservation.status != *from {
                    return None;
                }
                reservation.status = *to;
                Some(reservation.clone())
            }
            Event::UserRegistered { .. } | Event::ItemListed { .. } | Event::CommentRecorded { .. } => {
                None
            }
        }
    }
}

/// Reservation store held in memory, one `RwLock`ed ledger per item.
/// With a journal, every change is appended to the WAL before it is applied.
#[derive(Default)]
pub struct InMemoryStore {
    indexes: Arc<Indexes>,
    journal: Option<Journal>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            indexes: Arc::default(),
            journal: Some(journal),
        }
    }

    pub fn item_count(&self) -> usize {
        self.indexes.ledgers.len()
    }

    /// Taken before the ledger lock so compaction never waits on a ledger
    /// while a writer waits on the permit.
    async fn permit(&self) -> Option<JournalPermit> {
        match &self.journal {
            Some(journal) => Some(journal.permit().await),
            None => None,
        }
    }

    /// Journal + apply. Runs on its own task once started, so a caller
    /// cancelled mid-append cannot leave the WAL and memory disagreeing.
    async fn commit(
        &self,
        mut guard: OwnedRwLockWriteGuard<ItemLedger>,
        permit: Option<JournalPermit>,
        event: Event,
    ) -> Result<Reservation, StoreError> {
        let Some(journal) = self.journal.clone() else {
            return self
                .indexes
                .apply(&mut guard, &event)
                .ok_or_else(|| StoreError::Journal("event did not apply".into()));
        };
        let indexes = self.indexes.clone();
        tokio::spawn(async move {
            let _permit = permit;
            journal
                .append(&event)
                .await
                .map_err(|e| StoreError::Journal(e.0))?;
            indexes
                .apply(&mut guard, &event)
                .ok_or_else(|| StoreError::Journal("event did not apply".into()))
        })
        .await
        .map_err(|e| StoreError::Journal(format!("commit task failed: {e}")))?
    }

    /// Apply a replayed event. Creations always apply; only APPROVED
    /// reservations must stay disjoint, so an approval that would overlap
    /// another is skipped.
    pub fn apply_event(&self, event: &Event) {
        let item_id = match event {
            Event::ReservationCreated { item_id, .. } | Event::ReservationDecided { item_id, .. } => {
                *item_id
            }
            _ => return,
        };
        let ledger = self.indexes.ledger_or_create(item_id);
        let Ok(mut guard) = ledger.try_write() else {
            tracing::warn!("replay: ledger for item {item_id} is busy, skipping {event:?}");
            return;
        };
        if let Event::ReservationDecided { id, to: Status::Approved, .. } = event
            && let Some(current) = guard.get(id)
            && let Some(other) = guard.approved_overlap(&current.span, Some(*id))
        {
            tracing::warn!("replay: approval of {id} overlaps approved {other}, skipping");
            return;
        }
        if self.indexes.apply(&mut guard, event).is_none() {
            tracing::warn!("replay: event no longer applies, skipping {event:?}");
        }
    }

    /// Events that recreate the current reservation state, for WAL compaction.
    /// Per item, every creation precedes every decision: a reservation that
    /// overlaps a later approval was legal when it was made.
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let ledgers: Vec<SharedLedger> = self
            .indexes
            .ledgers
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut events = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                id: r.id,
                item_id: r.item_id,
                booker_id: r.booker_id,
                span: r.span,
            }));
            events.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.status != Status::Waiting)
                    .map(|r| Event::ReservationDecided {
                        id: r.id,
                        item_id: r.item_id,
                        from: Status::Waiting,
                        to: r.status,
                    }),
            );
        }
        events
    }

    fn candidate_ledgers(&self, scan: &Scan) -> Vec<SharedLedger> {
        if let Some(items) = &scan.items {
            return items.iter().filter_map(|id| self.indexes.ledger(id)).collect();
        }
        if let Some(booker) = scan.booker {
            let ids = self
                .indexes
                .by_booker
                .get(&booker)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            let items: HashSet<ItemId> = ids
                .iter()
                .filter_map(|id| self.indexes.reservation_to_item.get(id).map(|e| *e.value()))
                .collect();
            return items.iter().filter_map(|id| self.indexes.ledger(id)).collect();
        }
        self.indexes
            .ledgers
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn find_by_id(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let Some(item_id) = self.indexes.reservation_to_item.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.indexes.ledger(&item_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(&id).cloned())
    }

    async fn insert(
        &self,
        item_id: ItemId,
        booker_id: UserId,
        span: Span,
    ) -> Result<Reservation, StoreError> {
        let permit = self.permit().await;
        let guard = self.indexes.ledger_or_create(item_id).write_owned().await;
        if let Some(existing) = guard.approved_overlap(&span, None) {
            return Err(StoreError::Overlap(existing));
        }
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            item_id,
            booker_id,
            span,
        };
        self.commit(guard, permit, event).await
    }

    async fn transition(
        &self,
        id: ReservationId,
        from: Status,
        to: Status,
    ) -> Result<Reservation, StoreError> {
        if from.decide(to == Status::Approved) != Some(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        let item_id = self
            .indexes
            .reservation_to_item
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let ledger = self.indexes.ledger(&item_id).ok_or(StoreError::NotFound(id))?;
        let permit = self.permit().await;
        let guard = ledger.write_owned().await;

        let current = guard.get(&id).ok_or(StoreError::NotFound(id))?;
        if current.status != from {
            return Err(StoreError::StatusMismatch {
                id,
                expected: from,
                actual: current.status,
            });
        }
        if to == Status::Approved
            && let Some(other) = guard.approved_overlap(&current.span, Some(id))
        {
            return Err(StoreError::Overlap(other));
        }

        let event = Event::ReservationDecided {
            id,
            item_id,
            from,
            to,
        };
        self.commit(guard, permit, event).await
    }

    async fn scan(&self, scan: &Scan, page: Page) -> Result<Vec<Reservation>, StoreError> {
        let mut hits = Vec::new();
        for ledger in self.candidate_ledgers(scan) {
            let guard = ledger.read().await;
            hits.extend(guard.reservations.iter().filter(|r| scan.matches(r)).cloned());
        }
        hits.sort_by(|a, b| scan.compare(a, b));
        Ok(hits.into_iter().skip(page.offset).take(page.limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    async fn approved(store: &InMemoryStore, item: ItemId, start: Ms, end: Ms) -> Reservation {
        let r = store.insert(item, Ulid::new(), Span::new(start, end)).await.unwrap();
        store
            .transition(r.id, Status::Waiting, Status::Approved)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_id_and_waiting_status() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        let booker = Ulid::new();
        let r = store.insert(item, booker, Span::new(H, 2 * H)).await.unwrap();

        assert_eq!(r.status, Status::Waiting);
        assert_eq!(r.booker_id, booker);
        assert_eq!(store.find_by_id(r.id).await.unwrap(), Some(r));
        assert_eq!(store.find_by_id(Ulid::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_rejects_overlap_with_approved_only() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        let first = approved(&store, item, H, 2 * H).await;

        let err = store
            .insert(item, Ulid::new(), Span::new(H + H / 2, 3 * H))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Overlap(first.id));

        // adjacent window is fine
        store.insert(item, Ulid::new(), Span::new(2 * H, 3 * H)).await.unwrap();
        // waiting reservations never block
        store.insert(item, Ulid::new(), Span::new(2 * H, 3 * H)).await.unwrap();
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryStore::new();
        let r = store.insert(Ulid::new(), Ulid::new(), Span::new(H, 2 * H)).await.unwrap();

        store.transition(r.id, Status::Waiting, Status::Rejected).await.unwrap();
        let err = store
            .transition(r.id, Status::Waiting, Status::Approved)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StatusMismatch {
                id: r.id,
                expected: Status::Waiting,
                actual: Status::Rejected,
            }
        );
    }

    #[tokio::test]
    async fn transition_rejects_illegal_edges() {
        let store = InMemoryStore::new();
        let r = store.insert(Ulid::new(), Ulid::new(), Span::new(H, 2 * H)).await.unwrap();
        let err = store
            .transition(r.id, Status::Approved, Status::Rejected)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
        let err = store
            .transition(r.id, Status::Waiting, Status::Waiting)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn approving_overlapping_waiting_reservation_fails() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        let a = store.insert(item, Ulid::new(), Span::new(H, 3 * H)).await.unwrap();
        let b = store.insert(item, Ulid::new(), Span::new(2 * H, 4 * H)).await.unwrap();

        store.transition(a.id, Status::Waiting, Status::Approved).await.unwrap();
        let err = store
            .transition(b.id, Status::Waiting, Status::Approved)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Overlap(a.id));
        // b can still be rejected
        store.transition(b.id, Status::Waiting, Status::Rejected).await.unwrap();
    }

    #[tokio::test]
    async fn transition_unknown_reservation() {
        let store = InMemoryStore::new();
        let id = Ulid::new();
        let err = store
            .transition(id, Status::Waiting, Status::Approved)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn scan_filters_orders_and_paginates() {
        let store = InMemoryStore::new();
        let booker = Ulid::new();
        let item_a = Ulid::new();
        let item_b = Ulid::new();
        for (item, start) in [(item_a, 1), (item_b, 5), (item_a, 3), (item_b, 2)] {
            store
                .insert(item, booker, Span::new(start * H, start * H + H))
                .await
                .unwrap();
        }
        store.insert(item_a, Ulid::new(), Span::new(10 * H, 11 * H)).await.unwrap();

        let all = store.scan(&Scan::booked_by(booker), Page::everything()).await.unwrap();
        let starts: Vec<Ms> = all.iter().map(|r| r.span.start / H).collect();
        assert_eq!(starts, vec![5, 3, 2, 1]);

        let page = store.scan(&Scan::booked_by(booker), Page::new(1, 2)).await.unwrap();
        let starts: Vec<Ms> = page.iter().map(|r| r.span.start / H).collect();
        assert_eq!(starts, vec![3, 2]);

        let on_a = store
            .scan(&Scan::on_item(item_a).ordered(Order::StartAsc), Page::everything())
            .await
            .unwrap();
        let starts: Vec<Ms> = on_a.iter().map(|r| r.span.start / H).collect();
        assert_eq!(starts, vec![1, 3, 10]);
    }

    #[tokio::test]
    async fn scan_windows() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        let past = store.insert(item, Ulid::new(), Span::new(H, 2 * H)).await.unwrap();
        let current = store.insert(item, Ulid::new(), Span::new(3 * H, 5 * H)).await.unwrap();
        let future = store.insert(item, Ulid::new(), Span::new(6 * H, 7 * H)).await.unwrap();
        let now = 4 * H;

        let ids = |rs: Vec<Reservation>| rs.into_iter().map(|r| r.id).collect::<Vec<_>>();
        let scan = |w| Scan::on_item(item).within(w);
        assert_eq!(ids(store.scan(&scan(Window::Past(now)), Page::everything()).await.unwrap()), vec![past.id]);
        assert_eq!(
            ids(store.scan(&scan(Window::Current(now)), Page::everything()).await.unwrap()),
            vec![current.id]
        );
        assert_eq!(
            ids(store.scan(&scan(Window::Future(now)), Page::everything()).await.unwrap()),
            vec![future.id]
        );
    }

    #[tokio::test]
    async fn concurrent_approvals_of_overlapping_windows_admit_one() {
        let store = Arc::new(InMemoryStore::new());
        let item = Ulid::new();
        let mut ids = Vec::new();
        for i in 0..16 {
            let r = store
                .insert(item, Ulid::new(), Span::new(H + i * 60_000, 3 * H))
                .await
                .unwrap();
            ids.push(r.id);
        }

        let mut handles = Vec::new();
        for id in ids {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.transition(id, Status::Waiting, Status::Approved).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::Overlap(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn snapshot_replays_into_equal_store() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        // b and c were requested before a was approved and overlap it
        let a = store.insert(item, Ulid::new(), Span::new(H, 3 * H)).await.unwrap();
        let b = store.insert(item, Ulid::new(), Span::new(2 * H, 4 * H)).await.unwrap();
        let c = store.insert(item, Ulid::new(), Span::new(H, 2 * H)).await.unwrap();
        let a = store.transition(a.id, Status::Waiting, Status::Approved).await.unwrap();
        let c = store.transition(c.id, Status::Waiting, Status::Rejected).await.unwrap();
        let d = store.insert(item, Ulid::new(), Span::new(5 * H, 6 * H)).await.unwrap();

        let copy = InMemoryStore::new();
        for event in store.snapshot_events().await {
            copy.apply_event(&event);
        }
        for r in [a, b, c, d] {
            assert_eq!(copy.find_by_id(r.id).await.unwrap(), Some(r));
        }
    }

    #[tokio::test]
    async fn snapshot_lists_creations_before_decisions() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        approved(&store, item, 3 * H, 4 * H).await;
        store.insert(item, Ulid::new(), Span::new(H, 2 * H)).await.unwrap();

        let events = store.snapshot_events().await;
        let first_decision = events
            .iter()
            .position(|e| matches!(e, Event::ReservationDecided { .. }))
            .unwrap();
        assert!(events[first_decision..]
            .iter()
            .all(|e| matches!(e, Event::ReservationDecided { .. })));
        assert_eq!(first_decision, 2);
    }

    #[tokio::test]
    async fn replay_skips_events_that_break_constraints() {
        let store = InMemoryStore::new();
        let item = Ulid::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let events = [
            Event::ReservationCreated { id: a, item_id: item, booker_id: Ulid::new(), span: Span::new(H, 3 * H) },
            Event::ReservationCreated { id: b, item_id: item, booker_id: Ulid::new(), span: Span::new(2 * H, 4 * H) },
            Event::ReservationDecided { id: a, item_id: item, from: Status::Waiting, to: Status::Approved },
            Event::ReservationDecided { id: b, item_id: item, from: Status::Waiting, to: Status::Approved },
            Event::ReservationDecided { id: a, item_id: item, from: Status::Waiting, to: Status::Rejected },
        ];
        for e in &events {
            store.apply_event(e);
        }
        assert_eq!(store.find_by_id(a).await.unwrap().unwrap().status, Status::Approved);
        assert_eq!(store.find_by_id(b).await.unwrap().unwrap().status, Status::Waiting);
    }
}
