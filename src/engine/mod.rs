mod conflict;
mod eligibility;
mod error;
mod mutations;
mod queries;
pub mod store;

pub use conflict::now_ms;
pub use eligibility::Eligibility;
pub use error::{EngineError, ErrorKind, StoreError};
pub use queries::{Role, StateToken};
pub use store::{InMemoryStore, Order, Page, ReservationStore, Scan, Window};

use std::sync::Arc;

use crate::directory::{CommentSink, ItemCatalog, UserDirectory};
use crate::model::*;

/// The booking reservation engine. Owns no state of its own: reservations
/// live in the store, users/items/comments behind the directory traits.
pub struct Engine {
    pub(super) store: Arc<dyn ReservationStore>,
    pub(super) users: Arc<dyn UserDirectory>,
    pub(super) items: Arc<dyn ItemCatalog>,
    pub(super) comments: Arc<dyn CommentSink>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        users: Arc<dyn UserDirectory>,
        items: Arc<dyn ItemCatalog>,
        comments: Arc<dyn CommentSink>,
    ) -> Self {
        Self {
            store,
            users,
            items,
            comments,
        }
    }

    /// Engine over one object serving all three directory roles.
    pub fn with_directory<D>(store: Arc<dyn ReservationStore>, directory: Arc<D>) -> Self
    where
        D: UserDirectory + ItemCatalog + CommentSink + 'static,
    {
        Self::new(store, directory.clone(), directory.clone(), directory)
    }

    pub(super) async fn require_user(&self, id: UserId) -> Result<(), EngineError> {
        if self.users.exists(id).await? {
            Ok(())
        } else {
            Err(EngineError::user_not_found(id))
        }
    }

    pub(super) async fn require_item(&self, id: ItemId) -> Result<Item, EngineError> {
        self.items
            .get_item(id)
            .await?
            .ok_or_else(|| EngineError::item_not_found(id))
    }

    pub(super) async fn require_reservation(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }
}
