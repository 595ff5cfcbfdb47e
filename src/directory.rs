//! Users, items and comments: the collaborators the reservation engine
//! consults but does not own.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Journal;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("journal: {0}")]
    Journal(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn exists(&self, id: UserId) -> Result<bool, DirectoryError>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>, DirectoryError>;
}

#[async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, DirectoryError>;
    /// Ids of the items currently owned by `owner`.
    async fn items_owned_by(&self, owner: UserId) -> Result<Vec<ItemId>, DirectoryError>;
}

#[async_trait]
pub trait CommentSink: Send + Sync {
    async fn record(
        &self,
        author: UserId,
        item: ItemId,
        text: String,
        created: Ms,
    ) -> Result<Comment, DirectoryError>;
}

#[derive(Default)]
struct DirectoryState {
    users: DashMap<UserId, User>,
    /// Lower-cased email → user id, for uniqueness.
    emails: DashMap<String, UserId>,
    items: DashMap<ItemId, Item>,
    owned: DashMap<UserId, Vec<ItemId>>,
    comments: DashMap<ItemId, Vec<Comment>>,
}

impl DirectoryState {
    fn apply_user(&self, user: User) -> User {
        self.emails.insert(user.email.to_lowercase(), user.id);
        self.users.insert(user.id, user.clone());
        user
    }

    fn apply_item(&self, item: Item) -> Item {
        self.owned.entry(item.owner_id).or_default().push(item.id);
        self.items.insert(item.id, item.clone());
        item
    }

    fn apply_comment(&self, comment: Comment) -> Comment {
        self.comments
            .entry(comment.item_id)
            .or_default()
            .push(comment.clone());
        comment
    }
}

/// Directory kept in memory, optionally journaled to the WAL.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: Arc<DirectoryState>,
    journal: Option<Journal>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal: Some(journal),
        }
    }

    /// Journal `event`, then `apply` it. Both run on a spawned task so a
    /// cancelled caller cannot leave one done without the other; `undo`
    /// runs if the append fails.
    async fn commit<T, A, U>(&self, event: Event, apply: A, undo: U) -> Result<T, DirectoryError>
    where
        T: Send + 'static,
        A: FnOnce(&DirectoryState) -> T + Send + 'static,
        U: FnOnce(&DirectoryState) + Send + 'static,
    {
        let Some(journal) = self.journal.clone() else {
            return Ok(apply(self.state.as_ref()));
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            let _permit = journal.permit().await;
            if let Err(e) = journal.append(&event).await {
                undo(state.as_ref());
                return Err(DirectoryError::Journal(e.to_string()));
            }
            Ok(apply(state.as_ref()))
        })
        .await
        .map_err(|e| DirectoryError::Journal(format!("commit task failed: {e}")))?
    }

    pub async fn register_user(
        &self,
        id: UserId,
        name: String,
        email: String,
    ) -> Result<User, DirectoryError> {
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            return Err(DirectoryError::Invalid("user name must be 1..=255 bytes".into()));
        }
        if email.len() > MAX_EMAIL_LEN || !is_plausible_email(&email) {
            return Err(DirectoryError::Invalid(format!("invalid email: {email}")));
        }
        if self.state.users.contains_key(&id) {
            return Err(DirectoryError::Duplicate(format!("user {id} already exists")));
        }
        let key = email.to_lowercase();
        match self.state.emails.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(DirectoryError::Duplicate(format!("email already registered: {email}")));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        let user = self
            .commit(
                event,
                move |state| state.apply_user(User { id, name, email }),
                move |state| {
                    state.emails.remove(&key);
                },
            )
            .await?;
        tracing::info!("registered user {id}");
        Ok(user)
    }

    pub async fn list_item(
        &self,
        id: ItemId,
        owner_id: UserId,
        name: String,
        description: String,
        available: bool,
    ) -> Result<Item, DirectoryError> {
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            return Err(DirectoryError::Invalid("item name must be 1..=255 bytes".into()));
        }
        if description.trim().is_empty() || description.len() > MAX_DESCRIPTION_LEN {
            return Err(DirectoryError::Invalid(
                "item description must be 1..=2000 bytes".into(),
            ));
        }
        if !self.state.users.contains_key(&owner_id) {
            return Err(DirectoryError::NotFound(format!("user {owner_id}")));
        }
        if self.state.items.contains_key(&id) {
            return Err(DirectoryError::Duplicate(format!("item {id} already exists")));
        }

        let item = Item {
            id,
            owner_id,
            name,
            description,
            available,
        };
        let event = Event::ItemListed {
            id,
            owner_id,
            name: item.name.clone(),
            description: item.description.clone(),
            available,
        };
        let item = self
            .commit(event, move |state| state.apply_item(item), |_| {})
            .await?;
        tracing::info!("user {owner_id} listed item {id}");
        Ok(item)
    }

    pub fn comments_for(&self, item: ItemId) -> Vec<Comment> {
        let mut comments = self
            .state
            .comments
            .get(&item)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        comments.sort_by_key(|c| (c.created, c.id));
        comments
    }

    /// Apply a replayed directory event. Reservation events are ignored.
    pub fn apply_event(&self, event: &Event) {
        match event.clone() {
            Event::UserRegistered { id, name, email } => {
                self.state.apply_user(User { id, name, email });
            }
            Event::ItemListed {
                id,
                owner_id,
                name,
                description,
                available,
            } => {
                self.state.apply_item(Item {
                    id,
                    owner_id,
                    name,
                    description,
                    available,
                });
            }
            Event::CommentRecorded {
                id,
                item_id,
                author_id,
                text,
                created,
            } => {
                self.state.apply_comment(Comment {
                    id,
                    item_id,
                    author_id,
                    text,
                    created,
                });
            }
            Event::ReservationCreated { .. } | Event::ReservationDecided { .. } => {}
        }
    }

    /// Events that recreate the current directory state, for WAL compaction.
    /// Users come first so every item's owner exists when it is replayed.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for user in self.state.users.iter() {
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name.clone(),
                email: user.email.clone(),
            });
        }
        for item in self.state.items.iter() {
            events.push(Event::ItemListed {
                id: item.id,
                owner_id: item.owner_id,
                name: item.name.clone(),
                description: item.description.clone(),
                available: item.available,
            });
        }
        for entry in self.state.comments.iter() {
            for c in entry.value() {
                events.push(Event::CommentRecorded {
                    id: c.id,
                    item_id: c.item_id,
                    author_id: c.author_id,
                    text: c.text.clone(),
                    created: c.created,
                });
            }
        }
        events
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn exists(&self, id: UserId) -> Result<bool, DirectoryError> {
        Ok(self.state.users.contains_key(&id))
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, DirectoryError> {
        Ok(self.state.users.get(&id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl ItemCatalog for InMemoryDirectory {
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, DirectoryError> {
        Ok(self.state.items.get(&id).map(|e| e.value().clone()))
    }

    async fn items_owned_by(&self, owner: UserId) -> Result<Vec<ItemId>, DirectoryError> {
        Ok(self
            .state
            .owned
            .get(&owner)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CommentSink for InMemoryDirectory {
    async fn record(
        &self,
        author: UserId,
        item: ItemId,
        text: String,
        created: Ms,
    ) -> Result<Comment, DirectoryError> {
        let comment = Comment {
            id: Ulid::new(),
            item_id: item,
            author_id: author,
            text,
            created,
        };
        let event = Event::CommentRecorded {
            id: comment.id,
            item_id: item,
            author_id: author,
            text: comment.text.clone(),
            created,
        };
        self.commit(event, move |state| state.apply_comment(comment), |_| {})
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_lookup_user() {
        let dir = InMemoryDirectory::new();
        let id = Ulid::new();
        dir.register_user(id, "Ann".into(), "ann@example.com".into())
            .await
            .unwrap();

        assert!(dir.exists(id).await.unwrap());
        assert!(!dir.exists(Ulid::new()).await.unwrap());
        assert_eq!(dir.get_user(id).await.unwrap().unwrap().name, "Ann");
    }

    #[tokio::test]
    async fn duplicate_email_rejected_case_insensitive() {
        let dir = InMemoryDirectory::new();
        dir.register_user(Ulid::new(), "Ann".into(), "ann@example.com".into())
            .await
            .unwrap();
        let err = dir
            .register_user(Ulid::new(), "Other".into(), "ANN@example.com".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Duplicate(_)));
    }

    #[tokio::test]
    async fn invalid_email_rejected() {
        let dir = InMemoryDirectory::new();
        let err = dir
            .register_user(Ulid::new(), "Ann".into(), "not-an-email".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Invalid(_)));
    }

    #[tokio::test]
    async fn item_requires_existing_owner() {
        let dir = InMemoryDirectory::new();
        let err = dir
            .list_item(Ulid::new(), Ulid::new(), "Drill".into(), "Cordless".into(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn items_indexed_by_owner() {
        let dir = InMemoryDirectory::new();
        let owner = Ulid::new();
        dir.register_user(owner, "Olga".into(), "olga@example.com".into())
            .await
            .unwrap();
        let a = Ulid::new();
        let b = Ulid::new();
        dir.list_item(a, owner, "Drill".into(), "Cordless".into(), true)
            .await
            .unwrap();
        dir.list_item(b, owner, "Ladder".into(), "3m".into(), false)
            .await
            .unwrap();

        let mut owned = dir.items_owned_by(owner).await.unwrap();
        owned.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(owned, expected);
        assert!(!dir.get_item(b).await.unwrap().unwrap().available);
    }

    #[tokio::test]
    async fn snapshot_replays_into_equal_directory() {
        let dir = InMemoryDirectory::new();
        let owner = Ulid::new();
        let item = Ulid::new();
        dir.register_user(owner, "Olga".into(), "olga@example.com".into())
            .await
            .unwrap();
        dir.list_item(item, owner, "Drill".into(), "Cordless".into(), true)
            .await
            .unwrap();
        dir.record(owner, item, "great".into(), 5).await.unwrap();

        let copy = InMemoryDirectory::new();
        for event in dir.snapshot_events() {
            copy.apply_event(&event);
        }
        assert!(copy.exists(owner).await.unwrap());
        assert_eq!(copy.get_item(item).await.unwrap(), dir.get_item(item).await.unwrap());
        assert_eq!(copy.comments_for(item), dir.comments_for(item));
        // email index restored too
        assert!(copy
            .register_user(Ulid::new(), "X".into(), "OLGA@example.com".into())
            .await
            .is_err());
    }
}
