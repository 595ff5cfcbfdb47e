use crate::limits::MAX_COMMENT_LEN;
use crate::model::*;
use crate::observability::COMMENTS_TOTAL;

use super::store::{Page, Scan};
use super::{Engine, EngineError};

/// Whether a user may comment on an item, and why not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// An APPROVED reservation of the item by the user has ended.
    Eligible,
    /// APPROVED reservations exist but none has ended yet.
    RentalNotFinished,
    NoCompletedRental,
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        self == Eligibility::Eligible
    }

    pub fn reason(self) -> Option<&'static str> {
        match self {
            Eligibility::Eligible => None,
            Eligibility::RentalNotFinished => Some("rental not finished"),
            Eligibility::NoCompletedRental => Some("no completed rental of this item"),
        }
    }

    fn of(approved: &[Reservation], now: Ms) -> Self {
        if approved.iter().any(|r| r.span.end < now) {
            Eligibility::Eligible
        } else if approved.is_empty() {
            Eligibility::NoCompletedRental
        } else {
            Eligibility::RentalNotFinished
        }
    }
}

impl Engine {
    pub async fn comment_eligibility(
        &self,
        user: UserId,
        item: ItemId,
        now: Ms,
    ) -> Result<Eligibility, EngineError> {
        let mut scan = Scan::booked_by(user).with_status(Status::Approved);
        scan.items = Some(vec![item]);
        let approved = self.store.scan(&scan, Page::everything()).await?;
        Ok(Eligibility::of(&approved, now))
    }

    pub async fn can_comment(&self, user: UserId, item: ItemId, now: Ms) -> Result<bool, EngineError> {
        Ok(self.comment_eligibility(user, item, now).await?.is_eligible())
    }

    /// Record a comment once the author has finished renting the item.
    pub async fn add_comment(
        &self,
        author: UserId,
        item: ItemId,
        text: String,
        now: Ms,
    ) -> Result<Comment, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::validation("comment text must not be blank"));
        }
        if text.len() > MAX_COMMENT_LEN {
            return Err(EngineError::validation(format!(
                "comment text must be at most {MAX_COMMENT_LEN} bytes"
            )));
        }
        self.require_user(author).await?;
        self.require_item(item).await?;

        let eligibility = self.comment_eligibility(author, item, now).await?;
        if let Some(reason) = eligibility.reason() {
            tracing::debug!("user {author} may not comment on item {item}: {reason}");
            return Err(EngineError::validation(reason));
        }

        let comment = self.comments.record(author, item, text, now).await?;
        metrics::counter!(COMMENTS_TOTAL).increment(1);
        tracing::info!("comment {} on item {item} by {author}", comment.id);
        Ok(comment)
    }
}
