//! Read access to group membership and message backlog, plus the sink that
//! receives backfilled history.

use async_trait::async_trait;

use crate::{
    error::RepositoryError,
    types::{Chat, GroupId, Message, UserId},
};

/// Group membership lookup.
#[async_trait]
pub trait ChatRepository: Send + Sync + 'static {
    /// Fetch a chat. `None` if it does not exist.
    async fn get_chat_by_id(&self, group_id: &GroupId) -> Result<Option<Chat>, RepositoryError>;
}

/// Paged message backlog.
#[async_trait]
pub trait MessageRepository: Send + Sync + 'static {
    /// Messages of a chat in `[offset, offset + limit)`, oldest first.
    ///
    /// Returns fewer than `limit` messages only at the end of the backlog.
    async fn get_messages(
        &self,
        chat_id: &GroupId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError>;
}

/// Receives backfilled pages for a new member.
#[async_trait]
pub trait HistorySink: Send + Sync + 'static {
    /// Deliver one page. Pages arrive in backlog order.
    async fn deliver_history(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        messages: &[Message],
    ) -> Result<(), RepositoryError>;
}
