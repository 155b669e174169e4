//! Group History Manager
//!
//! Backfills a group's backlog for a member who just joined. The backlog is
//! read in fixed-size pages and handed to a [`HistorySink`] one page at a
//! time, so memory stays bounded by the page size however long the backlog.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    config::HistoryConfig,
    error::HistoryError,
    repository::{ChatRepository, HistorySink, MessageRepository},
    types::{GroupId, UserId},
};

/// Outcome of one history sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySyncResult {
    /// Group synced
    pub group_id: GroupId,
    /// Member the history was delivered to
    pub user_id: UserId,
    /// Messages handed to the sink
    pub messages_synced: usize,
    /// Repository reads issued
    pub pages_fetched: usize,
    /// Stopped at the configured ceiling rather than the end of the backlog
    pub truncated: bool,
}

/// Pages a group's backlog into a sink for new members.
pub struct GroupHistoryManager {
    config: HistoryConfig,
    chats: Arc<dyn ChatRepository>,
    messages: Arc<dyn MessageRepository>,
    sink: Arc<dyn HistorySink>,
}

impl GroupHistoryManager {
    /// Create a history manager.
    pub fn new(
        chats: Arc<dyn ChatRepository>,
        messages: Arc<dyn MessageRepository>,
        sink: Arc<dyn HistorySink>,
        config: HistoryConfig,
    ) -> Self {
        Self { config, chats, messages, sink }
    }

    /// Deliver the group's backlog to `user_id`, oldest first.
    ///
    /// Stops at the end of the backlog or after `max_history_messages`.
    #[tracing::instrument(skip_all, fields(group_id = %group_id, user_id = %user_id))]
    pub async fn synchronize_history_for_new_member(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<HistorySyncResult, HistoryError> {
        let chat = self
            .chats
            .get_chat_by_id(group_id)
            .await?
            .ok_or_else(|| HistoryError::GroupNotFound(group_id.clone()))?;
        if !chat.participants.contains(user_id) {
            return Err(HistoryError::NotAMember {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
            });
        }

        let page_size = self.config.page_size.max(1);
        let ceiling = self.config.max_history_messages;
        let mut result = HistorySyncResult {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
            messages_synced: 0,
            pages_fetched: 0,
            truncated: false,
        };

        while result.messages_synced < ceiling {
            let offset = result.messages_synced;
            let limit = page_size.min(ceiling - offset);

            let mut page = tokio::time::timeout(
                self.config.page_timeout,
                self.messages.get_messages(group_id, limit, offset),
            )
            .await
            .map_err(|_| HistoryError::Timeout { offset, timeout: self.config.page_timeout })??;
            page.truncate(limit);
            result.pages_fetched += 1;

            if !page.is_empty() {
                self.sink
                    .deliver_history(group_id, user_id, &page)
                    .await
                    .map_err(|e| HistoryError::Sink(e.to_string()))?;
            }
            result.messages_synced += page.len();

            tracing::debug!(offset, fetched = page.len(), "History page delivered");

            if page.len() < limit {
                break;
            }
            result.truncated = result.messages_synced >= ceiling;
        }

        tracing::info!(
            messages = result.messages_synced,
            pages = result.pages_fetched,
            truncated = result.truncated,
            "History synchronized"
        );
        Ok(result)
    }

    /// Run [`Self::synchronize_history_for_new_member`] on the runtime.
    pub fn spawn_history_sync(
        self: &Arc<Self>,
        group_id: GroupId,
        user_id: UserId,
    ) -> JoinHandle<Result<HistorySyncResult, HistoryError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.synchronize_history_for_new_member(&group_id, &user_id).await })
    }
}

impl std::fmt::Debug for GroupHistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHistoryManager").field("config", &self.config).finish_non_exhaustive()
    }
}
