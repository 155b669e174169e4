//! In-memory chat and message repositories, and a recording history sink.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use groupcast_core::{
    Chat, ChatRepository, GroupId, HistorySink, Message, MessageRepository, RepositoryError,
    UserId,
};

use crate::sim_env::SIM_EPOCH_MILLIS;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a chat with `participants`; the first participant is the admin.
pub fn chat(id: &str, participants: Vec<UserId>) -> Chat {
    Chat {
        id: id.into(),
        name: format!("chat {id}"),
        admins: participants.first().cloned().into_iter().collect(),
        participants,
        created_at: SIM_EPOCH_MILLIS,
    }
}

/// `count` users named `prefix0`, `prefix1`, ...
pub fn users(prefix: &str, count: usize) -> Vec<UserId> {
    (0..count).map(|i| UserId::new(format!("{prefix}{i}"))).collect()
}

/// In-memory [`ChatRepository`].
#[derive(Debug, Default)]
pub struct MemoryChatRepository {
    chats: Mutex<HashMap<GroupId, Chat>>,
    unavailable: AtomicBool,
}

impl MemoryChatRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a chat.
    pub fn insert(&self, chat: Chat) {
        lock(&self.chats).insert(chat.id.clone(), chat);
    }

    /// Make every lookup fail until called with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatRepository for MemoryChatRepository {
    async fn get_chat_by_id(&self, group_id: &GroupId) -> Result<Option<Chat>, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("chat repository offline".into()));
        }
        Ok(lock(&self.chats).get(group_id).cloned())
    }
}

/// In-memory [`MessageRepository`] that records how it was read.
#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    messages: Mutex<HashMap<GroupId, Vec<Message>>>,
    reads: AtomicUsize,
    largest_read: AtomicUsize,
    read_delay: Mutex<Duration>,
}

impl MemoryMessageRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `count` generated messages to a chat's backlog.
    pub fn seed_backlog(&self, chat_id: &GroupId, sender: &UserId, count: usize) {
        let mut messages = lock(&self.messages);
        let backlog = messages.entry(chat_id.clone()).or_default();
        let start = backlog.len();
        backlog.extend((start..start + count).map(|i| Message {
            id: format!("{chat_id}-{i}"),
            chat_id: chat_id.clone(),
            sender_id: sender.clone(),
            content: Bytes::from(format!("message {i}")),
            timestamp: SIM_EPOCH_MILLIS + i as u64,
        }));
    }

    /// Delay every read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        *lock(&self.read_delay) = delay;
    }

    /// Reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Most messages returned by any single read.
    pub fn largest_read(&self) -> usize {
        self.largest_read.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn get_messages(
        &self,
        chat_id: &GroupId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let delay = *lock(&self.read_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let page: Vec<Message> = lock(&self.messages)
            .get(chat_id)
            .map(|backlog| backlog.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default();

        self.reads.fetch_add(1, Ordering::SeqCst);
        self.largest_read.fetch_max(page.len(), Ordering::SeqCst);
        Ok(page)
    }
}

/// [`HistorySink`] that counts what it receives.
#[derive(Debug, Default)]
pub struct RecordingHistorySink {
    pages: Mutex<Vec<usize>>,
    last_message_id: Mutex<Option<String>>,
    fail: AtomicBool,
}

impl RecordingHistorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of every page received, in order.
    pub fn page_sizes(&self) -> Vec<usize> {
        lock(&self.pages).clone()
    }

    /// Messages received in total.
    pub fn total(&self) -> usize {
        lock(&self.pages).iter().sum()
    }

    /// Id of the newest message received.
    pub fn last_message_id(&self) -> Option<String> {
        lock(&self.last_message_id).clone()
    }

    /// Reject every page until called with `false`.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistorySink for RecordingHistorySink {
    async fn deliver_history(
        &self,
        _group_id: &GroupId,
        _user_id: &UserId,
        messages: &[Message],
    ) -> Result<(), RepositoryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("history sink offline".into()));
        }
        lock(&self.pages).push(messages.len());
        if let Some(last) = messages.last() {
            *lock(&self.last_message_id) = Some(last.id.clone());
        }
        Ok(())
    }
}
