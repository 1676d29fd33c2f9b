//! Chat participant lookup.
//!
//! Chats and their members are owned by the persistence layer; the router
//! only needs the participant list. `InMemoryChatDirectory` is filled through
//! the collaborator API.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::connection_manager::UserIdentity;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Chat directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Participants of a chat, or `None` if the chat is unknown
    async fn participants(&self, chat_id: &str) -> Result<Option<HashSet<UserIdentity>>, DirectoryError>;
}

#[derive(Default)]
pub struct InMemoryChatDirectory {
    chats: DashMap<String, HashSet<UserIdentity>>,
}

impl InMemoryChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or replace a chat's participants; returns the distinct participant count
    pub fn upsert(&self, chat_id: impl Into<String>, participants: impl IntoIterator<Item = UserIdentity>) -> usize {
        let chat_id = chat_id.into();
        let participants: HashSet<_> = participants.into_iter().collect();
        let count = participants.len();
        tracing::debug!(chat_id = %chat_id, participants = count, "Chat participants recorded");
        self.chats.insert(chat_id, participants);
        count
    }

    pub fn remove(&self, chat_id: &str) -> bool {
        self.chats.remove(chat_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

#[async_trait]
impl ChatDirectory for InMemoryChatDirectory {
    async fn participants(&self, chat_id: &str) -> Result<Option<HashSet<UserIdentity>>, DirectoryError> {
        Ok(self.chats.get(chat_id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let directory = InMemoryChatDirectory::new();
        directory.upsert("c1", ["alice".to_string(), "bob".to_string()]);

        let participants = directory.participants("c1").await.unwrap().unwrap();
        assert!(participants.contains("alice"));
        assert!(participants.contains("bob"));
        assert!(directory.participants("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let directory = InMemoryChatDirectory::new();
        directory.upsert("c1", ["alice".to_string(), "bob".to_string()]);
        directory.upsert("c1", ["alice".to_string(), "carol".to_string()]);

        let participants = directory.participants("c1").await.unwrap().unwrap();
        assert!(!participants.contains("bob"));
        assert_eq!(directory.len(), 1);

        assert!(directory.remove("c1"));
        assert!(directory.is_empty());
    }
}
