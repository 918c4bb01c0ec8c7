//! Conversation and message persistence, as seen by the realtime handlers.
//!
//! The hub only needs a narrow slice of the chat domain: membership checks,
//! message writes and conversation listing. [`ChatStore`] is that slice;
//! [`store::SqliteChatStore`] is the bundled implementation.

pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
    Business,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Business => "business",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "business" => Some(Self::Business),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub last_message_at: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub edited_at: Option<String>,
    pub deleted: bool,
}

/// Input for [`ChatStore::create_conversation`]. `members` includes the creator.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub tenant_id: String,
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub created_by: String,
    pub members: Vec<String>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError>;

    /// Existing direct conversation between two users of a tenant, if any.
    async fn find_direct_conversation(
        &self,
        tenant_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError>;

    /// Conversations the user belongs to, most recently active first.
    async fn list_conversations(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError>;

    async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool, StoreError>;

    async fn conversation_members(&self, conversation_id: &str) -> Result<Vec<String>, StoreError>;

    async fn insert_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<ChatMessage, StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<ChatMessage, StoreError>;

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<ChatMessage, StoreError>;

    /// Soft delete: the row stays, content is blanked.
    async fn delete_message(&self, message_id: &str) -> Result<ChatMessage, StoreError>;

    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError>;
}
