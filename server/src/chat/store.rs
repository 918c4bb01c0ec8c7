use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{ChatMessage, ChatStore, Conversation, ConversationKind, NewConversation};
use crate::db::{with_conn, DbPool};
use crate::error::StoreError;

#[derive(Clone)]
pub struct SqliteChatStore {
    db: DbPool,
}

impl SqliteChatStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn load_members(conn: &Connection, conversation_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_members WHERE conversation_id = ?1 ORDER BY joined_at, user_id",
    )?;
    let members = stmt
        .query_map(params![conversation_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(members)
}

fn load_conversation(conn: &Connection, conversation_id: &str) -> Result<Conversation, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, kind, title, created_by, created_at, last_message_at
             FROM conversations WHERE id = ?1",
            params![conversation_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;

    let (id, tenant_id, kind, title, created_by, created_at, last_message_at) = row;
    let kind = ConversationKind::parse(&kind)
        .ok_or_else(|| StoreError::Unavailable(format!("unknown conversation kind {}", kind)))?;
    let members = load_members(conn, &id)?;

    Ok(Conversation {
        id,
        tenant_id,
        kind,
        title,
        created_by,
        created_at,
        last_message_at,
        members,
    })
}

fn load_message(conn: &Connection, message_id: &str) -> Result<ChatMessage, StoreError> {
    conn.query_row(
        "SELECT id, conversation_id, sender_id, content, created_at, edited_at, deleted
         FROM messages WHERE id = ?1",
        params![message_id],
        |row| {
            Ok(ChatMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
                edited_at: row.get(5)?,
                deleted: row.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, StoreError> {
        with_conn(&self.db, move |conn| {
            let id = uuid::Uuid::now_v7().to_string();
            let now = now_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, tenant_id, kind, title, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    new.tenant_id,
                    new.kind.as_str(),
                    new.title,
                    new.created_by,
                    now
                ],
            )?;
            for member in &new.members {
                tx.execute(
                    "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![id, member, now],
                )?;
            }
            tx.commit()?;
            load_conversation(conn, &id)
        })
        .await
    }

    async fn find_direct_conversation(
        &self,
        tenant_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let user_a = user_a.to_string();
        let user_b = user_b.to_string();
        with_conn(&self.db, move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT c.id FROM conversations c
                     JOIN conversation_members a ON a.conversation_id = c.id AND a.user_id = ?2
                     JOIN conversation_members b ON b.conversation_id = c.id AND b.user_id = ?3
                     WHERE c.tenant_id = ?1 AND c.kind = 'direct'
                     LIMIT 1",
                    params![tenant_id, user_a, user_b],
                    |row| row.get(0),
                )
                .optional()?;
            id.map(|id| load_conversation(conn, &id)).transpose()
        })
        .await
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        let conversation_id = conversation_id.to_string();
        with_conn(&self.db, move |conn| load_conversation(conn, &conversation_id)).await
    }

    async fn list_conversations(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        let tenant_id = tenant_id.to_string();
        let user_id = user_id.to_string();
        with_conn(&self.db, move |conn| {
            let ids = {
                let mut stmt = conn.prepare(
                    "SELECT c.id FROM conversations c
                     JOIN conversation_members m ON m.conversation_id = c.id
                     WHERE c.tenant_id = ?1 AND m.user_id = ?2
                     ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
                )?;
                let ids = stmt
                    .query_map(params![tenant_id, user_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            };
            ids.iter().map(|id| load_conversation(conn, id)).collect()
        })
        .await
    }

    async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        with_conn(&self.db, move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn conversation_members(&self, conversation_id: &str) -> Result<Vec<String>, StoreError> {
        let conversation_id = conversation_id.to_string();
        with_conn(&self.db, move |conn| load_members(conn, &conversation_id)).await
    }

    async fn insert_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let conversation_id = conversation_id.to_string();
        let sender_id = sender_id.to_string();
        let content = content.to_string();
        with_conn(&self.db, move |conn| {
            let id = uuid::Uuid::now_v7().to_string();
            let now = now_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, conversation_id, sender_id, content, now],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                params![now, conversation_id],
            )?;
            tx.commit()?;

            Ok(ChatMessage {
                id,
                conversation_id,
                sender_id,
                content,
                created_at: now,
                edited_at: None,
                deleted: false,
            })
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> Result<ChatMessage, StoreError> {
        let message_id = message_id.to_string();
        with_conn(&self.db, move |conn| load_message(conn, &message_id)).await
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<ChatMessage, StoreError> {
        let message_id = message_id.to_string();
        let content = content.to_string();
        with_conn(&self.db, move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET content = ?1, edited_at = ?2 WHERE id = ?3 AND deleted = 0",
                params![content, now_rfc3339(), message_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("message {}", message_id)));
            }
            load_message(conn, &message_id)
        })
        .await
    }

    async fn delete_message(&self, message_id: &str) -> Result<ChatMessage, StoreError> {
        let message_id = message_id.to_string();
        with_conn(&self.db, move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET content = '', deleted = 1 WHERE id = ?1 AND deleted = 0",
                params![message_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("message {}", message_id)));
            }
            load_message(conn, &message_id)
        })
        .await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        let message_id = message_id.to_string();
        with_conn(&self.db, move |conn| {
            let updated = conn.execute(
                "UPDATE conversation_members SET last_read_message_id = ?1
                 WHERE conversation_id = ?2 AND user_id = ?3",
                params![message_id, conversation_id, user_id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!(
                    "membership of {} in {}",
                    user_id, conversation_id
                )));
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    fn store() -> SqliteChatStore {
        SqliteChatStore::new(init_memory_db().unwrap())
    }

    fn group(members: &[&str]) -> NewConversation {
        NewConversation {
            tenant_id: "t1".into(),
            kind: ConversationKind::Group,
            title: Some("Team".into()),
            created_by: members[0].to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_and_membership() {
        let store = store();
        let conv = store.create_conversation(group(&["alice", "bob"])).await.unwrap();
        assert_eq!(conv.kind, ConversationKind::Group);
        assert_eq!(conv.members.len(), 2);
        assert!(store.is_member(&conv.id, "alice").await.unwrap());
        assert!(!store.is_member(&conv.id, "dave").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_direct_conversation() {
        let store = store();
        let direct = store
            .create_conversation(NewConversation {
                tenant_id: "t1".into(),
                kind: ConversationKind::Direct,
                title: None,
                created_by: "alice".into(),
                members: vec!["alice".into(), "bob".into()],
            })
            .await
            .unwrap();
        let found = store
            .find_direct_conversation("t1", "bob", "alice")
            .await
            .unwrap()
            .expect("direct conversation");
        assert_eq!(found.id, direct.id);
        assert!(store
            .find_direct_conversation("t2", "alice", "bob")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_message_lifecycle() {
        let store = store();
        let conv = store.create_conversation(group(&["alice", "bob"])).await.unwrap();
        let msg = store.insert_message(&conv.id, "alice", "hello").await.unwrap();

        let edited = store.edit_message(&msg.id, "hello there").await.unwrap();
        assert_eq!(edited.content, "hello there");
        assert!(edited.edited_at.is_some());

        let deleted = store.delete_message(&msg.id).await.unwrap();
        assert!(deleted.deleted);
        assert!(deleted.content.is_empty());
        assert!(matches!(
            store.edit_message(&msg.id, "again").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_orders_by_activity() {
        let store = store();
        let first = store.create_conversation(group(&["alice", "bob"])).await.unwrap();
        let second = store.create_conversation(group(&["alice", "carol"])).await.unwrap();
        store.insert_message(&first.id, "bob", "ping").await.unwrap();

        let listed = store.list_conversations("t1", "alice").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
        assert!(store.list_conversations("t1", "dave").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_requires_membership() {
        let store = store();
        let conv = store.create_conversation(group(&["alice", "bob"])).await.unwrap();
        let msg = store.insert_message(&conv.id, "alice", "hi").await.unwrap();
        store.mark_read(&conv.id, "bob", &msg.id).await.unwrap();
        assert!(store.mark_read(&conv.id, "dave", &msg.id).await.is_err());
    }
}
