use std::collections::{HashMap, HashSet};

use crate::ws::connection::ConnectionId;

/// Keys a single connection is subscribed to. Kept as a reverse index so
/// unregistering a connection does not scan every conversation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionSubscriptions {
    pub conversations: HashSet<String>,
    pub watched_users: HashSet<String>,
}

/// Who hears what: conversation → connections, watched user → connections.
///
/// Not synchronized on its own; the hub owns it behind the same lock as the
/// connection registry. Every key maps to a non-empty set; empty sets are pruned.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    conversations: HashMap<String, HashSet<ConnectionId>>,
    watchers: HashMap<String, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, ConnectionSubscriptions>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the connection was not already subscribed.
    pub fn subscribe_conversation(&mut self, conversation_id: &str, conn: ConnectionId) -> bool {
        let added = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default()
            .insert(conn);
        if added {
            self.by_connection
                .entry(conn)
                .or_default()
                .conversations
                .insert(conversation_id.to_string());
        }
        added
    }

    /// Returns true if the connection was subscribed.
    pub fn unsubscribe_conversation(&mut self, conversation_id: &str, conn: ConnectionId) -> bool {
        let removed = remove_member(&mut self.conversations, conversation_id, conn);
        if removed {
            if let Some(subs) = self.by_connection.get_mut(&conn) {
                subs.conversations.remove(conversation_id);
            }
            self.prune_connection(conn);
        }
        removed
    }

    pub fn watch_user(&mut self, user_id: &str, conn: ConnectionId) -> bool {
        let added = self
            .watchers
            .entry(user_id.to_string())
            .or_default()
            .insert(conn);
        if added {
            self.by_connection
                .entry(conn)
                .or_default()
                .watched_users
                .insert(user_id.to_string());
        }
        added
    }

    pub fn unwatch_user(&mut self, user_id: &str, conn: ConnectionId) -> bool {
        let removed = remove_member(&mut self.watchers, user_id, conn);
        if removed {
            if let Some(subs) = self.by_connection.get_mut(&conn) {
                subs.watched_users.remove(user_id);
            }
            self.prune_connection(conn);
        }
        removed
    }

    /// Drop every subscription held by `conn`, returning what it had.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> ConnectionSubscriptions {
        let subs = self.by_connection.remove(&conn).unwrap_or_default();
        for conversation_id in &subs.conversations {
            remove_member(&mut self.conversations, conversation_id, conn);
        }
        for user_id in &subs.watched_users {
            remove_member(&mut self.watchers, user_id, conn);
        }
        subs
    }

    pub fn conversation_subscribers(&self, conversation_id: &str) -> Vec<ConnectionId> {
        self.conversations
            .get(conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn watchers_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.watchers
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, conversation_id: &str, conn: ConnectionId) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|set| set.contains(&conn))
    }

    pub fn subscriptions_of(&self, conn: ConnectionId) -> ConnectionSubscriptions {
        self.by_connection.get(&conn).cloned().unwrap_or_default()
    }

    /// Number of conversation keys currently held (for stats and tests).
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    pub fn watched_user_count(&self) -> usize {
        self.watchers.len()
    }

    fn prune_connection(&mut self, conn: ConnectionId) {
        let empty = self
            .by_connection
            .get(&conn)
            .is_some_and(|s| s.conversations.is_empty() && s.watched_users.is_empty());
        if empty {
            self.by_connection.remove(&conn);
        }
    }
}

fn remove_member(
    map: &mut HashMap<String, HashSet<ConnectionId>>,
    key: &str,
    conn: ConnectionId,
) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(&conn);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut index = SubscriptionIndex::new();
        let conn = ConnectionId::new();
        assert!(index.subscribe_conversation("conv-1", conn));
        assert!(!index.subscribe_conversation("conv-1", conn));
        assert_eq!(index.conversation_subscribers("conv-1"), vec![conn]);
    }

    #[test]
    fn test_unsubscribe_absent_is_noop() {
        let mut index = SubscriptionIndex::new();
        let conn = ConnectionId::new();
        assert!(!index.unsubscribe_conversation("conv-1", conn));
        assert!(!index.unwatch_user("user-1", conn));
        assert_eq!(index.conversation_count(), 0);
    }

    #[test]
    fn test_empty_keys_are_pruned() {
        let mut index = SubscriptionIndex::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        index.subscribe_conversation("conv-1", a);
        index.subscribe_conversation("conv-1", b);
        index.unsubscribe_conversation("conv-1", a);
        assert_eq!(index.conversation_count(), 1);
        index.unsubscribe_conversation("conv-1", b);
        assert_eq!(index.conversation_count(), 0);
        assert_eq!(index.subscriptions_of(b), ConnectionSubscriptions::default());
    }

    #[test]
    fn test_remove_connection_clears_every_entry() {
        let mut index = SubscriptionIndex::new();
        let gone = ConnectionId::new();
        let stays = ConnectionId::new();
        index.subscribe_conversation("conv-1", gone);
        index.subscribe_conversation("conv-2", gone);
        index.subscribe_conversation("conv-2", stays);
        index.watch_user("user-9", gone);

        let removed = index.remove_connection(gone);
        assert_eq!(removed.conversations.len(), 2);
        assert!(removed.watched_users.contains("user-9"));

        assert!(index.conversation_subscribers("conv-1").is_empty());
        assert_eq!(index.conversation_subscribers("conv-2"), vec![stays]);
        assert!(index.watchers_of("user-9").is_empty());
        assert_eq!(index.conversation_count(), 1);
        assert_eq!(index.watched_user_count(), 0);
    }

    #[test]
    fn test_watchers_are_independent_of_conversations() {
        let mut index = SubscriptionIndex::new();
        let conn = ConnectionId::new();
        index.watch_user("user-1", conn);
        assert!(!index.is_subscribed("user-1", conn));
        assert_eq!(index.watchers_of("user-1"), vec![conn]);
    }
}
