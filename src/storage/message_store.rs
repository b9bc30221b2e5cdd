use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{OptionalExtension, params};
use tokio::sync::broadcast;

use crate::common::{ChatMessage, DeliveryState, SenderType};
use crate::error::SyncError;

use super::database::Database;

const NOTIFY_CAPACITY: usize = 64;

/// Durable message cache, the single source of truth for rendering.
///
/// Every mutation is one SQLite statement or transaction, followed by exactly
/// one change notification carrying the affected conversation id. Ordering
/// within a conversation is `(timestamp, rowid)`; rowid is the insertion
/// sequence and breaks timestamp ties.
pub struct MessageStore {
    db: Mutex<Database>,
    notifier: broadcast::Sender<String>,
}

impl MessageStore {
    /// Open (and initialize) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        Self::from_database(Database::new(path)?)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, SyncError> {
        Self::from_database(Database::in_memory()?)
    }

    fn from_database(db: Database) -> Result<Self, SyncError> {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        let store = Self {
            db: Mutex::new(db),
            notifier,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), SyncError> {
        let db = self.lock()?;
        let conn = db.connection();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                content TEXT NOT NULL,
                sender_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                delivery_state TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                response_to TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, timestamp)",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, SyncError> {
        self.db
            .lock()
            .map_err(|_| SyncError::Storage("connection mutex poisoned".into()))
    }

    /// Subscribe to change notifications; each item is the conversation id
    /// whose rows changed. This is what the engine's live views are built on.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notifier.subscribe()
    }

    fn notify(&self, conversation_id: &str) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.notifier.send(conversation_id.to_string());
    }

    /// Insert or update a message keyed by id.
    pub fn upsert(&self, message: &ChatMessage) -> Result<(), SyncError> {
        {
            let db = self.lock()?;
            db.connection().execute(
                "INSERT INTO messages
                     (id, conversation_id, content, sender_type, timestamp, delivery_state, is_read, response_to)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     content = excluded.content,
                     delivery_state = excluded.delivery_state,
                     is_read = excluded.is_read,
                     response_to = excluded.response_to",
                params![
                    message.id,
                    message.conversation_id,
                    message.content,
                    message.sender_type.as_str(),
                    message.timestamp,
                    message.delivery_state.as_str(),
                    message.is_read as i64,
                    message.response_to,
                ],
            )?;
        }
        self.notify(&message.conversation_id);
        Ok(())
    }

    /// Insert only if the id is unknown; returns false on a duplicate.
    /// Redelivered frames dedup here.
    pub fn insert_if_absent(&self, message: &ChatMessage) -> Result<bool, SyncError> {
        let inserted = {
            let db = self.lock()?;
            db.connection().execute(
                "INSERT OR IGNORE INTO messages
                     (id, conversation_id, content, sender_type, timestamp, delivery_state, is_read, response_to)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id,
                    message.conversation_id,
                    message.content,
                    message.sender_type.as_str(),
                    message.timestamp,
                    message.delivery_state.as_str(),
                    message.is_read as i64,
                    message.response_to,
                ],
            )?
        };
        if inserted > 0 {
            self.notify(&message.conversation_id);
        }
        Ok(inserted > 0)
    }

    /// Look up a single message by id.
    pub fn get(&self, id: &str) -> Result<Option<ChatMessage>, SyncError> {
        let db = self.lock()?;
        let message = db
            .connection()
            .query_row(
                "SELECT id, conversation_id, content, sender_type, timestamp, delivery_state, is_read, response_to
                 FROM messages WHERE id = ?1",
                params![id],
                map_message_row,
            )
            .optional()?;
        Ok(message)
    }

    /// All messages for a conversation, ordered by `(timestamp, rowid)`.
    pub fn query_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, SyncError> {
        let db = self.lock()?;
        let mut stmt = db.connection().prepare(
            "SELECT id, conversation_id, content, sender_type, timestamp, delivery_state, is_read, response_to
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;

        let messages = stmt
            .query_map(params![conversation_id], map_message_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(messages)
    }

    /// Up to `limit` messages strictly older than `before` (or the newest
    /// ones when `before` is None), returned oldest first. Lazy history
    /// loading uses this.
    pub fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<ChatMessage>, SyncError> {
        let db = self.lock()?;
        let mut stmt = db.connection().prepare(
            "SELECT id, conversation_id, content, sender_type, timestamp, delivery_state, is_read, response_to
             FROM messages
             WHERE conversation_id = ?1 AND timestamp < ?2
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?3",
        )?;

        let mut messages = stmt
            .query_map(
                params![conversation_id, before.unwrap_or(i64::MAX), limit as i64],
                map_message_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }

    /// Largest timestamp stored for a conversation, if any.
    pub fn latest_timestamp(&self, conversation_id: &str) -> Result<Option<i64>, SyncError> {
        let db = self.lock()?;
        let latest = db
            .connection()
            .query_row(
                "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }

    /// Number of messages stored for a conversation.
    pub fn message_count(&self, conversation_id: &str) -> Result<usize, SyncError> {
        let db = self.lock()?;
        let count: i64 = db.connection().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Advance the delivery state of a message in place. Returns false when
    /// the id is unknown.
    pub fn set_delivery_state(&self, id: &str, state: DeliveryState) -> Result<bool, SyncError> {
        let conversation = {
            let db = self.lock()?;
            let conn = db.connection();
            let conversation: Option<String> = conn
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if conversation.is_some() {
                conn.execute(
                    "UPDATE messages SET delivery_state = ?1 WHERE id = ?2",
                    params![state.as_str(), id],
                )?;
            }
            conversation
        };

        match conversation {
            Some(conversation) => {
                self.notify(&conversation);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flip the read flag on the given messages within a conversation.
    /// Returns how many rows changed.
    pub fn mark_read(&self, conversation_id: &str, ids: &[String]) -> Result<usize, SyncError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let changed = {
            let mut db = self.lock()?;
            let tx = db.connection_mut().transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE messages SET is_read = 1
                     WHERE id = ?1 AND conversation_id = ?2 AND is_read = 0",
                )?;
                for id in ids {
                    changed += stmt.execute(params![id, conversation_id])?;
                }
            }
            tx.commit()?;
            changed
        };

        if changed > 0 {
            self.notify(conversation_id);
        }
        Ok(changed)
    }

    /// Swap a client-local id for the server id once the backend acknowledged
    /// the submission. If a row with the server id already arrived over the
    /// channel (the reply raced the ack), that row wins and the local one is
    /// removed. The whole swap is one transaction.
    pub fn reconcile_id(
        &self,
        local_id: &str,
        server_id: &str,
        state: DeliveryState,
    ) -> Result<(), SyncError> {
        let conversation = {
            let mut db = self.lock()?;
            let tx = db.connection_mut().transaction()?;

            let conversation: Option<String> = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    params![local_id],
                    |row| row.get(0),
                )
                .optional()?;

            if conversation.is_some() {
                let server_row_exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
                    params![server_id],
                    |row| row.get(0),
                )?;

                if server_row_exists {
                    tx.execute("DELETE FROM messages WHERE id = ?1", params![local_id])?;
                } else {
                    tx.execute(
                        "UPDATE messages SET id = ?1, delivery_state = ?2 WHERE id = ?3",
                        params![server_id, state.as_str(), local_id],
                    )?;
                }
            }

            tx.commit()?;
            conversation
        };

        if let Some(conversation) = conversation {
            self.notify(&conversation);
        }
        Ok(())
    }

    /// Make every later query fail, then fire one change notification.
    /// Lets engine tests exercise the snapshot error path.
    #[cfg(test)]
    pub(crate) fn break_queries(&self, conversation_id: &str) {
        if let Ok(db) = self.lock() {
            let _ = db.connection().execute("DROP TABLE messages", []);
        }
        self.notify(conversation_id);
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let sender_raw: String = row.get(3)?;
    let state_raw: String = row.get(5)?;

    let sender_type = SenderType::parse(&sender_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown sender type `{sender_raw}`").into(),
        )
    })?;
    let delivery_state = DeliveryState::parse(&state_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown delivery state `{state_raw}`").into(),
        )
    })?;

    Ok(ChatMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
        sender_type,
        timestamp: row.get(4)?,
        delivery_state,
        is_read: row.get::<_, i64>(6)? != 0,
        response_to: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, conversation: &str, timestamp: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            content: format!("content of {id}"),
            sender_type: SenderType::User,
            timestamp,
            delivery_state: DeliveryState::Pending,
            is_read: false,
            response_to: None,
        }
    }

    #[test]
    fn query_orders_by_timestamp_regardless_of_insertion_order() {
        let store = MessageStore::in_memory().expect("store");
        store.upsert(&message("m3", "conv1", 30)).expect("insert");
        store.upsert(&message("m1", "conv1", 10)).expect("insert");
        store.upsert(&message("m2", "conv1", 20)).expect("insert");
        store.upsert(&message("other", "conv2", 5)).expect("insert");

        let rows = store.query_by_conversation("conv1").expect("query");
        let ids: Vec<&str> = rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn timestamp_ties_break_by_insertion_sequence() {
        let store = MessageStore::in_memory().expect("store");
        store.upsert(&message("first", "conv1", 10)).expect("insert");
        store.upsert(&message("second", "conv1", 10)).expect("insert");

        let rows = store.query_by_conversation("conv1").expect("query");
        let ids: Vec<&str> = rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn insert_if_absent_dedups_by_id() {
        let store = MessageStore::in_memory().expect("store");
        let msg = message("srv-42", "conv1", 10);

        assert!(store.insert_if_absent(&msg).expect("first insert"));
        assert!(!store.insert_if_absent(&msg).expect("second insert"));
        assert_eq!(store.message_count("conv1").expect("count"), 1);
    }

    #[test]
    fn upsert_updates_in_place() {
        let store = MessageStore::in_memory().expect("store");
        let mut msg = message("m1", "conv1", 10);
        store.upsert(&msg).expect("insert");

        msg.delivery_state = DeliveryState::Failed;
        store.upsert(&msg).expect("update");

        let stored = store.get("m1").expect("get").expect("present");
        assert_eq!(stored.delivery_state, DeliveryState::Failed);
        assert_eq!(store.message_count("conv1").expect("count"), 1);
    }

    #[test]
    fn reconcile_swaps_local_id_for_server_id() {
        let store = MessageStore::in_memory().expect("store");
        store
            .upsert(&message("local-abc", "conv1", 10))
            .expect("insert");

        store
            .reconcile_id("local-abc", "srv-42", DeliveryState::Sent)
            .expect("reconcile");

        assert!(store.get("local-abc").expect("get").is_none());
        let stored = store.get("srv-42").expect("get").expect("present");
        assert_eq!(stored.delivery_state, DeliveryState::Sent);
        assert_eq!(stored.timestamp, 10);
    }

    #[test]
    fn reconcile_prefers_existing_server_row() {
        let store = MessageStore::in_memory().expect("store");
        store
            .upsert(&message("local-abc", "conv1", 10))
            .expect("insert");
        let mut delivered = message("srv-42", "conv1", 12);
        delivered.delivery_state = DeliveryState::Delivered;
        store.upsert(&delivered).expect("insert");

        store
            .reconcile_id("local-abc", "srv-42", DeliveryState::Sent)
            .expect("reconcile");

        assert_eq!(store.message_count("conv1").expect("count"), 1);
        let stored = store.get("srv-42").expect("get").expect("present");
        assert_eq!(stored.delivery_state, DeliveryState::Delivered);
    }

    #[test]
    fn reply_reference_survives_storage() {
        let store = MessageStore::in_memory().expect("store");
        let mut msg = message("m2", "conv1", 20);
        msg.response_to = Some("m1".to_string());
        store.upsert(&msg).expect("insert");

        let stored = store.get("m2").expect("get").expect("row");
        assert_eq!(stored.response_to.as_deref(), Some("m1"));
    }

    #[test]
    fn mark_read_flips_only_named_rows() {
        let store = MessageStore::in_memory().expect("store");
        store.upsert(&message("m1", "conv1", 10)).expect("insert");
        store.upsert(&message("m2", "conv1", 20)).expect("insert");

        let changed = store
            .mark_read("conv1", &["m1".to_string()])
            .expect("mark read");
        assert_eq!(changed, 1);

        assert!(store.get("m1").expect("get").expect("row").is_read);
        assert!(!store.get("m2").expect("get").expect("row").is_read);
    }

    #[test]
    fn recent_messages_paginates_backwards() {
        let store = MessageStore::in_memory().expect("store");
        for i in 0..5 {
            store
                .upsert(&message(&format!("m{i}"), "conv1", i * 10))
                .expect("insert");
        }

        let newest = store
            .recent_messages("conv1", 2, None)
            .expect("recent page");
        let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m4"]);

        let older = store
            .recent_messages("conv1", 2, Some(30))
            .expect("older page");
        let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn latest_timestamp_tracks_the_conversation() {
        let store = MessageStore::in_memory().expect("store");
        assert_eq!(store.latest_timestamp("conv1").expect("latest"), None);

        store.upsert(&message("m1", "conv1", 10)).expect("insert");
        store.upsert(&message("m2", "conv1", 25)).expect("insert");
        assert_eq!(store.latest_timestamp("conv1").expect("latest"), Some(25));
    }

    #[tokio::test]
    async fn mutations_notify_subscribers_with_conversation_id() {
        let store = MessageStore::in_memory().expect("store");
        let mut changes = store.subscribe();

        store.upsert(&message("m1", "conv1", 10)).expect("insert");
        assert_eq!(changes.recv().await.expect("notification"), "conv1");

        store
            .set_delivery_state("m1", DeliveryState::Sent)
            .expect("state update");
        assert_eq!(changes.recv().await.expect("notification"), "conv1");
    }
}
