use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;
use uuid::Uuid;

use crate::models::{Conversation, ConversationPatch, Message, Role};
use crate::services::notifier::{ChangeEvent, ChangeHub, ChangeKind, Table};
use crate::services::store::{ConversationStore, StoreError};

const CONVERSATION_COLUMNS: &str = "id, user_id, title, pinned, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, created_at";

/// SQLite-backed store. Every committed write is published on the attached
/// `ChangeHub`, so all views sharing the database hear about it.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    changes: ChangeHub,
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let conn = task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
            let conn = Connection::open(&path)
                .with_context(|| format!("Failed to open database at {}", path.display()))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            Ok(conn)
        })
        .await??;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            changes: ChangeHub::new(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            changes: ChangeHub::new(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// The push channel fed by this database's writes.
    pub fn changes(&self) -> ChangeHub {
        self.changes.clone()
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        // No foreign keys: removing a conversation does not remove its messages.
        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE conversations (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX idx_conversations_user ON conversations(user_id, updated_at DESC);
                CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        if version < 2 {
            conn.execute_batch(
                "ALTER TABLE conversations ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0;

                 UPDATE schema_version SET version = 2;",
            )?;
        }

        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("Database connection lock poisoned"))?;
            f(&conn)
        })
        .await?
    }

    fn publish_messages(&self, kind: ChangeKind, conversation_id: &str) {
        self.changes.publish(ChangeEvent {
            table: Table::Messages,
            kind,
            conversation_id: conversation_id.to_string(),
            owner_id: None,
        });
    }

    fn publish_conversation(&self, kind: ChangeKind, conversation_id: &str, owner_id: String) {
        self.changes.publish(ChangeEvent {
            table: Table::Conversations,
            kind,
            conversation_id: conversation_id.to_string(),
            owner_id: Some(owner_id),
        });
    }

    fn owner_of(conn: &Connection, conversation_id: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT user_id FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // --- Row helpers ---

    /// Fixed-width RFC 3339 so that text order is time order.
    fn timestamp(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Invalid timestamp: {}", raw))?
            .with_timezone(&Utc))
    }

    fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
        let pinned_int: i32 = row.get(3)?;
        let created_str: String = row.get(4)?;
        let updated_str: String = row.get(5)?;

        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            pinned: pinned_int != 0,
            created_at: Self::parse_timestamp(&created_str)?,
            updated_at: Self::parse_timestamp(&updated_str)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let role_str: String = row.get(2)?;
        let created_str: String = row.get(4)?;

        Ok(Message {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: Role::from_str(&role_str)
                .ok_or_else(|| anyhow!("Unknown role: {}", role_str))?,
            content: row.get(3)?,
            created_at: Self::parse_timestamp(&created_str)?,
        })
    }
}

#[async_trait]
impl ConversationStore for Database {
    async fn get_conversation(&self, id: &str, owner_id: &str) -> Result<Conversation, StoreError> {
        let id = id.to_string();
        let owner_id = owner_id.to_string();
        let found = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM conversations WHERE id = ?1 AND user_id = ?2",
                    CONVERSATION_COLUMNS
                ))?;
                let result = stmt
                    .query_row(params![id, owner_id], |row| {
                        Ok(Self::row_to_conversation(row))
                    })
                    .optional()?;
                result.transpose()
            })
            .await?;
        found.ok_or(StoreError::NotFound)
    }

    async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>, StoreError> {
        let owner_id = owner_id.to_string();
        let conversations = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM conversations WHERE user_id = ?1
                     ORDER BY pinned DESC, updated_at DESC",
                    CONVERSATION_COLUMNS
                ))?;
                let conversations = stmt
                    .query_map(params![owner_id], |row| Ok(Self::row_to_conversation(row)))?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .collect::<Result<Vec<_>>>()?;
                Ok(conversations)
            })
            .await?;
        Ok(conversations)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let conversation_id = conversation_id.to_string();
        let messages = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                    MESSAGE_COLUMNS
                ))?;
                let messages = stmt
                    .query_map(params![conversation_id], |row| Ok(Self::row_to_message(row)))?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .collect::<Result<Vec<_>>>()?;
                Ok(messages)
            })
            .await?;
        Ok(messages)
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let msg = message.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    msg.id,
                    msg.conversation_id,
                    msg.role.as_str(),
                    msg.content,
                    Self::timestamp(&msg.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.publish_messages(ChangeKind::Insert, &message.conversation_id);
        Ok(())
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let conv_id = id.to_string();
        let title = patch.title.clone();
        let pinned = patch.pinned.map(|p| p as i32);
        let updated_at = patch.updated_at.as_ref().map(Self::timestamp);
        let owner = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE conversations SET
                        title = COALESCE(?1, title),
                        pinned = COALESCE(?2, pinned),
                        updated_at = CASE WHEN ?3 IS NULL THEN updated_at ELSE MAX(updated_at, ?3) END
                     WHERE id = ?4",
                    params![title, pinned, updated_at, conv_id],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                Self::owner_of(conn, &conv_id)
            })
            .await?;

        let owner = owner.ok_or(StoreError::NotFound)?;
        self.publish_conversation(ChangeKind::Update, id, owner);
        Ok(())
    }

    async fn delete_messages(&self, conversation_id: &str) -> Result<(), StoreError> {
        let conv_id = conversation_id.to_string();
        let deleted = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM messages WHERE conversation_id = ?1",
                    params![conv_id],
                )?)
            })
            .await?;
        if deleted > 0 {
            self.publish_messages(ChangeKind::Delete, conversation_id);
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let conv_id = id.to_string();
        let owner = self
            .with_conn(move |conn| {
                let owner = Self::owner_of(conn, &conv_id)?;
                conn.execute("DELETE FROM conversations WHERE id = ?1", params![conv_id])?;
                Ok(owner)
            })
            .await?;
        if let Some(owner) = owner {
            self.publish_conversation(ChangeKind::Delete, id, owner);
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        owner_id: &str,
        title: &str,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: owner_id.to_string(),
            title: title.to_string(),
            pinned: false,
            created_at: now,
            updated_at: now,
        };

        let conv = conversation.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, pinned, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    conv.id,
                    conv.user_id,
                    conv.title,
                    conv.pinned as i32,
                    Self::timestamp(&conv.created_at),
                    Self::timestamp(&conv.updated_at),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.publish_conversation(ChangeKind::Insert, &conversation.id, conversation.user_id.clone());
        Ok(conversation)
    }
}
