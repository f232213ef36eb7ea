//! 会话日志存储
//!
//! 只追加的消息日志，按会话划分；每行保存 [`PersistedMessage`] 的 JSON 文本。
//! 读出时按创建时间排序，时间相同按插入序号排序。解析交给回放组装器，存储本身不理解内容。
//!
//! 两种实现：内存（默认）与 SQLite（需启用 `async-sqlite` feature）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::message::PersistedMessage;
use crate::core::StoreError;

/// 日志中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub sequence_no: u64,
    pub created_at: DateTime<Utc>,
    /// PersistedMessage 的 JSON 文本
    pub content: String,
}

/// 会话概要（列表与详情接口）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
}

/// 会话归属检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationAccess {
    Created,
    Owned,
    /// 会话属于其他 subject
    Foreign,
}

/// 会话存储接口
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 会话不存在时以 owner 创建；存在时报告是否属于 owner
    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        owner: &str,
    ) -> Result<ConversationAccess, StoreError>;

    async fn conversation_owner(&self, conversation_id: &str) -> Result<Option<String>, StoreError>;

    async fn conversation(&self, conversation_id: &str) -> Result<Option<ConversationSummary>, StoreError>;

    /// owner 的全部会话，新建的在前
    async fn list_conversations(&self, owner: &str) -> Result<Vec<ConversationSummary>, StoreError>;

    /// 按 (created_at, sequence_no) 升序返回全部消息
    async fn load_ordered_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError>;

    /// 追加一条消息，返回分配的序号
    async fn append_message(
        &self,
        conversation_id: &str,
        message: &PersistedMessage,
    ) -> Result<u64, StoreError>;

    /// 关闭底层资源
    async fn close(&self) {}
}

struct Conversation {
    owner: String,
    created_at: DateTime<Utc>,
    messages: Vec<StoredMessage>,
}

impl Conversation {
    fn summary(&self, id: &str) -> ConversationSummary {
        ConversationSummary {
            id: id.to_string(),
            owner: self.owner.clone(),
            created_at: self.created_at,
            message_count: self.messages.len() as u64,
        }
    }
}

/// 内存会话存储
#[derive(Default)]
pub struct MemoryMessageStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn ensure_conversation(
        &self,
        conversation_id: &str,
        owner: &str,
    ) -> Result<ConversationAccess, StoreError> {
        let mut conversations = self.conversations.write().await;
        match conversations.get(conversation_id) {
            Some(c) if c.owner == owner => Ok(ConversationAccess::Owned),
            Some(_) => Ok(ConversationAccess::Foreign),
            None => {
                conversations.insert(
                    conversation_id.to_string(),
                    Conversation {
                        owner: owner.to_string(),
                        created_at: Utc::now(),
                        messages: Vec::new(),
                    },
                );
                Ok(ConversationAccess::Created)
            }
        }
    }

    async fn conversation_owner(&self, conversation_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.owner.clone()))
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Option<ConversationSummary>, StoreError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.summary(conversation_id)))
    }

    async fn list_conversations(&self, owner: &str) -> Result<Vec<ConversationSummary>, StoreError> {
        let conversations = self.conversations.read().await;
        let mut listed: Vec<ConversationSummary> = conversations
            .iter()
            .filter(|(_, c)| c.owner == owner)
            .map(|(id, c)| c.summary(id))
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listed)
    }

    async fn load_ordered_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let conversations = self.conversations.read().await;
        let mut messages = conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence_no.cmp(&b.sequence_no))
        });
        Ok(messages)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: &PersistedMessage,
    ) -> Result<u64, StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;

        let sequence_no = conversation
            .messages
            .iter()
            .map(|m| m.sequence_no)
            .max()
            .unwrap_or(0)
            + 1;
        let mut record = message.clone();
        record.sequence_no = sequence_no;
        conversation.messages.push(StoredMessage {
            sequence_no,
            created_at: Utc::now(),
            content: record.encode(),
        });
        Ok(sequence_no)
    }
}

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::{DateTime, SecondsFormat, Utc};
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::{ConversationAccess, ConversationSummary, MessageStore, StoredMessage};
    use crate::core::StoreError;
    use crate::session::message::PersistedMessage;

    /// SQLite 会话存储
    pub struct SqliteMessageStore {
        pool: SqlitePool,
    }

    fn timestamp(now: DateTime<Utc>) -> String {
        // 固定宽度，字符串序即时间序
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn parse_timestamp(raw: &str, sequence_no: u64) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt {
                sequence_no,
                reason: format!("bad created_at: {e}"),
            })
    }

    fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationSummary, StoreError> {
        let created_at: String = row.get("created_at");
        let message_count: i64 = row.get("message_count");
        Ok(ConversationSummary {
            id: row.get("id"),
            owner: row.get("owner"),
            created_at: parse_timestamp(&created_at, 0)?,
            message_count: message_count as u64,
        })
    }

    const SUMMARY_SELECT: &str = "SELECT c.id, c.owner, c.created_at,
            (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
         FROM conversations c";

    impl SqliteMessageStore {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;
            let store = Self { pool };
            store.init_tables().await?;
            Ok(store)
        }

        async fn init_tables(&self) -> Result<(), StoreError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL,
                    sequence_no INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (conversation_id, sequence_no),
                    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
            )
            .execute(&self.pool)
            .await?;

            Ok(())
        }
    }

    #[async_trait]
    impl MessageStore for SqliteMessageStore {
        async fn ensure_conversation(
            &self,
            conversation_id: &str,
            owner: &str,
        ) -> Result<ConversationAccess, StoreError> {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO conversations (id, owner, created_at) VALUES (?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(owner)
            .bind(timestamp(Utc::now()))
            .execute(&self.pool)
            .await?
            .rows_affected();
            if inserted == 1 {
                return Ok(ConversationAccess::Created);
            }

            match self.conversation_owner(conversation_id).await? {
                Some(existing) if existing == owner => Ok(ConversationAccess::Owned),
                Some(_) => Ok(ConversationAccess::Foreign),
                None => Err(StoreError::NotFound(conversation_id.to_string())),
            }
        }

        async fn conversation_owner(&self, conversation_id: &str) -> Result<Option<String>, StoreError> {
            let row = sqlx::query("SELECT owner FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| r.get::<String, _>("owner")))
        }

        async fn conversation(&self, conversation_id: &str) -> Result<Option<ConversationSummary>, StoreError> {
            let row = sqlx::query(&format!("{SUMMARY_SELECT} WHERE c.id = ?"))
                .bind(conversation_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(summary_from_row).transpose()
        }

        async fn list_conversations(&self, owner: &str) -> Result<Vec<ConversationSummary>, StoreError> {
            let rows = sqlx::query(&format!(
                "{SUMMARY_SELECT} WHERE c.owner = ? ORDER BY c.created_at DESC, c.id ASC"
            ))
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(summary_from_row).collect()
        }

        async fn load_ordered_messages(
            &self,
            conversation_id: &str,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            let rows = sqlx::query(
                "SELECT sequence_no, content, created_at FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at ASC, sequence_no ASC",
            )
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|row| {
                    let sequence_no: i64 = row.get("sequence_no");
                    let created_at: String = row.get("created_at");
                    let created_at = parse_timestamp(&created_at, sequence_no as u64)?;
                    Ok(StoredMessage {
                        sequence_no: sequence_no as u64,
                        created_at,
                        content: row.get("content"),
                    })
                })
                .collect()
        }

        async fn append_message(
            &self,
            conversation_id: &str,
            message: &PersistedMessage,
        ) -> Result<u64, StoreError> {
            let mut tx = self.pool.begin().await?;

            let exists = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(conversation_id.to_string()));
            }

            let next: i64 = sqlx::query(
                "SELECT COALESCE(MAX(sequence_no), 0) + 1 AS next FROM messages WHERE conversation_id = ?",
            )
            .bind(conversation_id)
            .fetch_one(&mut *tx)
            .await?
            .get("next");

            let mut record = message.clone();
            record.sequence_no = next as u64;
            sqlx::query(
                "INSERT INTO messages (conversation_id, sequence_no, content, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(next)
            .bind(record.encode())
            .bind(timestamp(Utc::now()))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(next as u64)
        }

        async fn close(&self) {
            self.pool.close().await;
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteMessageStore;

/// 创建会话存储
///
/// 提供了 db_path 且启用了 async-sqlite 时使用 SQLite，否则使用内存存储
pub async fn create_message_store(db_path: Option<&std::path::Path>) -> Arc<dyn MessageStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteMessageStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite message store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("SQLite store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory message store");
    Arc::new(MemoryMessageStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::message::PartRecord;

    fn prompt(text: &str) -> PersistedMessage {
        PersistedMessage::request(vec![PartRecord::UserPrompt(text.to_string())])
    }

    async fn exercise(store: &dyn MessageStore) {
        assert_eq!(
            store.ensure_conversation("c1", "alice").await.unwrap(),
            ConversationAccess::Created
        );
        assert_eq!(
            store.ensure_conversation("c1", "alice").await.unwrap(),
            ConversationAccess::Owned
        );
        assert_eq!(
            store.ensure_conversation("c1", "bob").await.unwrap(),
            ConversationAccess::Foreign
        );
        assert_eq!(
            store.conversation_owner("c1").await.unwrap().as_deref(),
            Some("alice")
        );

        assert_eq!(store.append_message("c1", &prompt("one")).await.unwrap(), 1);
        assert_eq!(store.append_message("c1", &prompt("two")).await.unwrap(), 2);

        let loaded = store.load_ordered_messages("c1").await.unwrap();
        let seqs: Vec<_> = loaded.iter().map(|m| m.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2]);
        let second = PersistedMessage::decode(&loaded[1].content).unwrap();
        assert_eq!(second.sequence_no, 2);
        assert_eq!(second.parts, vec![PartRecord::UserPrompt("two".to_string())]);

        assert!(store.load_ordered_messages("other").await.unwrap().is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.ensure_conversation("c2", "alice").await.unwrap();
        store.ensure_conversation("c3", "bob").await.unwrap();
        let listed = store.list_conversations("alice").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
        assert_eq!(listed[1].message_count, 2);
        assert!(store.list_conversations("carol").await.unwrap().is_empty());
        let c3 = store.conversation("c3").await.unwrap().unwrap();
        assert_eq!((c3.owner.as_str(), c3.message_count), ("bob", 0));
        assert!(store.conversation("nope").await.unwrap().is_none());
        assert!(matches!(
            store.append_message("missing", &prompt("x")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryMessageStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_create_message_store_defaults_to_memory() {
        let store = create_message_store(None).await;
        exercise(store.as_ref()).await;
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_sqlite_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteMessageStore::new(dir.path().join("chat.db")).await.unwrap();
        exercise(&store).await;
        store.close().await;
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chat.db");
        {
            let store = SqliteMessageStore::new(&path).await.unwrap();
            store.ensure_conversation("c1", "alice").await.unwrap();
            store.append_message("c1", &prompt("kept")).await.unwrap();
            store.close().await;
        }
        let store = SqliteMessageStore::new(&path).await.unwrap();
        let loaded = store.load_ordered_messages("c1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            store.ensure_conversation("c1", "alice").await.unwrap(),
            ConversationAccess::Owned
        );
    }
}
