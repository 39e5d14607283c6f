//! SQLite 内核存储（异步）
//!
//! 使用 sqlx 提供完全异步的数据库操作。seq 在事务内按参与者 MAX(seq)+1 分配；
//! 单参与者的写入已被轮次队列串行化，事务只为跨进程安全。
//! 需要启用 `async-sqlite` feature。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{KernelStore, StoreError};
use crate::contract::parse_urgency;
use crate::core::turn::{parse_action_status, parse_role};
use crate::escalation::{parse_escalation_status, Escalation, EscalationStatus};
use crate::memory::history::HistoryEntry;
use crate::memory::snapshot::MemorySnapshot;
use crate::session::Session;

/// SQLite 内核存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
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

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 初始化数据库表
    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS history (
                school_id TEXT NOT NULL,
                actor_key TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                agent TEXT NOT NULL,
                user_message TEXT NOT NULL,
                reply TEXT NOT NULL,
                action TEXT,
                action_status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (school_id, actor_key, seq)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                school_id TEXT NOT NULL,
                actor_key TEXT NOT NULL,
                summary TEXT NOT NULL,
                embedding TEXT,
                covers_through INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS escalations (
                id TEXT PRIMARY KEY,
                school_id TEXT NOT NULL,
                actor_key TEXT NOT NULL,
                agent TEXT NOT NULL,
                authority_role TEXT NOT NULL,
                urgency TEXT NOT NULL,
                reason TEXT NOT NULL,
                decision_kind TEXT NOT NULL,
                allowed_actions TEXT NOT NULL,
                context TEXT NOT NULL,
                status TEXT NOT NULL,
                decision TEXT,
                instruction TEXT,
                artifact TEXT,
                created_at INTEGER NOT NULL,
                decided_at INTEGER,
                delivered_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                actor_key TEXT PRIMARY KEY,
                school_id TEXT NOT NULL,
                role TEXT NOT NULL,
                context TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_active INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_actor ON snapshots(school_id, actor_key)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_escalations_actor ON escalations(school_id, actor_key, status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_history(row: &sqlx::sqlite::SqliteRow) -> HistoryEntry {
        let role: String = row.get("role");
        let status: String = row.get("action_status");
        HistoryEntry {
            seq: row.get::<i64, _>("seq") as u64,
            school_id: row.get("school_id"),
            actor_key: row.get("actor_key"),
            role: parse_role(&role),
            agent: row.get("agent"),
            user_message: row.get("user_message"),
            reply: row.get("reply"),
            action: row.get("action"),
            action_status: parse_action_status(&status),
            created_at: row.get("created_at"),
        }
    }

    fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<MemorySnapshot, StoreError> {
        let embedding: Option<String> = row.get("embedding");
        let embedding = match embedding {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(MemorySnapshot {
            id: row.get("id"),
            school_id: row.get("school_id"),
            actor_key: row.get("actor_key"),
            summary: row.get("summary"),
            embedding,
            covers_through: row.get::<i64, _>("covers_through") as u64,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_escalation(row: &sqlx::sqlite::SqliteRow) -> Result<Escalation, StoreError> {
        let urgency: String = row.get("urgency");
        let status: String = row.get("status");
        let allowed: String = row.get("allowed_actions");
        Ok(Escalation {
            id: row.get("id"),
            school_id: row.get("school_id"),
            actor_key: row.get("actor_key"),
            agent: row.get("agent"),
            authority_role: row.get("authority_role"),
            urgency: parse_urgency(&urgency),
            reason: row.get("reason"),
            decision_kind: row.get("decision_kind"),
            allowed_actions: serde_json::from_str(&allowed)?,
            context: row.get("context"),
            status: parse_escalation_status(&status),
            decision: row.get("decision"),
            instruction: row.get("instruction"),
            artifact: row.get("artifact"),
            created_at: row.get("created_at"),
            decided_at: row.get("decided_at"),
            delivered_at: row.get("delivered_at"),
        })
    }

    async fn write_escalation(&self, e: &Escalation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO escalations (
                id, school_id, actor_key, agent, authority_role, urgency, reason,
                decision_kind, allowed_actions, context, status, decision, instruction,
                artifact, created_at, decided_at, delivered_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.id)
        .bind(&e.school_id)
        .bind(&e.actor_key)
        .bind(&e.agent)
        .bind(&e.authority_role)
        .bind(e.urgency.to_string())
        .bind(&e.reason)
        .bind(&e.decision_kind)
        .bind(serde_json::to_string(&e.allowed_actions)?)
        .bind(&e.context)
        .bind(e.status.to_string())
        .bind(&e.decision)
        .bind(&e.instruction)
        .bind(&e.artifact)
        .bind(e.created_at)
        .bind(e.decided_at)
        .bind(e.delivered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KernelStore for SqliteStore {
    async fn append_history(&self, entry: HistoryEntry) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS max_seq FROM history WHERE school_id = ? AND actor_key = ?",
        )
        .bind(&entry.school_id)
        .bind(&entry.actor_key)
        .fetch_one(&mut *tx)
        .await?;
        let seq = row.get::<i64, _>("max_seq") as u64 + 1;

        sqlx::query(
            "INSERT INTO history (
                school_id, actor_key, seq, role, agent, user_message, reply,
                action, action_status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.school_id)
        .bind(&entry.actor_key)
        .bind(seq as i64)
        .bind(entry.role.to_string())
        .bind(&entry.agent)
        .bind(&entry.user_message)
        .bind(&entry.reply)
        .bind(&entry.action)
        .bind(entry.action_status.to_string())
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(seq)
    }

    async fn recent_history(
        &self,
        school_id: &str,
        actor_key: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM history WHERE school_id = ? AND actor_key = ?
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(school_id)
        .bind(actor_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<HistoryEntry> = rows.iter().map(Self::row_to_history).collect();
        entries.reverse();
        Ok(entries)
    }

    async fn history_block_after(
        &self,
        school_id: &str,
        actor_key: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM history WHERE school_id = ? AND actor_key = ? AND seq > ?
             ORDER BY seq ASC LIMIT ?",
        )
        .bind(school_id)
        .bind(actor_key)
        .bind(after_seq as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_history).collect())
    }

    async fn latest_seq(&self, school_id: &str, actor_key: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS max_seq FROM history WHERE school_id = ? AND actor_key = ?",
        )
        .bind(school_id)
        .bind(actor_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("max_seq") as u64)
    }

    async fn put_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StoreError> {
        let embedding = match &snapshot.embedding {
            Some(vec) => Some(serde_json::to_string(vec)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO snapshots (id, school_id, actor_key, summary, embedding, covers_through, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.school_id)
        .bind(&snapshot.actor_key)
        .bind(&snapshot.summary)
        .bind(embedding)
        .bind(snapshot.covers_through as i64)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshots(
        &self,
        school_id: &str,
        actor_key: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM snapshots WHERE school_id = ? AND actor_key = ?
             ORDER BY covers_through DESC LIMIT ?",
        )
        .bind(school_id)
        .bind(actor_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut snaps = rows
            .iter()
            .map(Self::row_to_snapshot)
            .collect::<Result<Vec<_>, _>>()?;
        snaps.reverse();
        Ok(snaps)
    }

    async fn snapshot_watermark(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(covers_through), 0) AS watermark FROM snapshots
             WHERE school_id = ? AND actor_key = ?",
        )
        .bind(school_id)
        .bind(actor_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("watermark") as u64)
    }

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<(), StoreError> {
        self.write_escalation(escalation).await
    }

    async fn update_escalation(&self, escalation: &Escalation) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT id FROM escalations WHERE id = ?")
            .bind(&escalation.id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(escalation.id.clone()));
        }
        self.write_escalation(escalation).await
    }

    async fn get_escalation(&self, id: &str) -> Result<Option<Escalation>, StoreError> {
        let row = sqlx::query("SELECT * FROM escalations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_escalation(&r)).transpose()
    }

    async fn pending_escalation(
        &self,
        school_id: &str,
        actor_key: &str,
        agent: &str,
    ) -> Result<Option<Escalation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM escalations
             WHERE school_id = ? AND actor_key = ? AND agent = ? AND status = 'pending'
             LIMIT 1",
        )
        .bind(school_id)
        .bind(actor_key)
        .bind(agent)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_escalation(&r)).transpose()
    }

    async fn decided_escalations(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<Vec<Escalation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM escalations
             WHERE school_id = ? AND actor_key = ? AND status = 'decided'
             ORDER BY created_at ASC",
        )
        .bind(school_id)
        .bind(actor_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_escalation).collect()
    }

    async fn escalations_for_authority(
        &self,
        school_id: &str,
        authority_role: &str,
    ) -> Result<Vec<Escalation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM escalations
             WHERE school_id = ? AND authority_role = ? AND status = 'pending'
             ORDER BY created_at ASC",
        )
        .bind(school_id)
        .bind(authority_role)
        .fetch_all(&self.pool)
        .await?;
        let mut escalations = rows
            .iter()
            .map(Self::row_to_escalation)
            .collect::<Result<Vec<_>, _>>()?;
        escalations
            .sort_by(|a, b| b.urgency.cmp(&a.urgency).then(a.created_at.cmp(&b.created_at)));
        Ok(escalations)
    }

    async fn save_session(&self, record: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sessions (actor_key, school_id, role, context, created_at, last_active)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.actor_key)
        .bind(&record.school_id)
        .bind(record.role.to_string())
        .bind(serde_json::to_string(&record.context)?)
        .bind(record.created_at)
        .bind(record.last_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_session(&self, actor_key: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE actor_key = ?")
            .bind(actor_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let role: String = r.get("role");
            let context: String = r.get("context");
            Ok(Session {
                actor_key: r.get("actor_key"),
                school_id: r.get("school_id"),
                role: parse_role(&role),
                context: serde_json::from_str(&context)?,
                created_at: r.get("created_at"),
                last_active: r.get("last_active"),
            })
        })
        .transpose()
    }

    async fn delete_session(&self, actor_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE actor_key = ?")
            .bind(actor_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Urgency;
    use crate::core::turn::ActorRole;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteStore {
        let db_path = dir.path().join("kernel.db");
        SqliteStore::new(&db_path).await.unwrap()
    }

    #[tokio::test]
    async fn test_history_seq_assignment() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for n in 0..3 {
            let entry = HistoryEntry::new(
                "sch_1",
                "13800000001",
                ActorRole::Parent,
                "class_assistant",
                format!("q{}", n),
                format!("a{}", n),
            );
            let seq = store.append_history(entry).await.unwrap();
            assert_eq!(seq, n + 1);
        }

        let recent = store.recent_history("sch_1", "13800000001", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].seq, 2);
        assert_eq!(recent[1].seq, 3);
    }

    #[tokio::test]
    async fn test_escalation_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let esc = Escalation::open(
            "sch_1",
            "13800000001",
            "class_assistant",
            "admin",
            Urgency::High,
            "家长要求提前公布成绩",
        );
        let id = esc.id.clone();
        store.insert_escalation(&esc).await.unwrap();

        let loaded = store.get_escalation(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EscalationStatus::Pending);
        assert_eq!(loaded.urgency, Urgency::High);

        let pending = store
            .pending_escalation("sch_1", "13800000001", "class_assistant")
            .await
            .unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_escalation_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let esc = Escalation::open(
            "sch_1",
            "13800000001",
            "class_assistant",
            "admin",
            Urgency::Normal,
            "test",
        );
        let result = store.update_escalation(&esc).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
