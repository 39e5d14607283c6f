//! 内存存储实现
//!
//! 缺省后端，进程退出即丢失。seq 分配与查询语义与 SQLite 实现一致，
//! 集成测试以此为基准。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KernelStore, StoreError};
use crate::escalation::{Escalation, EscalationStatus};
use crate::memory::history::HistoryEntry;
use crate::memory::snapshot::MemorySnapshot;
use crate::session::Session;

type ActorScope = (String, String);

#[derive(Default)]
struct Inner {
    history: HashMap<ActorScope, Vec<HistoryEntry>>,
    snapshots: HashMap<ActorScope, Vec<MemorySnapshot>>,
    escalations: HashMap<String, Escalation>,
    sessions: HashMap<String, Session>,
}

/// 内存内核存储
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn scope(school_id: &str, actor_key: &str) -> ActorScope {
    (school_id.to_string(), actor_key.to_string())
}

#[async_trait]
impl KernelStore for MemoryStore {
    async fn append_history(&self, mut entry: HistoryEntry) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let rows = inner
            .history
            .entry(scope(&entry.school_id, &entry.actor_key))
            .or_default();
        let seq = rows.last().map(|e| e.seq).unwrap_or(0) + 1;
        entry.seq = seq;
        rows.push(entry);
        Ok(seq)
    }

    async fn recent_history(
        &self,
        school_id: &str,
        actor_key: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        let rows = match inner.history.get(&scope(school_id, actor_key)) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        let start = rows.len().saturating_sub(limit);
        Ok(rows[start..].to_vec())
    }

    async fn history_block_after(
        &self,
        school_id: &str,
        actor_key: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.inner.read().await;
        let rows = match inner.history.get(&scope(school_id, actor_key)) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        Ok(rows
            .iter()
            .filter(|e| e.seq > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_seq(&self, school_id: &str, actor_key: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .history
            .get(&scope(school_id, actor_key))
            .and_then(|rows| rows.last())
            .map(|e| e.seq)
            .unwrap_or(0))
    }

    async fn put_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let snaps = inner
            .snapshots
            .entry(scope(&snapshot.school_id, &snapshot.actor_key))
            .or_default();
        snaps.push(snapshot);
        snaps.sort_by_key(|s| s.covers_through);
        Ok(())
    }

    async fn snapshots(
        &self,
        school_id: &str,
        actor_key: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnapshot>, StoreError> {
        let inner = self.inner.read().await;
        let snaps = match inner.snapshots.get(&scope(school_id, actor_key)) {
            Some(snaps) => snaps,
            None => return Ok(Vec::new()),
        };
        let start = snaps.len().saturating_sub(limit);
        Ok(snaps[start..].to_vec())
    }

    async fn snapshot_watermark(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .snapshots
            .get(&scope(school_id, actor_key))
            .and_then(|snaps| snaps.last())
            .map(|s| s.covers_through)
            .unwrap_or(0))
    }

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .escalations
            .insert(escalation.id.clone(), escalation.clone());
        Ok(())
    }

    async fn update_escalation(&self, escalation: &Escalation) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.escalations.contains_key(&escalation.id) {
            return Err(StoreError::NotFound(escalation.id.clone()));
        }
        inner
            .escalations
            .insert(escalation.id.clone(), escalation.clone());
        Ok(())
    }

    async fn get_escalation(&self, id: &str) -> Result<Option<Escalation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.escalations.get(id).cloned())
    }

    async fn pending_escalation(
        &self,
        school_id: &str,
        actor_key: &str,
        agent: &str,
    ) -> Result<Option<Escalation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .escalations
            .values()
            .find(|e| {
                e.status == EscalationStatus::Pending
                    && e.school_id == school_id
                    && e.actor_key == actor_key
                    && e.agent == agent
            })
            .cloned())
    }

    async fn decided_escalations(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<Vec<Escalation>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Escalation> = inner
            .escalations
            .values()
            .filter(|e| {
                e.status == EscalationStatus::Decided
                    && e.school_id == school_id
                    && e.actor_key == actor_key
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }

    async fn escalations_for_authority(
        &self,
        school_id: &str,
        authority_role: &str,
    ) -> Result<Vec<Escalation>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Escalation> = inner
            .escalations
            .values()
            .filter(|e| {
                e.status == EscalationStatus::Pending
                    && e.school_id == school_id
                    && e.authority_role == authority_role
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.urgency.cmp(&a.urgency).then(a.created_at.cmp(&b.created_at)));
        Ok(rows)
    }

    async fn save_session(&self, record: &Session) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .insert(record.actor_key.clone(), record.clone());
        Ok(())
    }

    async fn load_session(&self, actor_key: &str) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(actor_key).cloned())
    }

    async fn delete_session(&self, actor_key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(actor_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::turn::ActorRole;

    fn entry(n: u32) -> HistoryEntry {
        HistoryEntry::new(
            "sch_1",
            "13800000001",
            ActorRole::Parent,
            "class_assistant",
            format!("question {}", n),
            format!("answer {}", n),
        )
    }

    #[tokio::test]
    async fn test_seq_monotonic_per_actor() {
        let store = MemoryStore::new();
        for n in 0..3 {
            let seq = store.append_history(entry(n)).await.unwrap();
            assert_eq!(seq, (n + 1) as u64);
        }

        let mut other = entry(0);
        other.actor_key = "13800000002".into();
        assert_eq!(store.append_history(other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recent_history_window() {
        let store = MemoryStore::new();
        for n in 0..15 {
            store.append_history(entry(n)).await.unwrap();
        }
        let recent = store
            .recent_history("sch_1", "13800000001", 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.first().unwrap().seq, 6);
        assert_eq!(recent.last().unwrap().seq, 15);
    }

    #[tokio::test]
    async fn test_history_block_after_watermark() {
        let store = MemoryStore::new();
        for n in 0..15 {
            store.append_history(entry(n)).await.unwrap();
        }
        let block = store
            .history_block_after("sch_1", "13800000001", 0, 5)
            .await
            .unwrap();
        assert_eq!(block.len(), 5);
        assert_eq!(block.first().unwrap().seq, 1);
        assert_eq!(block.last().unwrap().seq, 5);
    }

    #[tokio::test]
    async fn test_snapshot_watermark_advances() {
        let store = MemoryStore::new();
        assert_eq!(store.snapshot_watermark("sch_1", "a").await.unwrap(), 0);
        store
            .put_snapshot(MemorySnapshot::new("sch_1", "a", "早期对话摘要", 5))
            .await
            .unwrap();
        assert_eq!(store.snapshot_watermark("sch_1", "a").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let store = MemoryStore::new();
        let record = Session {
            actor_key: "13800000001".into(),
            school_id: "sch_1".into(),
            role: ActorRole::Parent,
            context: [("student".to_string(), "小明".to_string())].into(),
            created_at: 1,
            last_active: 2,
        };
        store.save_session(&record).await.unwrap();
        let loaded = store.load_session("13800000001").await.unwrap().unwrap();
        assert_eq!(loaded.context.get("student").map(String::as_str), Some("小明"));
        store.delete_session("13800000001").await.unwrap();
        assert!(store.load_session("13800000001").await.unwrap().is_none());
    }
}
