//! 内核存储抽象层
//!
//! 行级读写接口：审计历史、摘要快照、升级记录、会话档案。
//! 内存实现为缺省；启用 `async-sqlite` feature 后可选 SQLite 持久化。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::escalation::Escalation;
use crate::memory::history::HistoryEntry;
use crate::memory::snapshot::MemorySnapshot;
use crate::session::Session;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for crate::core::error::KernelError {
    fn from(e: StoreError) -> Self {
        crate::core::error::KernelError::Store(e.to_string())
    }
}

/// 内核存储接口
#[async_trait]
pub trait KernelStore: Send + Sync {
    /// 追加一条审计记录，返回存储层分配的参与者内 seq（从 1 起单调）
    async fn append_history(&self, entry: HistoryEntry) -> Result<u64, StoreError>;

    /// 最近 limit 条记录，按 seq 升序
    async fn recent_history(
        &self,
        school_id: &str,
        actor_key: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// seq 大于 after_seq 的最早 limit 条，按 seq 升序（摘要器取块用）
    async fn history_block_after(
        &self,
        school_id: &str,
        actor_key: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// 该参与者最新 seq，无记录为 0
    async fn latest_seq(&self, school_id: &str, actor_key: &str) -> Result<u64, StoreError>;

    /// 写入快照（快照不可变，仅插入）
    async fn put_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StoreError>;

    /// 最近 limit 个快照，按 covers_through 升序
    async fn snapshots(
        &self,
        school_id: &str,
        actor_key: &str,
        limit: usize,
    ) -> Result<Vec<MemorySnapshot>, StoreError>;

    /// 摘要水位线：已覆盖的最大 seq，无快照为 0
    async fn snapshot_watermark(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<u64, StoreError>;

    /// 插入升级记录
    async fn insert_escalation(&self, escalation: &Escalation) -> Result<(), StoreError>;

    /// 覆写升级记录（按 id）
    async fn update_escalation(&self, escalation: &Escalation) -> Result<(), StoreError>;

    async fn get_escalation(&self, id: &str) -> Result<Option<Escalation>, StoreError>;

    /// 该参与者 + 智能体的待裁决记录（并入判定用；最多一条）
    async fn pending_escalation(
        &self,
        school_id: &str,
        actor_key: &str,
        agent: &str,
    ) -> Result<Option<Escalation>, StoreError>;

    /// 已裁决未送达的记录，按创建时间升序
    async fn decided_escalations(
        &self,
        school_id: &str,
        actor_key: &str,
    ) -> Result<Vec<Escalation>, StoreError>;

    /// 某角色名下全部待裁决记录，紧急度降序、创建时间升序
    async fn escalations_for_authority(
        &self,
        school_id: &str,
        authority_role: &str,
    ) -> Result<Vec<Escalation>, StoreError>;

    /// 保存会话档案（INSERT OR REPLACE 语义）
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn load_session(&self, actor_key: &str) -> Result<Option<Session>, StoreError>;

    async fn delete_session(&self, actor_key: &str) -> Result<(), StoreError>;
}

/// 创建内核存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite 持久化；否则使用内存存储
pub async fn create_kernel_store(db_path: Option<&std::path::Path>) -> Arc<dyn KernelStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using persistent kernel store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to create persistent store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent kernel store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory kernel store");
    Arc::new(MemoryStore::new())
}
