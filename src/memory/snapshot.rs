//! 历史摘要快照
//!
//! 超出原文窗口的旧轮次压缩为快照。covers_through 为水位线：
//! 该参与者 seq <= covers_through 的轮次已被覆盖，不再重复摘要。

use serde::{Deserialize, Serialize};

/// 一段历史的压缩摘要，写入后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub id: String,
    pub school_id: String,
    pub actor_key: String,
    /// 摘要文本
    pub summary: String,
    /// 可选嵌入向量（检索相关性用）
    pub embedding: Option<Vec<f32>>,
    /// 覆盖水位线：本快照覆盖到的最大 seq（含）
    pub covers_through: u64,
    /// 写入时间戳（毫秒）
    pub created_at: i64,
}

impl MemorySnapshot {
    pub fn new(
        school_id: impl Into<String>,
        actor_key: impl Into<String>,
        summary: impl Into<String>,
        covers_through: u64,
    ) -> Self {
        Self {
            id: format!("snap_{}", uuid::Uuid::new_v4()),
            school_id: school_id.into(),
            actor_key: actor_key.into(),
            summary: summary.into(),
            embedding: None,
            covers_through,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}
