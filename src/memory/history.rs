//! 审计历史记录
//!
//! 追加写入，不可修改。seq 由存储层按参与者单调分配，从 1 起。

use serde::{Deserialize, Serialize};

use crate::core::turn::{ActionStatus, ActorRole};

/// 一轮完整交互的审计记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// 参与者内单调序号，存储层分配（new 时为 0）
    pub seq: u64,
    pub school_id: String,
    pub actor_key: String,
    pub role: ActorRole,
    /// 处理该轮的智能体
    pub agent: String,
    /// 用户原话（合成轮为内核标注文字）
    pub user_message: String,
    /// 智能体回复
    pub reply: String,
    /// 请求的动作名
    pub action: Option<String>,
    pub action_status: ActionStatus,
    /// 写入时间戳（毫秒）
    pub created_at: i64,
}

impl HistoryEntry {
    pub fn new(
        school_id: impl Into<String>,
        actor_key: impl Into<String>,
        role: ActorRole,
        agent: impl Into<String>,
        user_message: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            school_id: school_id.into(),
            actor_key: actor_key.into(),
            role,
            agent: agent.into(),
            user_message: user_message.into(),
            reply: reply.into(),
            action: None,
            action_status: ActionStatus::None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, status: ActionStatus) -> Self {
        self.action = Some(action.into());
        self.action_status = status;
        self
    }
}
