//! 动作执行
//!
//! 智能体产出的动作经授权后在这里落地。处理器按名注册（统一大写），
//! 每次执行施加超时并输出结构化审计日志。未注册的动作记为 Unsupported，
//! 执行失败或超时记为 Failed，轮次本身照常完成。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::turn::ActionStatus;

/// 动作处理器：name 与策略表中的动作名一致
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// 执行动作，params 为智能体产出的 JSON 参数
    async fn execute(&self, params: Value) -> Result<String, String>;
}

/// 执行结论：状态 + 给用户的补充文本
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub detail: Option<String>,
}

impl ActionOutcome {
    fn status_only(status: ActionStatus) -> Self {
        Self {
            status,
            detail: None,
        }
    }
}

/// 动作分发器
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        let name = handler.name().trim().to_uppercase();
        self.handlers.insert(name, Arc::new(handler));
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// 在超时内执行动作并输出审计日志
    pub async fn dispatch(&self, action: &str, params: Value) -> ActionOutcome {
        let key = action.trim().to_uppercase();
        let Some(handler) = self.handlers.get(&key) else {
            tracing::warn!(action = %key, "No handler registered for action");
            return ActionOutcome::status_only(ActionStatus::Unsupported);
        };

        let start = Instant::now();
        let result = timeout(self.timeout, handler.execute(params)).await;

        let outcome_label = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": key,
            "outcome": outcome_label,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        match result {
            Ok(Ok(detail)) => {
                let detail = detail.trim().to_string();
                ActionOutcome {
                    status: ActionStatus::Executed,
                    detail: (!detail.is_empty()).then_some(detail),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(action = %key, error = %e, "Action execution failed");
                ActionOutcome::status_only(ActionStatus::Failed)
            }
            Err(_) => {
                tracing::warn!(action = %key, "Action timed out");
                ActionOutcome::status_only(ActionStatus::Failed)
            }
        }
    }
}

/// 固定文本处理器：注册到任意动作名，返回预设文本（演示与测试用）
pub struct StaticReplyAction {
    name: String,
    reply: String,
}

impl StaticReplyAction {
    pub fn new(name: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl ActionHandler for StaticReplyAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _params: Value) -> Result<String, String> {
        Ok(self.reply.clone())
    }
}
