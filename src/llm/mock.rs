//! Mock 生成端（用于测试，无需 API）
//!
//! 按脚本出队回复，支持延迟与失败注入；脚本耗尽后回显最后一条用户消息
//! 为合法契约 JSON，便于本地跑通完整轮次。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::traits::{ChatMessage, ChatRole, GenerateClient};

struct ScriptedResponse {
    delay: Option<Duration>,
    result: Result<String, String>,
}

/// 脚本化 Mock 客户端
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<ScriptedResponse>>,
    /// 每次调用收到的完整提示（按消息拼接），测试断言上下文用
    requests: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条脚本回复
    pub fn respond(&self, raw: impl Into<String>) {
        self.script.lock().unwrap().push_back(ScriptedResponse {
            delay: None,
            result: Ok(raw.into()),
        });
    }

    /// 追加一条延迟回复（串行化测试用）
    pub fn respond_after(&self, delay: Duration, raw: impl Into<String>) {
        self.script.lock().unwrap().push_back(ScriptedResponse {
            delay: Some(delay),
            result: Ok(raw.into()),
        });
    }

    /// 追加一次生成失败
    pub fn fail(&self, error: impl Into<String>) {
        self.script.lock().unwrap().push_back(ScriptedResponse {
            delay: None,
            result: Err(error.into()),
        });
    }

    /// 已收到的提示快照
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerateClient for ScriptedClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, String> {
        let rendered = messages
            .iter()
            .map(|m| format!("[{:?}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.requests.lock().unwrap().push(rendered);

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(response) => {
                if let Some(delay) = response.delay {
                    tokio::time::sleep(delay).await;
                }
                response.result
            }
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == ChatRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!(
                    r#"{{"message": "收到: {}", "confidence": 0.6}}"#,
                    last_user.replace('"', "'").replace('\n', " ")
                ))
            }
        }
    }
}
