//! 智能体回复契约
//!
//! 生成端输出统一解析为 AgentReply：回复文本 + 可选动作 + 可选升级请求。
//! Schema 注入 system prompt，减少生成端的格式错误。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

/// 升级紧急度（并入时取两者较高）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Default for Urgency {
    fn default() -> Self {
        Urgency::Normal
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Normal => write!(f, "normal"),
            Urgency::High => write!(f, "high"),
        }
    }
}

pub fn parse_urgency(s: &str) -> Urgency {
    match s {
        "low" => Urgency::Low,
        "high" => Urgency::High,
        _ => Urgency::Normal,
    }
}

/// 生成端请求的动作（{"name": "RECORD_ATTENDANCE", "params": {...}}）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// 生成端发起的升级请求：需要更高权限角色裁决后才能继续
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    /// 请求裁决的角色（如 admin）
    pub authority_role: String,
    #[serde(default)]
    pub urgency: Urgency,
    /// 升级原因，呈现给裁决者
    pub reason: String,
    /// 请求的裁决类型（approval、guidance 等，由人设定义）
    #[serde(default)]
    pub decision_kind: String,
    /// 裁决后允许执行的动作名
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    /// 附带上下文（原始请求摘录等）
    #[serde(default)]
    pub context: String,
}

/// 统一回复契约：每轮生成输出解析成此结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    /// 面向用户的回复文本
    pub message: String,
    /// 请求执行的动作（多数轮次为 None）
    #[serde(default)]
    pub action: Option<AgentAction>,
    /// 生成端自评置信度 [0.0, 1.0]
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// 升级请求（存在时动作挂起，待裁决）
    #[serde(default)]
    pub admin_escalation: Option<EscalationRequest>,
    /// 会话上下文增量（如记住正在讨论的学生）
    #[serde(default)]
    pub session_updates: Option<HashMap<String, String>>,
}

fn default_confidence() -> f32 {
    0.5
}

impl AgentReply {
    /// 兜底回复：生成或解析失败时使用，无动作、零置信度
    pub fn fallback(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action: None,
            confidence: 0.0,
            admin_escalation: None,
            session_updates: None,
        }
    }

    /// 解析后规整：置信度收敛到 [0,1]，动作名去空白，空动作名视为无动作
    pub fn sanitize(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        if let Some(action) = self.action.take() {
            let name = action.name.trim().to_string();
            if !name.is_empty() {
                self.action = Some(AgentAction {
                    name,
                    params: action.params,
                });
            }
        }
        if let Some(esc) = &self.admin_escalation {
            if esc.reason.trim().is_empty() && esc.authority_role.trim().is_empty() {
                self.admin_escalation = None;
            }
        }
        self
    }
}

/// 回复契约格式（仅用于 Schema 生成，与 AgentReply 的 JSON 结构一致）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ReplyFormat {
    /// 面向用户的回复文本，必填
    pub message: String,
    /// 动作请求：{"name": "...", "params": {...}}，无动作则省略
    pub action: Option<ActionFormat>,
    /// 自评置信度 0.0-1.0
    pub confidence: f32,
    /// 升级请求，不需要裁决则省略
    pub admin_escalation: Option<EscalationFormat>,
    /// 会话上下文增量键值对
    pub session_updates: Option<HashMap<String, String>>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct ActionFormat {
    /// 动作名，如 QUERY_RESULTS、RECORD_ATTENDANCE
    pub name: String,
    /// 动作参数，依动作不同而不同
    pub params: HashMap<String, String>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct EscalationFormat {
    /// 请求裁决的角色，如 admin
    pub authority_role: String,
    /// low / normal / high
    pub urgency: String,
    /// 升级原因
    pub reason: String,
    /// approval / guidance 等
    pub decision_kind: String,
    /// 裁决后允许执行的动作名
    pub allowed_actions: Vec<String>,
    /// 附带上下文
    pub context: String,
}

/// 返回回复契约的 JSON Schema 字符串，可拼入 system prompt
pub fn reply_schema_json() -> String {
    let schema = schema_for!(ReplyFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_reply() {
        let reply: AgentReply =
            serde_json::from_str(r#"{"message": "好的，已收到。"}"#).unwrap();
        assert_eq!(reply.message, "好的，已收到。");
        assert!(reply.action.is_none());
        assert!((reply.confidence - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_sanitize_clamps_confidence() {
        let reply = AgentReply {
            message: "ok".into(),
            action: None,
            confidence: 3.5,
            admin_escalation: None,
            session_updates: None,
        }
        .sanitize();
        assert!((reply.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_sanitize_drops_empty_action() {
        let reply = AgentReply {
            message: "ok".into(),
            action: Some(AgentAction {
                name: "   ".into(),
                params: serde_json::json!({}),
            }),
            confidence: 0.9,
            admin_escalation: None,
            session_updates: None,
        }
        .sanitize();
        assert!(reply.action.is_none());
    }

    #[test]
    fn test_fallback_shape() {
        let reply = AgentReply::fallback("稍后再试");
        assert!(reply.action.is_none());
        assert!(reply.admin_escalation.is_none());
        assert_eq!(reply.confidence, 0.0);
    }

    #[test]
    fn test_urgency_ordering() {
        assert!(Urgency::High > Urgency::Normal);
        assert!(Urgency::Normal > Urgency::Low);
        assert_eq!(parse_urgency("high"), Urgency::High);
        assert_eq!(parse_urgency("???"), Urgency::Normal);
    }

    #[test]
    fn test_schema_mentions_contract_fields() {
        let schema = reply_schema_json();
        assert!(schema.contains("message"));
        assert!(schema.contains("admin_escalation"));
        assert!(schema.contains("confidence"));
    }
}
