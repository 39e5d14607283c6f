//! 轮次协议定义
//!
//! 入站轮次与出站结果的统一格式，用于接入层与内核之间的传递。
//! 入站轮次一经记录即不可变。

use serde::{Deserialize, Serialize};

/// 参与者标识（电话号码）
pub type ActorKey = String;

/// 学校标识（租户）
pub type SchoolId = String;

/// 参与者角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// 教师
    Teacher,
    /// 家长
    Parent,
    /// 管理员
    Admin,
    /// 群成员（未注册身份）
    GroupMember,
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorRole::Teacher => write!(f, "teacher"),
            ActorRole::Parent => write!(f, "parent"),
            ActorRole::Admin => write!(f, "admin"),
            ActorRole::GroupMember => write!(f, "group_member"),
        }
    }
}

/// 字符串到角色（持久化列与配置文件中使用小写形式）
pub fn parse_role(s: &str) -> ActorRole {
    match s {
        "teacher" => ActorRole::Teacher,
        "parent" => ActorRole::Parent,
        "admin" => ActorRole::Admin,
        _ => ActorRole::GroupMember,
    }
}

/// 轮次载荷类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// 文本消息
    Text,
    /// 图片（media_id 指向传输层附件）
    Image,
    /// 语音
    Audio,
    /// 内核合成轮次（升级裁决回灌等），不计入用户消息
    System,
}

/// 入站轮次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundTurn {
    /// 参与者标识
    pub actor_key: ActorKey,
    /// 所属学校
    pub school_id: SchoolId,
    /// 参与者角色
    pub role: ActorRole,
    /// 载荷类型
    pub kind: TurnKind,
    /// 文本内容（媒体轮为标注文字，System 轮为内核指令）
    pub text: String,
    /// 传输层媒体引用
    pub media_id: Option<String>,
    /// 群聊来源（私聊为 None）
    pub group_id: Option<String>,
    /// 指定会话（缺省由内核按参与者解析）
    pub session_id: Option<String>,
}

impl InboundTurn {
    pub fn text(
        actor_key: impl Into<String>,
        school_id: impl Into<String>,
        role: ActorRole,
        text: impl Into<String>,
    ) -> Self {
        Self {
            actor_key: actor_key.into(),
            school_id: school_id.into(),
            role,
            kind: TurnKind::Text,
            text: text.into(),
            media_id: None,
            group_id: None,
            session_id: None,
        }
    }

    /// 内核合成轮次（如升级裁决回灌），text 携带升级记录 ID
    pub fn system(
        actor_key: impl Into<String>,
        school_id: impl Into<String>,
        role: ActorRole,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: TurnKind::System,
            ..Self::text(actor_key, school_id, role, text)
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_media(mut self, kind: TurnKind, media_id: impl Into<String>) -> Self {
        self.kind = kind;
        self.media_id = Some(media_id.into());
        self
    }
}

/// 动作执行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// 本轮未请求动作
    None,
    /// 已执行
    Executed,
    /// 越权被拒
    Denied,
    /// 未注册的动作名
    Unsupported,
    /// 执行失败或超时
    Failed,
    /// 升级待裁决，动作挂起
    HeldForEscalation,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionStatus::None => write!(f, "none"),
            ActionStatus::Executed => write!(f, "executed"),
            ActionStatus::Denied => write!(f, "denied"),
            ActionStatus::Unsupported => write!(f, "unsupported"),
            ActionStatus::Failed => write!(f, "failed"),
            ActionStatus::HeldForEscalation => write!(f, "held_for_escalation"),
        }
    }
}

pub fn parse_action_status(s: &str) -> ActionStatus {
    match s {
        "executed" => ActionStatus::Executed,
        "denied" => ActionStatus::Denied,
        "unsupported" => ActionStatus::Unsupported,
        "failed" => ActionStatus::Failed,
        "held_for_escalation" => ActionStatus::HeldForEscalation,
        _ => ActionStatus::None,
    }
}

/// 出站结果：每个提交的轮次必定产出一个（绝不静默丢弃）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutput {
    /// 轮次 ID
    pub turn_id: String,
    /// 参与者标识
    pub actor_key: ActorKey,
    /// 处理该轮的智能体
    pub agent: String,
    /// 面向用户的回复文本
    pub text: String,
    /// 请求的动作名（无动作为 None）
    pub action: Option<String>,
    /// 动作执行状态
    pub action_status: ActionStatus,
    /// 本轮新建或并入的升级记录 ID
    pub escalation_id: Option<String>,
    /// 是否走了兜底路径（生成/解析失败）
    pub fallback: bool,
    /// 完成时间戳（毫秒）
    pub timestamp: i64,
}

impl TurnOutput {
    pub fn new(actor_key: impl Into<String>, agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            turn_id: format!("turn_{}", uuid::Uuid::new_v4()),
            actor_key: actor_key.into(),
            agent: agent.into(),
            text: text.into(),
            action: None,
            action_status: ActionStatus::None,
            escalation_id: None,
            fallback: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
