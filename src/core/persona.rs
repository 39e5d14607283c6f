//! 智能体人设
//!
//! 每个角色有一个默认智能体，每个智能体一段系统指令。
//! 指令可被 prompts 目录下的 <agent>.txt 覆盖，缺失时用内置文本。

use std::collections::HashMap;
use std::path::Path;

use crate::authz::PolicyTable;
use crate::contract::reply_schema_json;
use crate::core::turn::ActorRole;

/// 内置智能体清单
pub const AGENTS: [&str; 4] = [
    "class_assistant",
    "teaching_assistant",
    "admin_assistant",
    "group_assistant",
];

/// 角色对应的默认智能体
pub fn default_agent(role: ActorRole) -> &'static str {
    match role {
        ActorRole::Parent => "class_assistant",
        ActorRole::Teacher => "teaching_assistant",
        ActorRole::Admin => "admin_assistant",
        ActorRole::GroupMember => "group_assistant",
    }
}

fn builtin_instructions(agent: &str) -> &'static str {
    match agent {
        "class_assistant" => {
            "你是班级助手，面向家长。回答孩子的在校情况、作业与成绩查询，语气友善克制。\
             涉及成绩发布、缴费减免等需要校方批准的请求，发起升级而不是擅自承诺。"
        }
        "teaching_assistant" => {
            "你是教学助手，面向教师。协助出勤记录、作业布置与班级通知。\
             超出教师权限的事项（如全校通告、成绩发布）发起升级。"
        }
        "admin_assistant" => {
            "你是校务助手，面向管理员。除日常查询外，你负责呈报待裁决的升级请求：\
             管理员答复时，产出 DECIDE_ESCALATION 动作并在 params 里带上 escalation_id 与 decision，\
             必要时附 instruction。"
        }
        "group_assistant" => {
            "你是群聊助手，面向群成员。只回答公开信息（如课表），不处理任何个人数据请求。"
        }
        _ => "你是校园消息助手，礼貌、准确、简短地回复。",
    }
}

/// 人设注册表
pub struct PersonaRegistry {
    overrides: HashMap<String, String>,
}

impl PersonaRegistry {
    pub fn builtin() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    /// 从 prompts 目录加载覆盖文本（<agent>.txt），读不到的沿用内置
    pub fn load(prompts_dir: impl AsRef<Path>) -> Self {
        let dir = prompts_dir.as_ref();
        let mut overrides = HashMap::new();
        for agent in AGENTS {
            let path = dir.join(format!("{}.txt", agent));
            if let Ok(text) = std::fs::read_to_string(&path) {
                if !text.trim().is_empty() {
                    tracing::info!(agent = agent, path = %path.display(), "Loaded persona override");
                    overrides.insert(agent.to_string(), text.trim().to_string());
                }
            }
        }
        Self { overrides }
    }

    pub fn instructions(&self, agent: &str) -> &str {
        self.overrides
            .get(agent)
            .map(String::as_str)
            .unwrap_or_else(|| builtin_instructions(agent))
    }

    /// 组装系统提示：人设 + 输出契约 + 该角色可请求的动作清单
    pub fn system_prompt(&self, agent: &str, role: ActorRole, policy: &PolicyTable) -> String {
        let actions = policy.actions_for(role);
        let action_list = if actions.is_empty() {
            "（无）".to_string()
        } else {
            actions.join("、")
        };
        format!(
            "{}\n\n你的每次回复必须是一个 JSON 对象，不要输出任何其他文字。字段结构如下:\n{}\n\n\
             当前用户角色: {}。可请求的动作: {}。\n\
             动作名放在 action.name，没有动作时省略 action 字段。\
             需要管理员裁决时设置 admin_escalation 并说明原因。",
            self.instructions(agent),
            reply_schema_json(),
            role,
            action_list
        )
    }
}

impl Default for PersonaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_agent_per_role() {
        assert_eq!(default_agent(ActorRole::Parent), "class_assistant");
        assert_eq!(default_agent(ActorRole::Teacher), "teaching_assistant");
        assert_eq!(default_agent(ActorRole::Admin), "admin_assistant");
        assert_eq!(default_agent(ActorRole::GroupMember), "group_assistant");
    }

    #[test]
    fn test_system_prompt_carries_contract_and_actions() {
        let registry = PersonaRegistry::builtin();
        let prompt = registry.system_prompt("class_assistant", ActorRole::Parent, &PolicyTable::builtin());
        assert!(prompt.contains("班级助手"));
        assert!(prompt.contains("message"));
        assert!(prompt.contains("QUERY_RESULTS"));
        // 家长人设不含管理员专属动作
        assert!(!prompt.contains("RELEASE_RESULTS"));
    }

    #[test]
    fn test_unknown_agent_falls_back() {
        let registry = PersonaRegistry::builtin();
        assert!(registry.instructions("unknown_agent").contains("校园消息助手"));
    }

    #[test]
    fn test_load_override_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("class_assistant.txt"), "测试专用人设。").unwrap();

        let registry = PersonaRegistry::load(dir.path());
        assert_eq!(registry.instructions("class_assistant"), "测试专用人设。");
        // 未覆盖的智能体沿用内置
        assert!(registry.instructions("group_assistant").contains("群聊助手"));
    }
}
