//! 动作授权
//!
//! 纯表驱动：动作名 -> 允许角色 + 会话前置条件。未知动作一律拒绝。
//! 拒绝不是错误路径：轮次照常完成，回复换成礼貌说明，动作不执行。

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::core::error::KernelError;
use crate::core::turn::ActorRole;

/// 单条策略
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub action: String,
    pub roles: Vec<ActorRole>,
    /// 是否要求注册会话（群成员视为未注册）
    pub needs_session: bool,
}

/// 授权结论
#[derive(Debug, Clone)]
pub struct Authorization {
    pub authorized: bool,
    /// 拒绝原因（诊断用，不直接呈现给用户）
    pub reason: Option<String>,
}

impl Authorization {
    fn allow() -> Self {
        Self {
            authorized: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            authorized: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    rules: Vec<PolicyEntry>,
}

#[derive(Deserialize)]
struct PolicyEntry {
    action: String,
    roles: Vec<String>,
    #[serde(default)]
    needs_session: bool,
}

/// 策略表
pub struct PolicyTable {
    rules: HashMap<String, PolicyRule>,
}

impl PolicyTable {
    /// 内置缺省表
    pub fn builtin() -> Self {
        let rules = [
            ("QUERY_RESULTS", vec![ActorRole::Parent, ActorRole::Teacher, ActorRole::Admin], true),
            ("QUERY_HOMEWORK", vec![ActorRole::Parent, ActorRole::Teacher, ActorRole::Admin], true),
            ("QUERY_SCHEDULE", vec![ActorRole::Parent, ActorRole::Teacher, ActorRole::Admin, ActorRole::GroupMember], false),
            ("RECORD_ATTENDANCE", vec![ActorRole::Teacher], true),
            ("SEND_ANNOUNCEMENT", vec![ActorRole::Teacher, ActorRole::Admin], true),
            ("RELEASE_RESULTS", vec![ActorRole::Admin], true),
            ("DECIDE_ESCALATION", vec![ActorRole::Admin], true),
            ("LOGOUT", vec![ActorRole::Parent, ActorRole::Teacher, ActorRole::Admin, ActorRole::GroupMember], false),
        ];
        let rules = rules
            .into_iter()
            .map(|(action, roles, needs_session)| {
                (
                    action.to_string(),
                    PolicyRule {
                        action: action.to_string(),
                        roles,
                        needs_session,
                    },
                )
            })
            .collect();
        Self { rules }
    }

    /// 从 TOML 加载，整表替换内置缺省
    pub fn from_toml_str(content: &str) -> Result<Self, KernelError> {
        let file: PolicyFile =
            toml::from_str(content).map_err(|e| KernelError::Config(format!("policy: {}", e)))?;
        let rules = file
            .rules
            .into_iter()
            .map(|entry| {
                let action = entry.action.trim().to_uppercase();
                let roles = entry
                    .roles
                    .iter()
                    .map(|r| crate::core::turn::parse_role(r))
                    .collect();
                (
                    action.clone(),
                    PolicyRule {
                        action,
                        roles,
                        needs_session: entry.needs_session,
                    },
                )
            })
            .collect();
        Ok(Self { rules })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| KernelError::Config(format!("policy {}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 纯授权判定。动作名大小写不敏感；未知动作拒绝。
    pub fn authorize(&self, action: &str, role: ActorRole, has_session: bool) -> Authorization {
        let key = action.trim().to_uppercase();
        let Some(rule) = self.rules.get(&key) else {
            return Authorization::deny(format!("unknown action: {}", action));
        };
        if !rule.roles.contains(&role) {
            return Authorization::deny(format!("role {} not allowed for {}", role, rule.action));
        }
        if rule.needs_session && !has_session {
            return Authorization::deny(format!("{} requires an authenticated session", rule.action));
        }
        Authorization::allow()
    }

    /// 某角色可请求的动作名，按字典序（人设提示里列出）
    pub fn actions_for(&self, role: ActorRole) -> Vec<String> {
        let mut actions: Vec<String> = self
            .rules
            .values()
            .filter(|rule| rule.roles.contains(&role))
            .map(|rule| rule.action.clone())
            .collect();
        actions.sort();
        actions
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_results_admin_only() {
        let table = PolicyTable::builtin();
        assert!(!table.authorize("RELEASE_RESULTS", ActorRole::Parent, true).authorized);
        assert!(table.authorize("RELEASE_RESULTS", ActorRole::Admin, true).authorized);
    }

    #[test]
    fn test_unknown_action_denied() {
        let table = PolicyTable::builtin();
        let auth = table.authorize("FORMAT_DISK", ActorRole::Admin, true);
        assert!(!auth.authorized);
        assert!(auth.reason.unwrap().contains("unknown action"));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let table = PolicyTable::builtin();
        assert!(table.authorize("query_results", ActorRole::Parent, true).authorized);
    }

    #[test]
    fn test_needs_session_gate() {
        let table = PolicyTable::builtin();
        let auth = table.authorize("QUERY_RESULTS", ActorRole::Parent, false);
        assert!(!auth.authorized);
        assert!(auth.reason.unwrap().contains("session"));
        // 无会话前置的动作不受影响
        assert!(table.authorize("QUERY_SCHEDULE", ActorRole::GroupMember, false).authorized);
    }

    #[test]
    fn test_actions_for_role() {
        let table = PolicyTable::builtin();
        let parent = table.actions_for(ActorRole::Parent);
        assert!(parent.contains(&"QUERY_RESULTS".to_string()));
        assert!(!parent.contains(&"RELEASE_RESULTS".to_string()));
        let admin = table.actions_for(ActorRole::Admin);
        assert!(admin.contains(&"DECIDE_ESCALATION".to_string()));
    }

    #[test]
    fn test_toml_override() {
        let table = PolicyTable::from_toml_str(
            r#"
[[rules]]
action = "release_results"
roles = ["teacher", "admin"]
needs_session = true
"#,
        )
        .unwrap();
        assert!(table.authorize("RELEASE_RESULTS", ActorRole::Teacher, true).authorized);
        // 整表替换：内置规则不再存在
        assert!(!table.authorize("QUERY_SCHEDULE", ActorRole::Parent, true).authorized);
    }
}
