//! 参与者通讯录
//!
//! 参与者标识到（学校、角色、显示名）的解析。接入层在构造轮次前查询；
//! 未注册号码按群成员处理，落到缺省学校。

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::core::error::KernelError;
use crate::core::turn::{parse_role, ActorRole};

/// 参与者档案
#[derive(Debug, Clone)]
pub struct ActorProfile {
    pub actor_key: String,
    pub school_id: String,
    pub role: ActorRole,
    pub display_name: Option<String>,
    /// 人设覆盖（缺省按角色选择）
    pub agent: Option<String>,
}

/// 通讯录接口
pub trait ActorDirectory: Send + Sync {
    /// 解析参与者档案；None 表示未注册
    fn resolve(&self, actor_key: &str) -> Option<ActorProfile>;

    /// 未注册号码的归属学校
    fn default_school(&self) -> &str;

    /// 解析，未注册则按群成员返回
    fn resolve_or_guest(&self, actor_key: &str) -> ActorProfile {
        self.resolve(actor_key).unwrap_or_else(|| ActorProfile {
            actor_key: actor_key.to_string(),
            school_id: self.default_school().to_string(),
            role: ActorRole::GroupMember,
            display_name: None,
            agent: None,
        })
    }
}

#[derive(Deserialize)]
struct DirectoryFile {
    default_school: Option<String>,
    #[serde(default)]
    actors: Vec<ActorEntry>,
}

#[derive(Deserialize)]
struct ActorEntry {
    key: String,
    school: Option<String>,
    role: String,
    name: Option<String>,
    agent: Option<String>,
}

/// 静态通讯录：TOML 文件整表加载
pub struct StaticDirectory {
    actors: HashMap<String, ActorProfile>,
    default_school: String,
}

impl StaticDirectory {
    pub fn from_toml_str(content: &str) -> Result<Self, KernelError> {
        let file: DirectoryFile =
            toml::from_str(content).map_err(|e| KernelError::Config(format!("directory: {}", e)))?;
        let default_school = file.default_school.unwrap_or_else(|| "default".to_string());
        let actors = file
            .actors
            .into_iter()
            .map(|entry| {
                let profile = ActorProfile {
                    actor_key: entry.key.clone(),
                    school_id: entry.school.unwrap_or_else(|| default_school.clone()),
                    role: parse_role(&entry.role),
                    display_name: entry.name,
                    agent: entry.agent,
                };
                (entry.key, profile)
            })
            .collect();
        Ok(Self {
            actors,
            default_school,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| KernelError::Config(format!("directory {}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 空通讯录（全部按群成员处理）
    pub fn empty(default_school: impl Into<String>) -> Self {
        Self {
            actors: HashMap::new(),
            default_school: default_school.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl ActorDirectory for StaticDirectory {
    fn resolve(&self, actor_key: &str) -> Option<ActorProfile> {
        self.actors.get(actor_key).cloned()
    }

    fn default_school(&self) -> &str {
        &self.default_school
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_school = "sch_1"

[[actors]]
key = "13800000001"
role = "parent"
name = "张妈妈"

[[actors]]
key = "13900000000"
school = "sch_1"
role = "admin"
name = "王校长"
agent = "admin_assistant"
"#;

    #[test]
    fn test_resolve_registered_actor() {
        let dir = StaticDirectory::from_toml_str(SAMPLE).unwrap();
        let profile = dir.resolve("13900000000").unwrap();
        assert_eq!(profile.role, ActorRole::Admin);
        assert_eq!(profile.agent.as_deref(), Some("admin_assistant"));
        assert_eq!(profile.school_id, "sch_1");
    }

    #[test]
    fn test_unregistered_becomes_guest() {
        let dir = StaticDirectory::from_toml_str(SAMPLE).unwrap();
        let profile = dir.resolve_or_guest("10000000000");
        assert_eq!(profile.role, ActorRole::GroupMember);
        assert_eq!(profile.school_id, "sch_1");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let result = StaticDirectory::from_toml_str("actors = 3");
        assert!(matches!(result, Err(KernelError::Config(_))));
    }
}
