//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AULA__*` 覆盖（双下划线表示嵌套，如 `AULA__LLM__MODEL=gpt-4o`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub actions: ActionsSection,
    #[serde(default)]
    pub authz: AuthzSection,
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub store: StoreSection,
}

/// [app] 段：应用名、缺省学校、人设覆盖目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未登记参与者归入的学校
    #[serde(default = "default_school_id")]
    pub school_id: String,
    /// 人设覆盖文件目录（<agent>.txt）
    pub prompts_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            school_id: default_school_id(),
            prompts_dir: None,
        }
    }
}

fn default_school_id() -> String {
    "sch_default".to_string()
}

/// [llm] 段：后端与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时回落到 OPENAI_API_KEY 环境变量
    pub api_key: Option<String>,
    /// 单次生成调用超时（秒）
    #[serde(default = "default_generate_timeout_secs")]
    pub timeout_secs: u64,
    /// 设置后快照会带嵌入向量
    pub embedding_model: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            timeout_secs: default_generate_timeout_secs(),
            embedding_model: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_generate_timeout_secs() -> u64 {
    60
}

/// [memory] 段：原文窗口与摘要参数
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 最近保留的原文轮次数
    #[serde(default = "default_raw_window")]
    pub raw_window: usize,
    /// 摘要背景块的 token 预算
    #[serde(default = "default_background_budget")]
    pub background_budget: usize,
    /// 积累多少旧轮次才值得压缩
    #[serde(default = "default_snapshot_min_block")]
    pub snapshot_min_block: usize,
    /// 单轮上下文最多携带的快照数
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            raw_window: default_raw_window(),
            background_budget: default_background_budget(),
            snapshot_min_block: default_snapshot_min_block(),
            snapshot_limit: default_snapshot_limit(),
        }
    }
}

fn default_raw_window() -> usize {
    10
}

fn default_background_budget() -> usize {
    1000
}

fn default_snapshot_min_block() -> usize {
    3
}

fn default_snapshot_limit() -> usize {
    3
}

/// [session] 段：会话存活与清扫
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

/// [escalation] 段：裁决者名录与固定话术
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationSection {
    /// school_id -> (角色 -> 参与者标识)
    #[serde(default)]
    pub authorities: HashMap<String, HashMap<String, String>>,
    /// 升级提交后的确认话术
    #[serde(default = "default_ack_text")]
    pub ack_text: String,
    /// 生成或解析失败时的兜底话术
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,
    /// 动作被拒时的解释话术
    #[serde(default = "default_deny_text")]
    pub deny_text: String,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            authorities: HashMap::new(),
            ack_text: default_ack_text(),
            fallback_text: default_fallback_text(),
            deny_text: default_deny_text(),
        }
    }
}

fn default_ack_text() -> String {
    "已为你提交校方审批，有结果会第一时间通知你。".to_string()
}

fn default_fallback_text() -> String {
    "抱歉，系统刚才开小差了，请稍后再试。".to_string()
}

fn default_deny_text() -> String {
    "这个操作需要相应权限，我暂时帮不了你，需要的话可以联系学校。".to_string()
}

/// [actions] 段：动作执行超时
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsSection {
    #[serde(default = "default_action_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ActionsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_action_timeout_secs(),
        }
    }
}

fn default_action_timeout_secs() -> u64 {
    10
}

/// [authz] 段：策略表文件，未设置用内置表
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthzSection {
    pub policy_path: Option<PathBuf>,
}

/// [directory] 段：参与者名录文件，未设置时所有人按访客处理
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DirectorySection {
    pub path: Option<PathBuf>,
}

/// [store] 段：SQLite 文件路径，未设置用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub db_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            memory: MemorySection::default(),
            session: SessionSection::default(),
            escalation: EscalationSection::default(),
            actions: ActionsSection::default(),
            authz: AuthzSection::default(),
            directory: DirectorySection::default(),
            store: StoreSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AULA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AULA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AULA")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
