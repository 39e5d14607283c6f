//! Aula - 校园多智能体消息内核
//!
//! 模块划分：
//! - **actions**: 动作处理器注册与带超时派发
//! - **authz**: 动作授权策略表（角色 x 动作，TOML 可替换）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **contract**: 智能体回复契约与升级请求结构
//! - **core**: 轮次协议、参与者队列、人设、轮次管线
//! - **delivery**: 出站投递抽象（升级通知、裁决回灌推送）
//! - **escalation**: 升级记录生命周期（PENDING / DECIDED / DELIVERED）
//! - **integrations**: WhatsApp 接入（webhook 解析、出站发送、去重）
//! - **llm**: 生成客户端抽象与实现（OpenAI 兼容 / 脚本 Mock）、回复恢复解析
//! - **memory**: 审计历史、摘要快照、上下文装配与后台压缩
//! - **session**: 参与者会话与静态通讯录
//! - **store**: 内核存储抽象（内存 / SQLite）

pub mod actions;
pub mod authz;
pub mod config;
pub mod contract;
pub mod core;
pub mod delivery;
pub mod escalation;
pub mod integrations;
pub mod llm;
pub mod memory;
pub mod session;
pub mod store;

pub use crate::core::{Kernel, KernelBuilder};
