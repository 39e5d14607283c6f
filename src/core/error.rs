//! 内核错误类型与降级路径
//!
//! 每类错误对应一条固定的降级路径：生成/解析失败 → 兜底回复；
//! 越权 → 礼貌拒绝；历史写入失败 → 记日志放行；升级状态写入失败 → 硬失败。

use thiserror::Error;

/// 一轮对话处理过程中可能出现的错误（生成、解析、授权、持久化、投递等）
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation timed out after {0}s")]
    GenerationTimeout(u64),

    #[error("Reply parse failed: {0}")]
    Parse(String),

    #[error("Action not authorized: {action} for role {role}")]
    Unauthorized { action: String, role: String },

    #[error("Store error: {0}")]
    Store(String),

    /// 升级记录状态非法迁移（如对已裁决记录重复裁决）
    #[error("Escalation state error: {0}")]
    Escalation(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// 参与者队列已关闭，轮次无法入队
    #[error("Actor lane closed: {0}")]
    LaneClosed(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 错误对应的处理路径，由轮次管线在出口处统一执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// 返回兜底回复，轮次照常完成（生成、解析失败）
    FallbackReply,
    /// 返回礼貌拒绝，动作不执行（越权）
    PoliteDeny,
    /// 记日志后放行，不影响本轮回复（历史/会话写入失败）
    LogAndContinue,
    /// 向上传播，本轮以错误收尾（升级/策略状态写入失败）
    Propagate,
}

impl KernelError {
    /// 错误到处理路径的固定映射
    pub fn recovery(&self) -> Recovery {
        match self {
            KernelError::Generation(_) | KernelError::GenerationTimeout(_) => {
                Recovery::FallbackReply
            }
            KernelError::Parse(_) => Recovery::FallbackReply,
            KernelError::Unauthorized { .. } => Recovery::PoliteDeny,
            KernelError::Store(_) => Recovery::LogAndContinue,
            KernelError::Escalation(_) | KernelError::Config(_) => Recovery::Propagate,
            KernelError::Delivery(_) => Recovery::LogAndContinue,
            KernelError::LaneClosed(_) => Recovery::Propagate,
        }
    }
}
