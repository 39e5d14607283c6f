//! 记忆层：审计历史（原文窗口）、摘要快照（长期背景）、上下文装配与后台压缩

pub mod budget;
pub mod context;
pub mod history;
pub mod snapshot;
pub mod summarizer;
pub mod tokenizer;

pub use budget::TokenEstimator;
pub use context::{ContextAssembler, ContextBundle};
pub use history::HistoryEntry;
pub use snapshot::MemorySnapshot;
pub use summarizer::Summarizer;
