//! 生成层：客户端抽象、实现与输出恢复解析

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod parser;
pub mod traits;

pub use embedding::{create_embedder, EmbeddingProvider, OpenAiEmbedder};
pub use mock::ScriptedClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use parser::{parse_reply, ParseError};
pub use traits::{ChatMessage, ChatRole, GenerateClient};
