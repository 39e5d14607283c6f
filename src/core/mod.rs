//! 核心编排层：错误与降级、轮次协议、人设、参与者队列、轮次管线

pub mod error;
pub mod persona;
pub mod pipeline;
pub mod serializer;
pub mod turn;

pub use error::{KernelError, Recovery};
pub use persona::{default_agent, PersonaRegistry, AGENTS};
pub use pipeline::{create_client_from_config, Kernel, KernelBuilder};
pub use serializer::TurnSerializer;
pub use turn::{
    parse_action_status, parse_role, ActionStatus, ActorKey, ActorRole, InboundTurn, SchoolId,
    TurnKind, TurnOutput,
};
