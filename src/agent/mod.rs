//! Agent 驱动：模型客户端与会话运行器

pub mod model;
pub mod openai;
pub mod runner;

pub use model::{ModelChunk, ModelClient, ModelStream, ScriptedModel};
pub use openai::OpenAiModel;
pub use runner::{AgentRunner, RunOutcome};
