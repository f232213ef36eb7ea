//! deskpilot - 目录/协作 API 的智能体后端
//!
//! 模块划分：
//! - **auth**: 出站 client-credentials 令牌生命周期、入站调用方身份
//! - **graph**: 目录 API 传输网关、分页、并发拉取编排
//! - **session**: 流式会话事件协议、持久化消息、历史回放与会话存储
//! - **tools**: 工具注册、参数 schema、带超时的执行器、目录只读工具
//! - **agent**: 模型客户端（OpenAI 兼容流式）与会话运行器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **server**: HTTP / SSE 接口（feature `web`）

pub mod agent;
pub mod auth;
pub mod config;
pub mod core;
pub mod graph;
pub mod observability;
#[cfg(feature = "web")]
pub mod server;
pub mod session;
pub mod tools;
