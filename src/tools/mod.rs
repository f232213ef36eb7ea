//! 工具箱：工具注册、参数 schema、带超时的执行器与目录只读工具

pub mod directory;
pub mod executor;
pub mod registry;
pub mod schema;

pub use directory::{ListChannelsTool, SearchTeamsTool};
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolError, ToolRegistry, ToolSpec};
pub use schema::{parameters_schema, parse_args};
