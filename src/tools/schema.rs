//! 工具参数 JSON Schema 生成与解析（schemars）
//!
//! 参数结构体派生 `JsonSchema` + `Deserialize`，schema 交给模型，解析失败转为重试提示。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::registry::ToolError;

/// 参数类型的 JSON Schema
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 把模型给出的参数解析为具体类型；模型偶尔把参数作为 JSON 字符串给出，一并接受
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = match args {
        Value::String(raw) => serde_json::from_str(&raw)
            .map_err(|e| ToolError::InvalidArgs(format!("arguments are not valid json: {e}")))?,
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs(e.to_string()))
}
