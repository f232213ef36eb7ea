//! `@odata.nextLink` 分页

use serde_json::Value;

use super::transport::{ApiReply, GraphTransport};
use crate::core::RemoteError;

const NEXT_LINK: &str = "@odata.nextLink";

/// 依次拉取所有页，按分页顺序累积每页的 `value` 数组
///
/// 空响应或没有 `value` 的页贡献 0 项；任一页失败则整体失败。
pub async fn collect_pages(transport: &GraphTransport, url: &str) -> Result<Vec<Value>, RemoteError> {
    let mut items = Vec::new();
    let mut next = Some(url.to_string());
    let mut pages = 0usize;

    while let Some(current) = next.take() {
        let page = match transport.get(&current).await? {
            ApiReply::Json(v) => v,
            ApiReply::Empty => break,
        };
        pages += 1;

        match page.get("value") {
            Some(Value::Array(values)) => items.extend(values.iter().cloned()),
            Some(other) => {
                return Err(RemoteError::malformed(
                    "page `value` is not an array",
                    other.to_string(),
                ))
            }
            None => {}
        }

        next = page
            .get(NEXT_LINK)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }

    tracing::debug!(url = %url, pages, items = items.len(), "Collected paginated result");
    Ok(items)
}
